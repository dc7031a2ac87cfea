//! Reconciles the nominal sample counter against hardware time markers.
//!
//! The hardware tags some samples with the absolute time it sampled them at. From the
//! first tag of a run we fix the epoch; every later tag tells us how many samples the
//! clock says we should have seen, and the difference from what actually arrived is the
//! number of samples lost upstream.

use tracing::{debug, info};

/// Absolute time attached to a sample of a batch
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeMarker {
    /// Sample (frame) offset inside the batch
    pub offset: usize,
    pub epoch_seconds: u64,
    /// In [0, 1)
    pub fraction_seconds: f64,
}

impl TimeMarker {
    pub fn new(offset: usize, epoch_seconds: u64, fraction_seconds: f64) -> Self {
        Self {
            offset,
            epoch_seconds,
            fraction_seconds,
        }
    }
}

/// Absolute sample index (samples since the unix epoch) of a time, rounded to the nearest sample.
///
/// `sample_rate * seconds` overflows the f64 mantissa for realistic rates, so the integer
/// part of the rate is multiplied out in integer arithmetic and only the sub-Hz remainder
/// and the fractional second go through floating point.
pub fn sample_index(sample_rate: f64, seconds: u64, fraction: f64) -> i128 {
    let whole = sample_rate.trunc();
    let rem = sample_rate - whole;
    whole as i128 * seconds as i128 + (rem * seconds as f64 + sample_rate * fraction).round() as i128
}

/// Absolute sample index of a whole second, floored
pub fn sample_index_floor(sample_rate: f64, seconds: u64) -> i128 {
    let whole = sample_rate.trunc();
    let rem = sample_rate - whole;
    whole as i128 * seconds as i128 + (rem * seconds as f64).floor() as i128
}

/// The start of one continuous run
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureEpoch {
    pub sample_rate: f64,
    /// Index of the whole second the run started in
    pub start_index_floor: u64,
    /// Index of the first sample of the run
    pub start_index_exact: u64,
    /// Index the archive segment is opened at, so that `segment_base + local_index` is absolute
    pub segment_base: u64,
}

/// Samples handed to the archive so far
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteCursor {
    /// Logical samples emitted, real and backfilled
    pub local_index: u64,
    /// Backfilled samples
    pub total_dropped: u64,
}

impl WriteCursor {
    pub fn advance(&mut self, real: u64) {
        self.local_index += real;
    }

    pub fn backfill(&mut self, gap: u64) {
        self.local_index += gap;
        self.total_dropped += gap;
    }
}

#[derive(Debug)]
pub struct Reconciler {
    sample_rate: f64,
    epoch: Option<CaptureEpoch>,
    /// Real samples delivered in this run before the current batch
    items_seen: u64,
    /// Samples recovered by backfill in this run
    dropped: u64,
}

impl Reconciler {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            epoch: None,
            items_seen: 0,
            dropped: 0,
        }
    }

    pub fn epoch(&self) -> Option<&CaptureEpoch> {
        self.epoch.as_ref()
    }

    /// Fix the run's epoch from its first marker. `carried` is the write cursor's
    /// local index from earlier runs, folded into the segment base.
    pub fn establish(&mut self, marker: &TimeMarker, carried: u64) -> CaptureEpoch {
        let at_marker = sample_index(
            self.sample_rate,
            marker.epoch_seconds,
            marker.fraction_seconds,
        );
        let exact = (at_marker - marker.offset as i128).max(0) as u64;
        let floor = sample_index_floor(self.sample_rate, marker.epoch_seconds).max(0) as u64;
        let epoch = CaptureEpoch {
            sample_rate: self.sample_rate,
            start_index_floor: floor,
            start_index_exact: exact,
            segment_base: floor.saturating_sub(carried),
        };
        info!(
            seconds = marker.epoch_seconds,
            fraction = marker.fraction_seconds,
            start_index = exact,
            segment_base = epoch.segment_base,
            "Established capture epoch"
        );
        self.epoch = Some(epoch);
        self.items_seen = 0;
        self.dropped = 0;
        epoch
    }

    /// Samples missing at `marker`: positive means the clock ran ahead of the delivered count.
    /// Returns `None` before an epoch exists.
    pub fn gap(&self, marker: &TimeMarker) -> Option<i64> {
        let epoch = self.epoch.as_ref()?;
        let expected = sample_index(
            self.sample_rate,
            marker.epoch_seconds,
            marker.fraction_seconds,
        ) - epoch.start_index_exact as i128
            - self.dropped as i128;
        let gap = expected - (self.items_seen + marker.offset as u64) as i128;
        debug!(offset = marker.offset, gap = gap as i64, "Reconciled marker");
        Some(gap.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Account for a gap that has been backfilled
    pub fn record_drop(&mut self, gap: u64) {
        self.dropped += gap;
    }

    /// Account for the real samples of a finished batch
    pub fn advance(&mut self, items: u64) {
        self.items_seen += items;
    }

    pub fn reset(&mut self) {
        self.epoch = None;
        self.items_seen = 0;
        self.dropped = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_index_is_exact_for_large_epochs() {
        // 1.7e9 s at 25 MHz is well past 2^53
        let idx = sample_index(25e6, 1_700_000_000, 0.5);
        assert_eq!(idx, 25_000_000i128 * 1_700_000_000 + 12_500_000);
        assert_eq!(
            sample_index_floor(25e6, 1_700_000_000),
            25_000_000i128 * 1_700_000_000
        );
    }

    #[test]
    fn test_fractional_rate() {
        // 2.5 Hz over 3 seconds is 7.5 samples, floored to 7
        assert_eq!(sample_index_floor(2.5, 3), 7);
        assert_eq!(sample_index(2.5, 3, 0.2), 8);
    }

    #[test]
    fn test_no_gap_when_markers_match() {
        let mut r = Reconciler::new(1e6);
        let epoch = r.establish(&TimeMarker::new(0, 100, 0.0), 0);
        assert_eq!(epoch.start_index_exact, 100_000_000);
        assert_eq!(epoch.segment_base, 100_000_000);
        r.advance(1000);
        assert_eq!(r.gap(&TimeMarker::new(0, 100, 0.001)), Some(0));
        assert_eq!(r.gap(&TimeMarker::new(500, 100, 0.0015)), Some(0));
    }

    #[test]
    fn test_gap_accounts_for_previous_drops() {
        let mut r = Reconciler::new(1e6);
        r.establish(&TimeMarker::new(0, 100, 0.0), 0);
        r.advance(1000);
        // Marker at offset 200 says 1700 samples have elapsed, we've seen 1200
        let m = TimeMarker::new(200, 100, 0.0017);
        assert_eq!(r.gap(&m), Some(500));
        r.record_drop(500);
        assert_eq!(r.gap(&m), Some(0));
        // Next marker with the same offset error adds nothing new
        assert_eq!(r.gap(&TimeMarker::new(300, 100, 0.0018)), Some(0));
    }

    #[test]
    fn test_epoch_marker_offset_and_carry() {
        let mut r = Reconciler::new(1000.0);
        let epoch = r.establish(&TimeMarker::new(10, 5, 0.5), 200);
        assert_eq!(epoch.start_index_exact, 5490);
        assert_eq!(epoch.start_index_floor, 5000);
        assert_eq!(epoch.segment_base, 4800);
    }

    #[test]
    fn test_jitter_is_negative() {
        let mut r = Reconciler::new(1000.0);
        r.establish(&TimeMarker::new(0, 5, 0.0), 0);
        r.advance(100);
        assert_eq!(r.gap(&TimeMarker::new(0, 5, 0.098)), Some(-2));
        assert_eq!(Reconciler::new(1000.0).gap(&TimeMarker::new(0, 5, 0.0)), None);
    }
}
