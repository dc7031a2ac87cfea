//! The continuous capture engine.
//!
//! One engine owns one run: it establishes the epoch from the first marker, reconciles
//! every later marker against the sample counter, repairs or gives up on gaps, and
//! pushes the in-sequence samples either straight to the archive or through the
//! downconverter first.

use byte_slice_cast::AsByteSlice;
use num_complex::Complex64;
use tracing::{debug, error, info, warn};

use crate::{
    archive::{Archive, Segment, SegmentSpec},
    config::CaptureConfig,
    downconvert::Downconverter,
    error::{ArchiveError, CaptureError, CaptureResult},
    format::{i16_to_i8, ItemKind, SampleFormat},
    gap::{GapAction, GapPolicy},
    monitoring::CaptureStats,
    timebase::{CaptureEpoch, Reconciler, TimeMarker, WriteCursor},
};

/// Frames of zeros written per append while backfilling
const ZERO_CHUNK_FRAMES: u64 = 1 << 16;

/// What happened to a batch that didn't fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    Continue,
    /// Loss with stop-on-loss set. Segments are closed, nothing more will be written.
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    AwaitingEpoch,
    Running,
    Stopped,
    Failed,
}

enum Stage<S> {
    Raw {
        segment: Option<S>,
        /// Squash complex int16 to int8 with this divisor
        narrow: Option<i16>,
        scratch: Vec<u8>,
        zeros: Vec<u8>,
    },
    Mix {
        dc: Downconverter,
        segments: Vec<S>,
        /// Decimated samples written per channel, across restarts
        index: u64,
        values: Vec<f64>,
        /// Little-endian f64 bit patterns of the block being written
        flat: Vec<u64>,
    },
}

pub struct CaptureEngine<A: Archive> {
    archive: A,
    format: SampleFormat,
    sample_rate: f64,
    identifier: String,
    policy: GapPolicy,
    reconciler: Reconciler,
    cursor: WriteCursor,
    stage: Stage<A::Segment>,
    state: EngineState,
    stats: CaptureStats,
}

/// Write full (or partial, on close) output blocks to each channel's segment
fn write_blocks<S: Segment>(
    segments: &mut [S],
    index: &mut u64,
    flat: &mut Vec<u64>,
    blocks: &[Vec<Complex64>],
) -> Result<(), ArchiveError> {
    let count = blocks[0].len() as u64;
    if count == 0 {
        return Ok(());
    }
    for (segment, block) in segments.iter_mut().zip(blocks) {
        flat.clear();
        flat.extend(
            block
                .iter()
                .flat_map(|z| [z.re.to_bits().to_le(), z.im.to_bits().to_le()]),
        );
        segment.append(*index, flat.as_byte_slice(), count)?;
    }
    *index += count;
    Ok(())
}

impl<A: Archive> CaptureEngine<A> {
    pub fn new(config: &CaptureConfig, archive: A) -> CaptureResult<Self> {
        let format = config.validate()?;
        let stage = match &config.mix {
            Some(mix) => Stage::Mix {
                dc: Downconverter::new(
                    &mix.taps()?,
                    &mix.carriers,
                    config.sample_rate,
                    mix.block_size,
                    mix.calibration.clone(),
                    mix.input_scale,
                )?,
                segments: vec![],
                index: 0,
                values: vec![],
                flat: vec![],
            },
            None => Stage::Raw {
                segment: None,
                narrow: config.scale_to_i8,
                scratch: vec![],
                zeros: vec![],
            },
        };
        info!(
            format = %format,
            sample_rate = config.sample_rate,
            mixing = config.mix.is_some(),
            stop_on_loss = config.stop_on_loss,
            "Capture engine ready"
        );
        Ok(Self {
            archive,
            format,
            sample_rate: config.sample_rate,
            identifier: config.identifier.clone(),
            policy: GapPolicy {
                capacity: config.gap_capacity,
                stop_on_loss: config.stop_on_loss,
            },
            reconciler: Reconciler::new(config.sample_rate),
            cursor: WriteCursor::default(),
            stage,
            state: EngineState::AwaitingEpoch,
            stats: CaptureStats::default(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn cursor(&self) -> WriteCursor {
        self.cursor
    }

    pub fn epoch(&self) -> Option<&CaptureEpoch> {
        self.reconciler.epoch()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    pub fn downconverter(&self) -> Option<&Downconverter> {
        match &self.stage {
            Stage::Mix { dc, .. } => Some(dc),
            Stage::Raw { .. } => None,
        }
    }

    /// Process one batch of raw frames and the markers attached to it
    pub fn process(&mut self, data: &[u8], markers: &[TimeMarker]) -> CaptureResult<BatchOutcome> {
        if matches!(self.state, EngineState::Stopped | EngineState::Failed) {
            return Err(CaptureError::NotRunning);
        }
        let frame = self.format.frame_bytes();
        if data.len() % frame != 0 {
            return Err(CaptureError::MalformedBatch {
                len: data.len(),
                frame,
            });
        }
        let n = data.len() / frame;
        let mut markers: Vec<&TimeMarker> = markers
            .iter()
            .filter(|m| {
                if m.offset >= n {
                    warn!(offset = m.offset, len = n, "Ignoring marker past end of batch");
                }
                m.offset < n
            })
            .collect();
        markers.sort_by_key(|m| m.offset);

        if self.state == EngineState::AwaitingEpoch {
            let first = *markers.first().ok_or(CaptureError::MissingTimeMarker)?;
            let carried = self.carried();
            let epoch = self.reconciler.establish(first, carried);
            if let Err(e) = self.open_segments(&epoch) {
                return Err(self.fail(e.into()));
            }
            self.state = EngineState::Running;
            if markers.len() > 1 {
                debug!(count = markers.len() - 1, "Skipping extra markers in first batch");
            }
            markers.clear();
        }

        let mut pos = 0;
        for marker in markers {
            let gap = self.reconciler.gap(marker).unwrap_or(0);
            match self.policy.decide(gap) {
                GapAction::Continue => {
                    if gap < 0 {
                        debug!(offset = marker.offset, gap, "Marker ahead of the clock, ignoring");
                        self.stats.jitter += 1;
                    }
                }
                GapAction::Backfill(gap) => {
                    self.write_real(&data[pos * frame..marker.offset * frame])?;
                    pos = marker.offset;
                    self.backfill(gap)?;
                    self.reconciler.record_drop(gap);
                    self.stats.gaps += 1;
                    self.stats.backfilled += gap;
                    warn!(
                        offset = marker.offset,
                        dropped = gap,
                        total_dropped = self.cursor.total_dropped,
                        local_index = self.cursor.local_index,
                        "Dropped samples, backfilled"
                    );
                }
                GapAction::Stop => {
                    self.write_real(&data[pos * frame..marker.offset * frame])?;
                    self.stats.gaps += 1;
                    warn!(
                        offset = marker.offset,
                        dropped = gap,
                        "Dropped samples, stopping as requested"
                    );
                    if let Err(e) = self.close_segments() {
                        return Err(self.fail(e.into()));
                    }
                    self.state = EngineState::Stopped;
                    return Ok(BatchOutcome::Stopped);
                }
                GapAction::Fatal(gap) => {
                    self.write_real(&data[pos * frame..marker.offset * frame])?;
                    self.stats.gaps += 1;
                    return Err(self.fail(CaptureError::GapExceedsCapacity {
                        gap,
                        capacity: self.policy.capacity,
                    }));
                }
            }
        }
        self.write_real(&data[pos * frame..])?;
        self.reconciler.advance(n as u64);
        self.stats.batches += 1;
        Ok(BatchOutcome::Continue)
    }

    /// Close the current run and wait for a new epoch. Indices keep counting up.
    pub fn restart(&mut self) -> CaptureResult<()> {
        if let Err(e) = self.close_segments() {
            return Err(self.fail(e.into()));
        }
        if let Stage::Mix { dc, .. } = &mut self.stage {
            // The new epoch starts a fresh window
            let discarded = dc.restart_windows();
            if discarded > 0 {
                debug!(discarded, "Discarding unfinished window");
            }
        }
        self.reconciler.reset();
        self.state = EngineState::AwaitingEpoch;
        self.stats.restarts += 1;
        info!(local_index = self.cursor.local_index, "Capture restarted");
        Ok(())
    }

    /// Flush and close everything. The engine stays stopped afterwards.
    pub fn close(&mut self) -> CaptureResult<()> {
        if matches!(self.state, EngineState::Stopped | EngineState::Failed) {
            return Ok(());
        }
        let closed = self.close_segments();
        self.state = EngineState::Stopped;
        closed.map_err(Into::into)
    }

    /// Index offset folded into the next segment's base
    fn carried(&self) -> u64 {
        match &self.stage {
            Stage::Raw { .. } => self.cursor.local_index,
            Stage::Mix { index, .. } => *index,
        }
    }

    fn open_segments(&mut self, epoch: &CaptureEpoch) -> Result<(), ArchiveError> {
        match &mut self.stage {
            Stage::Raw {
                segment, narrow, ..
            } => {
                let format = match narrow {
                    Some(_) => SampleFormat {
                        kind: ItemKind::I8,
                        ..self.format
                    },
                    None => self.format,
                };
                *segment = Some(self.archive.open(&SegmentSpec {
                    name: "raw".to_owned(),
                    start_index: epoch.segment_base,
                    sample_rate: self.sample_rate,
                    format,
                    identifier: self.identifier.clone(),
                })?);
            }
            Stage::Mix {
                dc,
                segments,
                index,
                ..
            } => {
                let len = dc.window_len() as u64;
                let format = SampleFormat {
                    kind: ItemKind::F64,
                    complex: true,
                    subchannels: 1,
                };
                for ch in 0..dc.channels() {
                    segments.push(self.archive.open(&SegmentSpec {
                        name: format!("{:03}", ch),
                        start_index: (epoch.start_index_floor / len).saturating_sub(*index),
                        sample_rate: self.sample_rate / len as f64,
                        format,
                        identifier: self.identifier.clone(),
                    })?);
                }
            }
        }
        Ok(())
    }

    fn close_segments(&mut self) -> Result<(), ArchiveError> {
        match &mut self.stage {
            Stage::Raw { segment, .. } => {
                if let Some(mut segment) = segment.take() {
                    segment.close()?;
                }
            }
            Stage::Mix {
                dc,
                segments,
                index,
                flat,
                ..
            } => {
                if !segments.is_empty() {
                    let partial = dc.take_partial();
                    let flushed = write_blocks(segments, index, flat, &partial);
                    let mut closed = Ok(());
                    for mut segment in segments.drain(..) {
                        if let Err(e) = segment.close() {
                            closed = Err(e);
                        }
                    }
                    flushed?;
                    closed?;
                }
            }
        }
        Ok(())
    }

    /// Close what we can and park the engine in the failed state
    fn fail(&mut self, err: CaptureError) -> CaptureError {
        error!(error = %err, "Capture failed");
        if let Err(e) = self.close_segments() {
            error!(error = %e, "Could not close archive after failure");
        }
        self.state = EngineState::Failed;
        err
    }

    fn write_real(&mut self, data: &[u8]) -> CaptureResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let count = (data.len() / self.format.frame_bytes()) as u64;
        let format = self.format;
        let at = self.cursor.local_index;
        let written = match &mut self.stage {
            Stage::Raw {
                segment,
                narrow,
                scratch,
                ..
            } => match segment {
                Some(segment) => match narrow {
                    Some(scale) => {
                        i16_to_i8(data, *scale, scratch);
                        segment.append(at, scratch, count)
                    }
                    None => segment.append(at, data, count),
                },
                None => Err(ArchiveError::NotOpen),
            },
            Stage::Mix {
                dc,
                segments,
                index,
                values,
                flat,
            } => {
                values.clear();
                format.decode_into(data, values);
                let written = dc.consume(values, |blocks| write_blocks(segments, index, flat, blocks));
                self.stats.decimated = dc.emitted();
                written
            }
        };
        if let Err(e) = written {
            return Err(self.fail(e.into()));
        }
        self.cursor.advance(count);
        self.stats.samples += count;
        Ok(())
    }

    fn backfill(&mut self, gap: u64) -> CaptureResult<()> {
        let mut at = self.cursor.local_index;
        let written = match &mut self.stage {
            Stage::Raw {
                segment,
                narrow,
                zeros,
                ..
            } => match segment {
                Some(segment) => {
                    let frame = match narrow {
                        Some(_) => self.format.frame_bytes() / 2,
                        None => self.format.frame_bytes(),
                    };
                    let chunk = gap.min(ZERO_CHUNK_FRAMES);
                    zeros.resize(chunk as usize * frame, 0);
                    let mut left = gap;
                    let mut written = Ok(());
                    while left > 0 {
                        let n = left.min(chunk);
                        written = segment.append(at, &zeros[..n as usize * frame], n);
                        if written.is_err() {
                            break;
                        }
                        at += n;
                        left -= n;
                    }
                    written
                }
                None => Err(ArchiveError::NotOpen),
            },
            Stage::Mix {
                dc,
                segments,
                index,
                flat,
                ..
            } => {
                let written =
                    dc.consume_placeholders(gap, |blocks| write_blocks(segments, index, flat, blocks));
                self.stats.decimated = dc.emitted();
                written
            }
        };
        if let Err(e) = written {
            return Err(self.fail(e.into()));
        }
        self.cursor.backfill(gap);
        Ok(())
    }
}

impl<A: Archive> Drop for CaptureEngine<A> {
    fn drop(&mut self) {
        if let Err(e) = self.close_segments() {
            error!(error = %e, "Could not close archive on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;

    fn engine(config: CaptureConfig) -> CaptureEngine<MemoryArchive> {
        CaptureEngine::new(&config, MemoryArchive::new()).unwrap()
    }

    #[test]
    fn test_first_batch_needs_marker() {
        let mut e = engine(CaptureConfig::default());
        assert!(matches!(
            e.process(&[0; 16], &[]),
            Err(CaptureError::MissingTimeMarker)
        ));
        assert_eq!(e.state(), EngineState::AwaitingEpoch);
        assert!(e.archive().events().is_empty());
        e.process(&[0; 16], &[TimeMarker::new(0, 10, 0.0)]).unwrap();
        assert_eq!(e.state(), EngineState::Running);
        assert_eq!(e.cursor().local_index, 4);
    }

    #[test]
    fn test_malformed_batch() {
        let mut e = engine(CaptureConfig::default());
        assert!(matches!(
            e.process(&[0; 6], &[TimeMarker::new(0, 10, 0.0)]),
            Err(CaptureError::MalformedBatch { len: 6, frame: 4 })
        ));
    }

    #[test]
    fn test_short_to_char_backfill() {
        let config = CaptureConfig {
            sample_rate: 1000.0,
            scale_to_i8: Some(5),
            ..Default::default()
        };
        let mut e = engine(config);
        let batch: Vec<u8> = [50i16, -50, 25, 10]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        e.process(&batch, &[TimeMarker::new(0, 1, 0.0)]).unwrap();
        // Two frames arrived, the clock says four should have by offset 0 of the next batch
        e.process(&batch, &[TimeMarker::new(0, 1, 0.004)]).unwrap();
        let archive = e.archive();
        assert_eq!(archive.appends("raw"), vec![(0, 2), (2, 2), (4, 2)]);
        assert_eq!(
            archive.bytes("raw"),
            vec![10, 246, 5, 2, 0, 0, 0, 0, 10, 246, 5, 2]
        );
        assert_eq!(e.cursor().total_dropped, 2);
    }

    #[test]
    fn test_negative_gap_is_jitter() {
        let mut e = engine(CaptureConfig {
            sample_rate: 1000.0,
            ..Default::default()
        });
        e.process(&[0; 40], &[TimeMarker::new(0, 1, 0.0)]).unwrap();
        e.process(&[0; 40], &[TimeMarker::new(5, 1, 0.013)]).unwrap();
        assert_eq!(e.cursor().total_dropped, 0);
        assert_eq!(e.cursor().local_index, 20);
        assert_eq!(e.stats().jitter, 1);
    }

    #[test]
    fn test_write_failure_is_fatal_and_closes() {
        let archive = MemoryArchive::failing_after(1);
        let mut e = CaptureEngine::new(&CaptureConfig::default(), archive).unwrap();
        let m = TimeMarker::new(0, 10, 0.0);
        e.process(&[0; 16], &[m]).unwrap();
        assert!(matches!(
            e.process(&[0; 16], &[]),
            Err(CaptureError::WriteFailure(_))
        ));
        assert_eq!(e.state(), EngineState::Failed);
        assert!(e.archive().is_closed("raw"));
        assert!(matches!(e.process(&[0; 16], &[]), Err(CaptureError::NotRunning)));
    }

    #[test]
    fn test_restart_keeps_indices_monotonic() {
        let mut e = engine(CaptureConfig {
            sample_rate: 1000.0,
            item_width: 2,
            complex: false,
            ..Default::default()
        });
        e.process(&[0; 200], &[TimeMarker::new(0, 1, 0.0)]).unwrap();
        e.restart().unwrap();
        assert!(e.archive().is_closed("raw"));
        e.process(&[0; 200], &[TimeMarker::new(0, 5, 0.0)]).unwrap();
        assert_eq!(e.archive().appends("raw"), vec![(0, 100), (100, 100)]);
        let starts: Vec<u64> = e
            .archive()
            .events()
            .iter()
            .filter_map(|ev| match ev {
                crate::archive::ArchiveEvent::Open(s) => Some(s.start_index),
                _ => None,
            })
            .collect();
        // The second segment's base + local index is the true absolute index
        assert_eq!(starts, vec![1000, 4900]);
        assert_eq!(e.stats().restarts, 1);
    }
}
