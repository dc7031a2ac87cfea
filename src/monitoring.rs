//! Runtime stats for a capture: how much came in, how much was lost and repaired.

use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub batches: u64,
    /// Real samples received from the host
    pub samples: u64,
    /// Markers that reported loss
    pub gaps: u64,
    pub backfilled: u64,
    /// Markers that came in early (negative gap), ignored
    pub jitter: u64,
    /// Decimated samples per channel, mixing pipeline only
    pub decimated: u64,
    pub restarts: u64,
}

impl fmt::Display for CaptureStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} batches, {} samples, {} gaps ({} samples backfilled), {} jittered markers",
            self.batches, self.samples, self.gaps, self.backfilled, self.jitter
        )?;
        if self.decimated > 0 {
            write!(f, ", {} decimated samples", self.decimated)?;
        }
        if self.restarts > 0 {
            write!(f, ", {} restarts", self.restarts)?;
        }
        Ok(())
    }
}
