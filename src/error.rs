//! Error types for the capture engine and its archive collaborator

use thiserror::Error;

/// Failures reported by an archive writer
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment is not open")]
    NotOpen,
    #[error("append at index {got} would move backwards (next free index is {expected})")]
    OutOfOrder { expected: u64, got: u64 },
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Bad configuration, the run must not start
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// A single gap is larger than we are able to backfill
    #[error("dropped {gap} samples, more than the backfill capacity of {capacity}")]
    GapExceedsCapacity { gap: u64, capacity: u64 },
    /// Any non-success from the archive is fatal
    #[error("archive write failed: {0}")]
    WriteFailure(#[from] ArchiveError),
    #[error("first batch of a run carried no time marker")]
    MissingTimeMarker,
    #[error("engine is not running")]
    NotRunning,
    #[error("batch of {len} bytes is not a whole number of {frame}-byte frames")]
    MalformedBatch { len: usize, frame: usize },
}

pub type CaptureResult<T> = Result<T, CaptureError>;
