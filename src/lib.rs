//! Continuous capture of timestamped RF sample streams into a time-addressable archive.
//!
//! Batches of raw samples arrive with sparse hardware time markers. The engine turns
//! those markers into an absolute sample index, notices when the hardware dropped
//! samples, backfills (or stops, or gives up), and then writes the in-sequence samples
//! to the archive, either as they are or downconverted and decimated.

pub mod archive;
pub mod complex;
pub mod config;
pub mod downconvert;
pub mod engine;
pub mod error;
pub mod format;
pub mod gap;
pub mod monitoring;
pub mod timebase;

pub use config::{CaptureConfig, Coefficients, MixConfig};
pub use engine::{BatchOutcome, CaptureEngine, EngineState};
pub use error::{ArchiveError, CaptureError};
pub use timebase::TimeMarker;
