//! Construction-time configuration of a capture engine

use std::{ops::Range, path::PathBuf};

use crate::{
    downconvert::{load_coefficients, DC_CALIBRATION_END, DC_CALIBRATION_START},
    error::{CaptureError, CaptureResult},
    format::{ItemKind, SampleFormat},
    gap::GAP_REPAIR_CAP,
};

/// Where the prototype low-pass kernel comes from
#[derive(Clone, Debug, PartialEq)]
pub enum Coefficients {
    /// Raw little-endian f64 file
    File(PathBuf),
    Inline(Vec<f64>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MixConfig {
    pub coefficients: Coefficients,
    /// Window length, which is also the decimation factor
    pub window_len: usize,
    /// One carrier (Hz) per input subchannel
    pub carriers: Vec<f64>,
    /// Decimated samples per archive write
    pub block_size: usize,
    pub calibration: Range<u64>,
    /// Applied to every input value before mixing
    pub input_scale: f64,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            coefficients: Coefficients::Inline(vec![1.0; 100]),
            window_len: 100,
            carriers: vec![0.0, 0.0],
            block_size: 1000,
            calibration: DC_CALIBRATION_START..DC_CALIBRATION_END,
            input_scale: 1.0 / 16384.0,
        }
    }
}

impl MixConfig {
    /// Load the prototype kernel, exactly `window_len` taps
    pub fn taps(&self) -> CaptureResult<Vec<f64>> {
        match &self.coefficients {
            Coefficients::File(path) => load_coefficients(path, self.window_len),
            Coefficients::Inline(taps) if taps.len() == self.window_len => Ok(taps.clone()),
            Coefficients::Inline(taps) => Err(CaptureError::Configuration(format!(
                "{} coefficients given for a window of {}",
                taps.len(),
                self.window_len
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureConfig {
    /// Target directory of the archive
    pub directory: PathBuf,
    /// Bytes per subchannel sample (I and Q together when complex)
    pub item_width: usize,
    pub complex: bool,
    pub subchannels: usize,
    pub subdir_cadence_s: u64,
    pub file_cadence_ms: u64,
    pub sample_rate: f64,
    pub identifier: String,
    pub stop_on_loss: bool,
    pub gap_capacity: u64,
    /// Divide complex int16 input by this and archive it as complex int8
    pub scale_to_i8: Option<i16>,
    pub mix: Option<MixConfig>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            item_width: 4,
            complex: true,
            subchannels: 1,
            subdir_cadence_s: 3600,
            file_cadence_ms: 1000,
            sample_rate: 1e6,
            identifier: "drf_slurper".to_owned(),
            stop_on_loss: false,
            gap_capacity: GAP_REPAIR_CAP,
            scale_to_i8: None,
            mix: None,
        }
    }
}

fn invalid<T>(msg: impl Into<String>) -> CaptureResult<T> {
    Err(CaptureError::Configuration(msg.into()))
}

impl CaptureConfig {
    /// Check the option set is self-consistent and resolve the input format
    pub fn validate(&self) -> CaptureResult<SampleFormat> {
        let format = SampleFormat::from_item_width(self.item_width, self.complex, self.subchannels)?;
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return invalid(format!("sample rate {} must be positive", self.sample_rate));
        }
        if self.subdir_cadence_s == 0 || self.file_cadence_ms == 0 {
            return invalid("subdirectory and file cadences must be non-zero");
        }
        let subdir_ms = match self.subdir_cadence_s.checked_mul(1000) {
            Some(ms) => ms,
            None => {
                return invalid(format!(
                    "subdirectory cadence {} s is too long",
                    self.subdir_cadence_s
                ))
            }
        };
        if subdir_ms % self.file_cadence_ms != 0 {
            return invalid(format!(
                "subdirectory cadence {} s is not a whole number of {} ms files",
                self.subdir_cadence_s, self.file_cadence_ms
            ));
        }
        if self.gap_capacity == 0 {
            return invalid("gap capacity must be non-zero");
        }
        if let Some(scale) = self.scale_to_i8 {
            if !(format.complex && format.kind == ItemKind::I16) {
                return invalid(format!("8-bit conversion needs complex int16 input, got {format}"));
            }
            if scale <= 0 {
                return invalid(format!("8-bit conversion scale {scale} must be positive"));
            }
        }
        if let Some(mix) = &self.mix {
            if format.complex {
                return invalid("the mixing pipeline takes real input");
            }
            if self.scale_to_i8.is_some() {
                return invalid("8-bit conversion only applies to raw capture");
            }
            if mix.carriers.len() != format.subchannels {
                return invalid(format!(
                    "{} carriers for {} subchannels",
                    mix.carriers.len(),
                    format.subchannels
                ));
            }
            if mix.window_len == 0 || mix.block_size == 0 {
                return invalid("window length and output block size must be non-zero");
            }
            if mix.calibration.start > mix.calibration.end {
                return invalid("DC calibration window ends before it starts");
            }
        }
        Ok(format)
    }
}
