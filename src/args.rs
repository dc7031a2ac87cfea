//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;
use drf_slurper::{
    config::{CaptureConfig, Coefficients, MixConfig},
    downconvert::{DC_CALIBRATION_END, DC_CALIBRATION_START},
    gap::GAP_REPAIR_CAP,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Recorded raw sample stream to replay
    pub input: PathBuf,
    /// Marker log, one `position seconds fraction` per line
    #[clap(short, long)]
    pub markers: PathBuf,
    /// Archive target directory
    #[clap(short, long, default_value = ".")]
    pub directory: PathBuf,
    /// Bytes per sample of one subchannel (I and Q together for complex)
    #[clap(long, default_value_t = 4)]
    pub item_width: usize,
    /// Samples are real rather than interleaved I/Q
    #[clap(long)]
    pub real: bool,
    /// Subchannels interleaved in every frame
    #[clap(long, default_value_t = 1)]
    pub subchannels: usize,
    /// Seconds of data per archive subdirectory
    #[clap(long, default_value_t = 3600)]
    pub subdir_cadence: u64,
    /// Milliseconds of data per archive file
    #[clap(long, default_value_t = 1000)]
    pub file_cadence: u64,
    /// Sample rate in Hz
    #[clap(short = 'r', long, default_value_t = 1e6)]
    pub sample_rate: f64,
    /// Identifier pairing this archive with its metadata
    #[clap(long, default_value = "drf_slurper")]
    pub uuid: String,
    /// Stop cleanly on the first dropped sample instead of backfilling
    #[clap(long)]
    pub stop_on_dropped: bool,
    /// Largest gap (in samples) we'll backfill
    #[clap(long, default_value_t = GAP_REPAIR_CAP)]
    pub gap_capacity: u64,
    /// Archive complex int16 as complex int8, dividing by this scale
    #[clap(long, value_name = "SCALE")]
    pub short_to_char: Option<i16>,
    /// Downconvert with the little-endian f64 filter taps in this file
    #[clap(long)]
    pub filter: Option<PathBuf>,
    /// Filter window length, also the decimation factor
    #[clap(long, default_value_t = 100)]
    pub window_len: usize,
    /// Carrier frequency (Hz) per subchannel
    #[clap(short = 'f', long = "carrier", allow_hyphen_values = true)]
    pub carriers: Vec<f64>,
    /// Decimated samples per archive write
    #[clap(long, default_value_t = 1000)]
    pub block_size: usize,
    /// First input sample of the DC calibration window
    #[clap(long, default_value_t = DC_CALIBRATION_START)]
    pub dc_start: u64,
    /// End (exclusive) of the DC calibration window
    #[clap(long, default_value_t = DC_CALIBRATION_END)]
    pub dc_end: u64,
    /// Multiplier applied to input values before mixing
    #[clap(long, default_value_t = 1.0 / 16384.0)]
    pub input_scale: f64,
    /// Frames per delivered batch
    #[clap(short, long, default_value_t = 10_000)]
    pub batch_size: usize,
    /// Batch channel capacity
    #[clap(short, long, default_value_t = 256)]
    pub capacity: usize,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            directory: self.directory.clone(),
            item_width: self.item_width,
            complex: !self.real,
            subchannels: self.subchannels,
            subdir_cadence_s: self.subdir_cadence,
            file_cadence_ms: self.file_cadence,
            sample_rate: self.sample_rate,
            identifier: self.uuid.clone(),
            stop_on_loss: self.stop_on_dropped,
            gap_capacity: self.gap_capacity,
            scale_to_i8: self.short_to_char,
            mix: self.filter.as_ref().map(|path| MixConfig {
                coefficients: Coefficients::File(path.clone()),
                window_len: self.window_len,
                carriers: self.carriers.clone(),
                block_size: self.block_size,
                calibration: self.dc_start..self.dc_end,
                input_scale: self.input_scale,
            }),
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixing_args() {
        let args = Args::parse_from([
            "drf_slurper",
            "in.bin",
            "-m",
            "markers.txt",
            "--real",
            "--item-width",
            "2",
            "--subchannels",
            "2",
            "--filter",
            "taps.bin",
            "-f",
            "12.5e6",
            "-f",
            "-3e6",
        ]);
        let config = args.capture_config();
        assert!(!config.complex);
        let mix = config.mix.unwrap();
        assert_eq!(mix.carriers, vec![12.5e6, -3e6]);
        assert_eq!(mix.calibration, DC_CALIBRATION_START..DC_CALIBRATION_END);
    }

    #[test]
    fn test_raw_defaults() {
        let args = Args::parse_from(["drf_slurper", "in.bin", "-m", "markers.txt"]);
        let config = args.capture_config();
        assert!(config.mix.is_none());
        assert!(config.validate().is_ok());
    }
}
