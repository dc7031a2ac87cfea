//! Quadrature downconversion and decimation.
//!
//! For each input channel we
//! * remove the DC bias estimated over a calibration window
//! * multiply by the carrier phasor and the carrier-modulated window taps
//! * sum a whole window with compensated addition
//! * emit one decimated sample per window
//!
//! Window length and decimation factor are the same thing here: the window is
//! never overlapped, so every `L` inputs make exactly one output.

use std::{fs, ops::Range, path::Path};

use num_complex::Complex64;
use tracing::info;

use crate::{
    complex::{phasor, renormalize, KahanSum},
    error::{CaptureError, CaptureResult},
};

/// Default start of the DC calibration window, in input samples
pub const DC_CALIBRATION_START: u64 = 25_000_000;
/// Default end (exclusive) of the DC calibration window, in input samples
pub const DC_CALIBRATION_END: u64 = 250_000_000;

/// Read `len` little-endian f64 taps from a file
pub fn load_coefficients(path: &Path, len: usize) -> CaptureResult<Vec<f64>> {
    let bytes = fs::read(path).map_err(|e| {
        CaptureError::Configuration(format!(
            "can't read filter coefficients from {}: {}",
            path.display(),
            e
        ))
    })?;
    if bytes.len() < len * 8 {
        return Err(CaptureError::Configuration(format!(
            "filter file {} holds {} coefficients, window needs {}",
            path.display(),
            bytes.len() / 8,
            len
        )));
    }
    Ok(bytes[..len * 8]
        .chunks_exact(8)
        .map(|c| {
            let mut word = [0u8; 8];
            word.copy_from_slice(c);
            f64::from_le_bytes(word)
        })
        .collect())
}

#[derive(Clone, Debug, Default, PartialEq)]
struct DcCalibration {
    offset: f64,
    sum: f64,
    count: u64,
}

/// Mixer state of one output channel
#[derive(Clone, Debug)]
pub struct ChannelMixer {
    phase: Complex64,
    phase_increment: Complex64,
    window: Vec<Complex64>,
    window_position: usize,
    dc: DcCalibration,
    acc: KahanSum,
}

impl ChannelMixer {
    /// `taps` is the shared low-pass prototype, rotated here onto `carrier` (Hz)
    pub fn new(taps: &[f64], carrier: f64, sample_rate: f64) -> Self {
        let window = taps
            .iter()
            .enumerate()
            .map(|(i, c)| phasor(carrier * i as f64 / sample_rate) * *c)
            .collect();
        Self {
            phase: Complex64::new(1.0, 0.0),
            phase_increment: phasor(carrier * taps.len() as f64 / sample_rate),
            window,
            window_position: 0,
            dc: DcCalibration::default(),
            acc: KahanSum::default(),
        }
    }

    pub fn phase(&self) -> Complex64 {
        self.phase
    }

    pub fn dc_offset(&self) -> f64 {
        self.dc.offset
    }

    /// Samples accumulated into the unfinished window
    pub fn window_position(&self) -> usize {
        self.window_position
    }

    /// Drop the unfinished window and rewind the carrier phase. DC calibration is kept.
    fn restart(&mut self) -> usize {
        let discarded = self.window_position;
        self.window_position = 0;
        self.acc = KahanSum::default();
        self.phase = Complex64::new(1.0, 0.0);
        discarded
    }

    /// Feed one sample taken at input index `index`. `None` is a placeholder for a
    /// lost sample: it keeps the window and phase aligned but contributes nothing.
    /// Returns the decimated output when this sample completes a window.
    #[inline]
    fn step(&mut self, index: u64, sample: Option<f64>, cal: &Range<u64>) -> Option<Complex64> {
        if let Some(s) = sample {
            if cal.contains(&index) {
                self.dc.sum += s;
                self.dc.count += 1;
            }
        }
        if index == cal.end && self.dc.count > 0 {
            self.dc.offset = self.dc.sum / self.dc.count as f64;
            info!(offset = self.dc.offset, samples = self.dc.count, "DC offset determined");
        }
        if let Some(s) = sample {
            let x = Complex64::new(s - self.dc.offset, 0.0);
            self.acc.add(x * self.phase * self.window[self.window_position]);
        }
        self.window_position += 1;
        if self.window_position == self.window.len() {
            self.window_position = 0;
            self.phase = renormalize(self.phase * self.phase_increment);
            Some(self.acc.take())
        } else {
            None
        }
    }
}

/// Mix-and-decimate stage over all subchannels of the stream
#[derive(Clone, Debug)]
pub struct Downconverter {
    mixers: Vec<ChannelMixer>,
    calibration: Range<u64>,
    input_scale: f64,
    block_size: usize,
    blocks: Vec<Vec<Complex64>>,
    sample_index: u64,
    emitted: u64,
}

impl Downconverter {
    /// Build one mixer per carrier from a prototype kernel.
    ///
    /// The kernel is scaled to unit DC gain, so a boxcar yields the window mean.
    pub fn new(
        prototype: &[f64],
        carriers: &[f64],
        sample_rate: f64,
        block_size: usize,
        calibration: Range<u64>,
        input_scale: f64,
    ) -> CaptureResult<Self> {
        if prototype.is_empty() {
            return Err(CaptureError::Configuration(
                "window length must be at least 1".to_owned(),
            ));
        }
        if carriers.is_empty() || block_size == 0 {
            return Err(CaptureError::Configuration(
                "need at least one carrier and a non-zero output block size".to_owned(),
            ));
        }
        let gain: f64 = prototype.iter().sum();
        let taps: Vec<f64> = if gain.abs() > f64::EPSILON {
            prototype.iter().map(|c| c / gain).collect()
        } else {
            prototype.to_vec()
        };
        Ok(Self {
            mixers: carriers
                .iter()
                .map(|f| ChannelMixer::new(&taps, *f, sample_rate))
                .collect(),
            calibration,
            input_scale,
            block_size,
            blocks: vec![Vec::with_capacity(block_size); carriers.len()],
            sample_index: 0,
            emitted: 0,
        })
    }

    pub fn channels(&self) -> usize {
        self.mixers.len()
    }

    pub fn window_len(&self) -> usize {
        self.mixers[0].window.len()
    }

    pub fn mixer(&self, channel: usize) -> &ChannelMixer {
        &self.mixers[channel]
    }

    /// Decimated samples produced per channel so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Hand back the unfinished output block of every channel, leaving them empty
    pub fn take_partial(&mut self) -> Vec<Vec<Complex64>> {
        self.blocks
            .iter_mut()
            .map(|b| std::mem::replace(b, Vec::with_capacity(self.block_size)))
            .collect()
    }

    /// Line every channel up to start a new window at the next input sample.
    /// Returns how many input samples of the unfinished window were dropped.
    pub fn restart_windows(&mut self) -> usize {
        self.mixers
            .iter_mut()
            .map(ChannelMixer::restart)
            .max()
            .unwrap_or(0)
    }

    /// Feed interleaved frames, one value per channel. `on_block` gets every
    /// completed output block (one slice per channel).
    pub fn consume<E, F>(&mut self, values: &[f64], mut on_block: F) -> Result<(), E>
    where
        F: FnMut(&[Vec<Complex64>]) -> Result<(), E>,
    {
        for frame in values.chunks_exact(self.mixers.len()) {
            self.push(Some(frame), &mut on_block)?;
        }
        Ok(())
    }

    /// Feed `frames` placeholder frames standing in for lost samples
    pub fn consume_placeholders<E, F>(&mut self, frames: u64, mut on_block: F) -> Result<(), E>
    where
        F: FnMut(&[Vec<Complex64>]) -> Result<(), E>,
    {
        for _ in 0..frames {
            self.push(None, &mut on_block)?;
        }
        Ok(())
    }

    fn push<E, F>(&mut self, frame: Option<&[f64]>, on_block: &mut F) -> Result<(), E>
    where
        F: FnMut(&[Vec<Complex64>]) -> Result<(), E>,
    {
        let index = self.sample_index;
        let mut complete = false;
        for (ch, mixer) in self.mixers.iter_mut().enumerate() {
            let sample = frame.map(|f| f[ch] * self.input_scale);
            if let Some(out) = mixer.step(index, sample, &self.calibration) {
                self.blocks[ch].push(out);
                complete = true;
            }
        }
        self.sample_index += 1;
        if complete {
            self.emitted += 1;
            if self.blocks[0].len() == self.block_size {
                on_block(&self.blocks)?;
                self.blocks.iter_mut().for_each(Vec::clear);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn collect(dc: &mut Downconverter, values: &[f64]) -> Vec<Vec<Complex64>> {
        let mut out = vec![vec![]; dc.channels()];
        dc.consume(values, |blocks| {
            for (o, b) in out.iter_mut().zip(blocks) {
                o.extend_from_slice(b);
            }
            Ok::<_, ()>(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_boxcar_is_mean() {
        let mut rng = rand::thread_rng();
        let mut dc = Downconverter::new(&[1.0; 16], &[0.0], 1e6, 4, 0..0, 1.0).unwrap();
        let input: Vec<f64> = (0..16 * 8).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let out = collect(&mut dc, &input);
        assert_eq!(out[0].len(), 8);
        for (chunk, y) in input.chunks_exact(16).zip(&out[0]) {
            let mean = chunk.iter().sum::<f64>() / 16.0;
            assert!((y.re - mean).abs() < 1e-12);
            assert!(y.im.abs() < 1e-12);
        }
    }

    #[test]
    fn test_dc_calibration() {
        let v = 0.37;
        let mut dc = Downconverter::new(&[1.0; 4], &[0.0, 1000.0], 1e6, 10, 8..808, 1.0).unwrap();
        let input = vec![v; 2 * 1200];
        let out = collect(&mut dc, &input);
        for ch in 0..2 {
            let off = dc.mixer(ch).dc_offset();
            assert!((off - v).abs() / v < 1e-3);
        }
        // Once calibrated the constant input is removed entirely
        assert!(out[0][250..].iter().all(|y| y.norm() < 1e-12));
    }

    #[test]
    fn test_placeholders_skip_calibration() {
        let mut dc = Downconverter::new(&[1.0; 2], &[0.0], 1e6, 1, 0..10, 1.0).unwrap();
        dc.consume_placeholders(5, |_| Ok::<_, ()>(())).unwrap();
        let out = collect(&mut dc, &[2.0; 10]);
        assert_eq!(dc.mixer(0).dc_offset(), 2.0);
        assert_eq!(dc.emitted(), 7);
        assert_eq!(out[0].len(), 5);
    }

    #[test]
    fn test_restart_drops_unfinished_window() {
        let mut dc = Downconverter::new(&[1.0; 4], &[0.0, 100_000.0], 1e6, 8, 0..0, 1.0).unwrap();
        collect(&mut dc, &[1.0; 12]);
        assert_eq!(dc.mixer(0).window_position(), 2);
        assert_ne!(dc.mixer(1).phase(), Complex64::new(1.0, 0.0));

        assert_eq!(dc.restart_windows(), 2);
        for ch in 0..2 {
            assert_eq!(dc.mixer(ch).window_position(), 0);
            assert_eq!(dc.mixer(ch).phase(), Complex64::new(1.0, 0.0));
        }
        // The next window holds only new samples
        let out = collect(&mut dc, &[5.0, 0.0, 5.0, 0.0, 5.0, 0.0, 5.0, 0.0]);
        assert_eq!(out[0].len(), 0);
        assert_eq!(dc.take_partial()[0][1], Complex64::new(5.0, 0.0));
    }

    #[test]
    fn test_phase_stays_on_unit_circle() {
        let mut dc = Downconverter::new(&[1.0], &[123_456.789, -7.3], 1e6, 1000, 0..0, 1.0).unwrap();
        dc.consume_placeholders(1_000_000, |_| Ok::<_, ()>(())).unwrap();
        assert_eq!(dc.emitted(), 1_000_000);
        for ch in 0..2 {
            assert!((dc.mixer(ch).phase().norm() - 1.0).abs() < 1e-9);
        }
        // And the angle still tracks the carrier
        let expected = phasor(123_456.789 * 1e6 / 1e6);
        assert!((dc.mixer(0).phase() - expected).norm() < 1e-6);
    }

    #[test]
    fn test_tone_lands_at_dc() {
        // A cosine at the carrier comes out as a constant of half its amplitude
        let (rate, f0, l) = (1e6, 62_500.0, 64);
        let mut dc = Downconverter::new(&vec![1.0; l], &[-f0], rate, 8, 0..0, 1.0).unwrap();
        let input: Vec<f64> = (0..l * 8)
            .map(|n| (2.0 * std::f64::consts::PI * f0 * n as f64 / rate).cos())
            .collect();
        let out = collect(&mut dc, &input);
        for y in &out[0] {
            assert!((y.norm() - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn test_truncated_coefficients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taps.bin");
        let bytes: Vec<u8> = [0.5f64, 0.25, 0.25]
            .iter()
            .flat_map(|c| c.to_le_bytes())
            .collect();
        fs::write(&path, bytes).unwrap();
        assert_eq!(load_coefficients(&path, 3).unwrap(), vec![0.5, 0.25, 0.25]);
        assert!(matches!(
            load_coefficients(&path, 4),
            Err(CaptureError::Configuration(_))
        ));
        assert!(load_coefficients(&dir.path().join("missing"), 1).is_err());
    }
}
