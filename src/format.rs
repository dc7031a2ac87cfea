//! Sample format descriptors and byte-level conversions

use std::fmt;

use num_traits::AsPrimitive;

use crate::error::{CaptureError, CaptureResult};

/// Scalar type of each real component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemKind {
    I8,
    I16,
    F32,
    F64,
}

impl ItemKind {
    /// Bytes per component
    pub fn width(self) -> usize {
        match self {
            ItemKind::I8 => 1,
            ItemKind::I16 => 2,
            ItemKind::F32 => 4,
            ItemKind::F64 => 8,
        }
    }
}

/// Layout of one frame of the incoming stream: `subchannels` samples, each real or I/Q
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleFormat {
    pub kind: ItemKind,
    pub complex: bool,
    pub subchannels: usize,
}

impl SampleFormat {
    /// Resolve an item byte-width (per subchannel sample, both I and Q when complex)
    pub fn from_item_width(width: usize, complex: bool, subchannels: usize) -> CaptureResult<Self> {
        let kind = match (complex, width) {
            (true, 2) | (false, 1) => ItemKind::I8,
            (true, 4) | (false, 2) => ItemKind::I16,
            (true, 8) | (false, 4) => ItemKind::F32,
            (true, 16) | (false, 8) => ItemKind::F64,
            _ => {
                return Err(CaptureError::Configuration(format!(
                    "item width {} not supported for {} samples",
                    width,
                    if complex { "complex" } else { "real" }
                )))
            }
        };
        if subchannels == 0 {
            return Err(CaptureError::Configuration(
                "subchannel count must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            kind,
            complex,
            subchannels,
        })
    }

    /// Bytes per subchannel sample
    pub fn item_width(&self) -> usize {
        self.kind.width() * if self.complex { 2 } else { 1 }
    }

    /// Bytes per frame (one sample of every subchannel)
    pub fn frame_bytes(&self) -> usize {
        self.item_width() * self.subchannels
    }

    /// Scalar components per frame
    pub fn components(&self) -> usize {
        self.subchannels * if self.complex { 2 } else { 1 }
    }

    /// Decode little-endian components to f64, appending to `out`
    pub fn decode_into(&self, bytes: &[u8], out: &mut Vec<f64>) {
        match self.kind {
            ItemKind::I8 => decode(bytes, out, i8::from_le_bytes),
            ItemKind::I16 => decode(bytes, out, i16::from_le_bytes),
            ItemKind::F32 => decode(bytes, out, f32::from_le_bytes),
            ItemKind::F64 => decode(bytes, out, f64::from_le_bytes),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ItemKind::I8 => "i8",
            ItemKind::I16 => "i16",
            ItemKind::F32 => "f32",
            ItemKind::F64 => "f64",
        };
        write!(
            f,
            "{}{} x{}",
            if self.complex { "c" } else { "r" },
            kind,
            self.subchannels
        )
    }
}

fn decode<T, const N: usize>(bytes: &[u8], out: &mut Vec<f64>, from: fn([u8; N]) -> T)
where
    T: AsPrimitive<f64>,
{
    out.extend(bytes.chunks_exact(N).map(|c| {
        let mut word = [0u8; N];
        word.copy_from_slice(c);
        from(word).as_()
    }));
}

/// Squash complex int16 components down to int8 by integer division with `scale`.
/// Out-of-range quotients wrap, the same as a C narrowing cast.
pub fn i16_to_i8(input: &[u8], scale: i16, out: &mut Vec<u8>) {
    out.clear();
    out.extend(input.chunks_exact(2).map(|c| {
        let v = i16::from_le_bytes([c[0], c[1]]);
        (v / scale) as i8 as u8
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_widths() {
        let f = SampleFormat::from_item_width(4, true, 1).unwrap();
        assert_eq!(f.kind, ItemKind::I16);
        assert_eq!(f.frame_bytes(), 4);
        let f = SampleFormat::from_item_width(2, false, 2).unwrap();
        assert_eq!(f.kind, ItemKind::I16);
        assert_eq!(f.frame_bytes(), 4);
        assert_eq!(f.components(), 2);
        let f = SampleFormat::from_item_width(16, true, 3).unwrap();
        assert_eq!(f.frame_bytes(), 48);
    }

    #[test]
    fn test_unsupported_width() {
        assert!(matches!(
            SampleFormat::from_item_width(1, true, 1),
            Err(CaptureError::Configuration(_))
        ));
        assert!(SampleFormat::from_item_width(3, false, 1).is_err());
        assert!(SampleFormat::from_item_width(2, false, 0).is_err());
    }

    #[test]
    fn test_decode_i16() {
        let f = SampleFormat::from_item_width(2, false, 2).unwrap();
        let bytes: Vec<u8> = [-3i16, 1000].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = vec![];
        f.decode_into(&bytes, &mut out);
        assert_eq!(out, vec![-3.0, 1000.0]);
    }

    #[test]
    fn test_i16_to_i8() {
        let bytes: Vec<u8> = [10i16, -12, 640, 3]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut out = vec![];
        i16_to_i8(&bytes, 5, &mut out);
        // 640 / 5 = 128 wraps to -128
        assert_eq!(out, vec![2u8, (-2i8) as u8, (-128i8) as u8, 0]);
    }
}
