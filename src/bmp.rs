//! Validation of the raw BMP file carried by CLAIM and UPDATE payloads.
//!
//! The protocol accepts uncompressed 24- or 32-bit BMPs whose declared file
//! size is internally consistent. Width must be positive; a negative height
//! marks a top-down file and is allowed.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

// 14-byte file header followed by a 40-byte BITMAPINFOHEADER.
const MIN_HEADER_SIZE: usize = 54;

/// Dimensions extracted from an accepted BMP. `height` is the absolute value
/// of the (possibly negative) header field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BmpInfo {
    pub width: u32,
    pub height: u32,
    pub top_down: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BmpError {
    #[error("file is {0} bytes, shorter than the 54-byte headers")]
    TooShort(usize),

    #[error("unsupported bit depth {0} (only 24 and 32 are allowed)")]
    BitDepth(u16),

    #[error("compressed BMPs are not allowed (compression {0})")]
    Compressed(u32),

    #[error("dimensions {width}x{height} are not allowed")]
    Dimensions { width: i32, height: i32 },

    #[error("declared file size {declared} does not match computed size {computed}")]
    SizeMismatch { declared: u32, computed: u64 },

    #[error("actual length {actual} does not match declared file size {declared}")]
    LengthMismatch { actual: usize, declared: u32 },
}

/// Checks a raw BMP against the protocol's rules and extracts its dimensions.
pub fn validate(bytes: &[u8]) -> Result<BmpInfo, BmpError> {
    if bytes.len() < MIN_HEADER_SIZE {
        return Err(BmpError::TooShort(bytes.len()));
    }

    let declared_size = LittleEndian::read_u32(&bytes[2..6]);
    let pixel_data_offset = LittleEndian::read_u32(&bytes[10..14]);
    let width = LittleEndian::read_i32(&bytes[18..22]);
    let height = LittleEndian::read_i32(&bytes[22..26]);
    let bits_per_pixel = LittleEndian::read_u16(&bytes[28..30]);
    let compression = LittleEndian::read_u32(&bytes[30..34]);

    if bits_per_pixel != 24 && bits_per_pixel != 32 {
        return Err(BmpError::BitDepth(bits_per_pixel));
    }
    if compression != 0 {
        return Err(BmpError::Compressed(compression));
    }
    // Only the height may be negative (top-down pixel order).
    if width <= 0 || height == 0 {
        return Err(BmpError::Dimensions { width, height });
    }

    // Rows are padded to 4-byte boundaries.
    let bytes_per_pixel = u64::from(bits_per_pixel / 8);
    let stride = (width as u64 * bytes_per_pixel).div_ceil(4) * 4;
    let computed = u64::from(pixel_data_offset) + stride * u64::from(height.unsigned_abs());

    if u64::from(declared_size) != computed {
        return Err(BmpError::SizeMismatch {
            declared: declared_size,
            computed,
        });
    }
    if bytes.len() as u64 != u64::from(declared_size) {
        return Err(BmpError::LengthMismatch {
            actual: bytes.len(),
            declared: declared_size,
        });
    }

    Ok(BmpInfo {
        width: width as u32,
        height: height.unsigned_abs(),
        top_down: height < 0,
    })
}
