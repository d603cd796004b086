//! Parser for the UBB OP_RETURN payload.
//!
//! Wire format, byte-exact:
//!
//! ```text
//! offset  size  field
//! 0       2     magic           0x13 0x37
//! 2       1     version         0x01
//! 3       1     type            0x01 CLAIM | 0x02 RETRY-CLAIM | 0x03 UPDATE | 0x04 TRANSFER
//! 4       2     x0              u16 little-endian
//! 6       2     y0              u16 little-endian
//! 8..     var   CLAIM/UPDATE: URI (definite-length CBOR text), then the BMP
//!               file occupying the remainder of the payload
//! ```
//!
//! The parser does no semantic validation: coordinates, deed flow and BMP
//! acceptance are judged by the state-transition function.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// The two magic bytes every UBB payload starts with.
pub const UBB_MAGIC: [u8; 2] = [0x13, 0x37];

/// The only protocol version this indexer understands.
pub const PROTOCOL_VERSION: u8 = 0x01;

const TYPE_CLAIM: u8 = 0x01;
const TYPE_RETRY_CLAIM: u8 = 0x02;
const TYPE_UPDATE: u8 = 0x03;
const TYPE_TRANSFER: u8 = 0x04;

/// A successfully parsed payload. All branching in the transition function is
/// on this tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Claim {
        x0: u16,
        y0: u16,
        uri: String,
        bmp: Vec<u8>,
    },
    RetryClaim {
        x0: u16,
        y0: u16,
    },
    Update {
        x0: u16,
        y0: u16,
        uri: String,
        bmp: Vec<u8>,
    },
    /// Coordinates are present on the wire but carry no meaning.
    Transfer,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is {0} bytes, shorter than the 8-byte fixed header")]
    Truncated(usize),

    #[error("{0}")]
    Invalid(&'static str),
}

/// Parses the bytes pushed by a UBB OP_RETURN.
pub fn parse(bytes: &[u8]) -> Result<Payload, PayloadError> {
    if bytes.len() < 8 {
        return Err(PayloadError::Truncated(bytes.len()));
    }
    if bytes[0..2] != UBB_MAGIC {
        return Err(PayloadError::Invalid("wrong magic"));
    }
    if bytes[2] != PROTOCOL_VERSION {
        return Err(PayloadError::Invalid("unsupported version"));
    }

    let x0 = LittleEndian::read_u16(&bytes[4..6]);
    let y0 = LittleEndian::read_u16(&bytes[6..8]);

    match bytes[3] {
        TYPE_CLAIM => {
            let (uri, bmp) = parse_uri_and_bmp(&bytes[8..])?;
            Ok(Payload::Claim { x0, y0, uri, bmp })
        }
        TYPE_RETRY_CLAIM => Ok(Payload::RetryClaim { x0, y0 }),
        TYPE_UPDATE => {
            let (uri, bmp) = parse_uri_and_bmp(&bytes[8..])?;
            Ok(Payload::Update { x0, y0, uri, bmp })
        }
        // Trailing bytes after the fixed header are ignored for transfers.
        TYPE_TRANSFER => Ok(Payload::Transfer),
        _ => Err(PayloadError::Invalid("unknown payload type")),
    }
}

// The URI is a CBOR text string; the BMP starts immediately after its last
// byte and runs to the end of the payload.
fn parse_uri_and_bmp(rest: &[u8]) -> Result<(String, Vec<u8>), PayloadError> {
    let (uri_bytes, consumed) = cbor_text(rest)?;

    // UTF-8 is checked on the raw bytes, which rejects overlong encodings and
    // surrogates by construction.
    let uri = std::str::from_utf8(uri_bytes)
        .map_err(|_| PayloadError::Invalid("URI is not valid UTF-8"))?;
    if uri.contains('\u{0}') {
        return Err(PayloadError::Invalid("URI contains a NUL code point"));
    }

    let bmp = &rest[consumed..];
    if bmp.is_empty() {
        return Err(PayloadError::Invalid("payload carries no BMP"));
    }

    Ok((uri.to_string(), bmp.to_vec()))
}

// Decodes the header of a definite-length CBOR text string (major type 3) and
// returns the text bytes plus the total bytes consumed. The encoded length is
// derived from the header alone; 8-byte lengths (additional info 27) and
// indefinite-length strings (31) are rejected.
fn cbor_text(bytes: &[u8]) -> Result<(&[u8], usize), PayloadError> {
    let initial = *bytes
        .first()
        .ok_or(PayloadError::Invalid("missing URI"))?;
    if initial >> 5 != 3 {
        return Err(PayloadError::Invalid("URI is not a CBOR text string"));
    }

    let (len, header_len) = match initial & 0x1f {
        info @ 0..=23 => (info as u64, 1),
        24 => match bytes.get(1) {
            Some(&b) => (b as u64, 2),
            None => return Err(PayloadError::Invalid("URI length header is truncated")),
        },
        25 => match bytes.get(1..3) {
            Some(b) => (u16::from_be_bytes([b[0], b[1]]) as u64, 3),
            None => return Err(PayloadError::Invalid("URI length header is truncated")),
        },
        26 => match bytes.get(1..5) {
            Some(b) => (u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64, 5),
            None => return Err(PayloadError::Invalid("URI length header is truncated")),
        },
        27 => return Err(PayloadError::Invalid("8-byte URI length is not allowed")),
        31 => {
            return Err(PayloadError::Invalid(
                "indefinite-length URI is not allowed",
            ))
        }
        _ => return Err(PayloadError::Invalid("reserved CBOR additional info")),
    };

    let end = (header_len as u64)
        .checked_add(len)
        .filter(|end| *end <= bytes.len() as u64)
        .ok_or(PayloadError::Invalid("URI length exceeds payload"))? as usize;

    Ok((&bytes[header_len..end], end))
}
