//! Binary codec for command payloads.
//!
//! Every fixed-layout payload on the wire is a sequence of big-endian, fixed-width
//! integers and byte arrays. This module keeps the one bincode configuration that
//! produces exactly that layout, so that `u32` fields always take four bytes in network
//! order and arrays carry no length prefix.
//!
//! Variable-length tails (save-RAM, savestates, nicknames in PAUSE) are not encoded with
//! bincode, since bincode would prefix them with a length. Payload types append them
//! raw after the fixed part.
//!
//! # Examples
//!
//! ```
//! use fortress_netplay::network::codec::{decode, encode};
//!
//! let bytes = encode(&0x0102_0304_u32).expect("encoding should succeed");
//! assert_eq!(bytes, [1, 2, 3, 4]);
//!
//! let (value, used): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(value, 0x0102_0304);
//! assert_eq!(used, 4);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Network byte order, no varints.
fn wire_layout() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// A payload that could not be written or read.
///
/// bincode's errors carry no structure worth keeping, so only their text survives.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// A value did not serialize into the fixed layout.
    Encode(String),
    /// The bytes do not hold the expected fixed layout.
    Decode(String),
    /// The payload ended before a fixed-size field.
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(reason) => write!(f, "cannot encode payload: {reason}"),
            Self::Decode(reason) => write!(f, "malformed payload: {reason}"),
            Self::Truncated { needed, available } => {
                write!(f, "payload has {available} bytes, field ends at {needed}")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Shorthand for codec results.
pub type CodecResult<T> = Result<T, CodecError>;

/// Serializes `value` into a fresh buffer.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, wire_layout())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Serializes `value` onto the end of `out` and returns how many bytes it took.
///
/// ```
/// use fortress_netplay::network::codec::encode_append;
///
/// let mut out = vec![0xAA];
/// let added = encode_append(&[1_u32, 2_u32], &mut out).expect("encoding should succeed");
/// assert_eq!(added, 8);
/// assert_eq!(out, [0xAA, 0, 0, 0, 1, 0, 0, 0, 2]);
/// ```
pub fn encode_append<T: Serialize>(value: &T, out: &mut Vec<u8>) -> CodecResult<usize> {
    let before = out.len();
    bincode::serde::encode_into_std_write(value, out, wire_layout())
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out.len() - before)
}

/// Reads a `T` off the front of `bytes`, also returning the length it occupied so the
/// caller can find a raw tail behind it.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, wire_layout())
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Like [`decode`] for payloads without a tail.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    Ok(decode(bytes)?.0)
}

/// Reads one big-endian `u32` at `offset`.
pub fn read_u32(bytes: &[u8], offset: usize) -> CodecResult<u32> {
    let end = offset + 4;
    let slice = bytes.get(offset..end).ok_or(CodecError::Truncated {
        needed: end,
        available: bytes.len(),
    })?;
    decode_value(slice)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Fixed {
        frame: u32,
        devices: [u32; 2],
        nick: [u8; 4],
    }

    #[test]
    fn test_fixed_layout_is_big_endian_without_prefixes() {
        let value = Fixed {
            frame: 7,
            devices: [1, 0x0100],
            nick: *b"ab\0\0",
        };
        let bytes = encode(&value).unwrap();
        assert_eq!(
            bytes,
            [0, 0, 0, 7, 0, 0, 0, 1, 0, 0, 1, 0, b'a', b'b', 0, 0]
        );
        let (decoded, len): (Fixed, _) = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(len, 16);
    }

    #[test]
    fn test_decode_short_input_fails() {
        let result: CodecResult<(u32, _)> = decode(&[0, 1]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_read_u32_bounds() {
        let bytes = [0, 0, 0, 9, 0, 0, 1];
        assert_eq!(read_u32(&bytes, 0).unwrap(), 9);
        assert_eq!(
            read_u32(&bytes, 4),
            Err(CodecError::Truncated {
                needed: 8,
                available: 7
            })
        );
    }

    #[test]
    fn test_truncation_names_both_lengths() {
        let text = CodecError::Truncated {
            needed: 12,
            available: 3,
        }
        .to_string();
        assert!(text.contains("12") && text.contains('3'));
    }

    #[test]
    fn test_decode_reports_consumed_length_for_tails() {
        let mut bytes = encode(&(5_u32, 6_u32)).unwrap();
        bytes.extend_from_slice(b"tail");
        let ((a, b), used): ((u32, u32), _) = decode(&bytes).unwrap();
        assert_eq!((a, b, used), (5, 6, 8));
        assert_eq!(&bytes[used..], b"tail");
    }
}
