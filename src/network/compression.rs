//! Savestate transcoders.
//!
//! Savestates are the only payloads large enough to be worth compressing. Each side
//! advertises a capability bitmask in its handshake header; the transcoder used on a
//! connection is picked from the intersection, preferring zlib.
//!
//! ```
//! use fortress_netplay::network::compression::{Compression, COMPRESSION_ZLIB};
//!
//! let codec = Compression::negotiate(COMPRESSION_ZLIB, COMPRESSION_ZLIB);
//! assert_eq!(codec, Compression::Zlib);
//!
//! let state = vec![7_u8; 4096];
//! let mut packed = Vec::new();
//! codec.compress(&state, &mut packed).expect("compress");
//! assert!(packed.len() < state.len());
//!
//! let mut restored = vec![0_u8; state.len()];
//! codec.decompress(&packed, &mut restored).expect("decompress");
//! assert_eq!(restored, state);
//! ```

use std::error::Error;
use std::fmt;
use std::io::{Read, Write};

/// Capability bit for zlib.
pub const COMPRESSION_ZLIB: u32 = 1;

/// Every capability this build supports.
pub const COMPRESSION_SUPPORTED: u32 = COMPRESSION_ZLIB;

/// Error type for compression and decompression operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressionError {
    /// The deflate stream could not be produced.
    Deflate(String),
    /// The compressed data is not a valid zlib stream.
    Inflate(String),
    /// The data inflated to a different size than announced.
    SizeMismatch {
        /// Size announced by the sender.
        expected: usize,
        /// Size actually produced.
        actual: usize,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deflate(reason) => write!(f, "deflate failed: {reason}"),
            Self::Inflate(reason) => write!(f, "corrupt zlib stream: {reason}"),
            Self::SizeMismatch { expected, actual } => {
                write!(
                    f,
                    "inflated size mismatch: expected {expected} bytes, got {actual}"
                )
            },
        }
    }
}

impl Error for CompressionError {}

/// The transcoder negotiated for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    /// Bytes are sent as-is.
    #[default]
    Nil,
    /// zlib (RFC 1950) at the default level.
    Zlib,
}

impl Compression {
    /// Picks the best transcoder both masks support.
    #[must_use]
    pub fn negotiate(local_mask: u32, remote_mask: u32) -> Self {
        if local_mask & remote_mask & COMPRESSION_ZLIB != 0 {
            Compression::Zlib
        } else {
            Compression::Nil
        }
    }

    /// Upper bound on the compressed size of `len` input bytes.
    ///
    /// Used to size the receive limit for LOAD_SAVESTATE.
    #[must_use]
    pub fn max_compressed_len(len: usize) -> usize {
        // zlib's compressBound.
        len + (len >> 12) + (len >> 14) + (len >> 25) + 13
    }

    /// Appends the encoded form of `src` to `out`.
    pub fn compress(&self, src: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError> {
        match self {
            Compression::Nil => {
                out.extend_from_slice(src);
                Ok(())
            },
            Compression::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(out, flate2::Compression::default());
                encoder
                    .write_all(src)
                    .map_err(|err| CompressionError::Deflate(err.to_string()))?;
                encoder
                    .finish()
                    .map_err(|err| CompressionError::Deflate(err.to_string()))?;
                Ok(())
            },
        }
    }

    /// Decodes `src` into `out`, which must end up exactly filled.
    pub fn decompress(&self, src: &[u8], out: &mut [u8]) -> Result<(), CompressionError> {
        match self {
            Compression::Nil => {
                if src.len() != out.len() {
                    return Err(CompressionError::SizeMismatch {
                        expected: out.len(),
                        actual: src.len(),
                    });
                }
                out.copy_from_slice(src);
                Ok(())
            },
            Compression::Zlib => {
                let expected = out.len();
                // One extra byte lets us detect a stream that inflates too large.
                let mut inflated = Vec::with_capacity(expected + 1);
                flate2::read::ZlibDecoder::new(src)
                    .take(expected as u64 + 1)
                    .read_to_end(&mut inflated)
                    .map_err(|err| CompressionError::Inflate(err.to_string()))?;
                if inflated.len() != expected {
                    return Err(CompressionError::SizeMismatch {
                        expected,
                        actual: inflated.len(),
                    });
                }
                out.copy_from_slice(&inflated);
                Ok(())
            },
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Nil => write!(f, "none"),
            Compression::Zlib => write!(f, "zlib"),
        }
    }
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

    #[test]
    fn test_negotiate_prefers_zlib_only_when_both_support_it() {
        assert_eq!(Compression::negotiate(1, 1), Compression::Zlib);
        assert_eq!(Compression::negotiate(1, 0), Compression::Nil);
        assert_eq!(Compression::negotiate(0, 1), Compression::Nil);
        assert_eq!(Compression::negotiate(0b110, 0b110), Compression::Nil);
    }

    #[test]
    fn test_nil_is_identity() {
        let data: Vec<u8> = (0..=255).collect();
        let mut packed = Vec::new();
        Compression::Nil.compress(&data, &mut packed).unwrap();
        assert_eq!(packed, data);

        let mut out = vec![0u8; data.len()];
        Compression::Nil.decompress(&packed, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_nil_rejects_wrong_length() {
        let mut out = [0u8; 4];
        assert_eq!(
            Compression::Nil.decompress(&[1, 2, 3], &mut out),
            Err(CompressionError::SizeMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_zlib_preserves_checksum() {
        let data: Vec<u8> = (0..10_000_u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut packed = Vec::new();
        Compression::Zlib.compress(&data, &mut packed).unwrap();

        let mut out = vec![0u8; data.len()];
        Compression::Zlib.decompress(&packed, &mut out).unwrap();
        assert_eq!(crc32fast::hash(&out), crc32fast::hash(&data));
    }

    #[test]
    fn test_zlib_appends_after_existing_bytes() {
        let mut packed = vec![0xEE, 0xEE];
        Compression::Zlib.compress(b"hello", &mut packed).unwrap();
        assert_eq!(&packed[..2], &[0xEE, 0xEE]);

        let mut out = [0u8; 5];
        Compression::Zlib.decompress(&packed[2..], &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_zlib_detects_size_mismatch() {
        let mut packed = Vec::new();
        Compression::Zlib.compress(&[1u8; 32], &mut packed).unwrap();

        let mut short = [0u8; 16];
        assert!(matches!(
            Compression::Zlib.decompress(&packed, &mut short),
            Err(CompressionError::SizeMismatch { expected: 16, .. })
        ));

        let mut long = [0u8; 64];
        assert_eq!(
            Compression::Zlib.decompress(&packed, &mut long),
            Err(CompressionError::SizeMismatch {
                expected: 64,
                actual: 32
            })
        );
    }

    #[test]
    fn test_zlib_rejects_garbage() {
        let mut out = [0u8; 8];
        let err = Compression::Zlib
            .decompress(&[0xFF; 12], &mut out)
            .unwrap_err();
        let CompressionError::Inflate(reason) = &err else {
            panic!("expected an inflate error, got {err:?}");
        };
        assert!(!reason.is_empty());
        assert!(err.to_string().ends_with(reason.as_str()));
    }

    #[test]
    fn test_max_compressed_len_covers_incompressible_data() {
        let data: Vec<u8> = (0..50_000_u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut packed = Vec::new();
        Compression::Zlib.compress(&data, &mut packed).unwrap();
        assert!(packed.len() <= Compression::max_compressed_len(data.len()));
    }
}
