//! State checksum utilities for desync detection.
//!
//! The server periodically sends the CRC32 of a serialized core state; clients compare
//! it against their own serialization of the same frame. For the comparison to mean
//! anything the checksum must be computed over exactly the bytes the core produced,
//! with no platform-dependent framing.
//!
//! ```
//! use fortress_netplay::checksum::state_crc;
//!
//! let state = [1_u8, 2, 3, 4];
//! assert_eq!(state_crc(&state), state_crc(&state));
//! assert_ne!(state_crc(&state), state_crc(&[1, 2, 3, 5]));
//! ```

/// CRC32 (IEEE) of a serialized state.
#[must_use]
pub fn state_crc(state: &[u8]) -> u32 {
    crc32fast::hash(state)
}

/// Incrementally checksums content as it is loaded, for [`CoreInfo::content_crc`](crate::CoreInfo).
#[derive(Debug, Default, Clone)]
pub struct ContentCrc {
    hasher: crc32fast::Hasher,
}

impl ContentCrc {
    /// Starts a new checksum.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds more content bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Returns the checksum.
    #[must_use]
    pub fn finish(self) -> u32 {
        self.hasher.finalize()
    }
}
