//! Configuration types for netplay sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `NetplayConfig` | Identity, passwords, stall and check distances, latency, quirks | `lan()`, `internet()`, `lockstep()` |
//! | `TimingConfig` | Blocking-poll retries and stall timeouts | `lan()`, `internet()` |
//!
//! # Example
//!
//! ```
//! use fortress_netplay::{NetplayConfig, TimingConfig};
//!
//! let config = NetplayConfig {
//!     nick: "host".to_owned(),
//!     password: "secret".to_owned(),
//!     ..NetplayConfig::lan()
//! };
//! assert!(config.validate().is_ok());
//! assert!(TimingConfig::internet().validate().is_ok());
//! ```

use web_time::Duration;

use crate::error::NetplayError;
use crate::input::ShareMode;
use crate::network::compression::COMPRESSION_SUPPORTED;
use crate::{
    Quirks, MAX_CLIENT_STALL_TIME, MAX_PLAYERS, MAX_RETRIES, MAX_SERVER_STALL_TIME,
    MAX_STALL_FRAMES, NICK_LEN, RETRY_MS,
};

/// Smallest stall distance that can ever unstall.
///
/// A `RunningFast` stall clears once the slowest peer is within `stall_frames - 2`
/// frames; below 3 that never happens.
pub const MIN_STALL_FRAMES: u32 = 3;

/// Largest stall distance accepted; the ring holds twice this on the server.
pub const MAX_CONFIGURABLE_STALL_FRAMES: u32 = 600;

/// Default interval between server CRC checks, in frames.
pub const DEFAULT_CHECK_FRAMES: u32 = 600;

/// Default nickname.
pub const DEFAULT_NICK: &str = "Anonymous";

/// Session behavior.
///
/// # Forward Compatibility
///
/// New fields may be added. Construct with `..NetplayConfig::default()`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "NetplayConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct NetplayConfig {
    /// Our nickname. The server may change it to keep nicks unique.
    ///
    /// Default: `"Anonymous"`
    pub nick: String,

    /// Server: password that admits players. Client: the password we send.
    ///
    /// Default: empty (no password)
    pub password: String,

    /// Server: password that admits spectators only.
    ///
    /// Default: empty
    pub spectate_password: String,

    /// Join as a spectator instead of asking to play straight away.
    ///
    /// Default: `false`
    pub start_as_spectator: bool,

    /// How far, in frames, we may run ahead of the slowest peer before stalling.
    /// Also sizes the delta-frame ring.
    ///
    /// Default: 60
    pub stall_frames: u32,

    /// Server: send a state CRC every this many frames. 0 disables desync checks.
    ///
    /// Default: 600
    pub check_frames: u32,

    /// Smallest number of frames local input is delayed by.
    ///
    /// Default: 0
    pub input_latency_min: u32,

    /// How many more frames the automatic latency adjustment may add.
    ///
    /// Default: 0
    pub input_latency_range: u32,

    /// Compression capabilities we advertise.
    ///
    /// Default: everything supported (zlib)
    pub compression: u32,

    /// Core quirks known up front. More may be discovered at run time.
    ///
    /// Default: none
    pub quirks: Quirks,

    /// Server: how several players on one device are combined, per device.
    ///
    /// Default: no preference
    pub share_modes: [ShareMode; MAX_PLAYERS],

    /// Largest save-RAM we accept in SYNC.
    ///
    /// Default: 1 MiB
    pub max_save_ram: usize,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            nick: DEFAULT_NICK.to_owned(),
            password: String::new(),
            spectate_password: String::new(),
            start_as_spectator: false,
            stall_frames: MAX_STALL_FRAMES,
            check_frames: DEFAULT_CHECK_FRAMES,
            input_latency_min: 0,
            input_latency_range: 0,
            compression: COMPRESSION_SUPPORTED,
            quirks: Quirks::NONE,
            share_modes: [ShareMode::default(); MAX_PLAYERS],
            max_save_ram: 1 << 20,
        }
    }
}

impl NetplayConfig {
    /// Creates a new `NetplayConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: short stall distance and frequent checks.
    pub fn lan() -> Self {
        Self {
            stall_frames: 30,
            check_frames: 60,
            ..Self::default()
        }
    }

    /// Preset for the internet: the full stall distance and a little input latency to
    /// hide jitter.
    pub fn internet() -> Self {
        Self {
            stall_frames: MAX_STALL_FRAMES,
            check_frames: 300,
            input_latency_min: 1,
            input_latency_range: 4,
            ..Self::default()
        }
    }

    /// Preset for cores that must not rely on savestates: runs without rollback and
    /// waits for remote input every frame.
    pub fn lockstep() -> Self {
        Self {
            quirks: Quirks::NO_SAVESTATES,
            input_latency_min: 1,
            input_latency_range: 2,
            check_frames: 0,
            ..Self::default()
        }
    }

    /// Whether any password is configured, so the server must challenge clients.
    #[must_use]
    pub fn requires_password(&self) -> bool {
        !self.password.is_empty() || !self.spectate_password.is_empty()
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] naming the first field out of range.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.nick.is_empty() || self.nick.len() >= NICK_LEN {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "nick must be 1 to {} bytes, got {}",
                    NICK_LEN - 1,
                    self.nick.len()
                ),
            });
        }
        if self.stall_frames < MIN_STALL_FRAMES || self.stall_frames > MAX_CONFIGURABLE_STALL_FRAMES
        {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "stall_frames must be {}..={}, got {}",
                    MIN_STALL_FRAMES, MAX_CONFIGURABLE_STALL_FRAMES, self.stall_frames
                ),
            });
        }
        let max_latency = self.input_latency_min.saturating_add(self.input_latency_range);
        if max_latency >= self.stall_frames {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "input latency up to {} frames cannot exceed stall_frames ({})",
                    max_latency, self.stall_frames
                ),
            });
        }
        if self.compression & !COMPRESSION_SUPPORTED != 0 {
            return Err(NetplayError::InvalidRequest {
                info: format!("unsupported compression mask 0x{:x}", self.compression),
            });
        }
        Ok(())
    }
}

/// Timing of the blocking poll and the stall timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TimingConfig has no effect unless passed to SessionBuilder::with_timing_config()"]
pub struct TimingConfig {
    /// How long one attempt of a blocking poll waits for data.
    ///
    /// Default: 500ms
    pub retry_interval: Duration,

    /// Attempts without progress before a blocking poll hangs up.
    ///
    /// Default: 16
    pub max_retries: u32,

    /// Server: how long a stalled client may hold everyone up.
    ///
    /// Default: 5s
    pub server_stall_timeout: Duration,

    /// Client: how long we wait on a stalled server.
    ///
    /// Default: 10s
    pub client_stall_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(RETRY_MS),
            max_retries: MAX_RETRIES,
            server_stall_timeout: MAX_SERVER_STALL_TIME,
            client_stall_timeout: MAX_CLIENT_STALL_TIME,
        }
    }
}

impl TimingConfig {
    /// Creates a new `TimingConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: peers that go quiet are dropped sooner.
    pub fn lan() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
            max_retries: MAX_RETRIES,
            server_stall_timeout: Duration::from_secs(2),
            client_stall_timeout: Duration::from_secs(4),
        }
    }

    /// Preset for the internet. Same as the defaults.
    pub fn internet() -> Self {
        Self::default()
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] naming the first field out of range.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.retry_interval < Duration::from_millis(1)
            || self.retry_interval > Duration::from_secs(10)
        {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "retry_interval must be 1ms..=10s, got {}ms",
                    self.retry_interval.as_millis()
                ),
            });
        }
        if self.max_retries == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "max_retries must be at least 1".to_owned(),
            });
        }
        for (field, value) in [
            ("server_stall_timeout", self.server_stall_timeout),
            ("client_stall_timeout", self.client_stall_timeout),
        ] {
            if value < self.retry_interval {
                return Err(NetplayError::InvalidRequest {
                    info: format!(
                        "{} ({}ms) is shorter than retry_interval ({}ms)",
                        field,
                        value.as_millis(),
                        self.retry_interval.as_millis()
                    ),
                });
            }
        }
        Ok(())
    }
}
