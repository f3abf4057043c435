//! # Fortress Netplay
//!
//! Fortress Netplay keeps two or more instances of a deterministic emulation core in
//! lockstep over TCP. Every frame each side captures its local input, exchanges it with
//! its peers and runs the core with the best input it knows about. When real remote input
//! arrives that differs from what was predicted, the session rewinds to the last
//! confirmed frame and replays forward. Periodic state checksums detect desyncs, which
//! are repaired by transferring a compressed savestate.
//!
//! The host owns a [`NetplaySession`] and calls it once per emulated frame:
//!
//! ```ignore
//! let mut session = SessionBuilder::new()
//!     .with_nick("player")?
//!     .start_client(Box::new(TcpStreamSocket::connect(addr)?), &mut core)?;
//!
//! loop {
//!     // pre_frame + core.run(&input) + post_frame
//!     session.advance_frame(&mut core)?;
//! }
//! ```
//!
//! The core, the sockets, the password hash and the notification sink are all
//! collaborators reached through traits: [`NetplayCore`], [`StreamSocket`],
//! [`StreamListener`], [`PasswordHasher`] and [`NotificationSink`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::net::SocketAddr;

pub use error::NetplayError;
pub use input::{FrameInput, ShareMode};
pub use network::compression::Compression;
pub use network::connection::{ConnectionId, ConnectionMode};
pub use network::memory_socket::{MemoryListener, MemoryStream};
pub use network::messages::{Command, CommandId, ModeRefusedReason};
pub use network::tcp_socket::{TcpListenerSocket, TcpStreamSocket};
pub use notify::{
    CollectingSink, CompositeSink, NetplayEvent, Notification, NotificationSink, Severity,
    TracingSink,
};
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{NetplayConfig, TimingConfig};
pub use sessions::netplay_session::{NetplaySession, PeerInfo, Role};
pub use sessions::stall::StallReason;
pub use sync_layer::{DeltaFrame, DeltaRing, RingIndex};

pub mod checksum;
#[doc(hidden)]
pub mod error;
pub mod input;
pub mod notify;
mod rng;
#[doc(hidden)]
pub mod sync_layer;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    pub mod config;
    mod handshake;
    mod input_sync;
    #[doc(hidden)]
    pub mod netplay_session;
    mod resync;
    #[doc(hidden)]
    pub mod stall;
    #[cfg(test)]
    pub(crate) mod test_core;
}
#[doc(hidden)]
pub mod network {
    /// Big-endian fixed-layout payload encoding.
    ///
    /// Wraps the bincode configuration shared by every command payload.
    pub mod codec;
    pub mod compression;
    #[doc(hidden)]
    pub mod connection;
    pub mod memory_socket;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod packet_buffer;
    pub mod tcp_socket;
}

// #############
// # CONSTANTS #
// #############

/// Maximum number of player slots in a session. Slots are tracked in a `u32` bitmap.
pub const MAX_PLAYERS: usize = 16;

/// Number of `u32` words used to encode one player's input for one frame.
///
/// Word 0 holds the joypad buttons, words 1 and 2 the two analog sticks
/// (x in the low 16 bits, y in the high 16 bits).
pub const WORDS_PER_INPUT: usize = 3;

/// Size of the fixed nickname buffer on the wire, including the NUL terminator.
pub const NICK_LEN: usize = 32;

/// Size of a hex-encoded SHA-256 password hash on the wire.
pub const PASS_HASH_LEN: usize = 64;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 5;

/// Oldest protocol version we accept from a peer.
pub const LOWEST_PROTOCOL_VERSION: u32 = 5;

/// 'RANP', the first word of every handshake header.
pub const PROTOCOL_MAGIC: u32 = 0x5241_4E50;

/// Number of bounded waits before a blocked poll declares its peers dead.
pub const MAX_RETRIES: u32 = 16;

/// Per-attempt wait of a blocked poll, in milliseconds.
pub const RETRY_MS: u64 = 500;

/// Default distance, in frames, that we may run ahead of the slowest peer.
pub const MAX_STALL_FRAMES: u32 = 60;

/// Upper bound for a server-requested stall.
pub const MAX_REQUESTED_STALL_FRAMES: u32 = 60;

/// Number of frames the core may be run while waiting for serialization to work.
pub const SERIALIZATION_INIT_FRAMES: u32 = 60;

/// How long the server waits on a stalled client before hanging it up.
pub const MAX_SERVER_STALL_TIME: web_time::Duration = web_time::Duration::from_secs(5);

/// How long a client waits on a stalled server before giving up on the session.
pub const MAX_CLIENT_STALL_TIME: web_time::Duration = web_time::Duration::from_secs(10);

/// Input words for a single player for a single frame.
pub type InputWords = [u32; WORDS_PER_INPUT];

/// A frame is a single step of core execution.
///
/// Frames count up from 0 when a session starts (or from the server's frame when a
/// client joins) and travel over the wire as `u32`. The delta-frame ring derives its
/// slot from the frame number, so `Frame` is also the pointer type of the session:
/// "self", "run", "other", "unread" and each player's "read" position are all frames.
///
/// # Examples
///
/// ```
/// use fortress_netplay::Frame;
///
/// let frame = Frame::new(41);
/// assert_eq!((frame + 1).as_u32(), 42);
/// assert!(frame.next() > frame);
/// assert_eq!(Frame::new(50) - Frame::new(45), 5);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(u32);

impl Frame {
    /// The first frame of a session.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame` from its wire value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The following frame.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Frame(self.0.wrapping_add(1))
    }

    /// The preceding frame, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Frame(self.0.saturating_sub(1))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Frame(self.0.wrapping_add(rhs))
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl std::ops::Sub<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: u32) -> Self::Output {
        Frame(self.0.saturating_sub(rhs))
    }
}

/// Distance between two frames, saturating at zero.
impl std::ops::Sub<Frame> for Frame {
    type Output = u32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// A set of player slots, one bit per slot.
///
/// Used for the connected-player bitmap, the slave bitmap and the
/// device-to-client mapping.
///
/// ```
/// use fortress_netplay::PlayerMask;
///
/// let mut mask = PlayerMask::EMPTY;
/// mask.insert(0);
/// mask.insert(3);
/// assert!(mask.contains(3));
/// assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 3]);
/// mask.remove(0);
/// assert_eq!(mask.len(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerMask(u32);

impl PlayerMask {
    /// No players.
    pub const EMPTY: PlayerMask = PlayerMask(0);

    const VALID_BITS: u32 = if MAX_PLAYERS >= 32 {
        u32::MAX
    } else {
        (1 << MAX_PLAYERS) - 1
    };

    /// Builds a mask from raw bits, dropping bits beyond [`MAX_PLAYERS`].
    #[inline]
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        PlayerMask(bits & Self::VALID_BITS)
    }

    /// A mask with exactly one slot set.
    #[inline]
    #[must_use]
    pub const fn single(player: usize) -> Self {
        if player < MAX_PLAYERS {
            PlayerMask(1 << player)
        } else {
            PlayerMask(0)
        }
    }

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if `player` is in the set.
    #[inline]
    #[must_use]
    pub const fn contains(self, player: usize) -> bool {
        player < MAX_PLAYERS && self.0 & (1 << player) != 0
    }

    /// Adds a slot. Out-of-range slots are ignored.
    #[inline]
    pub fn insert(&mut self, player: usize) {
        if player < MAX_PLAYERS {
            self.0 |= 1 << player;
        }
    }

    /// Removes a slot.
    #[inline]
    pub fn remove(&mut self, player: usize) {
        if player < MAX_PLAYERS {
            self.0 &= !(1 << player);
        }
    }

    /// Returns `true` if no slot is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of slots set.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// The mask without `player`.
    #[inline]
    #[must_use]
    pub const fn without(self, player: usize) -> Self {
        if player < MAX_PLAYERS {
            PlayerMask(self.0 & !(1 << player))
        } else {
            self
        }
    }

    /// Iterates the set slots in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_PLAYERS).filter(move |p| self.contains(*p))
    }
}

/// Per-core compatibility flags that change how serialization-based sync is used.
///
/// ```
/// use fortress_netplay::Quirks;
///
/// let quirks = Quirks::INITIALIZATION | Quirks::ENDIAN_DEPENDENT;
/// assert!(quirks.contains(Quirks::INITIALIZATION));
/// assert!(!quirks.contains(Quirks::NO_SAVESTATES));
/// assert!(!quirks.forbids_transmission());
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Quirks(u32);

impl Quirks {
    /// No quirks.
    pub const NONE: Quirks = Quirks(0);
    /// The core cannot serialize at all; savestate-based resync is disabled.
    pub const NO_SAVESTATES: Quirks = Quirks(1 << 0);
    /// Savestates work locally but must not be sent to peers.
    pub const NO_TRANSMISSION: Quirks = Quirks(1 << 1);
    /// Serialization only works after the core has run for a few frames.
    pub const INITIALIZATION: Quirks = Quirks(1 << 2);
    /// Savestates are only valid between hosts of the same endianness.
    pub const ENDIAN_DEPENDENT: Quirks = Quirks(1 << 3);
    /// Savestates are only valid between identical platforms.
    pub const PLATFORM_DEPENDENT: Quirks = Quirks(1 << 4);

    /// Builds quirks from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Quirks(bits)
    }

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every flag in `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Quirks) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the flags in `other`.
    #[inline]
    pub fn insert(&mut self, other: Quirks) {
        self.0 |= other.0;
    }

    /// Clears the flags in `other`.
    #[inline]
    pub fn remove(&mut self, other: Quirks) {
        self.0 &= !other.0;
    }

    /// Savestates may not leave this host.
    #[inline]
    #[must_use]
    pub const fn forbids_transmission(self) -> bool {
        self.0 & (Self::NO_SAVESTATES.0 | Self::NO_TRANSMISSION.0) != 0
    }
}

impl std::ops::BitOr for Quirks {
    type Output = Quirks;

    fn bitor(self, rhs: Self) -> Self::Output {
        Quirks(self.0 | rhs.0)
    }
}

/// Identity of a loaded core and its content, exchanged in the INFO handshake stage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoreInfo {
    /// Library name. A mismatch with the peer is fatal.
    pub name: String,
    /// Library version. A mismatch only produces a warning.
    pub version: String,
    /// CRC32 of the loaded content, or 0 if unknown.
    pub content_crc: u32,
}

impl CoreInfo {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, version: impl Into<String>, content_crc: u32) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            content_crc,
        }
    }
}

/// The emulation core as seen by the netplay engine.
///
/// The session never runs frames on its own except while replaying after a rewind,
/// while waiting for serialization to initialize, and inside
/// [`NetplaySession::advance_frame`]. Every other call is a query or a state transfer.
pub trait NetplayCore {
    /// Size in bytes of a serialized state, or 0 if the core cannot serialize yet.
    fn serialize_size(&mut self) -> usize;

    /// Serializes the current state into `buf`, which is exactly `serialize_size()` long.
    fn serialize(&mut self, buf: &mut [u8]) -> bool;

    /// Restores a state previously produced by [`serialize`](NetplayCore::serialize).
    fn unserialize(&mut self, buf: &[u8]) -> bool;

    /// Runs exactly one frame using the resolved input.
    fn run(&mut self, input: &FrameInput);

    /// Hard-resets the core.
    fn reset(&mut self);

    /// Name, version and content checksum.
    fn info(&self) -> CoreInfo;

    /// The save-RAM region, if the core has one.
    fn save_ram(&mut self) -> Option<&mut [u8]>;

    /// The device type configured for `port`.
    fn port_device(&self, port: usize) -> u32;

    /// Configures the device type for `port`, as dictated by the server.
    fn set_port_device(&mut self, port: usize, device: u32);

    /// Queries the local input driver (not the network) for one input value.
    fn local_input(&mut self, device: u32, index: u32, id: u32) -> i16;
}

/// A byte stream to one peer, used without blocking except where stated.
///
/// Implemented for TCP by [`TcpStreamSocket`] and in memory by [`MemoryStream`].
#[cfg(feature = "sync-send")]
pub trait StreamSocket: Send + std::fmt::Debug {
    /// Sends as many bytes as possible without blocking.
    ///
    /// Returns `Ok(0)` when nothing can be written right now.
    fn send(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    /// Sends every byte, blocking as long as needed.
    fn send_all_blocking(&mut self, buf: &[u8]) -> std::io::Result<()>;
    /// Receives whatever is available without blocking.
    ///
    /// Returns [`std::io::ErrorKind::WouldBlock`] when nothing is available and an
    /// error of kind [`std::io::ErrorKind::UnexpectedEof`] once the peer has closed.
    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    /// Waits up to `timeout` for the stream to become readable.
    fn wait_readable(&mut self, timeout: web_time::Duration) -> std::io::Result<bool>;
    /// Address of the remote end, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// A byte stream to one peer, used without blocking except where stated.
///
/// Implemented for TCP by [`TcpStreamSocket`] and in memory by [`MemoryStream`].
#[cfg(not(feature = "sync-send"))]
pub trait StreamSocket: std::fmt::Debug {
    /// Sends as many bytes as possible without blocking.
    ///
    /// Returns `Ok(0)` when nothing can be written right now.
    fn send(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    /// Sends every byte, blocking as long as needed.
    fn send_all_blocking(&mut self, buf: &[u8]) -> std::io::Result<()>;
    /// Receives whatever is available without blocking.
    ///
    /// Returns [`std::io::ErrorKind::WouldBlock`] when nothing is available and an
    /// error of kind [`std::io::ErrorKind::UnexpectedEof`] once the peer has closed.
    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    /// Waits up to `timeout` for the stream to become readable.
    fn wait_readable(&mut self, timeout: web_time::Duration) -> std::io::Result<bool>;
    /// Address of the remote end, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Accepts incoming peers on the server side.
#[cfg(feature = "sync-send")]
pub trait StreamListener: Send + std::fmt::Debug {
    /// Accepts one pending connection without blocking.
    fn accept(&mut self) -> std::io::Result<Option<Box<dyn StreamSocket>>>;
    /// Address we listen on, if known.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Accepts incoming peers on the server side.
#[cfg(not(feature = "sync-send"))]
pub trait StreamListener: std::fmt::Debug {
    /// Accepts one pending connection without blocking.
    fn accept(&mut self) -> std::io::Result<Option<Box<dyn StreamSocket>>>;
    /// Address we listen on, if known.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// The SHA-256 primitive used for password challenges.
///
/// Implementations return the digest as lowercase hex, which is how it travels on the
/// wire.
#[cfg(feature = "sync-send")]
pub trait PasswordHasher: Send + std::fmt::Debug {
    /// Hashes `input` and returns the hex digest.
    fn hash(&self, input: &[u8]) -> [u8; PASS_HASH_LEN];
}

/// The SHA-256 primitive used for password challenges.
///
/// Implementations return the digest as lowercase hex, which is how it travels on the
/// wire.
#[cfg(not(feature = "sync-send"))]
pub trait PasswordHasher: std::fmt::Debug {
    /// Hashes `input` and returns the hex digest.
    fn hash(&self, input: &[u8]) -> [u8; PASS_HASH_LEN];
}

/// Default [`PasswordHasher`] backed by the `sha2` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl PasswordHasher for Sha256Hasher {
    fn hash(&self, input: &[u8]) -> [u8; PASS_HASH_LEN] {
        use sha2::{Digest, Sha256};

        let digest = Sha256::digest(input);
        let mut out = [0u8; PASS_HASH_LEN];
        // 32 digest bytes always encode to exactly 64 hex characters.
        if hex::encode_to_slice(digest, &mut out).is_err() {
            out = [b'0'; PASS_HASH_LEN];
        }
        out
    }
}

// ###################
// # UNIT TESTS      #
// ###################
