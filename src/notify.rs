//! Structured notifications for the host.
//!
//! Everything a player should hear about (peers joining and leaving, mode changes,
//! pauses, desyncs, compatibility warnings) is raised as a [`Notification`] and handed
//! to the session's [`NotificationSink`]. The default sink logs through `tracing`;
//! hosts route notifications to an on-screen message queue, and tests collect them.
//!
//! ```
//! use fortress_netplay::notify::{CollectingSink, NetplayEvent, Notification, NotificationSink};
//! use fortress_netplay::Frame;
//!
//! let sink = CollectingSink::new();
//! sink.notify(&Notification::new(NetplayEvent::Desync, "here").with_frame(Frame::new(120)));
//!
//! assert_eq!(sink.len(), 1);
//! assert!(sink.has_event(|e| matches!(e, NetplayEvent::Desync)));
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::messages::ModeRefusedReason;
use crate::sessions::stall::StallReason;
use crate::Frame;

/// How much attention a notification deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Ordinary session activity.
    Info,
    /// Something odd that the session can live with.
    Warning,
    /// A connection was lost or refused.
    Error,
}

impl Severity {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum NetplayEvent {
    /// We finished the handshake with the server.
    Connected {
        /// Our nickname as the server knows it.
        nick: String,
    },
    /// A client finished the handshake with us.
    PeerJoined {
        /// The client's nickname.
        nick: String,
    },
    /// Someone took a player slot.
    PlayerJoined {
        /// Zero-based slot.
        player: usize,
    },
    /// Someone left a player slot.
    PlayerLeft {
        /// Zero-based slot.
        player: usize,
    },
    /// We took a player slot.
    JoinedAsPlayer {
        /// Zero-based slot.
        player: usize,
        /// Whether the server runs our input for us.
        slave: bool,
    },
    /// We went back to spectating.
    LeftGame,
    /// The server refused to let us play.
    JoinRefused {
        /// Why.
        reason: ModeRefusedReason,
    },
    /// The server changed our nickname to keep it unique.
    NickChanged {
        /// The new nickname.
        nick: String,
    },
    /// A connection was closed.
    Hangup {
        /// The peer's nickname, if the handshake got that far.
        nick: String,
        /// Why it was closed.
        reason: String,
    },
    /// Our state checksum disagreed with the server's.
    Desync,
    /// The peer runs a different build of the netplay implementation.
    ImplementationMismatch,
    /// The peer runs a different version of the core.
    CoreVersionMismatch {
        /// Our version.
        local: String,
        /// Theirs.
        remote: String,
    },
    /// The peer loaded different content.
    ContentMismatch {
        /// Our content CRC.
        local: u32,
        /// Theirs.
        remote: u32,
    },
    /// A peer paused.
    Paused {
        /// Who paused.
        nick: String,
    },
    /// Every peer resumed.
    Resumed,
    /// Ports 0 and 1 swap at the given frame.
    PlayersFlipped,
    /// The session started waiting.
    Stalled {
        /// Why.
        reason: StallReason,
    },
    /// The core cannot serialize; savestate resync is off.
    SavestatesUnavailable,
    /// A peer sent something it should not have.
    ProtocolViolation {
        /// What was wrong.
        reason: String,
    },
}

impl NetplayEvent {
    /// Default severity for this kind of event.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            NetplayEvent::Hangup { .. }
            | NetplayEvent::JoinRefused { .. }
            | NetplayEvent::ProtocolViolation { .. } => Severity::Error,
            NetplayEvent::Desync
            | NetplayEvent::ImplementationMismatch
            | NetplayEvent::CoreVersionMismatch { .. }
            | NetplayEvent::ContentMismatch { .. }
            | NetplayEvent::SavestatesUnavailable => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl std::fmt::Display for NetplayEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetplayEvent::Connected { nick } => write!(f, "Connected as \"{nick}\""),
            NetplayEvent::PeerJoined { nick } => write!(f, "\"{nick}\" has connected"),
            NetplayEvent::PlayerJoined { player } => {
                write!(f, "Player {} has joined", player + 1)
            },
            NetplayEvent::PlayerLeft { player } => write!(f, "Player {} has left", player + 1),
            NetplayEvent::JoinedAsPlayer { player, slave } => {
                write!(f, "You have joined as player {}", player + 1)?;
                if *slave {
                    write!(f, " (slave)")?;
                }
                Ok(())
            },
            NetplayEvent::LeftGame => write!(f, "You have left the game"),
            NetplayEvent::JoinRefused { reason } => write!(f, "Could not join: {reason}"),
            NetplayEvent::NickChanged { nick } => write!(f, "Your nickname is now \"{nick}\""),
            NetplayEvent::Hangup { nick, reason } => {
                if nick.is_empty() {
                    write!(f, "Netplay disconnected: {reason}")
                } else {
                    write!(f, "\"{nick}\" disconnected: {reason}")
                }
            },
            NetplayEvent::Desync => write!(f, "Netplay has desynchronized; resyncing"),
            NetplayEvent::ImplementationMismatch => {
                write!(f, "Peer runs a different netplay build; expect desyncs")
            },
            NetplayEvent::CoreVersionMismatch { local, remote } => {
                write!(f, "Core version mismatch: ours {local}, theirs {remote}")
            },
            NetplayEvent::ContentMismatch { local, remote } => {
                write!(
                    f,
                    "Content mismatch: ours {local:08x}, theirs {remote:08x}"
                )
            },
            NetplayEvent::Paused { nick } => write!(f, "\"{nick}\" paused"),
            NetplayEvent::Resumed => write!(f, "Netplay resumed"),
            NetplayEvent::PlayersFlipped => write!(f, "Netplay players are flipped"),
            NetplayEvent::Stalled { reason } => write!(f, "Waiting: {reason}"),
            NetplayEvent::SavestatesUnavailable => {
                write!(f, "Core cannot save states; netplay may desync")
            },
            NetplayEvent::ProtocolViolation { reason } => {
                write!(f, "Protocol violation: {reason}")
            },
        }
    }
}

/// An event with the context it happened in.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    /// What happened.
    #[serde(flatten)]
    pub event: NetplayEvent,
    /// Severity, normally the event's default.
    pub severity: Severity,
    /// Session frame at the time, if known.
    pub frame: Option<Frame>,
    /// Source location that raised it (file:line).
    pub location: &'static str,
}

impl Notification {
    /// Wraps an event.
    #[must_use]
    pub fn new(event: NetplayEvent, location: &'static str) -> Self {
        let severity = event.severity();
        Self {
            event,
            severity,
            frame: None,
            location,
        }
    }

    /// Attaches the frame.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Serializes to a JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.event)?;
        if let Some(frame) = self.frame {
            write!(f, " (frame {frame})")?;
        }
        Ok(())
    }
}

/// Receives notifications from a session.
///
/// Called synchronously from inside session methods, so implementations should be quick.
#[cfg(feature = "sync-send")]
pub trait NotificationSink: Send + Sync {
    /// Handles one notification.
    fn notify(&self, notification: &Notification);
}

/// Receives notifications from a session.
///
/// Called synchronously from inside session methods, so implementations should be quick.
#[cfg(not(feature = "sync-send"))]
pub trait NotificationSink {
    /// Handles one notification.
    fn notify(&self, notification: &Notification);
}

/// Logs notifications through `tracing`, at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        let frame = notification.frame.map(Frame::as_u32);
        let location = notification.location;
        match notification.severity {
            Severity::Info => {
                tracing::info!(?frame, location, "{}", notification.event);
            },
            Severity::Warning => {
                tracing::warn!(?frame, location, "{}", notification.event);
            },
            Severity::Error => {
                tracing::error!(?frame, location, "{}", notification.event);
            },
        }
    }
}

/// Keeps every notification, for tests and for hosts that drain them once per frame.
#[derive(Debug, Default)]
pub struct CollectingSink {
    notifications: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of everything collected so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Just the events.
    #[must_use]
    pub fn events(&self) -> Vec<NetplayEvent> {
        self.notifications
            .lock()
            .iter()
            .map(|n| n.event.clone())
            .collect()
    }

    /// Number collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.notifications.lock().len()
    }

    /// Whether nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifications.lock().is_empty()
    }

    /// Whether any collected event matches.
    pub fn has_event(&self, predicate: impl Fn(&NetplayEvent) -> bool) -> bool {
        self.notifications
            .lock()
            .iter()
            .any(|n| predicate(&n.event))
    }

    /// Removes and returns everything collected.
    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.notifications.lock())
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, notification: &Notification) {
        self.notifications.lock().push(notification.clone());
    }
}

/// Forwards to several sinks.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl CompositeSink {
    /// Creates a sink with no children.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child.
    pub fn add(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    /// Creates a composite from a list.
    #[must_use]
    pub fn from_sinks(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for CompositeSink {
    fn notify(&self, notification: &Notification) {
        for sink in &self.sinks {
            sink.notify(notification);
        }
    }
}

impl std::fmt::Debug for CompositeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeSink")
            .field("num_sinks", &self.sinks.len())
            .finish()
    }
}

/// Raises a notification through a sink, recording the call site.
macro_rules! notify_to {
    ($sink:expr, $frame:expr, $event:expr) => {{
        let notification = $crate::notify::Notification::new(
            $event,
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $sink.notify(&notification);
    }};
}
pub(crate) use notify_to;
