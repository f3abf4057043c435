//! One peer connection: its socket, its handshake stage and its buffers.

use std::io;
use std::net::SocketAddr;

use web_time::Instant;

use crate::error::NetplayError;
use crate::network::compression::Compression;
use crate::network::messages::{Command, HandshakeHeader, PayloadLimits};
use crate::network::packet_buffer::{RecvBuffer, SendBuffer, DEFAULT_SEND_CAPACITY};
use crate::sessions::stall::StallReason;
use crate::{InputWords, StreamSocket, WORDS_PER_INPUT};

/// Identifies a connection within a session.
///
/// Ids are slot numbers and are reused once a connection has been hung up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) usize);

impl ConnectionId {
    /// Raw slot number.
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a connection is in its life.
///
/// Handshake stages are ordered; a connection only ever moves forward through them,
/// and every mode from [`Spectating`](Self::Spectating) up counts as connected.
/// [`None`](Self::None) is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Hung up, or never opened.
    #[default]
    None,
    /// Asked to leave; flushed and hung up at the next post-frame.
    DelayedDisconnect,
    /// Waiting for the peer's handshake header.
    Init,
    /// Waiting for the peer's nickname.
    PreNick,
    /// Waiting for the client's password (server only).
    PrePassword,
    /// Waiting for the peer's core info.
    PreInfo,
    /// Waiting for the server's sync data (client only).
    PreSync,
    /// Connected, watching.
    Spectating,
    /// Connected, playing with input generated by the server.
    Slave,
    /// Connected, playing.
    Playing,
}

impl ConnectionMode {
    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self >= ConnectionMode::Spectating
    }

    /// Whether this mode occupies a player slot.
    #[must_use]
    pub fn is_playing(self) -> bool {
        matches!(self, ConnectionMode::Playing | ConnectionMode::Slave)
    }

    /// Whether the mode is one of the handshake stages.
    #[must_use]
    pub fn is_handshaking(self) -> bool {
        self >= ConnectionMode::Init && self < ConnectionMode::Spectating
    }
}

/// A peer connection.
#[derive(Debug)]
pub(crate) struct Connection {
    socket: Option<Box<dyn StreamSocket>>,
    pub(crate) mode: ConnectionMode,
    pub(crate) nick: String,
    pub(crate) player: usize,
    pub(crate) can_play: bool,
    pub(crate) salt: u32,
    pub(crate) paused: bool,
    pub(crate) stall: StallReason,
    pub(crate) stall_since: Option<Instant>,
    /// Server: frame we last asked this client to stall at. Client: stall frames left.
    pub(crate) stall_frame: u32,
    pub(crate) compression: Compression,
    pub(crate) slave_input: InputWords,
    peer: Option<SocketAddr>,
    send: SendBuffer,
    recv: RecvBuffer,
}

impl Connection {
    pub(crate) fn new(socket: Box<dyn StreamSocket>) -> Self {
        let peer = socket.peer_addr();
        Self {
            socket: Some(socket),
            mode: ConnectionMode::Init,
            nick: String::new(),
            player: 0,
            can_play: false,
            salt: 0,
            paused: false,
            stall: StallReason::None,
            stall_since: None,
            stall_frame: 0,
            compression: Compression::Nil,
            slave_input: [0; WORDS_PER_INPUT],
            peer,
            send: SendBuffer::new(DEFAULT_SEND_CAPACITY),
            recv: RecvBuffer::new(),
        }
    }

    /// Whether the connection still has a socket.
    pub(crate) fn is_active(&self) -> bool {
        self.socket.is_some() && self.mode != ConnectionMode::None
    }

    /// Active and past the handshake.
    pub(crate) fn is_connected(&self) -> bool {
        self.is_active() && self.mode.is_connected()
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues a command; the socket is only written once the queue is full or flushed.
    pub(crate) fn send_command(&mut self, command: &Command) -> Result<(), NetplayError> {
        let Some(socket) = self.socket.as_deref_mut() else {
            return Err(NetplayError::socket("connection is closed"));
        };
        self.send.queue_command(socket, command)
    }

    /// Queues raw bytes, used for the handshake header.
    pub(crate) fn send_raw(&mut self, bytes: &[u8]) -> Result<(), NetplayError> {
        let Some(socket) = self.socket.as_deref_mut() else {
            return Err(NetplayError::socket("connection is closed"));
        };
        self.send.queue(socket, bytes)?;
        Ok(())
    }

    /// Whether commands are queued but not yet written.
    pub(crate) fn has_queued_output(&self) -> bool {
        !self.send.is_empty()
    }

    /// Writes queued bytes, everything if `blocking`.
    pub(crate) fn flush(&mut self, blocking: bool) -> Result<(), NetplayError> {
        let Some(socket) = self.socket.as_deref_mut() else {
            return Err(NetplayError::socket("connection is closed"));
        };
        self.send.flush(socket, blocking)?;
        Ok(())
    }

    /// Reads whatever has arrived. `Ok(0)` means nothing new.
    pub(crate) fn fill(&mut self) -> Result<usize, NetplayError> {
        let Some(socket) = self.socket.as_deref_mut() else {
            return Err(NetplayError::socket("connection is closed"));
        };
        Ok(self.recv.fill(socket)?)
    }

    /// Waits up to `timeout` for data.
    pub(crate) fn wait_readable(&mut self, timeout: web_time::Duration) -> io::Result<bool> {
        match self.socket.as_deref_mut() {
            Some(socket) => socket.wait_readable(timeout),
            None => Ok(false),
        }
    }

    pub(crate) fn next_command(
        &mut self,
        limits: &PayloadLimits,
    ) -> Result<Option<Command>, NetplayError> {
        self.recv.next_command(limits)
    }

    pub(crate) fn next_handshake_header(
        &mut self,
    ) -> Result<Option<HandshakeHeader>, NetplayError> {
        self.recv.next_handshake_header()
    }

    /// Bytes waiting in the receive buffer.
    pub(crate) fn buffered(&self) -> usize {
        self.recv.buffered()
    }

    /// Closes the socket and releases the buffers. Safe to call more than once.
    pub(crate) fn close(&mut self) {
        if self.socket.take().is_some() {
            self.send = SendBuffer::new(0);
            self.recv = RecvBuffer::new();
        }
        self.mode = ConnectionMode::None;
        self.stall = StallReason::None;
        self.stall_since = None;
        self.paused = false;
    }

    /// Best-effort final flush before a close.
    pub(crate) fn flush_before_close(&mut self) {
        if let Some(socket) = self.socket.as_deref_mut() {
            let _ = self.send.flush(socket, false);
        }
    }
}
