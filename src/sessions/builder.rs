use std::sync::Arc;

use tracing::info;

use crate::input::ShareMode;
use crate::notify::{NotificationSink, TracingSink};
use crate::sessions::config::{NetplayConfig, TimingConfig};
use crate::sessions::netplay_session::{NetplaySession, Role};
use crate::{
    NetplayCore, NetplayError, PasswordHasher, Quirks, Sha256Hasher, StreamListener,
    StreamSocket, MAX_PLAYERS, NICK_LEN,
};

/// The [`SessionBuilder`] builds netplay sessions.
///
/// After setting all appropriate values, use [`start_server`](Self::start_server) or
/// [`start_client`](Self::start_client) to consume the builder and create a
/// [`NetplaySession`].
#[must_use = "SessionBuilder must be consumed by calling start_server or start_client"]
pub struct SessionBuilder {
    config: NetplayConfig,
    timing: TimingConfig,
    hasher: Box<dyn PasswordHasher>,
    sink: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            timing,
            hasher,
            sink: _,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("config", config)
            .field("timing", timing)
            .field("hasher", hasher)
            .finish_non_exhaustive()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    ///
    /// Notifications go to [`TracingSink`] and passwords are hashed with
    /// [`Sha256Hasher`] unless replaced.
    pub fn new() -> Self {
        Self {
            config: NetplayConfig::default(),
            timing: TimingConfig::default(),
            hasher: Box::new(Sha256Hasher),
            sink: Arc::new(TracingSink),
        }
    }

    /// Replaces the whole session configuration, e.g. with one of the
    /// [`NetplayConfig`] presets. Values set earlier on the builder are lost.
    pub fn with_config(mut self, config: NetplayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the timing of the blocking poll and the stall timeouts.
    pub fn with_timing_config(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Sets our nickname. The server may still change it to keep nicknames unique.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if the nickname is empty or does not fit
    /// the wire field.
    pub fn with_nick(mut self, nick: impl Into<String>) -> Result<Self, NetplayError> {
        let nick = nick.into();
        if nick.is_empty() || nick.len() >= NICK_LEN || nick.contains('\0') {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "nick must be 1 to {} bytes without NUL, got {:?}",
                    NICK_LEN - 1,
                    nick
                ),
            });
        }
        self.config.nick = nick;
        Ok(self)
    }

    /// Server: clients must present this password to play.
    ///
    /// Client: the password we present, whichever of the server's two it is.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    /// Server: clients presenting this password may only spectate.
    pub fn with_spectate_password(mut self, password: impl Into<String>) -> Self {
        self.config.spectate_password = password.into();
        self
    }

    /// Join as a spectator instead of asking for a player slot (client), or keep the
    /// server from taking slot 0 (server).
    pub fn start_as_spectator(mut self) -> Self {
        self.config.start_as_spectator = true;
        self
    }

    /// Sets how far ahead of the slowest peer we may run. Default is 60.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if the value is out of range or smaller
    /// than the configured input latency allows.
    pub fn with_stall_frames(mut self, frames: u32) -> Result<Self, NetplayError> {
        let mut config = self.config.clone();
        config.stall_frames = frames;
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Server: sends a state checksum every `frames` frames. 0 disables checksums.
    pub fn with_check_frames(mut self, frames: u32) -> Self {
        self.config.check_frames = frames;
        self
    }

    /// Sets the local input latency: at least `min` frames, growing by up to `range`
    /// more when the connection needs it.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if `min + range` reaches the stall
    /// distance.
    pub fn with_input_latency(mut self, min: u32, range: u32) -> Result<Self, NetplayError> {
        let mut config = self.config.clone();
        config.input_latency_min = min;
        config.input_latency_range = range;
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Sets the mask of compression schemes we offer.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] for bits this build does not support.
    pub fn with_compression(mut self, mask: u32) -> Result<Self, NetplayError> {
        let mut config = self.config.clone();
        config.compression = mask;
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Declares what the core cannot do.
    pub fn with_quirks(mut self, quirks: Quirks) -> Self {
        self.config.quirks = quirks;
        self
    }

    /// Sets how the input of several players feeding `device` is merged.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if `device` is not below
    /// [`MAX_PLAYERS`].
    pub fn with_share_mode(mut self, device: usize, mode: ShareMode) -> Result<Self, NetplayError> {
        let Some(slot) = self.config.share_modes.get_mut(device) else {
            return Err(NetplayError::InvalidRequest {
                info: format!("device {device} out of range, max is {}", MAX_PLAYERS - 1),
            });
        };
        *slot = mode;
        Ok(self)
    }

    /// Sets where notifications go. Default is [`TracingSink`].
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the password hash. Both ends must use the same one.
    pub fn with_hasher(mut self, hasher: Box<dyn PasswordHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    fn validate(&self) -> Result<(), NetplayError> {
        self.config.validate()?;
        self.timing.validate()
    }

    /// Consumes the builder to construct a server session that accepts connections
    /// from `listener` at the start of every frame.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if the configuration is invalid.
    pub fn start_server(
        self,
        listener: Box<dyn StreamListener>,
        core: &mut dyn NetplayCore,
    ) -> Result<NetplaySession, NetplayError> {
        self.validate()?;
        let local_addr = listener.local_addr();
        let mut session = NetplaySession::new(
            Role::Server,
            self.config,
            self.timing,
            self.hasher,
            self.sink,
            core,
        );
        session.listener = Some(listener);
        info!(addr = ?local_addr, nick = %session.nick(), "netplay server started");
        Ok(session)
    }

    /// Consumes the builder to construct a client session over an already connected
    /// socket. The handshake proceeds as frames are run; until it completes the core
    /// runs alone.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if the configuration is invalid, or a
    /// socket error if our handshake header cannot be sent.
    pub fn start_client(
        self,
        socket: Box<dyn StreamSocket>,
        core: &mut dyn NetplayCore,
    ) -> Result<NetplaySession, NetplayError> {
        self.validate()?;
        let mut session = NetplaySession::new(
            Role::Client,
            self.config,
            self.timing,
            self.hasher,
            self.sink,
            core,
        );
        let idx = session.begin_handshake(socket);
        if !session.connections[idx].is_active() {
            return Err(NetplayError::socket("failed to send the handshake header"));
        }
        info!(addr = ?session.connections[idx].peer_addr(), "connecting to server");
        Ok(session)
    }
}
