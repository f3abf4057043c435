//! Connection handshake: header exchange, nick, password, core info and initial sync.
//!
//! Each stage consumes exactly one message and moves the connection one step forward
//! through [`ConnectionMode`]. Anything unexpected ends the connection.

use tracing::{debug, info, warn};

use crate::error::NetplayError;
use crate::input::ShareMode;
use crate::network::compression::Compression;
use crate::network::connection::{Connection, ConnectionMode};
use crate::network::messages::{
    nick_from_wire, nick_to_wire, Command, HandshakeHeader, InfoPayload, SyncHeader, SyncPayload,
    SYNC_PAUSED_BIT,
};
use crate::network::codec;
use crate::notify::{notify_to, NetplayEvent};
use crate::sessions::netplay_session::NetplaySession;
use crate::sessions::stall::StallReason;
use crate::{
    Frame, NetplayCore, PasswordHasher, PlayerMask, Quirks, StreamSocket,
    LOWEST_PROTOCOL_VERSION, MAX_PLAYERS, NICK_LEN, PASS_HASH_LEN, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, WORDS_PER_INPUT,
};

const ENDIAN_BIT: u32 = 1 << 30;

/// Describes this build: endianness and native word sizes.
pub(crate) fn platform_magic() -> u32 {
    let big_endian = u32::from(cfg!(target_endian = "big"));
    let word = std::mem::size_of::<usize>() as u32;
    let long = if cfg!(target_pointer_width = "64") {
        std::mem::size_of::<i64>()
    } else {
        std::mem::size_of::<i32>()
    } as u32;
    (big_endian << 30) | (word << 15) | long
}

/// Hash of the implementation version, so mismatched builds can be reported.
pub(crate) fn impl_magic() -> u32 {
    let version = env!("CARGO_PKG_VERSION").as_bytes();
    let mut magic = 0_u32;
    for (i, byte) in version.iter().enumerate() {
        magic ^= u32::from(*byte) << (i & 0xf);
    }
    magic ^ (PROTOCOL_VERSION << (version.len() & 0xf))
}

fn endian_mismatch(local: u32, remote: u32) -> bool {
    (local ^ remote) & ENDIAN_BIT != 0
}

/// The PASSWORD payload for `password` under `salt`.
pub(crate) fn password_digest(
    hasher: &dyn PasswordHasher,
    salt: u32,
    password: &str,
) -> [u8; PASS_HASH_LEN] {
    hasher.hash(format!("{salt:08X}{password}").as_bytes())
}

/// Makes `nick` unique by appending " (2)", " (3)", ... while `taken` says it is in use.
pub(crate) fn dedupe_nick(nick: &str, taken: impl Fn(&str) -> bool) -> String {
    let mut keep = nick.len().min(NICK_LEN - 5);
    while !nick.is_char_boundary(keep) {
        keep -= 1;
    }
    let mut candidate = nick.to_owned();
    let mut count = 1;
    while taken(&candidate) {
        count += 1;
        candidate = format!("{} ({count})", &nick[..keep]);
        let mut end = candidate.len().min(NICK_LEN - 1);
        while !candidate.is_char_boundary(end) {
            end -= 1;
        }
        candidate.truncate(end);
    }
    candidate
}

impl NetplaySession {
    /// Server: takes every pending connection off the listener.
    pub(super) fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok(Some(socket)) => accepted.push(socket),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                },
            }
        }
        for socket in accepted {
            self.begin_handshake(socket);
        }
    }

    /// Registers a new connection and sends our header.
    pub(crate) fn begin_handshake(&mut self, socket: Box<dyn StreamSocket>) -> usize {
        let mut conn = Connection::new(socket);
        if self.is_server() && self.config.requires_password() {
            conn.salt = crate::rng::salt();
        }
        let idx = match self.connections.iter().position(|c| !c.is_active()) {
            Some(free) if self.is_server() => {
                self.connections[free] = conn;
                free
            },
            _ => {
                self.connections.push(conn);
                self.connections.len() - 1
            },
        };
        debug!(connection = idx, addr = ?self.connections[idx].peer_addr(), "new connection");

        let header = HandshakeHeader {
            magic: PROTOCOL_MAGIC,
            platform_magic: platform_magic(),
            compression: self.config.compression,
            salt: self.connections[idx].salt,
            protocol_version: PROTOCOL_VERSION,
            impl_hash: impl_magic(),
        };
        let sent = codec::encode(&header)
            .map_err(NetplayError::from)
            .and_then(|bytes| self.connections[idx].send_raw(&bytes))
            .and_then(|()| self.connections[idx].flush(false));
        if let Err(err) = sent {
            self.hangup_with_error(idx, &err);
        }
        idx
    }

    /// Runs the handshake stage the connection is in. Returns whether a message was
    /// consumed.
    pub(super) fn handshake_step(
        &mut self,
        idx: usize,
        core: &mut dyn NetplayCore,
    ) -> Result<bool, NetplayError> {
        let mode = self.connections[idx].mode;
        if mode == ConnectionMode::Init {
            return self.on_header(idx);
        }

        let mut limits = self.payload_limits();
        if mode == ConnectionMode::PreSync {
            // Identical cores send save RAM the size of our own.
            let local_ram = core.save_ram().map_or(0, |ram| ram.len());
            limits.max_save_ram = limits.max_save_ram.max(local_ram);
        }
        let Some(command) = self.connections[idx].next_command(&limits)? else {
            return Ok(false);
        };
        match command {
            Command::Nak => {
                return Err(NetplayError::IncompatiblePeer {
                    reason: "peer rejected the handshake".to_owned(),
                })
            },
            Command::Disconnect => {
                self.hangup(idx, "peer disconnected during handshake");
                return Ok(true);
            },
            _ => {},
        }

        match mode {
            ConnectionMode::PreNick => self.on_nick(idx, command)?,
            ConnectionMode::PrePassword if self.is_server() => self.on_password(idx, command)?,
            ConnectionMode::PreInfo => self.on_info(idx, command, core)?,
            ConnectionMode::PreSync if !self.is_server() => self.on_sync(idx, command, core)?,
            _ => {
                return Err(NetplayError::violation(format!(
                    "{:?} during handshake stage {mode:?}",
                    command.id()
                )))
            },
        }
        Ok(true)
    }

    fn on_header(&mut self, idx: usize) -> Result<bool, NetplayError> {
        let Some(header) = self.connections[idx].next_handshake_header()? else {
            return Ok(false);
        };
        if header.magic != PROTOCOL_MAGIC {
            return Err(NetplayError::violation(format!(
                "bad protocol magic {:#010x}",
                header.magic
            )));
        }
        if header.protocol_version < LOWEST_PROTOCOL_VERSION {
            return Err(NetplayError::VersionIncompatible {
                local: PROTOCOL_VERSION,
                remote: header.protocol_version,
            });
        }
        let local = platform_magic();
        if self.quirks.contains(Quirks::ENDIAN_DEPENDENT)
            && endian_mismatch(local, header.platform_magic)
        {
            return Err(NetplayError::IncompatiblePeer {
                reason: "endianness differs and the core is endian dependent".to_owned(),
            });
        }
        if self.quirks.contains(Quirks::PLATFORM_DEPENDENT) && local != header.platform_magic {
            return Err(NetplayError::IncompatiblePeer {
                reason: "platform differs and the core is platform dependent".to_owned(),
            });
        }
        if header.impl_hash != impl_magic() {
            warn!(
                local = impl_magic(),
                remote = header.impl_hash,
                "peer runs a different netplay implementation"
            );
            notify_to!(
                self.sink,
                self.self_frame,
                NetplayEvent::ImplementationMismatch
            );
        }

        let is_server = self.is_server();
        let conn = &mut self.connections[idx];
        conn.compression = Compression::negotiate(self.config.compression, header.compression);
        if !is_server {
            conn.salt = header.salt;
        }
        conn.send_command(&Command::Nick(self.nick.clone()))?;
        if !is_server && conn.salt != 0 {
            let digest = password_digest(self.hasher.as_ref(), conn.salt, &self.config.password);
            conn.send_command(&Command::Password(digest))?;
        }
        conn.flush(false)?;
        conn.mode = ConnectionMode::PreNick;
        Ok(true)
    }

    fn on_nick(&mut self, idx: usize, command: Command) -> Result<(), NetplayError> {
        let Command::Nick(nick) = command else {
            return Err(NetplayError::violation("expected NICK"));
        };
        self.connections[idx].nick = nick;
        if !self.is_server() {
            self.connections[idx].mode = ConnectionMode::PreInfo;
        } else if self.config.requires_password() {
            self.connections[idx].mode = ConnectionMode::PrePassword;
        } else {
            self.connections[idx].can_play = true;
            self.send_info(idx)?;
            self.connections[idx].mode = ConnectionMode::PreInfo;
        }
        Ok(())
    }

    fn on_password(&mut self, idx: usize, command: Command) -> Result<(), NetplayError> {
        let Command::Password(hash) = command else {
            return Err(NetplayError::violation("expected PASSWORD"));
        };
        let salt = self.connections[idx].salt;
        let hasher = self.hasher.as_ref();
        let mut admitted = false;
        if !self.config.password.is_empty()
            && password_digest(hasher, salt, &self.config.password) == hash
        {
            admitted = true;
            self.connections[idx].can_play = true;
        }
        if !self.config.spectate_password.is_empty()
            && password_digest(hasher, salt, &self.config.spectate_password) == hash
        {
            admitted = true;
        }
        if !admitted {
            info!(connection = idx, nick = %self.connections[idx].nick, "wrong password");
            return Err(NetplayError::AuthenticationFailure);
        }
        self.send_info(idx)?;
        self.connections[idx].mode = ConnectionMode::PreInfo;
        Ok(())
    }

    fn send_info(&mut self, idx: usize) -> Result<(), NetplayError> {
        let info = (!self.core_info.name.is_empty()).then(|| InfoPayload {
            core_name: self.core_info.name.clone(),
            core_version: self.core_info.version.clone(),
            content_crc: self.core_info.content_crc,
        });
        let conn = &mut self.connections[idx];
        conn.send_command(&Command::Info(info))?;
        conn.flush(false)
    }

    fn on_info(
        &mut self,
        idx: usize,
        command: Command,
        core: &mut dyn NetplayCore,
    ) -> Result<(), NetplayError> {
        let Command::Info(info) = command else {
            return Err(NetplayError::violation("expected INFO"));
        };
        let Some(info) = info else {
            // Peer has nothing loaded; tell it what we run and wait for a real INFO.
            return self.send_info(idx);
        };

        if let Err(err) = self.check_core_info(&info) {
            if !self.is_server() {
                // Lets the server log why we are leaving.
                let _ = self.send_info(idx);
            }
            return Err(err);
        }

        if self.is_server() {
            self.send_sync(idx, core)?;
            self.connections[idx].mode = ConnectionMode::Spectating;
            self.on_peer_ready(idx);
        } else {
            self.send_info(idx)?;
            self.connections[idx].mode = ConnectionMode::PreSync;
        }
        Ok(())
    }

    fn check_core_info(&self, remote: &InfoPayload) -> Result<(), NetplayError> {
        let local = &self.core_info;
        if remote.core_name != local.name {
            return Err(NetplayError::IncompatiblePeer {
                reason: format!(
                    "peer runs core \"{}\", we run \"{}\"",
                    remote.core_name, local.name
                ),
            });
        }
        if remote.core_version != local.version {
            notify_to!(
                self.sink,
                self.self_frame,
                NetplayEvent::CoreVersionMismatch {
                    local: local.version.clone(),
                    remote: remote.core_version.clone(),
                }
            );
        }
        if local.content_crc != 0
            && remote.content_crc != 0
            && local.content_crc != remote.content_crc
        {
            notify_to!(
                self.sink,
                self.self_frame,
                NetplayEvent::ContentMismatch {
                    local: local.content_crc,
                    remote: remote.content_crc,
                }
            );
        }
        Ok(())
    }

    fn send_sync(&mut self, idx: usize, core: &mut dyn NetplayCore) -> Result<(), NetplayError> {
        let nick = {
            let wanted = self.connections[idx].nick.clone();
            dedupe_nick(&wanted, |candidate| {
                candidate == self.nick
                    || self
                        .connections
                        .iter()
                        .enumerate()
                        .any(|(other, c)| other != idx && c.is_connected() && c.nick == candidate)
            })
        };
        if nick != self.connections[idx].nick {
            debug!(connection = idx, from = %self.connections[idx].nick, to = %nick, "renaming peer");
        }
        self.connections[idx].nick = nick;

        let mut connected_players = self.connected_players.bits();
        if self.local_paused || self.remote_paused {
            connected_players |= SYNC_PAUSED_BIT;
        }
        let mut share_modes = [0; MAX_PLAYERS];
        let mut client_devices = [0; MAX_PLAYERS];
        for device in 0..MAX_PLAYERS {
            share_modes[device] = self.share_modes[device].to_u8();
            client_devices[device] = self.client_devices[device].bits();
        }
        let header = SyncHeader {
            frame: self.self_frame,
            connected_players,
            flip_frame: if self.flip {
                self.flip_frame.as_u32()
            } else {
                0
            },
            devices: self.device_types,
            share_modes,
            client_devices,
            nick: nick_to_wire(&self.connections[idx].nick),
        };
        let save_ram = core.save_ram().map(|ram| ram.to_vec()).unwrap_or_default();

        let conn = &mut self.connections[idx];
        conn.send_command(&Command::Sync(Box::new(SyncPayload { header, save_ram })))?;
        conn.flush(false)
    }

    /// Server: a client finished its handshake.
    fn on_peer_ready(&mut self, idx: usize) {
        let nick = self.connections[idx].nick.clone();
        info!(connection = idx, %nick, addr = ?self.connections[idx].peer_addr(), "peer connected");
        notify_to!(self.sink, self.self_frame, NetplayEvent::PeerJoined { nick });
        if !self.quirks.forbids_transmission() {
            self.force_send_savestate = true;
        }
        if self.stall.reason() == StallReason::NoConnection {
            self.stall.clear();
        }
    }

    fn on_sync(
        &mut self,
        idx: usize,
        command: Command,
        core: &mut dyn NetplayCore,
    ) -> Result<(), NetplayError> {
        let Command::Sync(sync) = command else {
            return Err(NetplayError::violation("expected SYNC"));
        };
        let SyncPayload { header, save_ram } = *sync;
        let frame = header.frame;

        self.self_frame = frame;
        self.run_frame = frame;
        self.other_frame = frame;
        self.unread_frame = frame;
        self.server_frame = frame;
        self.ring.clear();
        self.ring.ready(frame, frame);
        self.ring
            .slot_mut(frame)
            .set_self_input([0; WORDS_PER_INPUT]);

        let players = header.connected_players;
        self.remote_paused = players & SYNC_PAUSED_BIT != 0;
        self.connected_players = PlayerMask::from_bits_truncate(players & !SYNC_PAUSED_BIT);
        self.connected_slaves = PlayerMask::EMPTY;
        self.read_frame = [Frame::ZERO; MAX_PLAYERS];
        for player in self.connected_players.iter() {
            self.read_frame[player] = frame;
        }
        self.flip = header.flip_frame != 0;
        self.flip_frame = Frame::new(header.flip_frame);

        for port in 0..MAX_PLAYERS {
            self.device_types[port] = header.devices[port];
            core.set_port_device(port, header.devices[port]);
            self.share_modes[port] = ShareMode::from_u8(header.share_modes[port]);
            self.client_devices[port] = PlayerMask::from_bits_truncate(header.client_devices[port]);
        }

        let nick = nick_from_wire(&header.nick);
        if !nick.is_empty() && nick != self.nick {
            self.nick = nick.clone();
            notify_to!(self.sink, frame, NetplayEvent::NickChanged { nick });
        }

        if let Some(ram) = core.save_ram() {
            if !ram.is_empty() && ram.len() == save_ram.len() {
                ram.copy_from_slice(&save_ram);
            } else if !save_ram.is_empty() {
                debug!(
                    local = ram.len(),
                    remote = save_ram.len(),
                    "save RAM size differs; ignoring the server's"
                );
            }
        }

        self.force_rewind = false;
        self.pending_reset = None;
        self.savestate_request_outstanding = false;
        self.stall.clear();
        self.self_mode = ConnectionMode::Spectating;
        self.connections[idx].mode = ConnectionMode::Playing;
        info!(nick = %self.nick, %frame, "connected to server");
        notify_to!(
            self.sink,
            frame,
            NetplayEvent::Connected {
                nick: self.nick.clone()
            }
        );

        if !self.config.start_as_spectator {
            self.connections[idx].send_command(&Command::Play { slave: false })?;
            self.connections[idx].flush(false)?;
        }
        Ok(())
    }
}
