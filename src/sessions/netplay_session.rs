use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};
use web_time::Instant;

use crate::error::NetplayError;
use crate::input::{FrameInput, ShareMode};
use crate::network::compression::Compression;
use crate::network::connection::{Connection, ConnectionId, ConnectionMode};
use crate::network::messages::{Command, ModePayload, PayloadLimits};
use crate::notify::{notify_to, NetplayEvent, NotificationSink};
use crate::sessions::config::{NetplayConfig, TimingConfig};
use crate::sessions::stall::{RunTimeWindow, StallGovernor, StallReason};
use crate::sync_layer::DeltaRing;
use crate::{
    CoreInfo, Frame, NetplayCore, PasswordHasher, PlayerMask, Quirks, StreamListener,
    MAX_PLAYERS,
};

/// Upper bound for a savestate payload while the state size is still unknown.
const UNKNOWN_STATE_PAYLOAD_LIMIT: usize = 64 << 20;

/// Which end of the session we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepts connections, arbitrates player slots and relays input.
    Server,
    /// Connected to exactly one server.
    Client,
}

/// A snapshot of one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Connection slot.
    pub id: ConnectionId,
    /// The peer's nickname, empty until the handshake got that far.
    pub nick: String,
    /// Handshake stage or connected mode.
    pub mode: ConnectionMode,
    /// Player slot, meaningful while playing.
    pub player: usize,
    /// Remote address, if the socket knows it.
    pub addr: Option<SocketAddr>,
    /// Whether the peer has paused.
    pub paused: bool,
}

/// A netplay session: the shared timeline of one server and its clients.
///
/// Drive it once per emulated frame, either with [`advance_frame`](Self::advance_frame),
/// or with [`pre_frame`](Self::pre_frame), a run of the core using
/// [`frame_input`](Self::frame_input), and [`post_frame`](Self::post_frame).
///
/// Connections that misbehave are hung up on their own; the session carries on and
/// reports what happened through its [`NotificationSink`]. A client whose server goes
/// away continues alone.
pub struct NetplaySession {
    pub(super) role: Role,
    pub(super) config: NetplayConfig,
    pub(super) timing: TimingConfig,
    /// Quirks in effect; grows when the core turns out to be unable to serialize.
    pub(super) quirks: Quirks,
    pub(super) hasher: Box<dyn PasswordHasher>,
    pub(super) sink: Arc<dyn NotificationSink>,
    pub(super) listener: Option<Box<dyn StreamListener>>,
    /// Server: one per peer, slots reused. Client: exactly one, the server.
    pub(super) connections: Vec<Connection>,
    pub(super) ring: DeltaRing,

    /// Next frame whose local input is captured.
    pub(super) self_frame: Frame,
    /// Next frame the core runs.
    pub(super) run_frame: Frame,
    /// First frame not yet confirmed; the rollback target.
    pub(super) other_frame: Frame,
    /// First frame for which some remote input is missing.
    pub(super) unread_frame: Frame,
    /// Client: first frame the server has not yet sent its own input for.
    pub(super) server_frame: Frame,
    /// Frame being replayed, while replaying.
    pub(super) replay_frame: Frame,
    pub(super) is_replay: bool,
    /// Per player, next frame whose input we expect.
    pub(super) read_frame: [Frame; MAX_PLAYERS],

    /// Serialized core size; 0 until serialization works.
    pub(super) state_size: usize,
    /// Largest compressed savestate we produce or accept.
    pub(super) zbuffer_size: usize,
    pub(super) zbuffer: Vec<u8>,

    pub(super) self_mode: ConnectionMode,
    pub(super) self_player: usize,
    /// Every playing slot, ours included.
    pub(super) connected_players: PlayerMask,
    pub(super) connected_slaves: PlayerMask,
    /// Per device, the players feeding it.
    pub(super) client_devices: [PlayerMask; MAX_PLAYERS],
    pub(super) device_types: [u32; MAX_PLAYERS],
    pub(super) share_modes: [ShareMode; MAX_PLAYERS],

    pub(super) local_paused: bool,
    pub(super) remote_paused: bool,
    pub(super) flip: bool,
    pub(super) flip_frame: Frame,

    pub(super) force_rewind: bool,
    pub(super) force_send_savestate: bool,
    /// Frame at which a received RESET takes effect, kept until it is confirmed.
    pub(super) pending_reset: Option<Frame>,
    pub(super) savestate_request_outstanding: bool,
    pub(super) desync: u32,
    pub(super) stateless_mode: bool,

    pub(super) stall: StallGovernor,
    pub(super) input_latency_frames: u32,
    pub(super) run_time: RunTimeWindow,
    pub(super) nick: String,
    pub(super) core_info: CoreInfo,

    /// Between `pre_frame` returning `true` and `post_frame`.
    in_frame: bool,
}

impl std::fmt::Debug for NetplaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("role", &self.role)
            .field("self_mode", &self.self_mode)
            .field("self_frame", &self.self_frame)
            .field("run_frame", &self.run_frame)
            .field("other_frame", &self.other_frame)
            .field("unread_frame", &self.unread_frame)
            .field("connected_players", &self.connected_players)
            .field("stall", &self.stall.reason())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl NetplaySession {
    pub(crate) fn new(
        role: Role,
        config: NetplayConfig,
        timing: TimingConfig,
        hasher: Box<dyn PasswordHasher>,
        sink: Arc<dyn NotificationSink>,
        core: &mut dyn NetplayCore,
    ) -> Self {
        let is_server = role == Role::Server;
        let ring = DeltaRing::new(DeltaRing::size_for(config.stall_frames, is_server));
        let mut device_types = [0; MAX_PLAYERS];
        for (port, device) in device_types.iter_mut().enumerate() {
            *device = core.port_device(port);
        }
        let share_modes = config.share_modes;

        let mut session = Self {
            role,
            quirks: config.quirks,
            nick: config.nick.clone(),
            config,
            timing,
            hasher,
            sink,
            listener: None,
            connections: Vec::new(),
            ring,
            self_frame: Frame::ZERO,
            run_frame: Frame::ZERO,
            other_frame: Frame::ZERO,
            unread_frame: Frame::ZERO,
            server_frame: Frame::ZERO,
            replay_frame: Frame::ZERO,
            is_replay: false,
            read_frame: [Frame::ZERO; MAX_PLAYERS],
            state_size: 0,
            zbuffer_size: 0,
            zbuffer: Vec::new(),
            self_mode: ConnectionMode::None,
            self_player: 0,
            connected_players: PlayerMask::EMPTY,
            connected_slaves: PlayerMask::EMPTY,
            client_devices: [PlayerMask::EMPTY; MAX_PLAYERS],
            device_types,
            share_modes,
            local_paused: false,
            remote_paused: false,
            flip: false,
            flip_frame: Frame::ZERO,
            force_rewind: false,
            force_send_savestate: false,
            pending_reset: None,
            savestate_request_outstanding: false,
            desync: 0,
            stateless_mode: false,
            stall: StallGovernor::default(),
            input_latency_frames: 0,
            run_time: RunTimeWindow::default(),
            core_info: core.info(),
            in_frame: false,
        };
        session.input_latency_frames = session.config.input_latency_min;

        if session.quirks.contains(Quirks::NO_SAVESTATES) {
            session.stateless_mode = true;
        } else if !session.quirks.contains(Quirks::INITIALIZATION)
            && !session.init_serialization(core)
        {
            session.disable_savestates();
        }

        if is_server && !session.config.start_as_spectator {
            session.self_mode = ConnectionMode::Playing;
            session.self_player = 0;
            session.connected_players.insert(0);
            session.client_devices[0].insert(0);
        } else if is_server {
            session.self_mode = ConnectionMode::Spectating;
        }
        session
    }

    // ###############
    // # ACCESSORS   #
    // ###############

    /// Whether we are the server or a client.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Shorthand for `role() == Role::Server`.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Next frame whose local input will be captured.
    #[must_use]
    pub fn self_frame(&self) -> Frame {
        self.self_frame
    }

    /// Next frame the core will run.
    #[must_use]
    pub fn run_frame(&self) -> Frame {
        self.run_frame
    }

    /// Oldest frame not yet confirmed by every peer.
    #[must_use]
    pub fn other_frame(&self) -> Frame {
        self.other_frame
    }

    /// First frame with remote input still missing, never past
    /// [`self_frame`](Self::self_frame).
    #[must_use]
    pub fn unread_frame(&self) -> Frame {
        self.unread_frame.min(self.self_frame)
    }

    /// Client: first frame the server has not yet accounted for.
    #[must_use]
    pub fn server_frame(&self) -> Frame {
        self.server_frame
    }

    /// Next frame of input expected from `player`.
    #[must_use]
    pub fn read_frame(&self, player: usize) -> Option<Frame> {
        self.read_frame.get(player).copied()
    }

    /// Our own mode.
    #[must_use]
    pub fn self_mode(&self) -> ConnectionMode {
        self.self_mode
    }

    /// Our player slot while playing.
    #[must_use]
    pub fn self_player(&self) -> Option<usize> {
        self.self_mode.is_playing().then_some(self.self_player)
    }

    /// Every playing slot, ours included.
    #[must_use]
    pub fn connected_players(&self) -> PlayerMask {
        self.connected_players
    }

    /// Slots played in slave mode.
    #[must_use]
    pub fn connected_slaves(&self) -> PlayerMask {
        self.connected_slaves
    }

    /// Why the session is holding, if it is.
    #[must_use]
    pub fn stall_reason(&self) -> StallReason {
        self.stall.reason()
    }

    /// Whether at least one peer has completed the handshake.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connections.iter().any(Connection::is_connected)
    }

    /// Whether the core is currently re-running a frame after a rollback.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.is_replay
    }

    /// Whether the session runs without savestates and waits for input every frame.
    #[must_use]
    pub fn is_stateless(&self) -> bool {
        self.stateless_mode
    }

    /// Quirks in effect.
    #[must_use]
    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// Our nickname, possibly changed by the server.
    #[must_use]
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Current local input delay in frames.
    #[must_use]
    pub fn input_latency_frames(&self) -> u32 {
        self.input_latency_frames
    }

    /// Whether we paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.local_paused
    }

    /// Whether a peer has paused.
    #[must_use]
    pub fn is_remote_paused(&self) -> bool {
        self.remote_paused
    }

    /// Whether savestate transmission is suspended by [`push_desync`](Self::push_desync).
    #[must_use]
    pub fn is_desync_active(&self) -> bool {
        self.desync > 0
    }

    /// Whether ports 0 and 1 are swapped for the frame the core is about to see.
    #[must_use]
    pub fn ports_flipped(&self) -> bool {
        self.flip_port()
    }

    /// Serialized state size, 0 until the core can serialize.
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// Snapshots of every active connection.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active())
            .map(|(idx, c)| PeerInfo {
                id: ConnectionId(idx),
                nick: c.nick.clone(),
                mode: c.mode,
                player: c.player,
                addr: c.peer_addr(),
                paused: c.paused,
            })
            .collect()
    }

    // ###############
    // # FRAME LOOP  #
    // ###############

    /// Runs one whole frame: [`pre_frame`](Self::pre_frame), the core, then
    /// [`post_frame`](Self::post_frame).
    ///
    /// Returns whether the core ran. When the session is stalled the frame is skipped
    /// but the network is still serviced.
    pub fn advance_frame(&mut self, core: &mut dyn NetplayCore) -> Result<bool, NetplayError> {
        if !self.pre_frame(core)? {
            return Ok(false);
        }
        let input = self.frame_input();
        let start = Instant::now();
        core.run(&input);
        self.run_time.record(start.elapsed());
        self.post_frame(core)?;
        Ok(true)
    }

    /// Prepares a frame: snapshots the core, services connections and captures input.
    ///
    /// Returns `false` when the session is stalled. In that case the frame has already
    /// been wrapped up: do not run the core and do not call
    /// [`post_frame`](Self::post_frame).
    pub fn pre_frame(&mut self, core: &mut dyn NetplayCore) -> Result<bool, NetplayError> {
        if self.in_frame {
            return Err(NetplayError::InvalidRequest {
                info: "pre_frame called twice without post_frame".to_owned(),
            });
        }
        let proceed = self.pre_frame_sync(core);
        if !proceed {
            trace!(frame = %self.self_frame, stall = %self.stall.reason(), "frame stalled");
            self.post_frame_sync(core, true);
            self.flush_all();
            return Ok(false);
        }
        self.in_frame = true;
        Ok(true)
    }

    /// Finishes a frame the core has run: reconciles remote input, rolls back and
    /// replays if a prediction was wrong, and flushes every connection.
    pub fn post_frame(&mut self, core: &mut dyn NetplayCore) -> Result<(), NetplayError> {
        if !self.in_frame {
            return Err(NetplayError::InvalidRequest {
                info: "post_frame called without a successful pre_frame".to_owned(),
            });
        }
        self.in_frame = false;
        self.update_unread();
        self.post_frame_sync(core, false);
        self.flush_all();
        Ok(())
    }

    /// The resolved input for the frame the core is about to run (or replay).
    #[must_use]
    pub fn frame_input(&self) -> FrameInput {
        let frame = if self.is_replay {
            self.replay_frame
        } else {
            self.run_frame
        };
        self.resolved_input(frame)
    }

    /// One input value for the current frame, the way a core's input callback asks.
    #[must_use]
    pub fn input_state(&self, port: usize, device: u32, index: u32, id: u32) -> i16 {
        self.frame_input().state(port, device, index, id)
    }

    // ###############
    // # CONNECTIONS #
    // ###############

    /// Payload bounds for commands read from any connection.
    pub(super) fn payload_limits(&self) -> PayloadLimits {
        let unsized_init = self.zbuffer_size == 0 && self.quirks.contains(Quirks::INITIALIZATION);
        let max_savestate = if unsized_init {
            UNKNOWN_STATE_PAYLOAD_LIMIT
        } else {
            self.zbuffer_size + 8
        };
        PayloadLimits {
            max_savestate,
            max_save_ram: self.config.max_save_ram,
        }
    }

    /// Sends to one connection, hanging it up on failure.
    pub(super) fn send_to(&mut self, idx: usize, command: &Command) -> bool {
        let Some(conn) = self.connections.get_mut(idx) else {
            return false;
        };
        if !conn.is_active() {
            return false;
        }
        match conn.send_command(command) {
            Ok(()) => true,
            Err(err) => {
                self.hangup_with_error(idx, &err);
                false
            },
        }
    }

    /// Sends to every connected peer except `except`.
    pub(super) fn broadcast(&mut self, command: &Command, except: Option<usize>) {
        for idx in 0..self.connections.len() {
            if Some(idx) == except || !self.connections[idx].is_connected() {
                continue;
            }
            self.send_to(idx, command);
        }
    }

    /// Tells everyone else about a mode change for `player`.
    pub(super) fn broadcast_mode(
        &mut self,
        frame: Frame,
        player: usize,
        playing: bool,
        except: Option<usize>,
    ) {
        let mode = Command::Mode(ModePayload {
            frame,
            you: false,
            playing,
            slave: false,
            player: player as u16,
        });
        self.broadcast(&mode, except);
    }

    pub(super) fn flush_all(&mut self) {
        for idx in 0..self.connections.len() {
            if !self.connections[idx].is_active() {
                continue;
            }
            if let Err(err) = self.connections[idx].flush(false) {
                self.hangup_with_error(idx, &err);
            }
        }
    }

    /// Reads at most one command (or handshake step) from a connection.
    ///
    /// Returns whether anything was consumed.
    pub(super) fn read_connection(
        &mut self,
        idx: usize,
        core: &mut dyn NetplayCore,
    ) -> Result<bool, NetplayError> {
        let conn = &self.connections[idx];
        if !conn.is_active() || conn.mode == ConnectionMode::DelayedDisconnect {
            return Ok(false);
        }
        if self.process_buffered(idx, core)? {
            return Ok(true);
        }
        if self.connections[idx].fill()? == 0 {
            return Ok(false);
        }
        self.process_buffered(idx, core)
    }

    fn process_buffered(
        &mut self,
        idx: usize,
        core: &mut dyn NetplayCore,
    ) -> Result<bool, NetplayError> {
        let mode = self.connections[idx].mode;
        if mode.is_handshaking() {
            let progressed = self.handshake_step(idx, core)?;
            if progressed && self.connections[idx].is_connected() {
                self.send_cur_input(idx);
            }
            return Ok(progressed);
        }
        let limits = self.payload_limits();
        match self.connections[idx].next_command(&limits)? {
            Some(command) => {
                trace!(connection = idx, command = ?command.id(), "received");
                self.handle_command(idx, command, core)?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn handle_command(
        &mut self,
        idx: usize,
        command: Command,
        core: &mut dyn NetplayCore,
    ) -> Result<(), NetplayError> {
        match command {
            Command::Ack => Ok(()),
            Command::Nak => Err(NetplayError::socket("peer rejected our last command")),
            Command::Disconnect => {
                if self.connections[idx].has_queued_output() {
                    self.schedule_disconnect(idx);
                } else {
                    self.hangup(idx, "peer disconnected");
                }
                Ok(())
            },
            Command::Input(input) => self.on_input(idx, input),
            Command::NoInput { frame } => self.on_noinput(frame),
            Command::FlipPlayers { frame } => self.on_flip_players(frame),
            Command::Spectate => self.on_spectate(idx),
            Command::Play { slave } => self.on_play(idx, slave),
            Command::Mode(mode) => self.on_mode(idx, mode),
            Command::ModeRefused(reason) => self.on_mode_refused(reason),
            Command::Crc { frame, crc } => self.on_crc(frame, crc),
            Command::RequestSavestate => self.on_request_savestate(),
            Command::LoadSavestate(state) => self.on_load_savestate(idx, state, core),
            Command::Pause(nick) => self.on_pause(idx, nick),
            Command::Resume => self.on_resume(idx),
            Command::Stall { frames } => self.on_stall_command(idx, frames),
            Command::Reset { frame } => self.on_reset(idx, frame, core),
            Command::Nick(_) | Command::Password(_) | Command::Info(_) | Command::Sync(_) => {
                Err(NetplayError::violation(
                    "handshake command after the handshake completed",
                ))
            },
        }
    }

    // ###############
    // # HANGUP      #
    // ###############

    /// Hangs up after an error, sending NAK first when the peer broke the protocol.
    pub(super) fn hangup_with_error(&mut self, idx: usize, err: &NetplayError) {
        if err.warrants_nak() {
            if let Some(conn) = self.connections.get_mut(idx) {
                if conn.send_command(&Command::Nak).is_ok() {
                    conn.flush_before_close();
                }
            }
            notify_to!(
                self.sink,
                self.self_frame,
                NetplayEvent::ProtocolViolation {
                    reason: err.to_string()
                }
            );
        }
        self.hangup(idx, &err.to_string());
    }

    pub(super) fn hangup_all(&mut self, err: &NetplayError) {
        for idx in 0..self.connections.len() {
            if self.connections[idx].is_active() {
                self.hangup_with_error(idx, err);
            }
        }
    }

    /// Closes a connection and forgets everything it contributed.
    pub(super) fn hangup(&mut self, idx: usize, reason: &str) {
        let Some(conn) = self.connections.get_mut(idx) else {
            return;
        };
        if conn.mode == ConnectionMode::None {
            return;
        }
        let nick = conn.nick.clone();
        let was_mode = conn.mode;
        let was_paused = conn.paused;
        let player = conn.player;
        conn.close();
        info!(connection = idx, %nick, reason, "hanging up");

        if self.is_server() {
            if was_mode.is_playing() {
                self.connected_players.remove(player);
                self.connected_slaves.remove(player);
                self.client_devices[player].remove(player);
                let frame = self.read_frame[player];
                self.broadcast_mode(frame, player, false, Some(idx));
                notify_to!(self.sink, self.self_frame, NetplayEvent::PlayerLeft { player });
            }
            if was_paused {
                self.remote_paused = self.connections.iter().any(|c| c.is_active() && c.paused);
            }
        } else {
            self.self_mode = ConnectionMode::None;
            self.connected_players = PlayerMask::EMPTY;
            self.connected_slaves = PlayerMask::EMPTY;
            self.client_devices = [PlayerMask::EMPTY; MAX_PLAYERS];
            self.remote_paused = false;
            self.flip = false;
            self.flip_frame = Frame::ZERO;
            self.stall.clear();
        }
        notify_to!(
            self.sink,
            self.self_frame,
            NetplayEvent::Hangup {
                nick,
                reason: reason.to_owned()
            }
        );
    }

    /// Hangs up connections that were asked to leave once their last bytes are out.
    pub(super) fn process_delayed_disconnects(&mut self) {
        for idx in 0..self.connections.len() {
            if self.connections[idx].mode == ConnectionMode::DelayedDisconnect {
                self.connections[idx].flush_before_close();
                self.hangup(idx, "disconnected");
            }
        }
    }

    /// Stops reading from a connection and leaves it open until the end of the frame,
    /// so whatever is still queued for it goes out first. A server frees the player
    /// slot right away.
    fn schedule_disconnect(&mut self, idx: usize) {
        let conn = &self.connections[idx];
        let (was_mode, player) = (conn.mode, conn.player);
        if self.is_server() && was_mode.is_playing() {
            self.connected_players.remove(player);
            self.connected_slaves.remove(player);
            self.client_devices[player].remove(player);
            let frame = self.read_frame[player];
            self.broadcast_mode(frame, player, false, Some(idx));
            notify_to!(self.sink, self.self_frame, NetplayEvent::PlayerLeft { player });
        }
        debug!(connection = idx, "disconnect scheduled");
        self.connections[idx].mode = ConnectionMode::DelayedDisconnect;
    }

    /// Server: asks one peer to leave. It is sent DISCONNECT and hung up at the end of
    /// the next frame.
    pub fn kick(&mut self, id: ConnectionId) -> Result<(), NetplayError> {
        if !self.is_server() {
            return Err(NetplayError::InvalidRequest {
                info: "only the server can disconnect individual peers".to_owned(),
            });
        }
        let idx = id.get();
        match self.connections.get(idx) {
            Some(conn) if conn.is_active() => {},
            _ => {
                return Err(NetplayError::InvalidRequest {
                    info: format!("no active connection {}", id),
                })
            },
        }
        if self.send_to(idx, &Command::Disconnect) {
            self.schedule_disconnect(idx);
        }
        Ok(())
    }

    /// Sends DISCONNECT to every peer and hangs them all up.
    ///
    /// A client continues alone afterwards; a server stops accepting.
    pub fn disconnect(&mut self) {
        for idx in 0..self.connections.len() {
            if !self.connections[idx].is_active() {
                continue;
            }
            if self.connections[idx].send_command(&Command::Disconnect).is_ok() {
                self.connections[idx].flush_before_close();
            }
            self.hangup(idx, "local disconnect");
        }
        self.listener = None;
        debug!("netplay session disconnected");
    }

    // ###############
    // # INTERNALS   #
    // ###############

    /// Sizes every buffer that depends on the serialized state size.
    ///
    /// Returns `false` if the core cannot report a size yet.
    pub(super) fn init_serialization(&mut self, core: &mut dyn NetplayCore) -> bool {
        if self.state_size > 0 {
            return true;
        }
        let size = core.serialize_size();
        if size == 0 {
            return false;
        }
        self.state_size = size;
        self.ring.allocate_states(size);
        self.zbuffer_size = Compression::max_compressed_len(size);
        self.zbuffer = Vec::with_capacity(self.zbuffer_size);
        true
    }

    /// Savestates cannot be used at all; fall back to waiting for input every frame.
    pub(super) fn disable_savestates(&mut self) {
        if self.stateless_mode {
            return;
        }
        warn!("core cannot serialize; running without savestates");
        self.quirks.insert(Quirks::NO_SAVESTATES);
        self.stateless_mode = true;
        notify_to!(
            self.sink,
            self.self_frame,
            NetplayEvent::SavestatesUnavailable
        );
    }

    /// Remote players, i.e. playing slots that are not ours.
    pub(super) fn remote_players(&self) -> PlayerMask {
        if self.self_mode == ConnectionMode::Playing {
            self.connected_players.without(self.self_player)
        } else {
            self.connected_players
        }
    }

    pub(super) fn connection_index_for_player(&self, player: usize) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| c.is_active() && c.mode.is_playing() && c.player == player)
    }
}

impl Drop for NetplaySession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
