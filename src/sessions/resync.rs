//! Keeping every peer on the same timeline.
//!
//! Before a frame runs the core is snapshotted into the frame's ring slot. After it
//! runs, frames whose remote input has all arrived are checked against what was
//! predicted; on a mismatch the core is restored to the oldest unconfirmed frame and
//! replayed with the real input. The server periodically sends state checksums, and a
//! client that disagrees asks for the server's state outright.
//!
//! Player slot changes, pauses and resets also live here: each of them moves the
//! shared timeline, and all of them are decided by the server.

use tracing::{debug, info, trace, warn};
use web_time::Instant;

use super::input_sync::NEUTRAL;
use crate::checksum::state_crc;
use crate::error::NetplayError;
use crate::network::compression::Compression;
use crate::network::connection::ConnectionMode;
use crate::network::messages::{
    Command, InputPayload, LoadSavestatePayload, ModePayload, ModeRefusedReason,
};
use crate::notify::{notify_to, NetplayEvent};
use crate::sessions::netplay_session::NetplaySession;
use crate::sessions::stall::StallReason;
use crate::{Frame, FrameInput, NetplayCore, Quirks, MAX_PLAYERS};

/// Frames a core with the initialization quirk may need before it can serialize.
const MAX_INITIALIZATION_FRAMES: u32 = 60;

impl NetplaySession {
    // ###############
    // # FRAME SYNC  #
    // ###############

    /// Everything that happens before the core runs a frame.
    ///
    /// Returns `false` if the session is stalled and the core must not run.
    pub(super) fn pre_frame_sync(&mut self, core: &mut dyn NetplayCore) -> bool {
        if self.quirks.contains(Quirks::INITIALIZATION) {
            self.try_init_serialization(core);
        }

        let run = self.run_frame;
        if self.ring.ready(run, self.other_frame) {
            if self.pending_reset == Some(run) {
                debug!(frame = %run, "applying reset");
                core.reset();
            }
            if run > Frame::ZERO && !self.quirks.contains(Quirks::INITIALIZATION) {
                self.snapshot(core, run);
            }
            if self.force_send_savestate && !self.stall.is_stalled() && !self.remote_paused {
                self.send_current_savestate(core);
                self.force_send_savestate = false;
            }
        } else {
            warn!(frame = %run, other = %self.other_frame, "no ring slot for the running frame");
        }

        if self.is_server()
            && self.run_frame > Frame::ZERO
            && self.quirks.forbids_transmission()
            && !self.is_connected()
            && self.stall.reason() != StallReason::NoConnection
        {
            self.stall.set(StallReason::NoConnection, None);
            self.report_stall();
        }

        if self.is_server() {
            self.accept_connections();
        }

        if !self.capture_input(core) {
            warn!(frame = %self.self_frame, other = %self.other_frame, "input ring overflow");
            self.hangup_all(&NetplayError::IncompatiblePeer {
                reason: "input ring overflow".to_owned(),
            });
        }

        let block = self.stateless_mode
            && !self.remote_players().is_empty()
            && self.unread_frame <= self.run_frame;
        self.poll_net_input(core, block);

        if self.self_mode == ConnectionMode::None {
            return self.stall.reason() != StallReason::NoConnection;
        }

        self.resolve_frame(self.run_frame);
        self.handle_slaves();
        self.update_unread();
        self.adjust_input_latency();
        self.consider_unstall();
        self.consider_stall();
        self.check_stall_timeout();

        let stalled = self.stall.reason() == StallReason::NoConnection
            || ((!self.is_server() || !self.remote_players().is_empty())
                && (self.stall.is_stalled() || self.remote_paused));
        !stalled
    }

    /// Everything that happens after the core ran a frame, or after a stalled frame
    /// was skipped.
    pub(super) fn post_frame_sync(&mut self, core: &mut dyn NetplayCore, stalled: bool) {
        let latency_only =
            self.stall.reason() == StallReason::InputLatency && !self.remote_paused;
        if !stalled || latency_only {
            self.self_frame = self.self_frame.next();
        }
        if !stalled {
            self.run_frame = self.run_frame.next();
        }

        let alone = (self.is_server() && self.remote_players().is_empty())
            || !self.self_mode.is_connected()
            || self.desync > 0;
        if alone {
            if self.is_server() && !stalled {
                self.handle_frame_hash(self.run_frame.prev());
            }
            self.other_frame = self.self_frame;
        } else {
            // A forced rewind restarts from other_frame as it stands, where a loaded
            // state or a changed past input sits.
            let mut rewind = self.force_rewind;
            while !rewind
                && self.other_frame < self.unread_frame
                && self.other_frame < self.run_frame
            {
                let frame = self.other_frame;
                if self.prediction_failed(frame) {
                    trace!(%frame, "prediction failed");
                    rewind = true;
                    break;
                }
                self.handle_frame_hash(frame);
                self.other_frame = frame.next();
            }

            if rewind {
                self.replay(core);
            }
            self.other_frame = self.unread_frame.min(self.run_frame);
            self.force_rewind = false;

            if self.run_frame < self.other_frame {
                self.run_frame = self.other_frame;
                self.self_frame = self.self_frame.max(self.run_frame);
            }
        }

        if let Some(reset) = self.pending_reset {
            if reset < self.other_frame && reset < self.run_frame {
                self.pending_reset = None;
            }
        }

        if self.is_server() {
            self.request_client_stalls();
        }
        self.process_delayed_disconnects();
    }

    /// Restores the state at `other_frame` and runs the core forward to `run_frame`
    /// with the best input now known.
    fn replay(&mut self, core: &mut dyn NetplayCore) {
        let start = self.other_frame;
        let restored = match self.ring.find(start) {
            Some(slot) if slot.has_state() => core.unserialize(slot.state()),
            _ => false,
        };
        if !restored {
            warn!(frame = %start, "no savestate to rewind to; skipping replay");
            return;
        }
        debug!(from = %start, to = %self.run_frame, "replaying");

        self.is_replay = true;
        let mut frame = start;
        while frame < self.run_frame {
            self.replay_frame = frame;
            if self.pending_reset == Some(frame) {
                core.reset();
            }
            if !self.stateless_mode {
                self.snapshot(core, frame);
            }
            if frame < self.unread_frame {
                self.handle_frame_hash(frame);
            }
            self.resolve_frame(frame);
            let input = self.resolved_input(frame);
            let started = Instant::now();
            core.run(&input);
            self.run_time.record(started.elapsed());
            frame = frame.next();
        }
        self.is_replay = false;
    }

    /// Serializes the core into `frame`'s slot. Returns whether a state was stored.
    fn snapshot(&mut self, core: &mut dyn NetplayCore, frame: Frame) -> bool {
        if self.stateless_mode || self.state_size == 0 {
            return false;
        }
        let Some(slot) = self.ring.find_mut(frame) else {
            return false;
        };
        let stored = core.serialize(slot.state_mut());
        slot.mark_state(stored);
        if !stored {
            self.disable_savestates();
        }
        stored
    }

    /// Sizes the savestate buffers as soon as a core with the initialization quirk can
    /// report its state size.
    fn try_init_serialization(&mut self, core: &mut dyn NetplayCore) -> bool {
        if !self.init_serialization(core) {
            return false;
        }
        info!(size = self.state_size, "core serialization initialized");
        self.quirks.remove(Quirks::INITIALIZATION);
        true
    }

    /// Runs the core with neutral input until it can serialize.
    fn wait_and_init_serialization(&mut self, core: &mut dyn NetplayCore) -> bool {
        for _ in 0..MAX_INITIALIZATION_FRAMES {
            if self.try_init_serialization(core) {
                return true;
            }
            core.run(&FrameInput::new(
                self.run_frame,
                false,
                [NEUTRAL; MAX_PLAYERS],
                self.device_types,
            ));
        }
        self.try_init_serialization(core)
    }

    // ###############
    // # CHECKSUMS   #
    // ###############

    /// Called once per confirmed frame. The server shares a checksum every
    /// `check_frames` frames; a client checks one it was sent earlier.
    fn handle_frame_hash(&mut self, frame: Frame) {
        if self.is_server() {
            let check = self.config.check_frames;
            if check == 0 || frame.as_u32() % check != 0 {
                return;
            }
            let crc = match self.ring.find(frame) {
                Some(slot) if slot.has_state() => state_crc(slot.state()),
                _ => return,
            };
            trace!(%frame, crc, "sending state checksum");
            self.broadcast(&Command::Crc { frame, crc }, None);
            return;
        }

        let Some(slot) = self.ring.find_mut(frame) else {
            return;
        };
        let Some(expected) = slot.pending_crc() else {
            return;
        };
        slot.set_pending_crc(None);
        if slot.has_state() {
            let local = state_crc(slot.state());
            if local != expected {
                self.on_desync(frame, expected, local);
            }
        }
    }

    pub(super) fn on_crc(&mut self, frame: Frame, crc: u32) -> Result<(), NetplayError> {
        if self.is_server() {
            return Err(NetplayError::violation("CRC sent to the server"));
        }
        if frame <= self.other_frame {
            let local = match self.ring.find(frame) {
                Some(slot) if slot.has_state() => state_crc(slot.state()),
                _ => return Ok(()),
            };
            if local != crc {
                self.on_desync(frame, crc, local);
            }
            return Ok(());
        }
        if self.ring.ready(frame, self.other_frame) {
            self.ring.slot_mut(frame).set_pending_crc(Some(crc));
        } else {
            trace!(%frame, "no slot for checksum, dropping it");
        }
        Ok(())
    }

    fn on_desync(&mut self, frame: Frame, expected: u32, local: u32) {
        warn!(
            %frame,
            expected = format_args!("{expected:08x}"),
            local = format_args!("{local:08x}"),
            "desync detected"
        );
        notify_to!(self.sink, frame, NetplayEvent::Desync);
        self.request_savestate();
    }

    /// Client: asks the server for its state, once until one arrives.
    fn request_savestate(&mut self) {
        if self.savestate_request_outstanding || self.quirks.forbids_transmission() {
            return;
        }
        self.broadcast(&Command::RequestSavestate, None);
        self.savestate_request_outstanding = true;
    }

    pub(super) fn on_request_savestate(&mut self) -> Result<(), NetplayError> {
        self.force_send_savestate = true;
        Ok(())
    }

    // ###############
    // # SAVESTATES  #
    // ###############

    /// Sends the state stored for `frame` to every connected peer, compressed the way
    /// each one negotiated.
    pub(super) fn broadcast_savestate(&mut self, frame: Frame) {
        if self.desync > 0 || self.quirks.forbids_transmission() {
            return;
        }
        if !self.is_server() && self.self_mode != ConnectionMode::Playing {
            return;
        }
        let state = match self.ring.find(frame) {
            Some(slot) if slot.has_state() => slot.state().to_vec(),
            _ => return,
        };

        for compression in [Compression::Nil, Compression::Zlib] {
            let targets: Vec<usize> = self
                .connections
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_connected() && c.compression == compression)
                .map(|(idx, _)| idx)
                .collect();
            if targets.is_empty() {
                continue;
            }
            self.zbuffer.clear();
            if let Err(err) = compression.compress(&state, &mut self.zbuffer) {
                warn!(?compression, %err, "failed to compress savestate");
                continue;
            }
            let command = Command::LoadSavestate(LoadSavestatePayload {
                frame,
                inflated_size: state.len() as u32,
                data: self.zbuffer.clone(),
            });
            debug!(
                %frame,
                ?compression,
                bytes = self.zbuffer.len(),
                peers = targets.len(),
                "sending savestate"
            );
            for idx in targets {
                self.send_to(idx, &command);
            }
        }
    }

    /// Catches the running frame up with the input frame, then records and sends the
    /// core's state there.
    fn send_current_savestate(&mut self, core: &mut dyn NetplayCore) {
        self.force_future();
        let frame = self.run_frame;
        if self.ring.ready(frame, self.other_frame) && self.snapshot(core, frame) {
            self.broadcast_savestate(frame);
        }
    }

    pub(super) fn on_load_savestate(
        &mut self,
        idx: usize,
        payload: LoadSavestatePayload,
        core: &mut dyn NetplayCore,
    ) -> Result<(), NetplayError> {
        let conn = &self.connections[idx];
        if conn.mode != ConnectionMode::Playing {
            return Err(NetplayError::violation(
                "LOAD_SAVESTATE from a connection that is not playing",
            ));
        }
        let expected = if self.is_server() {
            self.read_frame[conn.player]
        } else {
            self.server_frame
        };
        let compression = conn.compression;
        let frame = payload.frame;
        if frame != expected {
            return Err(NetplayError::violation(format!(
                "LOAD_SAVESTATE for frame {frame} while expecting {expected}"
            )));
        }

        if self.quirks.contains(Quirks::INITIALIZATION) {
            self.wait_and_init_serialization(core);
        }
        if self.state_size == 0 || self.stateless_mode {
            return Err(NetplayError::SerializationUnavailable);
        }
        if payload.inflated_size as usize != self.state_size {
            return Err(NetplayError::violation(format!(
                "savestate of {} bytes, ours are {}",
                payload.inflated_size, self.state_size
            )));
        }
        if !self.ring.ready(frame, frame) {
            return Err(NetplayError::violation(format!(
                "no room to load a savestate for frame {frame}"
            )));
        }
        let slot = self.ring.slot_mut(frame);
        if let Err(err) = compression.decompress(&payload.data, slot.state_mut()) {
            slot.mark_state(false);
            return Err(NetplayError::violation(format!("undecodable savestate: {err}")));
        }
        slot.mark_state(true);
        debug!(connection = idx, %frame, "loaded peer savestate");

        if frame > self.run_frame {
            // post_frame moves the run frame onto the loaded one.
            self.run_frame = frame.prev();
            if frame > self.self_frame {
                self.self_frame = self.run_frame;
            }
        }
        for player in self.connected_players.iter() {
            if self.read_frame[player] < frame {
                self.read_frame[player] = frame;
            }
        }
        if self.server_frame < frame {
            self.server_frame = frame;
        }
        self.update_unread();

        self.force_rewind = true;
        self.savestate_request_outstanding = false;
        self.other_frame = frame;
        if self.is_server() {
            self.force_send_savestate = true;
        }
        Ok(())
    }

    /// Makes `self_frame` the running frame and never rewinds past it again.
    fn force_future(&mut self) {
        self.run_frame = self.self_frame;
        self.update_unread();
        if self.unread_frame < self.run_frame {
            let run = self.run_frame;
            for player in self.connected_players.iter() {
                if self.read_frame[player] < run {
                    self.read_frame[player] = run;
                }
            }
            if self.server_frame < run {
                self.server_frame = run;
            }
            self.update_unread();
        }
        if self.other_frame < self.run_frame {
            self.other_frame = self.run_frame;
        }
    }

    /// The host loaded a state into the core: record it as the current frame's state
    /// and hand it to every peer.
    ///
    /// Nothing is sent while [`push_desync`](Self::push_desync) is in effect or the
    /// quirks forbid transmission.
    pub fn load_savestate(&mut self, core: &mut dyn NetplayCore) -> Result<(), NetplayError> {
        self.force_future();
        let frame = self.run_frame;
        if !self.ring.ready(frame, self.other_frame) {
            return Err(NetplayError::InvalidRequest {
                info: format!("no ring slot for frame {frame}"),
            });
        }
        if !self.snapshot(core, frame) {
            return Err(NetplayError::SerializationUnavailable);
        }
        self.broadcast_savestate(frame);
        Ok(())
    }

    /// Resets the core now and tells every peer to reset at the same frame.
    pub fn reset(&mut self, core: &mut dyn NetplayCore) {
        self.force_future();
        core.reset();
        let frame = self.self_frame;
        info!(%frame, "resetting core");
        self.broadcast(&Command::Reset { frame }, None);
    }

    pub(super) fn on_reset(
        &mut self,
        idx: usize,
        frame: Frame,
        core: &mut dyn NetplayCore,
    ) -> Result<(), NetplayError> {
        if self.is_server() {
            if self.connections[idx].mode != ConnectionMode::Playing {
                return Err(NetplayError::violation(
                    "RESET from a connection that is not playing",
                ));
            }
            self.broadcast(&Command::Reset { frame }, Some(idx));
        }
        if frame < self.other_frame {
            debug!(%frame, other = %self.other_frame, "reset for a confirmed frame, applying now");
            core.reset();
            return Ok(());
        }
        // The check for the running frame has already happened by the time input is
        // polled, so a reset at run_frame needs a replay too.
        if frame <= self.run_frame || frame < self.self_frame {
            self.force_rewind = true;
        }
        self.pending_reset = Some(frame);
        Ok(())
    }

    // ###############
    // # DESYNC      #
    // ###############

    /// Starts a stretch in which local savestate loads are not shared. Nests.
    pub fn push_desync(&mut self) {
        self.desync += 1;
    }

    /// Ends a [`push_desync`](Self::push_desync) stretch. Leaving the outermost one
    /// sends the current state to everyone.
    pub fn pop_desync(&mut self) -> Result<(), NetplayError> {
        if self.desync == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "pop_desync without a matching push_desync".to_owned(),
            });
        }
        self.desync -= 1;
        if self.desync == 0 && !self.quirks.forbids_transmission() {
            self.force_send_savestate = true;
        }
        Ok(())
    }

    // ###############
    // # PAUSE       #
    // ###############

    /// Pauses or resumes locally and tells every peer right away.
    pub fn set_paused(&mut self, paused: bool) {
        if self.local_paused == paused {
            return;
        }
        self.local_paused = paused;

        // With several peers paused we stand in for them, and are not resumed to any.
        let paused_peers = self
            .connections
            .iter()
            .filter(|c| c.is_active() && c.paused)
            .count();
        if paused_peers > 1 {
            return;
        }
        let command = if paused {
            Command::Pause(self.nick.clone())
        } else {
            Command::Resume
        };
        for idx in 0..self.connections.len() {
            if !self.connections[idx].is_connected() || !self.send_to(idx, &command) {
                continue;
            }
            if let Err(err) = self.connections[idx].flush(true) {
                self.hangup_with_error(idx, &err);
            }
        }
    }

    pub(super) fn on_pause(&mut self, idx: usize, nick: String) -> Result<(), NetplayError> {
        let nick = if self.is_server() {
            let nick = self.connections[idx].nick.clone();
            self.broadcast(&Command::Pause(nick.clone()), Some(idx));
            nick
        } else {
            nick
        };
        self.connections[idx].paused = true;
        self.remote_paused = true;
        info!(%nick, "peer paused");
        notify_to!(self.sink, self.self_frame, NetplayEvent::Paused { nick });
        Ok(())
    }

    pub(super) fn on_resume(&mut self, idx: usize) -> Result<(), NetplayError> {
        self.connections[idx].paused = false;
        self.remote_paused = self
            .connections
            .iter()
            .any(|c| c.is_active() && c.paused);
        if !self.remote_paused {
            if !self.local_paused {
                self.broadcast(&Command::Resume, Some(idx));
            }
            notify_to!(self.sink, self.self_frame, NetplayEvent::Resumed);
        }
        Ok(())
    }

    // ###############
    // # MODES       #
    // ###############

    fn refuse_mode(&mut self, idx: usize, reason: ModeRefusedReason) -> Result<(), NetplayError> {
        debug!(connection = idx, %reason, "refusing play request");
        self.send_to(idx, &Command::ModeRefused(reason));
        Ok(())
    }

    fn free_player_slot(&self) -> Option<usize> {
        (0..MAX_PLAYERS).find(|&p| !self.connected_players.contains(p))
    }

    /// Server: a spectator asks for a player slot.
    pub(super) fn on_play(&mut self, idx: usize, slave: bool) -> Result<(), NetplayError> {
        if !self.is_server() {
            return Err(NetplayError::violation("PLAY sent to a client"));
        }
        let conn = &self.connections[idx];
        if !conn.can_play {
            return self.refuse_mode(idx, ModeRefusedReason::Unprivileged);
        }
        if conn.mode.is_playing() {
            return self.refuse_mode(idx, ModeRefusedReason::Other);
        }
        let Some(player) = self.free_player_slot() else {
            return self.refuse_mode(idx, ModeRefusedReason::NoSlots);
        };

        let frame = self.self_frame.next();
        let conn = &mut self.connections[idx];
        conn.mode = if slave {
            ConnectionMode::Slave
        } else {
            ConnectionMode::Playing
        };
        conn.player = player;
        conn.slave_input = NEUTRAL;
        self.connected_players.insert(player);
        if slave {
            self.connected_slaves.insert(player);
        }
        self.client_devices[player].insert(player);
        self.read_frame[player] = frame;

        let announce = ModePayload {
            frame,
            you: false,
            playing: true,
            slave,
            player: player as u16,
        };
        self.broadcast(&Command::Mode(announce), Some(idx));
        self.send_to(idx, &Command::Mode(ModePayload { you: true, ..announce }));
        info!(connection = idx, player, slave, %frame, "player joined");
        notify_to!(self.sink, frame, NetplayEvent::PlayerJoined { player });
        Ok(())
    }

    /// Server: a player gives up its slot.
    pub(super) fn on_spectate(&mut self, idx: usize) -> Result<(), NetplayError> {
        if !self.is_server() {
            return Err(NetplayError::violation("SPECTATE sent to a client"));
        }
        let conn = &self.connections[idx];
        let player = conn.player;
        let frame = if conn.mode.is_playing() {
            let frame = self.read_frame[player];
            self.connections[idx].mode = ConnectionMode::Spectating;
            self.connected_players.remove(player);
            self.connected_slaves.remove(player);
            self.client_devices[player].remove(player);
            self.broadcast_mode(frame, player, false, Some(idx));
            info!(connection = idx, player, %frame, "player left");
            notify_to!(self.sink, frame, NetplayEvent::PlayerLeft { player });
            frame
        } else {
            self.self_frame
        };
        self.send_to(
            idx,
            &Command::Mode(ModePayload {
                frame,
                you: true,
                playing: false,
                slave: false,
                player: player as u16,
            }),
        );
        Ok(())
    }

    /// Client: the server announces a slot change, ours or someone else's.
    pub(super) fn on_mode(&mut self, idx: usize, mode: ModePayload) -> Result<(), NetplayError> {
        if self.is_server() {
            return Err(NetplayError::violation("MODE sent to the server"));
        }
        let player = usize::from(mode.player);
        if player >= MAX_PLAYERS {
            return Err(NetplayError::violation(format!("MODE for player {player}")));
        }
        let frame = mode.frame;
        if frame < self.self_frame {
            self.force_rewind = true;
        }

        match (mode.you, mode.playing) {
            (true, true) => {
                if frame != self.server_frame {
                    return Err(NetplayError::violation(format!(
                        "MODE for frame {frame} while the server is at {}",
                        self.server_frame
                    )));
                }
                if self.self_mode.is_playing() {
                    return Err(NetplayError::violation("MODE made us play while playing"));
                }
                self.self_mode = if mode.slave {
                    ConnectionMode::Slave
                } else {
                    ConnectionMode::Playing
                };
                self.self_player = player;
                self.connected_players.insert(player);
                if mode.slave {
                    self.connected_slaves.insert(player);
                }
                self.client_devices[player].insert(player);

                if frame <= self.self_frame {
                    self.join_retroactively(idx, frame, player);
                } else {
                    let mut f = self.self_frame;
                    while f < frame {
                        if !self.ring.ready(f, self.other_frame) {
                            return Err(NetplayError::violation(format!(
                                "MODE for frame {frame} is too far ahead"
                            )));
                        }
                        self.ring.slot_mut(f).set_self_input(NEUTRAL);
                        f = f.next();
                    }
                    self.read_frame[player] = frame;
                }
                info!(player, %frame, "joined as player");
                notify_to!(
                    self.sink,
                    frame,
                    NetplayEvent::JoinedAsPlayer {
                        player,
                        slave: mode.slave
                    }
                );
            },
            (true, false) => {
                if self.self_mode != ConnectionMode::Spectating {
                    return Err(NetplayError::violation(
                        "MODE made us spectate without being asked",
                    ));
                }
                info!(%frame, "left the game");
                notify_to!(self.sink, frame, NetplayEvent::LeftGame);
            },
            (false, true) => {
                if frame != self.server_frame {
                    return Err(NetplayError::violation(format!(
                        "MODE for frame {frame} while the server is at {}",
                        self.server_frame
                    )));
                }
                self.connected_players.insert(player);
                if mode.slave {
                    self.connected_slaves.insert(player);
                }
                self.client_devices[player].insert(player);
                self.read_frame[player] = frame;
                notify_to!(self.sink, frame, NetplayEvent::PlayerJoined { player });
            },
            (false, false) => {
                self.connected_players.remove(player);
                self.connected_slaves.remove(player);
                self.client_devices[player].remove(player);
                notify_to!(self.sink, frame, NetplayEvent::PlayerLeft { player });
            },
        }
        Ok(())
    }

    /// We became a player at a frame we already captured input for: that input
    /// becomes our real input and goes to the server.
    fn join_retroactively(&mut self, idx: usize, frame: Frame, player: usize) {
        let mut commands = Vec::new();
        let mut next = frame;
        while next <= self.self_frame {
            let Some(slot) = self.ring.find_mut(next) else {
                break;
            };
            if !slot.have_local() {
                break;
            }
            let words = slot.self_input();
            slot.set_real(player, words);
            commands.push(Command::Input(InputPayload {
                frame: next,
                player: player as u32,
                words,
            }));
            next = next.next();
        }
        self.read_frame[player] = next;
        for command in &commands {
            if !self.send_to(idx, command) {
                return;
            }
        }
    }

    pub(super) fn on_mode_refused(&mut self, reason: ModeRefusedReason) -> Result<(), NetplayError> {
        if self.is_server() {
            return Err(NetplayError::violation("MODE_REFUSED sent to the server"));
        }
        info!(%reason, "play request refused");
        notify_to!(self.sink, self.self_frame, NetplayEvent::JoinRefused { reason });
        Ok(())
    }

    /// Switches between playing and spectating.
    ///
    /// A server switches at once. A client leaves play at once but only asks to join;
    /// it becomes a player when the server answers.
    pub fn toggle_play_spectate(&mut self) -> Result<(), NetplayError> {
        if self.is_server() {
            return self.toggle_server_mode();
        }
        match self.self_mode {
            ConnectionMode::Playing | ConnectionMode::Slave => {
                let player = self.self_player;
                self.self_mode = ConnectionMode::Spectating;
                self.connected_players.remove(player);
                self.connected_slaves.remove(player);
                self.client_devices[player].remove(player);
                self.broadcast(&Command::Spectate, None);
                info!(player, "leaving play");
                Ok(())
            },
            ConnectionMode::Spectating => {
                self.broadcast(&Command::Play { slave: false }, None);
                Ok(())
            },
            mode => Err(NetplayError::InvalidRequest {
                info: format!("cannot change play mode while {mode:?}"),
            }),
        }
    }

    fn toggle_server_mode(&mut self) -> Result<(), NetplayError> {
        let frame = self.self_frame;
        if self.self_mode == ConnectionMode::Playing {
            let player = self.self_player;
            self.self_mode = ConnectionMode::Spectating;
            self.connected_players.remove(player);
            self.client_devices[player].remove(player);
            self.broadcast_mode(frame, player, false, None);
            notify_to!(self.sink, frame, NetplayEvent::LeftGame);
            return Ok(());
        }
        let Some(player) = self.free_player_slot() else {
            return Err(NetplayError::InvalidRequest {
                info: "every player slot is taken".to_owned(),
            });
        };
        self.self_mode = ConnectionMode::Playing;
        self.self_player = player;
        self.connected_players.insert(player);
        self.client_devices[player].insert(player);
        self.read_frame[player] = frame;
        self.broadcast_mode(frame, player, true, None);
        notify_to!(
            self.sink,
            frame,
            NetplayEvent::JoinedAsPlayer {
                player,
                slave: false
            }
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use crate::network::connection::{Connection, ConnectionMode};
    use crate::network::memory_socket::MemoryStream;
    use crate::network::messages::{Command, ModePayload, ModeRefusedReason, PayloadLimits};
    use crate::notify::{CollectingSink, NetplayEvent};
    use crate::sessions::config::{NetplayConfig, TimingConfig};
    use crate::sessions::netplay_session::{NetplaySession, Role};
    use crate::sessions::test_core::TestCore;
    use crate::{Frame, NetplayCore, NetplayError, Sha256Hasher};

    fn session(role: Role) -> (NetplaySession, TestCore, Arc<CollectingSink>) {
        let mut core = TestCore::new();
        let sink = Arc::new(CollectingSink::new());
        let session = NetplaySession::new(
            role,
            NetplayConfig::default(),
            TimingConfig::default(),
            Box::new(Sha256Hasher),
            sink.clone(),
            &mut core,
        );
        (session, core, sink)
    }

    /// Adds a connected peer to `session` and returns the far end.
    fn attach(session: &mut NetplaySession, mode: ConnectionMode) -> Connection {
        let (near, far) = MemoryStream::pair();
        let mut conn = Connection::new(Box::new(near));
        conn.mode = mode;
        conn.can_play = true;
        session.connections.push(conn);
        let mut far = Connection::new(Box::new(far));
        far.mode = ConnectionMode::Playing;
        far
    }

    fn received(session: &mut NetplaySession, far: &mut Connection) -> Vec<Command> {
        session.flush_all();
        far.fill().unwrap();
        let limits = PayloadLimits {
            max_savestate: 1 << 20,
            max_save_ram: 1 << 20,
        };
        let mut out = Vec::new();
        while let Some(command) = far.next_command(&limits).unwrap() {
            out.push(command);
        }
        out
    }

    #[test]
    fn play_assigns_first_free_slot() {
        let (mut server, _, sink) = session(Role::Server);
        let mut far = attach(&mut server, ConnectionMode::Spectating);
        server.self_frame = Frame::new(7);

        server.on_play(0, false).unwrap();
        assert_eq!(server.connections[0].mode, ConnectionMode::Playing);
        assert_eq!(server.connections[0].player, 1);
        assert!(server.connected_players.contains(1));
        assert_eq!(server.read_frame[1], Frame::new(8));
        assert!(sink.has_event(|e| matches!(e, NetplayEvent::PlayerJoined { player: 1 })));

        let replies = received(&mut server, &mut far);
        assert_eq!(
            replies,
            vec![Command::Mode(ModePayload {
                frame: Frame::new(8),
                you: true,
                playing: true,
                slave: false,
                player: 1,
            })]
        );
    }

    #[test]
    fn play_without_privilege_is_refused() {
        let (mut server, _, _) = session(Role::Server);
        let mut far = attach(&mut server, ConnectionMode::Spectating);
        server.connections[0].can_play = false;

        server.on_play(0, false).unwrap();
        assert_eq!(server.connections[0].mode, ConnectionMode::Spectating);
        assert_eq!(
            received(&mut server, &mut far),
            vec![Command::ModeRefused(ModeRefusedReason::Unprivileged)]
        );
    }

    #[test]
    fn spectate_frees_the_slot() {
        let (mut server, _, _) = session(Role::Server);
        let mut far = attach(&mut server, ConnectionMode::Spectating);
        server.on_play(0, false).unwrap();
        received(&mut server, &mut far);
        server.read_frame[1] = Frame::new(12);

        server.on_spectate(0).unwrap();
        assert!(!server.connected_players.contains(1));
        assert_eq!(server.connections[0].mode, ConnectionMode::Spectating);
        let replies = received(&mut server, &mut far);
        assert!(matches!(
            replies.as_slice(),
            [Command::Mode(ModePayload { frame, you: true, playing: false, .. })] if *frame == Frame::new(12)
        ));
    }

    #[test]
    fn client_joins_prospectively() {
        let (mut client, _, sink) = session(Role::Client);
        let _far = attach(&mut client, ConnectionMode::Playing);
        client.self_mode = ConnectionMode::Spectating;
        client.self_frame = Frame::new(3);
        client.server_frame = Frame::new(6);

        client
            .on_mode(
                0,
                ModePayload {
                    frame: Frame::new(6),
                    you: true,
                    playing: true,
                    slave: false,
                    player: 2,
                },
            )
            .unwrap();
        assert_eq!(client.self_mode, ConnectionMode::Playing);
        assert_eq!(client.self_player(), Some(2));
        assert_eq!(client.read_frame[2], Frame::new(6));
        assert!(client.ring.slot(Frame::new(4)).have_local());
        assert!(client.ring.slot(Frame::new(5)).have_local());
        assert!(sink.has_event(|e| matches!(e, NetplayEvent::JoinedAsPlayer { player: 2, .. })));
    }

    #[test]
    fn client_joins_retroactively_and_sends_past_input() {
        let (mut client, _, _) = session(Role::Client);
        let mut far = attach(&mut client, ConnectionMode::Playing);
        client.self_mode = ConnectionMode::Spectating;
        for f in 0..=5 {
            client.ring.ready(Frame::new(f), Frame::ZERO);
            client.ring.slot_mut(Frame::new(f)).set_self_input([f, 0, 0]);
        }
        client.self_frame = Frame::new(5);
        client.server_frame = Frame::new(4);

        client
            .on_mode(
                0,
                ModePayload {
                    frame: Frame::new(4),
                    you: true,
                    playing: true,
                    slave: false,
                    player: 1,
                },
            )
            .unwrap();
        assert!(client.force_rewind);
        assert_eq!(client.read_frame[1], Frame::new(6));
        assert_eq!(client.ring.slot(Frame::new(5)).real(1), Some([5, 0, 0]));

        let sent = received(&mut client, &mut far);
        let frames: Vec<u32> = sent
            .iter()
            .filter_map(|c| match c {
                Command::Input(input) => Some(input.frame.as_u32()),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![4, 5]);
    }

    #[test]
    fn client_rejects_mode_for_wrong_frame() {
        let (mut client, _, _) = session(Role::Client);
        client.self_mode = ConnectionMode::Spectating;
        client.server_frame = Frame::new(10);
        let err = client
            .on_mode(
                0,
                ModePayload {
                    frame: Frame::new(11),
                    you: false,
                    playing: true,
                    slave: false,
                    player: 3,
                },
            )
            .unwrap_err();
        assert!(matches!(err, NetplayError::ProtocolViolation { .. }));
    }

    #[test]
    fn refused_play_is_reported() {
        let (mut client, _, sink) = session(Role::Client);
        client.on_mode_refused(ModeRefusedReason::NoSlots).unwrap();
        assert!(sink.has_event(|e| matches!(
            e,
            NetplayEvent::JoinRefused {
                reason: ModeRefusedReason::NoSlots
            }
        )));
        let (mut server, _, _) = session(Role::Server);
        assert!(server.on_mode_refused(ModeRefusedReason::Other).is_err());
    }

    #[test]
    fn server_toggles_between_play_and_spectate() {
        let (mut server, _, sink) = session(Role::Server);
        server.toggle_play_spectate().unwrap();
        assert_eq!(server.self_mode(), ConnectionMode::Spectating);
        assert!(server.connected_players().is_empty());
        assert!(sink.has_event(|e| matches!(e, NetplayEvent::LeftGame)));

        server.toggle_play_spectate().unwrap();
        assert_eq!(server.self_player(), Some(0));
    }

    #[test]
    fn client_leaves_play_immediately() {
        let (mut client, _, _) = session(Role::Client);
        let mut far = attach(&mut client, ConnectionMode::Playing);
        client.self_mode = ConnectionMode::Playing;
        client.self_player = 1;
        client.connected_players.insert(1);

        client.toggle_play_spectate().unwrap();
        assert_eq!(client.self_mode(), ConnectionMode::Spectating);
        assert!(!client.connected_players().contains(1));
        assert_eq!(received(&mut client, &mut far), vec![Command::Spectate]);

        client.toggle_play_spectate().unwrap();
        assert_eq!(client.self_mode(), ConnectionMode::Spectating);
        assert_eq!(
            received(&mut client, &mut far),
            vec![Command::Play { slave: false }]
        );
    }

    #[test]
    fn disconnected_client_cannot_toggle() {
        let (mut client, _, _) = session(Role::Client);
        assert!(matches!(
            client.toggle_play_spectate(),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn crc_mismatch_requests_one_savestate() {
        let (mut client, mut core, sink) = session(Role::Client);
        let mut far = attach(&mut client, ConnectionMode::Playing);
        client.self_mode = ConnectionMode::Spectating;
        client.ring.ready(Frame::new(4), Frame::ZERO);
        core.frames = 4;
        let slot = client.ring.slot_mut(Frame::new(4));
        assert!(core.serialize(slot.state_mut()));
        slot.mark_state(true);
        client.other_frame = Frame::new(5);

        client.on_crc(Frame::new(4), 0xDEAD_BEEF).unwrap();
        client.on_crc(Frame::new(4), 0xDEAD_BEEF).unwrap();
        assert!(client.savestate_request_outstanding);
        assert!(sink.has_event(|e| matches!(e, NetplayEvent::Desync)));
        assert_eq!(
            received(&mut client, &mut far),
            vec![Command::RequestSavestate]
        );
    }

    #[test]
    fn future_crc_is_checked_when_confirmed() {
        let (mut client, mut core, sink) = session(Role::Client);
        client.self_mode = ConnectionMode::Spectating;
        client.ring.ready(Frame::new(2), Frame::ZERO);
        let slot = client.ring.slot_mut(Frame::new(2));
        assert!(core.serialize(slot.state_mut()));
        slot.mark_state(true);
        let crc = crate::checksum::state_crc(slot.state());

        client.on_crc(Frame::new(2), crc).unwrap();
        assert_eq!(client.ring.slot(Frame::new(2)).pending_crc(), Some(crc));
        client.handle_frame_hash(Frame::new(2));
        assert_eq!(client.ring.slot(Frame::new(2)).pending_crc(), None);
        assert!(!sink.has_event(|e| matches!(e, NetplayEvent::Desync)));
    }

    #[test]
    fn loading_a_savestate_rewinds_to_it() {
        let (mut client, mut core, _) = session(Role::Client);
        let _far = attach(&mut client, ConnectionMode::Playing);
        client.self_mode = ConnectionMode::Spectating;
        client.server_frame = Frame::new(20);
        client.self_frame = Frame::new(10);
        client.run_frame = Frame::new(10);

        let mut donor = TestCore::new();
        donor.frames = 20;
        donor.acc = 0x1234;
        let mut state = vec![0; 8];
        assert!(donor.serialize(&mut state));
        let payload = crate::network::messages::LoadSavestatePayload {
            frame: Frame::new(20),
            inflated_size: 8,
            data: state.clone(),
        };

        client.on_load_savestate(0, payload, &mut core).unwrap();
        assert_eq!(client.other_frame, Frame::new(20));
        assert_eq!(client.run_frame, Frame::new(19));
        assert_eq!(client.self_frame, Frame::new(19));
        assert!(client.force_rewind);

        client.post_frame_sync(&mut core, false);
        assert_eq!(client.run_frame, Frame::new(20));
        assert_eq!(core.frames, 20);
        assert_eq!(core.acc, 0x1234);
    }

    #[test]
    fn repeated_savestate_reloads_the_same_frame() {
        let (mut client, mut core, _) = session(Role::Client);
        let _far = attach(&mut client, ConnectionMode::Playing);
        client.self_mode = ConnectionMode::Spectating;
        client.server_frame = Frame::new(20);
        client.self_frame = Frame::new(10);
        client.run_frame = Frame::new(10);

        let mut donor = TestCore::new();
        donor.frames = 20;
        donor.acc = 0x1234;
        let mut state = vec![0; 8];
        assert!(donor.serialize(&mut state));
        let payload = crate::network::messages::LoadSavestatePayload {
            frame: Frame::new(20),
            inflated_size: 8,
            data: state.clone(),
        };

        client.on_load_savestate(0, payload.clone(), &mut core).unwrap();
        client.on_load_savestate(0, payload, &mut core).unwrap();
        assert_eq!(client.run_frame, Frame::new(19));
        assert_eq!(client.server_frame, Frame::new(20));

        client.post_frame_sync(&mut core, false);
        assert_eq!(client.run_frame, Frame::new(20));
        assert_eq!(core.acc, 0x1234);

        let older = crate::network::messages::LoadSavestatePayload {
            frame: Frame::new(15),
            inflated_size: 8,
            data: state,
        };
        assert!(matches!(
            client.on_load_savestate(0, older, &mut core),
            Err(NetplayError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn disconnect_waits_for_queued_output() {
        let (mut server, mut core, sink) = session(Role::Server);
        let mut far = attach(&mut server, ConnectionMode::Playing);
        server.connections[0].player = 1;
        server.connected_players.insert(1);
        server.client_devices[1].insert(1);

        let pending = Command::Crc {
            frame: Frame::new(3),
            crc: 7,
        };
        server.connections[0].send_command(&pending).unwrap();
        far.send_command(&Command::Disconnect).unwrap();
        far.flush(true).unwrap();

        assert!(server.read_connection(0, &mut core).unwrap());
        assert_eq!(server.connections[0].mode, ConnectionMode::DelayedDisconnect);
        assert!(!server.connected_players.contains(1));
        assert!(sink.has_event(|e| matches!(e, NetplayEvent::PlayerLeft { player: 1 })));
        assert!(!server.read_connection(0, &mut core).unwrap());

        server.post_frame_sync(&mut core, true);
        assert!(!server.connections[0].is_active());
        assert_eq!(received(&mut server, &mut far), vec![pending]);
    }

    #[test]
    fn disconnect_with_nothing_queued_hangs_up_at_once() {
        let (mut client, mut core, sink) = session(Role::Client);
        let mut far = attach(&mut client, ConnectionMode::Playing);
        far.send_command(&Command::Disconnect).unwrap();
        far.flush(true).unwrap();

        assert!(client.read_connection(0, &mut core).unwrap());
        assert!(!client.connections[0].is_active());
        assert!(sink.has_event(|e| matches!(
            e,
            NetplayEvent::Hangup { reason, .. } if reason == "peer disconnected"
        )));
    }

    #[test]
    fn savestate_with_wrong_size_is_a_violation() {
        let (mut client, mut core, _) = session(Role::Client);
        let _far = attach(&mut client, ConnectionMode::Playing);
        let payload = crate::network::messages::LoadSavestatePayload {
            frame: Frame::ZERO,
            inflated_size: 9,
            data: vec![0; 9],
        };
        assert!(matches!(
            client.on_load_savestate(0, payload, &mut core),
            Err(NetplayError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn desync_nesting_defers_savestate() {
        let (mut server, _, _) = session(Role::Server);
        server.push_desync();
        server.push_desync();
        server.pop_desync().unwrap();
        assert!(!server.force_send_savestate);
        server.pop_desync().unwrap();
        assert!(server.force_send_savestate);
        assert!(server.pop_desync().is_err());
    }

    #[test]
    fn pause_and_resume_are_relayed() {
        let (mut server, _, sink) = session(Role::Server);
        let _first = attach(&mut server, ConnectionMode::Playing);
        let mut second = attach(&mut server, ConnectionMode::Spectating);
        server.connections[0].nick = "alice".to_owned();

        server.on_pause(0, "ignored".to_owned()).unwrap();
        assert!(server.is_remote_paused());
        assert!(sink.has_event(|e| matches!(e, NetplayEvent::Paused { nick } if nick == "alice")));
        assert_eq!(
            received(&mut server, &mut second),
            vec![Command::Pause("alice".to_owned())]
        );

        server.on_resume(0).unwrap();
        assert!(!server.is_remote_paused());
        assert_eq!(received(&mut server, &mut second), vec![Command::Resume]);
    }

    #[test]
    fn local_pause_is_sent_once() {
        let (mut client, _, _) = session(Role::Client);
        let mut far = attach(&mut client, ConnectionMode::Playing);
        client.set_paused(true);
        client.set_paused(true);
        assert!(client.is_paused());
        assert_eq!(
            received(&mut client, &mut far),
            vec![Command::Pause(client.nick().to_owned())]
        );
    }

    #[test]
    fn reset_for_past_frame_rewinds() {
        let (mut client, mut core, _) = session(Role::Client);
        client.self_frame = Frame::new(9);
        client.other_frame = Frame::new(4);
        client.on_reset(0, Frame::new(6), &mut core).unwrap();
        assert!(client.force_rewind);
        assert_eq!(client.pending_reset, Some(Frame::new(6)));
    }

    #[test]
    fn local_reset_moves_run_to_self() {
        let (mut server, mut core, _) = session(Role::Server);
        core.frames = 3;
        server.self_frame = Frame::new(5);
        server.run_frame = Frame::new(4);
        server.reset(&mut core);
        assert_eq!(server.run_frame, Frame::new(5));
        assert_eq!(server.other_frame, Frame::new(5));
        assert_eq!(core.frames, 0);
    }

    #[test]
    fn reset_for_running_frame_rewinds() {
        let (mut client, mut core, _) = session(Role::Client);
        client.self_frame = Frame::new(6);
        client.run_frame = Frame::new(6);
        client.other_frame = Frame::new(5);
        client.on_reset(0, Frame::new(6), &mut core).unwrap();
        assert!(client.force_rewind);

        let (mut client, mut core, _) = session(Role::Client);
        client.self_frame = Frame::new(6);
        client.run_frame = Frame::new(6);
        client.other_frame = Frame::new(5);
        client.on_reset(0, Frame::new(7), &mut core).unwrap();
        assert!(!client.force_rewind);
        assert_eq!(client.pending_reset, Some(Frame::new(7)));
    }
}
