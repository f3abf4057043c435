//! Input capture, exchange and resolution.
//!
//! Every player's input for a frame lands in the frame's ring slot, either as real
//! input (captured locally or received) or, until it arrives, as a prediction that
//! repeats the player's last real input. What the core actually ran with is kept as the
//! slot's simulated input so reconciliation can tell whether a prediction held.

use tracing::{trace, warn};
use web_time::Instant;

use crate::error::NetplayError;
use crate::input::{capture_local, merge, PortPlayers};
use crate::network::connection::ConnectionMode;
use crate::network::messages::{Command, InputPayload, INPUT_BIT_SERVER};
use crate::notify::{notify_to, NetplayEvent};
use crate::sessions::netplay_session::NetplaySession;
use crate::{Frame, FrameInput, InputWords, NetplayCore, MAX_PLAYERS, WORDS_PER_INPUT};

pub(super) const NEUTRAL: InputWords = [0; WORDS_PER_INPUT];

impl NetplaySession {
    /// Captures local input for `self_frame` and shares it.
    ///
    /// Input is captured once per frame; a stalled frame keeps what it already has.
    /// Returns `false` if the ring has no room for the frame.
    pub(super) fn capture_input(&mut self, core: &mut dyn NetplayCore) -> bool {
        let frame = self.self_frame;
        if !self.ring.ready(frame, self.other_frame) {
            return false;
        }
        if self.ring.slot(frame).have_local() {
            return true;
        }

        let words = if frame == Frame::ZERO {
            NEUTRAL
        } else {
            capture_local(core)
        };
        let slot = self.ring.slot_mut(frame);
        slot.set_self_input(words);
        if self.self_mode == ConnectionMode::Playing {
            slot.set_real(self.self_player, words);
            self.read_frame[self.self_player] = frame.next();
        }

        for idx in 0..self.connections.len() {
            if self.connections[idx].is_connected() {
                self.send_cur_input(idx);
            }
        }
        true
    }

    /// Sends one connection everything it needs for `self_frame`.
    ///
    /// The server relays the other players' real input and then its own, or NOINPUT
    /// if it is not playing. A playing client sends its own input.
    pub(super) fn send_cur_input(&mut self, idx: usize) {
        let frame = self.self_frame;
        let Some(slot) = self.ring.find(frame) else {
            return;
        };
        let Some(conn) = self.connections.get(idx) else {
            return;
        };
        let mut commands = Vec::with_capacity(4);

        if self.is_server() {
            let own_player = (conn.mode == ConnectionMode::Playing).then_some(conn.player);
            let self_player =
                (self.self_mode == ConnectionMode::Playing).then_some(self.self_player);
            for player in self.connected_players.iter() {
                if Some(player) == own_player || Some(player) == self_player {
                    continue;
                }
                if let Some(words) = slot.real(player) {
                    commands.push(Command::Input(InputPayload {
                        frame,
                        player: player as u32,
                        words,
                    }));
                }
            }
            if !self.self_mode.is_playing() {
                commands.push(Command::NoInput { frame });
            }
        }

        if self.self_mode.is_playing() && slot.have_local() {
            let mut player = self.self_player as u32;
            if self.is_server() {
                player |= INPUT_BIT_SERVER;
            }
            commands.push(Command::Input(InputPayload {
                frame,
                player,
                words: slot.self_input(),
            }));
        }

        for command in &commands {
            if !self.send_to(idx, command) {
                return;
            }
        }
        if let Err(err) = self.connections[idx].flush(false) {
            self.hangup_with_error(idx, &err);
        }
    }

    /// Server: passes one player's input on to everyone who does not already have it.
    pub(super) fn broadcast_input(
        &mut self,
        frame: Frame,
        player: usize,
        words: InputWords,
        except: Option<usize>,
    ) {
        let command = Command::Input(InputPayload {
            frame,
            player: player as u32,
            words,
        });
        for idx in 0..self.connections.len() {
            let conn = &self.connections[idx];
            if Some(idx) == except || !conn.is_connected() {
                continue;
            }
            if conn.mode == ConnectionMode::Playing && conn.player == player {
                continue;
            }
            self.send_to(idx, &command);
        }
    }

    pub(super) fn on_input(&mut self, idx: usize, input: InputPayload) -> Result<(), NetplayError> {
        let player = if self.is_server() {
            let conn = &mut self.connections[idx];
            if !conn.mode.is_playing() {
                return Err(NetplayError::violation(
                    "INPUT from a connection that is not playing",
                ));
            }
            if conn.mode == ConnectionMode::Slave {
                conn.slave_input = input.words;
                return Ok(());
            }
            conn.player
        } else {
            input.player_slot()
        };

        if player >= MAX_PLAYERS || !self.connected_players.contains(player) {
            return Err(NetplayError::violation(format!(
                "INPUT for player {player}, who is not playing"
            )));
        }
        let expected = self.read_frame[player];
        if input.frame < expected {
            trace!(player, frame = %input.frame, "ignoring duplicate input");
            return Ok(());
        }
        if input.frame > expected {
            return Err(NetplayError::violation(format!(
                "INPUT for frame {} while expecting {expected}",
                input.frame
            )));
        }
        if !self.ring.ready(input.frame, self.other_frame) {
            return Err(NetplayError::violation(format!(
                "INPUT for frame {} is too far ahead",
                input.frame
            )));
        }
        self.ring.slot_mut(input.frame).set_real(player, input.words);
        self.read_frame[player] = input.frame.next();

        if self.is_server() {
            if input.frame <= self.self_frame {
                self.broadcast_input(input.frame, player, input.words, Some(idx));
            }
        } else if input.from_server() && self.server_frame <= input.frame {
            self.server_frame = input.frame.next();
        }
        Ok(())
    }

    /// Client: the server is not playing but has reached `frame`.
    pub(super) fn on_noinput(&mut self, frame: Frame) -> Result<(), NetplayError> {
        if self.is_server() {
            return Err(NetplayError::violation("NOINPUT sent to the server"));
        }
        if frame != self.server_frame {
            return Err(NetplayError::violation(format!(
                "NOINPUT for frame {frame} while expecting {}",
                self.server_frame
            )));
        }
        self.server_frame = frame.next();
        Ok(())
    }

    pub(super) fn on_flip_players(&mut self, frame: Frame) -> Result<(), NetplayError> {
        if self.is_server() {
            return Err(NetplayError::violation("FLIP_PLAYERS sent to the server"));
        }
        if frame < self.server_frame {
            return Err(NetplayError::violation(format!(
                "FLIP_PLAYERS for frame {frame}, which has already been confirmed"
            )));
        }
        self.flip = !self.flip;
        self.flip_frame = frame;
        if frame < self.self_frame {
            self.force_rewind = true;
        }
        notify_to!(self.sink, frame, NetplayEvent::PlayersFlipped);
        Ok(())
    }

    /// Server: swaps ports 0 and 1 from the next frame on, for everyone.
    pub fn flip_players(&mut self) -> Result<(), NetplayError> {
        if !self.is_server() {
            return Err(NetplayError::InvalidRequest {
                info: "only the server can flip players".to_owned(),
            });
        }
        let frame = self.self_frame.next();
        self.flip = !self.flip;
        self.flip_frame = frame;
        self.broadcast(&Command::FlipPlayers { frame }, None);
        notify_to!(self.sink, frame, NetplayEvent::PlayersFlipped);
        Ok(())
    }

    /// Whether ports 0 and 1 are swapped right now: judged by the replay frame while
    /// replaying, else by `self_frame`.
    pub(super) fn flip_port(&self) -> bool {
        let frame = if self.is_replay {
            self.replay_frame
        } else {
            self.self_frame
        };
        self.flip_port_at(frame)
    }

    pub(super) fn flip_port_at(&self, frame: Frame) -> bool {
        if self.flip_frame == Frame::ZERO {
            return false;
        }
        self.flip ^ (frame < self.flip_frame)
    }

    /// Reads from every connection until nothing is left.
    ///
    /// With `block` set, waits for remote input of the frame about to run, giving up on
    /// the peers we are waiting for after the configured number of retries.
    pub(super) fn poll_net_input(&mut self, core: &mut dyn NetplayCore, block: bool) {
        let started = Instant::now();
        let mut retries = 0;
        loop {
            for idx in 0..self.connections.len() {
                self.drain_connection(idx, core);
            }
            self.update_unread();

            let waiting = block
                && self.self_mode.is_connected()
                && self.unread_frame <= self.run_frame
                && self.connections.iter().any(|c| c.is_connected());
            if !waiting {
                return;
            }
            if retries >= self.timing.max_retries {
                warn!(frame = %self.run_frame, retries, "gave up waiting for input");
                let err = NetplayError::StallTimeout {
                    elapsed: started.elapsed(),
                };
                if self.is_server() {
                    let late: Vec<usize> = self
                        .remote_players()
                        .iter()
                        .filter(|&p| self.read_frame[p] <= self.run_frame)
                        .filter_map(|p| self.connection_index_for_player(p))
                        .collect();
                    for idx in late {
                        self.hangup_with_error(idx, &err);
                    }
                } else {
                    self.hangup_all(&err);
                }
                self.update_unread();
                return;
            }
            retries += 1;
            self.wait_for_data();
        }
    }

    fn drain_connection(&mut self, idx: usize, core: &mut dyn NetplayCore) {
        loop {
            if !self.connections[idx].is_active() {
                return;
            }
            if self.connections[idx].is_connected()
                && !self.ring.ready(self.unread_frame, self.other_frame)
            {
                return;
            }
            match self.read_connection(idx, core) {
                Ok(true) => {},
                Ok(false) => return,
                Err(err) => {
                    self.hangup_with_error(idx, &err);
                    return;
                },
            }
            self.update_unread();
        }
    }

    fn wait_for_data(&mut self) {
        let active = self.connections.iter().filter(|c| c.is_active()).count().max(1);
        let slice = self.timing.retry_interval / active as u32;
        for idx in 0..self.connections.len() {
            if !self.connections[idx].is_active() {
                continue;
            }
            match self.connections[idx].wait_readable(slice) {
                Ok(true) => return,
                Ok(false) => {},
                Err(err) => self.hangup_with_error(idx, &err.into()),
            }
        }
    }

    /// Recomputes the first frame with missing remote input.
    ///
    /// Slave players are skipped: the server generates their input itself. The stored
    /// value may run past `self_frame` when input for frames we have not reached yet
    /// has already arrived.
    pub(super) fn update_unread(&mut self) {
        if !self.self_mode.is_connected() && !self.is_server() {
            self.unread_frame = self.self_frame;
            return;
        }
        let mut unread: Option<Frame> = self
            .remote_players()
            .iter()
            .filter(|&p| !self.connected_slaves.contains(p))
            .map(|p| self.read_frame[p])
            .min();
        if !self.is_server() {
            unread = Some(unread.map_or(self.server_frame, |f| f.min(self.server_frame)));
        }
        self.unread_frame = unread.unwrap_or(self.self_frame);
    }

    /// Fills in what every connected player used for `frame`: real input where it has
    /// arrived, otherwise the player's last real input.
    pub(super) fn resolve_frame(&mut self, frame: Frame) {
        if self.ring.find(frame).is_none() {
            return;
        }
        let mut resolved = [None; MAX_PLAYERS];
        for player in self.connected_players.iter() {
            resolved[player] = Some(self.predict(player, frame));
        }
        let slot = self.ring.slot_mut(frame);
        for (player, words) in resolved.iter().enumerate() {
            if let Some(words) = words {
                slot.set_simulated(player, *words);
            }
        }
    }

    fn predict(&self, player: usize, frame: Frame) -> InputWords {
        if let Some(words) = self.ring.find(frame).and_then(|s| s.real(player)) {
            return words;
        }
        let last = self.read_frame[player].prev();
        if self.read_frame[player] == Frame::ZERO {
            return NEUTRAL;
        }
        self.ring
            .find(last)
            .and_then(|s| s.real(player))
            .unwrap_or(NEUTRAL)
    }

    /// Whether any real input for `frame` differs from what the core ran with.
    pub(super) fn prediction_failed(&self, frame: Frame) -> bool {
        let Some(slot) = self.ring.find(frame) else {
            return false;
        };
        slot.have_real()
            .iter()
            .any(|p| slot.real(p) != Some(slot.simulated(p)))
    }

    /// The per-port input the core sees for `frame`.
    pub(super) fn resolved_input(&self, frame: Frame) -> FrameInput {
        let mut ports = [NEUTRAL; MAX_PLAYERS];
        if let Some(slot) = self.ring.find(frame) {
            if self.self_mode.is_connected() {
                for (device, port) in ports.iter_mut().enumerate() {
                    let players: PortPlayers = self.client_devices[device]
                        .iter()
                        .map(|p| slot.simulated(p))
                        .collect();
                    *port = merge(self.share_modes[device], &players);
                }
            } else {
                ports[0] = slot.self_input();
            }
        }
        if self.flip_port() {
            ports.swap(0, 1);
        }
        FrameInput::new(frame, self.is_replay, ports, self.device_types)
    }

    /// Server: generates input for slave players from what they last sent.
    pub(super) fn handle_slaves(&mut self) {
        if !self.is_server() {
            return;
        }
        let frame = self.self_frame;
        for idx in 0..self.connections.len() {
            let conn = &self.connections[idx];
            if !conn.is_active() || conn.mode != ConnectionMode::Slave {
                continue;
            }
            let player = conn.player;
            let words = conn.slave_input;
            if self.read_frame[player] > frame {
                continue;
            }
            let Some(slot) = self.ring.find_mut(frame) else {
                continue;
            };
            slot.set_real(player, words);
            self.read_frame[player] = frame.next();
            self.broadcast_input(frame, player, words, None);
        }
    }
}
