//! Flow control: when the session holds the core back, and for how long.
//!
//! A session stalls for one reason at a time. Each reason has its own unstall
//! condition, checked at the start of every poll before new stalls are considered,
//! and the stall reasons that wait on a peer carry a start time so a peer that never
//! catches up can be hung up.

use web_time::{Duration, Instant};

use crate::error::NetplayError;
use crate::network::connection::ConnectionMode;
use crate::network::messages::Command;
use crate::notify::{notify_to, NetplayEvent};
use crate::sessions::netplay_session::NetplaySession;
use crate::{Frame, MAX_REQUESTED_STALL_FRAMES};

/// Minimum distance, in frames, between two STALL requests to the same client.
pub const MAX_REQUESTED_STALL_FREQUENCY: u32 = 120;

/// A client more than this many frames ahead of the server is asked to stall.
pub const STALL_REQUEST_THRESHOLD: u32 = 3;

/// Number of frame run times averaged for input-latency adjustment.
pub const FRAME_RUN_TIME_WINDOW: usize = 120;

/// Wall time of one frame at the nominal 60 Hz, in microseconds.
const NOMINAL_FRAME_US: u64 = 16_666;

/// Why the session is not advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallReason {
    /// Not stalled.
    #[default]
    None,
    /// We are too far ahead of the slowest peer.
    RunningFast,
    /// We are watching and have caught up with the server.
    SpectatorWait,
    /// Local input is being delayed to hide network latency.
    InputLatency,
    /// The server asked us to hold.
    ServerRequested,
    /// Nobody to play with and no way to hand over state to a late joiner.
    NoConnection,
}

impl StallReason {
    /// Whether a stall is in effect.
    #[must_use]
    pub fn is_stalled(self) -> bool {
        self != StallReason::None
    }
}

impl std::fmt::Display for StallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StallReason::None => "not stalled",
            StallReason::RunningFast => "running ahead of peers",
            StallReason::SpectatorWait => "waiting for the server",
            StallReason::InputLatency => "input latency",
            StallReason::ServerRequested => "stall requested by server",
            StallReason::NoConnection => "waiting for a peer",
        };
        f.write_str(text)
    }
}

/// The session-wide stall and when it started.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StallGovernor {
    reason: StallReason,
    since: Option<Instant>,
}

impl StallGovernor {
    pub(crate) fn reason(&self) -> StallReason {
        self.reason
    }

    pub(crate) fn is_stalled(&self) -> bool {
        self.reason.is_stalled()
    }

    /// Starts a stall. `since` is `None` for stalls that can never time out.
    pub(crate) fn set(&mut self, reason: StallReason, since: Option<Instant>) {
        self.reason = reason;
        self.since = since;
    }

    pub(crate) fn clear(&mut self) {
        self.reason = StallReason::None;
        self.since = None;
    }

    pub(crate) fn since(&self) -> Option<Instant> {
        self.since
    }

    /// Restarts the timeout clock, used while a peer is paused.
    pub(crate) fn refresh(&mut self, now: Instant) {
        if self.since.is_some() {
            self.since = Some(now);
        }
    }

    /// How long the stall has lasted, if it is timed.
    pub(crate) fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.since.map(|start| now.saturating_duration_since(start))
    }
}

/// Rolling window of core run times, in microseconds.
#[derive(Debug, Clone)]
pub(crate) struct RunTimeWindow {
    samples: Vec<u64>,
    next: usize,
    sum: u64,
}

impl Default for RunTimeWindow {
    fn default() -> Self {
        Self::new(FRAME_RUN_TIME_WINDOW)
    }
}

impl RunTimeWindow {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            samples: vec![0; size.max(1)],
            next: 0,
            sum: 0,
        }
    }

    pub(crate) fn record(&mut self, elapsed: Duration) {
        let cap = u64::MAX / self.samples.len() as u64;
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(cap).min(cap);
        let slot = &mut self.samples[self.next];
        self.sum = self.sum - *slot + micros;
        *slot = micros;
        self.next = (self.next + 1) % self.samples.len();
    }

    /// Average over the whole window; 0 until something has been recorded.
    pub(crate) fn average(&self) -> u64 {
        self.sum / self.samples.len() as u64
    }
}

/// Inputs to one input-latency adjustment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LatencyInputs {
    pub(crate) current: u32,
    pub(crate) min: u32,
    pub(crate) max: u32,
    pub(crate) stateless: bool,
    pub(crate) avg_run_us: u64,
    pub(crate) run_frame: Frame,
    pub(crate) unread_frame: Frame,
}

/// Moves the input latency one step towards what the connection needs.
///
/// With rollback available, latency grows when more frames are outstanding than we can
/// replay within one frame's time. Without it, latency follows how close remote input
/// arrives to the frame that needs it.
pub(crate) fn adjust_latency(inputs: LatencyInputs) -> u32 {
    let LatencyInputs {
        current,
        min,
        max,
        stateless,
        avg_run_us,
        run_frame,
        unread_frame,
    } = inputs;

    if stateless {
        if current < min || (unread_frame == run_frame + 1 && current < max) {
            return current + 1;
        }
        if current > max || (unread_frame > run_frame + 2 && current > min) {
            return current - 1;
        }
        return current;
    }

    if avg_run_us == 0 {
        return current;
    }
    let frames_per_frame = (NOMINAL_FRAME_US / avg_run_us).saturating_sub(2);
    let frames_ahead = u64::from(run_frame - unread_frame);
    if current < min || (frames_per_frame < frames_ahead && current < max) {
        current + 1
    } else if current > max || (frames_per_frame > frames_ahead + 2 && current > min) {
        current - 1
    } else {
        current
    }
}

impl NetplaySession {
    pub(super) fn stall_timeout(&self) -> Duration {
        if self.is_server() {
            self.timing.server_stall_timeout
        } else {
            self.timing.client_stall_timeout
        }
    }

    pub(super) fn adjust_input_latency(&mut self) {
        let avg_run_us = self.run_time.average();
        if avg_run_us == 0 && !self.stateless_mode {
            return;
        }
        let min = self.config.input_latency_min;
        let updated = adjust_latency(LatencyInputs {
            current: self.input_latency_frames,
            min,
            max: min + self.config.input_latency_range,
            stateless: self.stateless_mode,
            avg_run_us,
            run_frame: self.run_frame,
            unread_frame: self.unread_frame,
        });
        if updated != self.input_latency_frames {
            tracing::debug!(
                from = self.input_latency_frames,
                to = updated,
                "adjusting input latency"
            );
            self.input_latency_frames = updated;
        }
    }

    /// Clears the current stall if its condition no longer holds.
    pub(super) fn consider_unstall(&mut self) {
        match self.stall.reason() {
            StallReason::RunningFast => {
                if self.unread_frame + (self.config.stall_frames - 2) > self.self_frame {
                    self.stall.clear();
                    for conn in self.connections.iter_mut().filter(|c| c.is_active()) {
                        conn.stall = StallReason::None;
                        conn.stall_since = None;
                    }
                }
            },
            StallReason::SpectatorWait => {
                if self.self_mode == ConnectionMode::Playing || self.unread_frame > self.self_frame
                {
                    self.stall.clear();
                }
            },
            StallReason::InputLatency => self.stall.clear(),
            StallReason::ServerRequested => {
                let done = match self.connections.first_mut() {
                    Some(conn) if conn.stall_frame > 0 => {
                        conn.stall_frame -= 1;
                        false
                    },
                    Some(conn) => {
                        conn.stall = StallReason::None;
                        true
                    },
                    None => true,
                };
                if done {
                    self.stall.clear();
                }
            },
            StallReason::NoConnection | StallReason::None => {},
        }
    }

    /// Starts a stall if the session has got ahead of what it knows.
    pub(super) fn consider_stall(&mut self) {
        if self.stall.is_stalled() {
            return;
        }

        if self.self_mode == ConnectionMode::Playing
            && !self.connected_players.is_empty()
            && self.run_frame + self.input_latency_frames > self.self_frame
        {
            self.stall.set(StallReason::InputLatency, None);
        }

        if self.unread_frame + self.config.stall_frames <= self.self_frame {
            let now = Instant::now();
            self.stall.set(StallReason::RunningFast, Some(now));
            if self.is_server() {
                for player in self.connected_players.iter() {
                    if self.read_frame[player] > self.unread_frame {
                        continue;
                    }
                    if let Some(conn) = self.connections.iter_mut().find(|c| {
                        c.is_active() && c.mode == ConnectionMode::Playing && c.player == player
                    }) {
                        conn.stall = StallReason::RunningFast;
                        conn.stall_since = Some(now);
                    }
                }
            }
            self.report_stall();
        }

        if !self.is_server()
            && !self.stall.is_stalled()
            && matches!(
                self.self_mode,
                ConnectionMode::Spectating | ConnectionMode::Slave
            )
            && self.unread_frame <= self.self_frame
        {
            self.stall
                .set(StallReason::SpectatorWait, Some(Instant::now()));
            self.report_stall();
        }
    }

    /// Hangs up whoever a timed stall is waiting on once it has lasted too long.
    ///
    /// Returns `false` when the client gave up on the server.
    pub(super) fn check_stall_timeout(&mut self) -> bool {
        let now = Instant::now();
        if self.remote_paused {
            self.stall.refresh(now);
            return true;
        }
        let Some(elapsed) = self.stall.elapsed(now) else {
            return true;
        };
        if elapsed < self.stall_timeout() {
            return true;
        }

        let err = NetplayError::StallTimeout { elapsed };
        if self.is_server() {
            let stalled: Vec<usize> = self
                .connections
                .iter()
                .enumerate()
                .filter(|(_, c)| {
                    c.is_active() && c.mode == ConnectionMode::Playing && c.stall.is_stalled()
                })
                .map(|(idx, _)| idx)
                .collect();
            if !stalled.is_empty() {
                for idx in stalled {
                    self.hangup_with_error(idx, &err);
                }
                self.stall.clear();
            }
            true
        } else {
            tracing::warn!(?elapsed, "server stalled out");
            self.hangup_all(&err);
            false
        }
    }

    pub(super) fn report_stall(&self) {
        notify_to!(
            self.sink,
            self.self_frame,
            NetplayEvent::Stalled {
                reason: self.stall.reason()
            }
        );
    }

    /// Client side of STALL.
    pub(super) fn on_stall_command(&mut self, idx: usize, frames: u32) -> Result<(), NetplayError> {
        if self.is_server() {
            return Err(NetplayError::violation("STALL sent to the server"));
        }
        let frames = frames.min(MAX_REQUESTED_STALL_FRAMES);
        if let Some(conn) = self.connections.get_mut(idx) {
            conn.stall = StallReason::ServerRequested;
            conn.stall_frame = frames;
        }
        if frames > 0 && !self.stall.is_stalled() {
            self.stall.set(StallReason::ServerRequested, None);
            self.report_stall();
        }
        Ok(())
    }

    /// Server: asks playing clients that are running well ahead of us to hold back.
    pub(super) fn request_client_stalls(&mut self) {
        let self_frame = self.self_frame;
        for idx in 0..self.connections.len() {
            let conn = &self.connections[idx];
            if !conn.is_active() || conn.mode != ConnectionMode::Playing {
                continue;
            }
            let ahead = self.read_frame[conn.player] - self_frame;
            if ahead <= STALL_REQUEST_THRESHOLD {
                continue;
            }
            let last_request = Frame::new(conn.stall_frame);
            if conn.stall_frame != 0
                && last_request + MAX_REQUESTED_STALL_FREQUENCY > self_frame
            {
                continue;
            }
            let frames = ahead.min(MAX_REQUESTED_STALL_FRAMES);
            tracing::debug!(connection = idx, frames, "requesting client stall");
            let result = self.connections[idx].send_command(&Command::Stall { frames });
            match result {
                Ok(()) => self.connections[idx].stall_frame = self_frame.as_u32().max(1),
                Err(err) => self.hangup_with_error(idx, &err),
            }
        }
    }
}
