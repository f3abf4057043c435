//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a deterministic [`NetplayCore`](fortress_netplay::NetplayCore) with scripted input
//! - [`Peer`]: a session, its core and its notification sink bundled together
//! - helpers that step a server and its clients in turns until a condition holds

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

pub mod stubs;

use std::sync::Arc;
use std::time::Duration;

use fortress_netplay::{
    CollectingSink, ConnectionMode, MemoryListener, NetplayEvent, NetplaySession,
    SessionBuilder, StreamListener, StreamSocket, TimingConfig,
};

use stubs::StubCore;

/// Upper bound on turns any helper takes before failing the test.
pub const MAX_TURNS: usize = 400;

/// Timing that gives up on silent peers quickly, so failing tests fail fast.
#[must_use]
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        retry_interval: Duration::from_millis(5),
        max_retries: 4,
        server_stall_timeout: Duration::from_secs(2),
        client_stall_timeout: Duration::from_secs(2),
    }
}

/// Routes session logs to the test harness's captured output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A builder with quick timing and frequent checksums.
pub fn builder(nick: &str) -> SessionBuilder {
    SessionBuilder::new()
        .with_nick(nick)
        .unwrap()
        .with_timing_config(fast_timing())
        .with_check_frames(10)
}

/// One end of a test session.
pub struct Peer {
    pub session: NetplaySession,
    pub core: StubCore,
    pub sink: Arc<CollectingSink>,
}

impl Peer {
    /// Starts a server on `listener`.
    pub fn server(builder: SessionBuilder, listener: Box<dyn StreamListener>, seed: u32) -> Self {
        Self::server_with_core(builder, listener, StubCore::new(seed))
    }

    /// Starts a server on `listener` running `core`.
    pub fn server_with_core(
        builder: SessionBuilder,
        listener: Box<dyn StreamListener>,
        core: StubCore,
    ) -> Self {
        let sink = Arc::new(CollectingSink::new());
        let mut core = core;
        let session = builder
            .with_sink(sink.clone())
            .start_server(listener, &mut core)
            .unwrap();
        Self {
            session,
            core,
            sink,
        }
    }

    /// Starts a client over `socket`.
    pub fn client(builder: SessionBuilder, socket: Box<dyn StreamSocket>, core: StubCore) -> Self {
        let sink = Arc::new(CollectingSink::new());
        let mut core = core;
        let session = builder
            .with_sink(sink.clone())
            .start_client(socket, &mut core)
            .unwrap();
        Self {
            session,
            core,
            sink,
        }
    }

    /// Runs one frame with this peer's scripted input. Returns whether the core ran.
    pub fn step(&mut self) -> bool {
        self.core.press_for(self.session.self_frame());
        self.session.advance_frame(&mut self.core).unwrap()
    }

    pub fn has_event(&self, predicate: impl Fn(&NetplayEvent) -> bool) -> bool {
        self.sink.has_event(predicate)
    }

    pub fn saw_desync(&self) -> bool {
        self.has_event(|e| matches!(e, NetplayEvent::Desync))
    }
}

/// An in-memory server with one client connected to it, neither stepped yet.
pub fn server_and_client(server: SessionBuilder, client: SessionBuilder) -> (Peer, Peer) {
    let listener = MemoryListener::new();
    let socket = listener.connect();
    let server = Peer::server(server, Box::new(listener), 1);
    let client = Peer::client(client, Box::new(socket), StubCore::new(2));
    (server, client)
}

/// Steps every peer once per turn, server first, until `done` holds.
///
/// Returns the number of turns taken, or panics after [`MAX_TURNS`].
pub fn run_until(peers: &mut [&mut Peer], done: impl Fn(&[&mut Peer]) -> bool) -> usize {
    for turn in 0..MAX_TURNS {
        if done(peers) {
            return turn;
        }
        for peer in peers.iter_mut() {
            peer.step();
        }
    }
    panic!("condition not reached within {MAX_TURNS} turns");
}

/// Steps every peer `turns` times.
pub fn run_turns(peers: &mut [&mut Peer], turns: usize) {
    for _ in 0..turns {
        for peer in peers.iter_mut() {
            peer.step();
        }
    }
}

/// Steps a server and a client until the client holds a player slot.
pub fn join_as_player(server: &mut Peer, client: &mut Peer) -> usize {
    run_until(&mut [server, client], |peers| {
        peers[1].session.self_mode() == ConnectionMode::Playing
            && peers[0].session.connected_players().len() == 2
    })
}

/// Frames both cores have confirmed, compared one by one from `from` on.
///
/// Returns how many frames were compared.
pub fn assert_histories_agree(a: &Peer, b: &Peer, from: u32) -> usize {
    let confirmed = a
        .session
        .other_frame()
        .as_u32()
        .min(b.session.other_frame().as_u32());
    let mut compared = 0;
    for frame in from..=confirmed {
        match (a.core.history.get(&frame), b.core.history.get(&frame)) {
            (Some(x), Some(y)) => {
                assert_eq!(x, y, "cores disagree after frame {frame}");
                compared += 1;
            },
            _ => panic!("frame {frame} missing from a core history"),
        }
    }
    compared
}
