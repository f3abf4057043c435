//! TCP loopback tests: a server and a client each driven by their own thread.

// Allow hardcoded IP addresses - 127.0.0.1 is appropriate for tests
#![allow(clippy::ip_constant)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crate::common::{builder, init_tracing};
use crate::common::stubs::StubCore;
use fortress_netplay::{
    CollectingSink, ConnectionMode, Frame, NetplayEvent, NetplaySession, TcpListenerSocket,
    TcpStreamSocket, TimingConfig,
};
use serial_test::serial;

/// Confirmed frame both sides must reach before the test compares them.
const TARGET_FRAME: u32 = 180;

/// Hard cap on frames per thread.
const MAX_ITERATIONS: usize = 20_000;

fn loopback_timing() -> TimingConfig {
    TimingConfig {
        retry_interval: Duration::from_millis(50),
        max_retries: 40,
        server_stall_timeout: Duration::from_secs(5),
        client_stall_timeout: Duration::from_secs(5),
    }
}

struct Outcome {
    core: StubCore,
    sink: Arc<CollectingSink>,
    /// First frame at which both players were known to this side.
    joined_at: Frame,
}

/// Steps until this side has confirmed [`TARGET_FRAME`] and the other side says it has
/// too. Keeps stepping in between so the other side still gets our input.
fn drive(
    session: &mut NetplaySession,
    core: &mut StubCore,
    mine: &AtomicBool,
    theirs: &AtomicBool,
) -> Frame {
    let mut joined_at = None;
    for _ in 0..MAX_ITERATIONS {
        let both_playing = session.connected_players().len() == 2;
        if both_playing && joined_at.is_none() {
            joined_at = Some(session.self_frame());
        }
        if both_playing && session.other_frame() >= Frame::new(TARGET_FRAME) {
            mine.store(true, Ordering::SeqCst);
        }
        if mine.load(Ordering::SeqCst) && theirs.load(Ordering::SeqCst) {
            return joined_at.unwrap();
        }
        core.press_for(session.self_frame());
        session.advance_frame(core).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    panic!("loopback session did not reach frame {TARGET_FRAME}");
}

fn run_pair(serializable: bool) -> (Outcome, Outcome) {
    init_tracing();
    let server_done = Arc::new(AtomicBool::new(false));
    let client_done = Arc::new(AtomicBool::new(false));
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = {
        let (mine, theirs) = (server_done.clone(), client_done.clone());
        thread::spawn(move || {
            let listener = TcpListenerSocket::bind("127.0.0.1:0").unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let sink = Arc::new(CollectingSink::new());
            let mut core = StubCore::new(1);
            core.serializable = serializable;
            let mut session = builder("host")
                .with_timing_config(loopback_timing())
                .with_sink(sink.clone())
                .start_server(Box::new(listener), &mut core)
                .unwrap();
            let joined_at = drive(&mut session, &mut core, &mine, &theirs);
            Outcome {
                core,
                sink,
                joined_at,
            }
        })
    };

    let client = {
        let (mine, theirs) = (client_done, server_done);
        let addr = addr_rx.recv().unwrap();
        thread::spawn(move || {
            let socket = TcpStreamSocket::connect(addr).unwrap();
            let sink = Arc::new(CollectingSink::new());
            let mut core = StubCore::new(2);
            core.serializable = serializable;
            let mut session = builder("guest")
                .with_timing_config(loopback_timing())
                .with_sink(sink.clone())
                .start_client(Box::new(socket), &mut core)
                .unwrap();
            let joined_at = drive(&mut session, &mut core, &mine, &theirs);
            assert_eq!(session.self_mode(), ConnectionMode::Playing);
            Outcome {
                core,
                sink,
                joined_at,
            }
        })
    };

    (server.join().unwrap(), client.join().unwrap())
}

#[test]
#[serial]
fn test_tcp_session_with_savestates() {
    let (server, client) = run_pair(true);

    for side in [&server, &client] {
        assert!(!side.sink.has_event(|e| matches!(e, NetplayEvent::Desync)));
        assert!(!side
            .sink
            .has_event(|e| matches!(e, NetplayEvent::ProtocolViolation { .. })));
    }
    let from = server.joined_at.max(client.joined_at).as_u32() + 2;
    for frame in from..=TARGET_FRAME {
        assert_eq!(
            server.core.history.get(&frame),
            client.core.history.get(&frame),
            "cores disagree after frame {frame}"
        );
    }
}

#[test]
#[serial]
fn test_tcp_session_without_savestates() {
    let (server, client) = run_pair(false);

    assert!(server
        .sink
        .has_event(|e| matches!(e, NetplayEvent::SavestatesUnavailable)));
    // Without savestates nothing is predicted: every frame runs with real input, so the
    // input the cores saw matches frame for frame.
    let from = server.joined_at.max(client.joined_at).as_u32() + 1;
    for frame in from..TARGET_FRAME {
        let ours = server.core.inputs.get(&frame);
        assert!(ours.is_some(), "server never ran frame {frame}");
        assert_eq!(ours, client.core.inputs.get(&frame), "inputs differ at frame {frame}");
    }
}

#[test]
#[serial]
fn test_silent_peer_is_dropped_after_blocking_retries() {
    init_tracing();
    // Only the blocking poll's retry limit can drop the peer here.
    let timing = TimingConfig {
        retry_interval: Duration::from_millis(20),
        max_retries: 10,
        server_stall_timeout: Duration::from_secs(30),
        client_stall_timeout: Duration::from_secs(30),
    };
    let client_quiet = Arc::new(AtomicBool::new(false));
    let server_done = Arc::new(AtomicBool::new(false));
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = {
        let (quiet, done) = (client_quiet.clone(), server_done.clone());
        thread::spawn(move || {
            let listener = TcpListenerSocket::bind("127.0.0.1:0").unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let sink = Arc::new(CollectingSink::new());
            let mut core = StubCore::new(1);
            core.serializable = false;
            let mut session = builder("host")
                .with_timing_config(timing)
                .with_sink(sink.clone())
                .start_server(Box::new(listener), &mut core)
                .unwrap();

            for _ in 0..MAX_ITERATIONS {
                if quiet.load(Ordering::SeqCst) {
                    break;
                }
                core.press_for(session.self_frame());
                session.advance_frame(&mut core).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            assert!(quiet.load(Ordering::SeqCst), "client never joined");

            let mut steps = 0;
            while !session.peers().is_empty() {
                assert!(steps < 100, "silent client was never dropped");
                core.press_for(session.self_frame());
                session.advance_frame(&mut core).unwrap();
                steps += 1;
            }
            let before = session.self_frame();
            for _ in 0..10 {
                core.press_for(session.self_frame());
                assert!(session.advance_frame(&mut core).unwrap());
            }
            let advanced = session.self_frame() - before;
            done.store(true, Ordering::SeqCst);
            (advanced, sink)
        })
    };

    let client = {
        let (quiet, done) = (client_quiet, server_done);
        let addr = addr_rx.recv().unwrap();
        thread::spawn(move || {
            let socket = TcpStreamSocket::connect(addr).unwrap();
            let mut core = StubCore::new(2);
            core.serializable = false;
            let mut session = builder("guest")
                .with_timing_config(timing)
                .start_client(Box::new(socket), &mut core)
                .unwrap();
            for _ in 0..MAX_ITERATIONS {
                if session.connected_players().len() == 2 && session.other_frame() >= Frame::new(30)
                {
                    break;
                }
                core.press_for(session.self_frame());
                session.advance_frame(&mut core).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            quiet.store(true, Ordering::SeqCst);
            // Hold the connection open without running frames.
            for _ in 0..1_000 {
                if done.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            session
        })
    };

    let (advanced, sink) = server.join().unwrap();
    drop(client.join().unwrap());

    assert!(sink.has_event(|e| matches!(
        e,
        NetplayEvent::Hangup { nick, reason } if nick == "guest" && reason.contains("stalled")
    )));
    assert!(sink.has_event(|e| matches!(e, NetplayEvent::PlayerLeft { player: 1 })));
    assert_eq!(advanced, 10);
}
