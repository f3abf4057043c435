//! Gameplay integration tests: a server and its clients exchanging input frame by frame.

use std::thread;
use std::time::Duration;

use crate::common::{
    assert_histories_agree, builder, join_as_player, run_turns, run_until, server_and_client,
    MAX_TURNS,
};
use fortress_netplay::{ConnectionMode, NetplayEvent, PlayerMask, StallReason, TimingConfig};

#[test]
fn test_players_stay_in_sync() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);
    let from = client.session.self_frame().as_u32() + 2;

    run_turns(&mut [&mut server, &mut client], 150);

    assert!(!server.saw_desync());
    assert!(!client.saw_desync());
    let compared = assert_histories_agree(&server, &client, from);
    assert!(compared > 100, "only {compared} frames confirmed on both sides");
}

#[test]
fn test_confirmed_frame_trails_self_frame() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);

    run_turns(&mut [&mut server, &mut client], 40);

    for peer in [&server, &client] {
        let session = &peer.session;
        assert!(session.other_frame() <= session.run_frame());
        assert!(session.run_frame() <= session.self_frame());
        assert!(session.self_frame() - session.other_frame() <= 3);
    }
}

#[test]
fn test_three_players_stay_in_sync() {
    let listener = fortress_netplay::MemoryListener::new();
    let first = listener.connect();
    let second = listener.connect();
    let mut server = crate::common::Peer::server(builder("host"), Box::new(listener), 1);
    let mut a = crate::common::Peer::client(
        builder("alpha"),
        Box::new(first),
        crate::common::stubs::StubCore::new(2),
    );
    let mut b = crate::common::Peer::client(
        builder("beta"),
        Box::new(second),
        crate::common::stubs::StubCore::new(3),
    );
    run_until(&mut [&mut server, &mut a, &mut b], |peers| {
        peers.iter().all(|p| p.session.connected_players().len() == 3)
    });
    let from = server.session.self_frame().as_u32() + 2;

    run_turns(&mut [&mut server, &mut a, &mut b], 120);

    assert!(!server.saw_desync() && !a.saw_desync() && !b.saw_desync());
    assert!(assert_histories_agree(&server, &a, from) > 60);
    assert!(assert_histories_agree(&server, &b, from) > 60);
}

#[test]
fn test_client_pause_stalls_server() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 10);

    client.session.set_paused(true);
    let frozen_at = server.session.self_frame();
    for _ in 0..10 {
        assert!(!server.step());
    }
    assert_eq!(server.session.self_frame(), frozen_at);
    assert!(server.session.is_remote_paused());
    assert!(server.has_event(|e| matches!(e, NetplayEvent::Paused { nick } if nick == "guest")));
    assert!(server.session.peers()[0].paused);

    client.session.set_paused(false);
    run_turns(&mut [&mut server, &mut client], 10);
    assert!(server.has_event(|e| matches!(e, NetplayEvent::Resumed)));
    assert!(!server.session.is_remote_paused());
    assert!(server.session.self_frame() > frozen_at);
    assert!(!server.saw_desync() && !client.saw_desync());
}

#[test]
fn test_flip_players_reaches_client() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 10);
    let from = client.session.self_frame().as_u32() + 2;

    server.session.flip_players().unwrap();
    run_turns(&mut [&mut server, &mut client], 40);

    assert!(client.has_event(|e| matches!(e, NetplayEvent::PlayersFlipped)));
    assert!(server.session.ports_flipped());
    assert!(client.session.ports_flipped());
    assert!(!server.saw_desync() && !client.saw_desync());
    assert_histories_agree(&server, &client, from);
}

#[test]
fn test_only_server_flips() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);

    assert!(client.session.flip_players().is_err());
}

#[test]
fn test_kicked_client_continues_alone() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);

    let id = server.session.peers()[0].id;
    server.session.kick(id).unwrap();
    run_until(&mut [&mut server, &mut client], |peers| {
        peers[1].session.self_mode() == ConnectionMode::None
    });

    assert!(client.has_event(|e| matches!(e, NetplayEvent::Hangup { .. })));
    assert!(server.has_event(|e| matches!(e, NetplayEvent::PlayerLeft { player: 1 })));
    assert_eq!(server.session.connected_players(), PlayerMask::single(0));
    assert!(server.session.peers().is_empty());

    let before = client.session.self_frame();
    for _ in 0..5 {
        assert!(client.step());
    }
    assert_eq!(client.session.self_frame() - before, 5);
    assert_eq!(client.session.other_frame(), client.session.self_frame());
}

#[test]
fn test_client_disconnect_frees_slot() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);

    client.session.disconnect();
    run_until(&mut [&mut server], |peers| peers[0].session.peers().is_empty());

    assert!(server.has_event(|e| matches!(e, NetplayEvent::PlayerLeft { player: 1 })));
    assert!(server.has_event(|e| matches!(
        e,
        NetplayEvent::Hangup { nick, .. } if nick == "guest"
    )));
    assert_eq!(client.session.self_mode(), ConnectionMode::None);
    // The server carries on by itself.
    assert!(server.step());
}

#[test]
fn test_toggle_to_spectator_and_back() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);

    client.session.toggle_play_spectate().unwrap();
    run_until(&mut [&mut server, &mut client], |peers| {
        peers[1].session.self_mode() == ConnectionMode::Spectating
    });
    assert!(client.has_event(|e| matches!(e, NetplayEvent::LeftGame)));
    run_turns(&mut [&mut server, &mut client], 5);
    assert_eq!(server.session.connected_players(), PlayerMask::single(0));

    client.session.toggle_play_spectate().unwrap();
    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 30);

    assert_eq!(client.session.self_mode(), ConnectionMode::Playing);
    assert_eq!(client.session.connected_players(), server.session.connected_players());
    assert_eq!(
        client
            .sink
            .events()
            .iter()
            .filter(|e| matches!(e, NetplayEvent::JoinedAsPlayer { .. }))
            .count(),
        2
    );
}

#[test]
fn test_server_stalls_for_slow_client() {
    let (mut server, mut client) = server_and_client(
        builder("host").with_stall_frames(5).unwrap(),
        builder("guest").with_stall_frames(5).unwrap(),
    );
    join_as_player(&mut server, &mut client);

    for _ in 0..20 {
        server.step();
    }
    assert_eq!(server.session.stall_reason(), StallReason::RunningFast);
    assert!(server.has_event(|e| matches!(
        e,
        NetplayEvent::Stalled {
            reason: StallReason::RunningFast
        }
    )));
    let stalled_at = server.session.self_frame();

    run_turns(&mut [&mut server, &mut client], 30);
    assert!(server.session.self_frame() > stalled_at);
    assert!(!server.saw_desync() && !client.saw_desync());
}

#[test]
fn test_silent_client_is_dropped_after_stall_timeout() {
    let timing = TimingConfig {
        retry_interval: Duration::from_millis(5),
        max_retries: 4,
        server_stall_timeout: Duration::from_millis(100),
        client_stall_timeout: Duration::from_secs(2),
    };
    let (mut server, mut client) = server_and_client(
        builder("host")
            .with_stall_frames(5)
            .unwrap()
            .with_timing_config(timing),
        builder("guest").with_stall_frames(5).unwrap(),
    );
    join_as_player(&mut server, &mut client);

    // The client keeps its connection open but stops running frames.
    let mut turns = 0;
    while !server.session.peers().is_empty() {
        assert!(turns < MAX_TURNS, "silent client was never dropped");
        server.step();
        thread::sleep(Duration::from_millis(2));
        turns += 1;
    }

    assert!(server.has_event(|e| matches!(
        e,
        NetplayEvent::Stalled {
            reason: StallReason::RunningFast
        }
    )));
    assert!(server.has_event(|e| matches!(
        e,
        NetplayEvent::Hangup { nick, reason } if nick == "guest" && reason.contains("stalled")
    )));
    assert!(server.has_event(|e| matches!(e, NetplayEvent::PlayerLeft { player: 1 })));
    assert_eq!(server.session.connected_players(), PlayerMask::single(0));
    assert_eq!(server.session.stall_reason(), StallReason::None);

    let before = server.session.self_frame();
    for _ in 0..10 {
        assert!(server.step());
    }
    assert_eq!(server.session.self_frame() - before, 10);
}
