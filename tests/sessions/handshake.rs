//! Handshake integration tests.

use std::iter;

use crate::common::stubs::StubCore;
use crate::common::{builder, join_as_player, run_turns, run_until, server_and_client, Peer};
use fortress_netplay::network::codec;
use fortress_netplay::network::messages::{HandshakeHeader, PayloadLimits};
use fortress_netplay::network::packet_buffer::RecvBuffer;
use fortress_netplay::{
    Command, ConnectionMode, MemoryListener, ModeRefusedReason, NetplayEvent, PlayerMask,
    StreamSocket, MAX_PLAYERS, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};

#[test]
fn test_client_joins_as_player() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));

    join_as_player(&mut server, &mut client);

    assert!(client.has_event(|e| matches!(e, NetplayEvent::Connected { nick } if nick == "guest")));
    assert!(client.has_event(|e| matches!(
        e,
        NetplayEvent::JoinedAsPlayer {
            player: 1,
            slave: false
        }
    )));
    assert!(server.has_event(|e| matches!(e, NetplayEvent::PeerJoined { nick } if nick == "guest")));
    assert!(server.has_event(|e| matches!(e, NetplayEvent::PlayerJoined { player: 1 })));

    assert_eq!(client.session.self_player(), Some(1));
    assert_eq!(server.session.self_player(), Some(0));
    assert_eq!(client.session.connected_players(), server.session.connected_players());

    let peers = server.session.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].nick, "guest");
    assert_eq!(peers[0].mode, ConnectionMode::Playing);
    assert_eq!(peers[0].player, 1);
}

#[test]
fn test_client_frames_follow_server_after_sync() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));

    // Let the server get well ahead before the client is accepted.
    run_turns(&mut [&mut server], 30);
    join_as_player(&mut server, &mut client);

    let gap = server.session.self_frame() - client.session.self_frame();
    assert!(gap <= 2, "client is {gap} frames behind after joining");
}

#[test]
fn test_start_as_spectator_stays_spectating() {
    let (mut server, mut client) = server_and_client(
        builder("host"),
        builder("watcher").start_as_spectator(),
    );

    run_until(&mut [&mut server, &mut client], |peers| {
        peers[1].session.self_mode() == ConnectionMode::Spectating
    });
    run_turns(&mut [&mut server, &mut client], 20);

    assert_eq!(client.session.self_mode(), ConnectionMode::Spectating);
    assert_eq!(client.session.self_player(), None);
    assert_eq!(server.session.connected_players(), PlayerMask::single(0));
    assert_eq!(server.session.peers()[0].mode, ConnectionMode::Spectating);
}

#[test]
fn test_wrong_password_is_hung_up() {
    let (mut server, mut client) = server_and_client(
        builder("host").with_password("secret"),
        builder("guest").with_password("guess"),
    );

    run_turns(&mut [&mut server, &mut client], 10);

    assert!(server.has_event(|e| matches!(
        e,
        NetplayEvent::Hangup { reason, .. } if reason.contains("Authentication")
    )));
    assert!(client.has_event(|e| matches!(e, NetplayEvent::Hangup { .. })));
    assert!(!client.has_event(|e| matches!(e, NetplayEvent::Connected { .. })));
    assert_eq!(client.session.self_mode(), ConnectionMode::None);
    assert!(server.session.peers().is_empty());
}

#[test]
fn test_correct_password_joins() {
    let (mut server, mut client) = server_and_client(
        builder("host").with_password("secret"),
        builder("guest").with_password("secret"),
    );

    join_as_player(&mut server, &mut client);

    assert_eq!(client.session.self_player(), Some(1));
}

#[test]
fn test_spectate_password_refuses_play() {
    let (mut server, mut client) = server_and_client(
        builder("host")
            .with_password("secret")
            .with_spectate_password("watch"),
        builder("guest").with_password("watch"),
    );

    run_until(&mut [&mut server, &mut client], |peers| {
        peers[1].has_event(|e| matches!(e, NetplayEvent::JoinRefused { .. }))
    });

    assert!(client.has_event(|e| matches!(
        e,
        NetplayEvent::JoinRefused {
            reason: ModeRefusedReason::Unprivileged
        }
    )));
    assert_eq!(client.session.self_mode(), ConnectionMode::Spectating);
    assert_eq!(server.session.connected_players(), PlayerMask::single(0));
}

#[test]
fn test_different_core_is_rejected() {
    let listener = MemoryListener::new();
    let socket = listener.connect();
    let mut server = Peer::server(builder("host"), Box::new(listener), 1);
    let mut client = Peer::client(
        builder("guest"),
        Box::new(socket),
        StubCore::named(2, "other-core"),
    );

    run_turns(&mut [&mut server, &mut client], 10);

    assert!(client.has_event(|e| matches!(
        e,
        NetplayEvent::Hangup { reason, .. } if reason.contains("other-core") || reason.contains("stub-core")
    )));
    assert!(!client.has_event(|e| matches!(e, NetplayEvent::Connected { .. })));
    assert!(server.session.peers().is_empty());
}

#[test]
fn test_core_version_mismatch_only_warns() {
    let listener = MemoryListener::new();
    let socket = listener.connect();
    let mut server = Peer::server(builder("host"), Box::new(listener), 1);
    let mut core = StubCore::new(2);
    core.version = "2.0";
    let mut client = Peer::client(builder("guest"), Box::new(socket), core);

    join_as_player(&mut server, &mut client);

    assert!(client.has_event(|e| matches!(
        e,
        NetplayEvent::CoreVersionMismatch { local, remote } if local == "2.0" && remote == "1.0"
    )));
}

#[test]
fn test_duplicate_nick_is_renamed() {
    let (mut server, mut client) = server_and_client(builder("twin"), builder("twin"));

    join_as_player(&mut server, &mut client);

    assert_eq!(client.session.nick(), "twin (2)");
    assert!(client.has_event(|e| matches!(e, NetplayEvent::NickChanged { nick } if nick == "twin (2)")));
    assert_eq!(server.session.peers()[0].nick, "twin (2)");
}

#[test]
fn test_second_client_gets_next_slot() {
    let listener = MemoryListener::new();
    let first = listener.connect();
    let second = listener.connect();
    let mut server = Peer::server(builder("host"), Box::new(listener), 1);
    let mut a = Peer::client(builder("alpha"), Box::new(first), StubCore::new(2));
    let mut b = Peer::client(builder("beta"), Box::new(second), StubCore::new(3));

    run_until(&mut [&mut server, &mut a, &mut b], |peers| {
        peers[0].session.connected_players().len() == 3
            && peers[1].session.self_mode() == ConnectionMode::Playing
            && peers[2].session.self_mode() == ConnectionMode::Playing
    });

    let mut slots = [a.session.self_player(), b.session.self_player()];
    slots.sort();
    assert_eq!(slots, [Some(1), Some(2)]);
    // Each client learns about the other from the server's MODE broadcast.
    run_turns(&mut [&mut server, &mut a, &mut b], 5);
    assert_eq!(a.session.connected_players().len(), 3);
    assert_eq!(b.session.connected_players().len(), 3);
}

#[test]
fn test_large_matching_save_ram_is_applied() {
    const SAVE_RAM_LEN: usize = 2 << 20;
    let listener = MemoryListener::new();
    let socket = listener.connect();
    let mut host_core = StubCore::new(1);
    host_core.save_ram = (0..SAVE_RAM_LEN).map(|i| (i % 251) as u8).collect();
    let expected = host_core.save_ram.clone();
    let mut server = Peer::server_with_core(builder("host"), Box::new(listener), host_core);
    let mut guest_core = StubCore::new(2);
    guest_core.save_ram = vec![0; SAVE_RAM_LEN];
    let mut client = Peer::client(builder("guest"), Box::new(socket), guest_core);

    join_as_player(&mut server, &mut client);

    assert!(!client.has_event(|e| matches!(e, NetplayEvent::ProtocolViolation { .. })));
    assert!(client.has_event(|e| matches!(e, NetplayEvent::Connected { .. })));
    assert!(client.core.save_ram == expected, "save RAM was not applied");
}

#[test]
fn test_save_ram_of_other_size_is_ignored() {
    let listener = MemoryListener::new();
    let socket = listener.connect();
    let mut host_core = StubCore::new(1);
    host_core.save_ram = vec![0x5A; 4096];
    let mut server = Peer::server_with_core(builder("host"), Box::new(listener), host_core);
    let mut guest_core = StubCore::new(2);
    guest_core.save_ram = vec![0x11; 2048];
    let mut client = Peer::client(builder("guest"), Box::new(socket), guest_core);

    join_as_player(&mut server, &mut client);

    assert!(client.core.save_ram.iter().all(|&b| b == 0x11));
    assert!(!client.has_event(|e| matches!(e, NetplayEvent::ProtocolViolation { .. })));
}

#[test]
fn test_full_server_refuses_play() {
    let listener = MemoryListener::new();
    let handle = listener.clone();
    let mut server = Peer::server(builder("host"), Box::new(listener), 1);
    let mut players: Vec<Peer> = (1..MAX_PLAYERS as u32)
        .map(|seed| {
            Peer::client(
                builder(&format!("player{seed}")),
                Box::new(handle.connect()),
                StubCore::new(seed + 1),
            )
        })
        .collect();
    {
        let mut all: Vec<&mut Peer> = iter::once(&mut server).chain(players.iter_mut()).collect();
        run_until(&mut all, |peers| {
            peers[0].session.connected_players().len() == MAX_PLAYERS
                && peers[1..]
                    .iter()
                    .all(|p| p.session.self_mode() == ConnectionMode::Playing)
        });
    }

    let mut late = Peer::client(builder("late"), Box::new(handle.connect()), StubCore::new(99));
    {
        let mut all: Vec<&mut Peer> = iter::once(&mut server)
            .chain(players.iter_mut())
            .chain(iter::once(&mut late))
            .collect();
        run_until(&mut all, |peers| {
            peers[MAX_PLAYERS].has_event(|e| matches!(e, NetplayEvent::JoinRefused { .. }))
        });
        run_turns(&mut all, 5);
    }

    assert!(late.has_event(|e| matches!(
        e,
        NetplayEvent::JoinRefused {
            reason: ModeRefusedReason::NoSlots
        }
    )));
    assert!(!late.has_event(|e| matches!(e, NetplayEvent::JoinedAsPlayer { .. })));
    assert_eq!(late.session.self_mode(), ConnectionMode::Spectating);
    assert_eq!(late.session.self_player(), None);
    assert_eq!(server.session.connected_players().len(), MAX_PLAYERS);
    assert!(players
        .iter()
        .all(|p| p.session.self_mode() == ConnectionMode::Playing));
}

#[test]
fn test_message_for_wrong_stage_is_refused() {
    let listener = MemoryListener::new();
    let mut raw = listener.connect();
    let mut server = Peer::server(builder("host"), Box::new(listener), 1);

    let header = HandshakeHeader {
        magic: PROTOCOL_MAGIC,
        platform_magic: 0,
        compression: 0,
        salt: 0,
        protocol_version: PROTOCOL_VERSION,
        impl_hash: 0,
    };
    raw.send(&codec::encode(&header).unwrap()).unwrap();
    // INFO before NICK.
    raw.send(&Command::Info(None).to_bytes().unwrap()).unwrap();
    run_turns(&mut [&mut server], 3);

    assert!(server.has_event(|e| matches!(e, NetplayEvent::ProtocolViolation { .. })));
    assert!(server.has_event(|e| matches!(e, NetplayEvent::Hangup { .. })));
    assert!(server.session.peers().is_empty());

    let mut recv = RecvBuffer::new();
    recv.fill(&mut raw).unwrap();
    assert!(recv.next_handshake_header().unwrap().is_some());
    let limits = PayloadLimits::default();
    let mut replies = Vec::new();
    while let Some(command) = recv.next_command(&limits).unwrap() {
        replies.push(command);
    }
    assert!(matches!(replies.first(), Some(Command::Nick(nick)) if nick == "host"));
    assert_eq!(replies.last(), Some(&Command::Nak));
}
