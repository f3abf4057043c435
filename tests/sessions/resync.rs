//! Savestate transfer, checksum and reset integration tests.

use crate::common::{
    assert_histories_agree, builder, join_as_player, run_turns, server_and_client, Peer,
};
use fortress_netplay::NetplayEvent;

fn count_desyncs(peer: &Peer) -> usize {
    peer.sink
        .events()
        .iter()
        .filter(|e| matches!(e, NetplayEvent::Desync))
        .count()
}

#[test]
fn test_joining_client_receives_server_state() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    run_turns(&mut [&mut server], 30);

    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 5);

    // The core counts frames from zero, so it only matches the session frame once the
    // server's state has been loaded.
    assert_eq!(client.core.frames, client.session.run_frame().as_u32());
    assert_eq!(server.core.frames, server.session.run_frame().as_u32());
    assert!(client.session.state_size() > 0);
}

#[test]
fn test_desync_is_detected_and_repaired() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);

    client.core.skew = 3;
    run_turns(&mut [&mut server, &mut client], 40);
    assert!(client.saw_desync());
    assert!(!server.saw_desync());

    client.core.skew = 0;
    run_turns(&mut [&mut server, &mut client], 60);
    let from = client.session.self_frame().as_u32();
    let desyncs = count_desyncs(&client);
    run_turns(&mut [&mut server, &mut client], 40);

    assert_eq!(count_desyncs(&client), desyncs, "still desynced");
    assert!(assert_histories_agree(&server, &client, from) > 20);
}

#[test]
fn test_server_savestate_load_reaches_client() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 20);

    // The host loads a state of its own.
    server.core.acc = 0x1234_5678;
    server.session.load_savestate(&mut server.core).unwrap();
    let from = server.session.run_frame().as_u32() + 1;
    run_turns(&mut [&mut server, &mut client], 40);

    assert!(!server.saw_desync() && !client.saw_desync());
    assert!(assert_histories_agree(&server, &client, from) > 20);
}

#[test]
fn test_client_savestate_load_reaches_server() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 20);

    client.core.acc = 0x0BAD_F00D;
    client.session.load_savestate(&mut client.core).unwrap();
    let from = client.session.run_frame().as_u32() + 1;
    run_turns(&mut [&mut server, &mut client], 40);

    assert!(!server.saw_desync() && !client.saw_desync());
    assert!(assert_histories_agree(&server, &client, from) > 20);
}

#[test]
fn test_desync_stretch_withholds_savestate() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 10);

    server.session.push_desync();
    assert!(server.session.is_desync_active());
    server.core.acc = 0x5555_AAAA;
    server.session.load_savestate(&mut server.core).unwrap();
    run_turns(&mut [&mut server, &mut client], 3);
    server.session.pop_desync().unwrap();
    assert!(!server.session.is_desync_active());
    assert!(server.session.pop_desync().is_err());

    // Leaving the stretch sends whatever the server runs now.
    run_turns(&mut [&mut server, &mut client], 3);
    let from = server.session.run_frame().as_u32();
    run_turns(&mut [&mut server, &mut client], 40);
    assert!(assert_histories_agree(&server, &client, from) > 20);
}

#[test]
fn test_reset_is_shared() {
    let (mut server, mut client) = server_and_client(builder("host"), builder("guest"));
    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 30);

    server.session.reset(&mut server.core);
    assert_eq!(server.core.resets, 1);
    run_turns(&mut [&mut server, &mut client], 40);

    assert!(client.core.resets >= 1);
    // Both cores restarted their frame count at the same session frame.
    let server_offset = server.session.run_frame().as_u32() - server.core.frames;
    let client_offset = client.session.run_frame().as_u32() - client.core.frames;
    assert_eq!(server_offset, client_offset);
    assert!(server_offset > 0);
    assert!(!server.saw_desync() && !client.saw_desync());
}

#[test]
fn test_checksums_flow_without_desync() {
    let (mut server, mut client) = server_and_client(
        builder("host").with_check_frames(1),
        builder("guest"),
    );
    join_as_player(&mut server, &mut client);
    run_turns(&mut [&mut server, &mut client], 80);

    assert!(!client.saw_desync());
    assert!(!client.has_event(|e| matches!(e, NetplayEvent::ProtocolViolation { .. })));
}
