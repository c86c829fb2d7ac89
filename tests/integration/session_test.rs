// tests/integration/session_test.rs

//! End-to-end session tests: admission, colours, fan-out, private chat and
//! teardown ordering.

use super::test_helpers::{TestClient, TestServer};
use bytes::{BufMut, Bytes, BytesMut};
use convoyd::config::Config;
use convoyd::core::events::KillStage;
use convoyd::core::protocol::{MessageType, UserInfoPayload};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn welcome_carries_the_first_free_colour() {
    let server = TestServer::start().await;
    let a = TestClient::join(server.addr, "alice", "ua").await;
    assert_eq!(a.colour, 0);
    let b = TestClient::join(server.addr, "bob", "ub").await;
    assert_eq!(b.colour, 1);
    assert_eq!(server.sequencer.client_count(), 2);
}

#[tokio::test]
async fn full_server_rejects_with_a_single_frame() {
    let mut config = Config::default();
    config.game.max_players = 1;
    let server = TestServer::with_config(config).await;

    let first = TestClient::join(server.addr, "alice", "ua").await;
    assert_eq!(first.colour, 0);

    let mut second = TestClient::connect(server.addr).await;
    second.send_hello().await;
    second.send_credentials("bob", "ub", "").await;
    let reply = second.recv().await;
    assert_eq!(reply.message_type(), Some(MessageType::Full));
    second.expect_close().await;

    // The rejected connection never made it into the table.
    assert_eq!(server.sequencer.client_count(), 1);
}

#[tokio::test]
async fn duplicate_nickname_gets_a_counter() {
    let server = TestServer::start().await;
    let _first = TestClient::join(server.addr, "alice", "ua").await;

    let mut second = TestClient::connect(server.addr).await;
    second.send_hello().await;
    second.send_credentials("alice", "ub", "").await;
    second.recv_type(MessageType::Welcome).await;
    let join = second.recv_type(MessageType::UserJoin).await;
    let info = UserInfoPayload::decode(join.payload).unwrap();
    assert_eq!(info.nickname, "alice2");

    let snapshot = server.sequencer.heartbeat_snapshot("challenge-token");
    let mut lines = snapshot.lines();
    assert_eq!(lines.next(), Some("challenge-token"));
    assert_eq!(lines.next(), Some("version4"));
    assert_eq!(lines.next(), Some("2"));
    assert!(snapshot.contains(";alice;"));
    assert!(snapshot.contains(";alice2;"));
}

#[tokio::test]
async fn stream_data_fans_out_to_everyone_but_the_sender() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let mut b = TestClient::join_flowing(server.addr, "b", "ub").await;
    let mut c = TestClient::join_flowing(server.addr, "c", "uc").await;

    a.send_raw(MessageType::StreamData, 7, Bytes::from_static(b"xyz"))
        .await;

    for peer in [&mut b, &mut c] {
        let frame = peer.recv_type(MessageType::StreamData).await;
        assert_eq!(frame.source_uid, a.uid);
        assert_eq!(frame.stream_id, 7);
        assert_eq!(&frame.payload[..], b"xyz");
        // Exactly one copy.
        peer.assert_silent(MessageType::StreamData, Duration::from_millis(300))
            .await;
    }
    a.assert_silent(MessageType::StreamData, Duration::from_millis(300))
        .await;
}

#[tokio::test]
async fn per_receiver_ordering_is_preserved() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let mut b = TestClient::join_flowing(server.addr, "b", "ub").await;

    for i in 0u8..8 {
        a.send_raw(MessageType::StreamData, 3, Bytes::from(vec![i]))
            .await;
    }
    for i in 0u8..8 {
        let frame = b.recv_type(MessageType::StreamData).await;
        assert_eq!(frame.payload[0], i);
    }
}

#[tokio::test]
async fn first_stream_data_replays_join_state() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let mut b = TestClient::join_flowing(server.addr, "b", "ub").await;

    b.send_raw(MessageType::StreamData, 1, Bytes::from_static(b"p"))
        .await;

    // The newcomer gets the whole roster replayed...
    let info = a.recv_type(MessageType::UserInfo).await;
    assert_eq!(info.source_uid, b.uid);
    // ...and itself sees every existing client.
    let mut seen = Vec::new();
    while seen.len() < 2 {
        let frame = b.recv_type(MessageType::UserInfo).await;
        seen.push(frame.source_uid);
    }
    assert!(seen.contains(&a.uid));
    assert!(seen.contains(&b.uid));
}

#[tokio::test]
async fn private_chat_reaches_only_the_target() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let mut b = TestClient::join_flowing(server.addr, "b", "ub").await;
    let mut c = TestClient::join_flowing(server.addr, "c", "uc").await;

    let mut payload = BytesMut::new();
    payload.put_u32_le(b.uid);
    payload.extend_from_slice(b"hi");
    a.send_raw(MessageType::PrivChat, 0, payload.freeze()).await;

    let frame = b.recv_type(MessageType::Chat).await;
    assert_eq!(frame.source_uid, a.uid);
    assert_eq!(&frame.payload[..], b"hi");
    c.assert_silent(MessageType::Chat, Duration::from_millis(300))
        .await;
}

#[tokio::test]
async fn vehicle_data_updates_the_position_hint() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let mut b = TestClient::join_flowing(server.addr, "b", "ub").await;

    // 16 opaque out-of-band bytes, then three little-endian floats.
    let mut payload = BytesMut::new();
    payload.put_bytes(0, 16);
    payload.put_f32_le(10.5);
    payload.put_f32_le(-2.0);
    payload.put_f32_le(300.25);
    a.send_raw(MessageType::VehicleData, 2, payload.freeze())
        .await;

    let frame = b.recv_type(MessageType::VehicleData).await;
    assert_eq!(frame.source_uid, a.uid);

    let snapshot = server.sequencer.heartbeat_snapshot("x");
    assert!(snapshot.contains("10.50,-2.00,300.25"));
}

#[tokio::test]
async fn client_delete_is_a_clean_leave() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let mut b = TestClient::join_flowing(server.addr, "b", "ub").await;

    b.send_raw(MessageType::Delete, 0, Bytes::new()).await;

    let frame = a.recv_type(MessageType::UserLeave).await;
    assert_eq!(frame.source_uid, b.uid);
    assert_eq!(&frame.payload[..], b"disconnected on request");
    b.expect_close().await;
    assert_eq!(server.sequencer.client_count(), 1);
}

#[tokio::test]
async fn killer_tears_down_in_strict_order() {
    let server = TestServer::start().await;
    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    server.sequencer.set_kill_observer(observer_tx);

    let victim = TestClient::join_flowing(server.addr, "victim", "uv").await;
    assert!(server.sequencer.disconnect(victim.uid, "test teardown", false));

    let expected = [
        KillStage::BeamBufferFreed,
        KillStage::BroadcasterStopped,
        KillStage::ReceiverStopped,
        KillStage::SocketClosed,
        KillStage::Freed,
    ];
    for expected_stage in expected {
        let (uid, stage) =
            tokio::time::timeout(Duration::from_secs(5), observer_rx.recv())
                .await
                .expect("timed out waiting for a kill stage")
                .expect("kill observer channel closed");
        assert_eq!(uid, victim.uid);
        assert_eq!(stage, expected_stage);
    }
}

#[tokio::test]
async fn colour_of_a_leaver_is_reused() {
    let server = TestServer::start().await;
    let _a = TestClient::join(server.addr, "a", "ua").await;
    let b = TestClient::join(server.addr, "b", "ub").await;
    let c = TestClient::join(server.addr, "c", "uc").await;
    assert_eq!((b.colour, c.colour), (1, 2));

    server.sequencer.disconnect(b.uid, "bye", false);
    // Wait for the table to reflect the removal.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.sequencer.client_count() != 2 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let d = TestClient::join(server.addr, "d", "ud").await;
    assert_eq!(d.colour, 1);
}

#[tokio::test]
async fn wrong_protocol_version_is_rejected() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr).await;
    client
        .send_raw(MessageType::Hello, 0, Bytes::from_static(b"RELAY-0"))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.message_type(), Some(MessageType::WrongVersion));
    client.expect_close().await;
    assert_eq!(server.sequencer.client_count(), 0);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let mut config = Config::default();
    config.server.password = Some("sekrit".to_string());
    let server = TestServer::with_config(config).await;

    let mut client = TestClient::connect(server.addr).await;
    client.send_hello().await;
    client.send_credentials("alice", "ua", "not-the-digest").await;
    let reply = client.recv().await;
    assert_eq!(reply.message_type(), Some(MessageType::WrongPassword));
    client.expect_close().await;
}

#[tokio::test]
async fn game_commands_are_unicast_from_the_server() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let mut b = TestClient::join_flowing(server.addr, "b", "ub").await;

    server
        .sequencer
        .send_game_command(a.uid, "spawnObject(1)")
        .unwrap();
    let frame = a.recv_type(MessageType::GameCmd).await;
    assert_eq!(frame.source_uid, u32::MAX);
    assert_eq!(&frame.payload[..], b"spawnObject(1)");
    b.assert_silent(MessageType::GameCmd, Duration::from_millis(300))
        .await;

    let missing = server.sequencer.send_game_command(9999, "noop");
    assert!(missing.is_err());
}

#[tokio::test]
async fn chat_lines_land_in_the_history_ring() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "alice", "ua").await;

    a.chat("remember me").await;
    assert_eq!(a.recv_chat().await, "remember me");

    let history = server.sequencer.chat_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source_uid, a.uid);
    assert_eq!(history[0].nick, "alice");
    assert_eq!(history[0].msg, "remember me");
    assert!(!history[0].time.is_empty());
}

#[tokio::test]
async fn motd_greets_the_client_after_flow_enable() {
    use std::io::Write;

    let mut motd = tempfile::NamedTempFile::new().unwrap();
    write!(motd, "welcome to the convoy\ndrive carefully\n").unwrap();
    let mut config = Config::default();
    config.server.motd_file = Some(motd.path().to_string_lossy().into_owned());
    let server = TestServer::with_config(config).await;

    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    assert_eq!(a.recv_chat().await, "welcome to the convoy");
    assert_eq!(a.recv_chat().await, "drive carefully");
}

#[tokio::test]
async fn dropped_peer_becomes_an_errored_delete() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let b = TestClient::join_flowing(server.addr, "b", "ub").await;

    // Kill b's socket abruptly; a must observe an errored teardown.
    let b_uid = b.uid;
    drop(b);

    let frame = a.recv_type(MessageType::Delete).await;
    assert_eq!(frame.source_uid, b_uid);
    assert!(!frame.payload.is_empty());
}
