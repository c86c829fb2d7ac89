// tests/integration/moderation_test.rs

//! Chat-command moderation: kick, ban, unban, authorization and the
//! informational commands.

use super::test_helpers::{TestClient, TestServer};
use convoyd::config::Config;
use convoyd::core::protocol::MessageType;
use convoyd::core::sequencer::SERVER_VERSION;
use std::io::Write;
use std::time::Duration;

/// Writes an auth cache granting ADMIN|MOD (0x03) to the "modtoken" user.
fn moderator_auth_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "; test moderators").unwrap();
    writeln!(file, "3 modtoken marla").unwrap();
    file.flush().unwrap();
    file
}

fn config_with_auth(auth_file: &tempfile::NamedTempFile) -> Config {
    let mut config = Config::default();
    config.server.auth_file = Some(auth_file.path().to_string_lossy().into_owned());
    config
}

#[tokio::test]
async fn version_and_list_commands_reply_over_chat() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "alice", "ua").await;

    a.chat("!version").await;
    let reply = a.recv_chat().await;
    assert_eq!(reply, format!("SERVER: {SERVER_VERSION}"));

    a.chat("!list").await;
    let header = a.recv_chat().await;
    assert!(header.contains("uid | auth"));
    let row = a.recv_chat().await;
    assert!(row.contains("alice"));
}

#[tokio::test]
async fn moderation_requires_privileges() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "alice", "ua").await;
    let b = TestClient::join_flowing(server.addr, "bob", "ub").await;

    a.chat(&format!("!kick {} bye", b.uid)).await;
    let reply = a.recv_chat().await;
    assert_eq!(reply, "SERVER: You are not authorized to kick people!");
    assert_eq!(server.sequencer.client_count(), 2);
}

#[tokio::test]
async fn kick_by_a_moderator_is_a_clean_leave() {
    let auth_file = moderator_auth_file();
    let server = TestServer::with_config(config_with_auth(&auth_file)).await;
    let mut moderator = TestClient::join_flowing(server.addr, "ignored", "modtoken").await;
    let mut victim = TestClient::join_flowing(server.addr, "bob", "ub").await;

    moderator.chat(&format!("!kick {} bye!", victim.uid)).await;

    let leave = victim.recv_type(MessageType::UserLeave).await;
    assert_eq!(leave.source_uid, victim.uid);
    let reason = String::from_utf8_lossy(&leave.payload).into_owned();
    assert_eq!(reason, "kicked by marla: bye!");
    victim.expect_close().await;
}

#[tokio::test]
async fn kick_with_bad_syntax_gets_usage() {
    let auth_file = moderator_auth_file();
    let server = TestServer::with_config(config_with_auth(&auth_file)).await;
    let mut moderator = TestClient::join_flowing(server.addr, "ignored", "modtoken").await;

    moderator.chat("!kick nonsense").await;
    assert_eq!(moderator.recv_chat().await, "SERVER: usage: !kick <uid> <message>");
    assert_eq!(moderator.recv_chat().await, "SERVER: example: !kick 3 bye!");

    moderator.chat("!kick 999 gone").await;
    assert_eq!(
        moderator.recv_chat().await,
        "SERVER: kick not successful: uid not found!"
    );
}

#[tokio::test]
async fn ban_then_unban_round_trip() {
    let auth_file = moderator_auth_file();
    let server = TestServer::with_config(config_with_auth(&auth_file)).await;
    let mut moderator = TestClient::join_flowing(server.addr, "ignored", "modtoken").await;
    let mut victim = TestClient::join_flowing(server.addr, "spammer", "uv").await;
    let victim_uid = victim.uid;

    moderator.chat(&format!("!ban {victim_uid} spam")).await;

    // The victim is told why via an errored delete, then dropped.
    let delete = victim.recv_type(MessageType::Delete).await;
    assert_eq!(delete.source_uid, victim_uid);
    let reason = String::from_utf8_lossy(&delete.payload).into_owned();
    assert!(reason.contains("banned: spam"), "reason was '{reason}'");
    victim.expect_close().await;

    let bans = server.sequencer.ban_list();
    assert_eq!(bans.len(), 1);
    assert_eq!(bans[0].uid, victim_uid);
    assert_eq!(bans[0].nickname, "spammer");
    assert_eq!(bans[0].banned_by, "marla");

    // The banned address is rejected before any broadcast.
    let mut retry = TestClient::connect(server.addr).await;
    retry.send_hello().await;
    retry.send_credentials("spammer", "uv", "").await;
    let reply = retry.recv().await;
    assert_eq!(reply.message_type(), Some(MessageType::Banned));
    retry.expect_close().await;

    moderator.chat(&format!("!unban {victim_uid}")).await;
    assert_eq!(moderator.recv_chat().await, "SERVER: ban removed");
    assert!(server.sequencer.ban_list().is_empty());

    // Reconnection succeeds now.
    let back = TestClient::join(server.addr, "spammer", "uv").await;
    assert!(back.uid > victim_uid, "uids are never reused");
}

#[tokio::test]
async fn bans_command_lists_records() {
    let auth_file = moderator_auth_file();
    let server = TestServer::with_config(config_with_auth(&auth_file)).await;
    let mut moderator = TestClient::join_flowing(server.addr, "ignored", "modtoken").await;
    let victim = TestClient::join_flowing(server.addr, "spammer", "uv").await;

    moderator.chat(&format!("!ban {} flooding", victim.uid)).await;
    // Wait until the ban is recorded before asking for the table.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.sequencer.ban_list().is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    moderator.chat("!bans").await;
    let header = moderator.recv_chat().await;
    assert!(header.contains("banned by"));
    let row = moderator.recv_chat().await;
    assert!(row.contains("spammer"));
    assert!(row.contains("marla"));
}

#[tokio::test]
async fn unban_of_unknown_uid_reports_failure() {
    let auth_file = moderator_auth_file();
    let server = TestServer::with_config(config_with_auth(&auth_file)).await;
    let mut moderator = TestClient::join_flowing(server.addr, "ignored", "modtoken").await;

    moderator.chat("!unban 777").await;
    assert_eq!(
        moderator.recv_chat().await,
        "SERVER: ban not removed: uid not on the ban list"
    );
}

#[tokio::test]
async fn commands_are_not_broadcast() {
    let server = TestServer::start().await;
    let mut a = TestClient::join_flowing(server.addr, "a", "ua").await;
    let mut b = TestClient::join_flowing(server.addr, "b", "ub").await;

    a.chat("!version").await;
    let reply = a.recv_chat().await;
    assert!(reply.starts_with("SERVER: "));
    b.assert_silent(MessageType::Chat, Duration::from_millis(300))
        .await;

    // A plain chat line reaches everyone, the sender included.
    a.chat("hello all").await;
    assert_eq!(a.recv_chat().await, "hello all");
    assert_eq!(b.recv_chat().await, "hello all");
}
