// src/core/sequencer/chat.rs

//! Chat relay, the chat history ring and the `!` command handler.
//!
//! Validation failures in commands only ever produce chat replies; nothing
//! in here disconnects anyone except a successful kick or ban.

use super::{SERVER_VERSION, Sequencer};
use super::dispatch::PublishMode;
use crate::core::RelayError;
use crate::core::protocol::Frame;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One line of the chat history ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatLogEntry {
    pub time: String,
    pub source_uid: u32,
    pub nick: String,
    pub msg: String,
}

impl Sequencer {
    /// Chat frames broadcast to everyone unless they carry a `!` command,
    /// which the server handles itself. A script hook may override the
    /// publish mode either way.
    pub(crate) fn handle_chat(&self, uid: u32, frame: Frame) {
        let msg = String::from_utf8_lossy(&frame.payload)
            .trim_end_matches('\0')
            .to_string();
        let nick = {
            let clients = self.clients.lock();
            match clients.iter().find(|c| c.uid == uid) {
                Some(c) => c.nickname.clone(),
                None => return,
            }
        };
        info!("CHAT| {nick}: {msg}");

        let mut mode = PublishMode::All;
        if msg.starts_with('!') {
            mode = PublishMode::Drop;
        }
        if let Some(script) = &self.script {
            if let Some(overridden) = PublishMode::from_script(script.player_chat(uid, &msg)) {
                mode = overridden;
            }
        }
        if msg.starts_with('!') {
            self.handle_command(uid, &msg);
        }

        self.record_chat(uid, &nick, &msg);
        self.publish(uid, &frame, mode);
    }

    /// Appends to the 500-entry ring, evicting at the head.
    fn record_chat(&self, uid: u32, nick: &str, msg: &str) {
        let mut history = self.chat_history.lock();
        if history.len() >= super::CHAT_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(ChatLogEntry {
            time: chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string(),
            source_uid: uid,
            nick: nick.to_string(),
            msg: msg.to_string(),
        });
    }

    fn sender_can_moderate(&self, uid: u32) -> bool {
        let clients = self.clients.lock();
        clients
            .iter()
            .find(|c| c.uid == uid)
            .is_some_and(|c| c.auth.can_moderate())
    }

    fn handle_command(&self, uid: u32, msg: &str) {
        let uid_i = uid as i64;
        if msg == "!version" {
            self.server_say(SERVER_VERSION, uid_i, 0);
        } else if msg == "!list" {
            self.server_say(" uid | auth   | nick                 | vehicle", uid_i, 0);
            let rows: Vec<String> = {
                let clients = self.clients.lock();
                clients
                    .iter()
                    .map(|c| {
                        format!(
                            "{:>4} | {:<6} | {:<20} | {}",
                            c.uid,
                            c.auth.letters(true),
                            c.nickname,
                            c.vehicle_name
                        )
                    })
                    .collect()
            };
            for row in rows {
                self.server_say(&row, uid_i, 0);
            }
        } else if msg.starts_with("!bans") {
            self.server_say("uid | IP              | nickname             | banned by", uid_i, 0);
            for ban in self.ban_list() {
                self.server_say(
                    &format!(
                        "{:>3} | {:<15} | {:<20} | {:<20}",
                        ban.uid,
                        ban.ip.to_string(),
                        ban.nickname,
                        ban.banned_by
                    ),
                    uid_i,
                    0,
                );
            }
        } else if let Some(rest) = msg.strip_prefix("!unban") {
            if !self.sender_can_moderate(uid) {
                self.server_say("You are not authorized to unban people!", uid_i, 0);
                return;
            }
            match rest.trim().parse::<u32>() {
                Ok(ban_uid) => {
                    if self.unban(ban_uid) {
                        self.server_say("ban removed", uid_i, 0);
                    } else {
                        self.server_say("ban not removed: uid not on the ban list", uid_i, 0);
                    }
                }
                Err(_) => {
                    self.server_say("usage: !unban <uid>", uid_i, 0);
                    self.server_say("example: !unban 3", uid_i, 0);
                }
            }
        } else if let Some(rest) = msg.strip_prefix("!ban ") {
            if !self.sender_can_moderate(uid) {
                self.server_say("You are not authorized to ban people!", uid_i, 0);
                return;
            }
            match parse_uid_and_message(rest) {
                Some((ban_uid, ban_msg)) => {
                    if let Err(RelayError::UnknownUid(_)) = self.ban(ban_uid, uid, &ban_msg) {
                        self.server_say("kick + ban not successful: uid not found!", uid_i, 0);
                    }
                }
                None => {
                    self.server_say("usage: !ban <uid> <message>", uid_i, 0);
                    self.server_say("example: !ban 3 swearing", uid_i, 0);
                }
            }
        } else if let Some(rest) = msg.strip_prefix("!kick ") {
            if !self.sender_can_moderate(uid) {
                self.server_say("You are not authorized to kick people!", uid_i, 0);
                return;
            }
            match parse_uid_and_message(rest) {
                Some((kick_uid, kick_msg)) => {
                    if let Err(RelayError::UnknownUid(_)) = self.kick(kick_uid, uid, &kick_msg) {
                        self.server_say("kick not successful: uid not found!", uid_i, 0);
                    }
                }
                None => {
                    self.server_say("usage: !kick <uid> <message>", uid_i, 0);
                    self.server_say("example: !kick 3 bye!", uid_i, 0);
                }
            }
        }
        // Anything else starting with '!' stays server-side and unanswered.
    }
}

/// Splits "<uid> <message...>" for the kick and ban commands.
fn parse_uid_and_message(rest: &str) -> Option<(u32, String)> {
    let rest = rest.trim();
    let (uid_str, msg) = rest.split_once(char::is_whitespace)?;
    let uid = uid_str.parse().ok()?;
    let msg = msg.trim();
    if msg.is_empty() {
        return None;
    }
    Some((uid, msg.to_string()))
}
