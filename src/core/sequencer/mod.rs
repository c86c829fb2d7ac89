// src/core/sequencer/mod.rs

//! The session sequencer: the central coordinator owning the client table,
//! the admission and disconnection protocol, dispatch and broadcast policy,
//! moderation, and the killer queue feeding the reaper.
//!
//! Exactly one `Sequencer` exists per process, constructed by `main` and
//! shared by reference with the listener, the killer and the collaborators.

mod chat;
mod dispatch;
mod killer;
mod stats;

pub use chat::ChatLogEntry;
pub use dispatch::PublishMode;
pub use killer::Killer;
pub use stats::ServerStats;

use crate::config::Config;
use crate::connection::{Broadcaster, DEFAULT_QUEUE_CAPACITY, spawn_receiver};
use crate::core::RelayError;
use crate::core::auth::{AuthResolver, UserEventKind};
use crate::core::client::{AuthMask, Client, ClientStatus};
use crate::core::events::{EventReceiver, EventSender, KillObserver, SequencerEvent};
use crate::core::protocol::{Credentials, Frame, MessageType, SERVER_UID, UserInfoPayload};
use crate::core::scripting::ScriptHost;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Server version string reported by `!version`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the chat history ring.
const CHAT_HISTORY_CAP: usize = 500;

/// Write budget for a rejection frame, so a backed-up connector cannot
/// stall admission.
const REJECTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// One entry on the ban list. The list is value-owned and keyed by ip at
/// admission time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BanRecord {
    pub uid: u32,
    pub ip: IpAddr,
    pub nickname: String,
    pub banned_by: String,
    pub message: String,
}

/// Everything `Sequencer::new` produces: the shared sequencer plus the
/// receiving ends of its channels, consumed when the background tasks are
/// spawned.
pub struct SequencerInit {
    pub sequencer: Arc<Sequencer>,
    pub kill_rx: mpsc::UnboundedReceiver<Client>,
    pub event_rx: EventReceiver,
}

pub struct Sequencer {
    pub(crate) config: Config,
    /// The client table. The single lock protects lookup, insert, erase and
    /// the iteration done for broadcasts; it is never held across an await.
    pub(crate) clients: Mutex<Vec<Client>>,
    pub(crate) bans: Mutex<Vec<BanRecord>>,
    pub(crate) chat_history: Mutex<VecDeque<ChatLogEntry>>,
    motd: Vec<String>,
    /// Next uid to hand out. Monotonic for the process lifetime.
    fuid: AtomicU32,
    kill_tx: mpsc::UnboundedSender<Client>,
    events_tx: EventSender,
    pub(crate) kill_observer: Mutex<Option<KillObserver>>,
    pub(crate) auth: Option<Arc<dyn AuthResolver>>,
    pub(crate) script: Option<Arc<dyn ScriptHost>>,
    pub(crate) stats: ServerStats,
    pub(crate) start_time: Instant,
}

impl Sequencer {
    pub fn new(
        config: Config,
        motd: Vec<String>,
        auth: Option<Arc<dyn AuthResolver>>,
        script: Option<Arc<dyn ScriptHost>>,
    ) -> SequencerInit {
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (events_tx, event_rx) = mpsc::unbounded_channel();
        let bans = load_bans(&config);
        let sequencer = Arc::new(Self {
            clients: Mutex::new(Vec::with_capacity(config.game.max_players)),
            bans: Mutex::new(bans),
            chat_history: Mutex::new(VecDeque::with_capacity(CHAT_HISTORY_CAP)),
            motd,
            fuid: AtomicU32::new(1),
            kill_tx,
            events_tx,
            kill_observer: Mutex::new(None),
            auth,
            script,
            stats: ServerStats::default(),
            start_time: Instant::now(),
            config,
        });
        SequencerInit {
            sequencer,
            kill_rx,
            event_rx,
        }
    }

    /// Sender half of the io-failure event channel, cloned into every
    /// receiver and broadcaster.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// The script collaborator, for the frame-step timer task.
    pub fn script_host(&self) -> Option<Arc<dyn ScriptHost>> {
        self.script.clone()
    }

    /// The configured server password, if any.
    pub fn server_password(&self) -> Option<String> {
        self.config.server.password.clone()
    }

    /// Installs an observer that sees every kill stage in order. Used by the
    /// teardown-ordering tests.
    pub fn set_kill_observer(&self, observer: KillObserver) {
        *self.kill_observer.lock() = Some(observer);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Admits a handshake-complete connection: assigns uid, slot and colour,
    /// attaches the receive/broadcast pipelines, sends `Welcome` and
    /// broadcasts `UserJoin`.
    ///
    /// A full server or a banned address gets a single rejection frame (with
    /// a short write timeout so backed-up connectors cannot pile up) and the
    /// socket is closed without any table side effects.
    pub async fn admit(
        self: &Arc<Self>,
        mut socket: TcpStream,
        credentials: Credentials,
    ) -> Result<u32, RelayError> {
        let peer = socket.peer_addr()?;
        let mut username = credentials.username;

        // Resolve the token before taking the table lock.
        let mut auth = AuthMask::NONE;
        if let Some(resolver) = &self.auth {
            let (mask, registered_nick) = resolver.resolve(&credentials.unique_id);
            auth = mask;
            if let Some(nick) = registered_nick {
                username = nick;
            }
            if mask != AuthMask::NONE {
                info!("user auth flags: {}", mask.letters(true));
            }
        }

        let (uid, broadcaster) = match self.try_admit(peer.ip(), &username, &credentials.unique_id, auth)
        {
            Ok(admitted) => admitted,
            Err(e) => {
                let reject_ty = match &e {
                    RelayError::ServerFull => {
                        warn!("join request from '{username}' on full server: rejecting");
                        MessageType::Full
                    }
                    RelayError::Banned => {
                        warn!("banned peer {} rejected", peer.ip());
                        MessageType::Banned
                    }
                    _ => return Err(e),
                };
                let frame = Frame::new(reject_ty, SERVER_UID, 0, Bytes::new());
                let _ = tokio::time::timeout(
                    REJECTION_TIMEOUT,
                    crate::core::protocol::write_frame(&mut socket, &frame),
                )
                .await;
                return Err(e);
            }
        };

        // Attach the pipelines outside the lock.
        let (read_half, write_half) = socket.into_split();
        broadcaster.start(write_half, self.events_tx.clone());
        let receiver = spawn_receiver(uid, read_half, Arc::clone(self), self.events_tx.clone());
        let leftover_receiver = {
            let mut clients = self.clients.lock();
            match clients.iter_mut().find(|c| c.uid == uid) {
                Some(c) => {
                    c.receiver = Some(receiver);
                    None
                }
                None => Some(receiver),
            }
        };
        if let Some(receiver) = leftover_receiver {
            // The client raced a disconnect and is already on the killer
            // queue; the fresh receiver is ours to stop.
            receiver.stop().await;
            return Ok(uid);
        }

        info!(uid, "new client added");
        if let Some(script) = &self.script {
            script.player_added(uid);
        }
        if auth.contains(AuthMask::RANKED) {
            self.emit_user_event(uid, UserEventKind::Join);
        }
        Ok(uid)
    }

    /// Check-and-reserve in one critical section: the full and ban checks,
    /// nickname resolution, uid/slot/colour assignment, the table insert and
    /// the welcome/join enqueues all happen under the same table lock, so
    /// every peer observes a consistent uid-set transition and two racing
    /// admissions cannot both claim the last slot.
    fn try_admit(
        &self,
        ip: IpAddr,
        username: &str,
        unique_id: &str,
        auth: AuthMask,
    ) -> Result<(u32, Arc<Broadcaster>), RelayError> {
        let mut clients = self.clients.lock();
        if clients.len() >= self.config.game.max_players {
            return Err(RelayError::ServerFull);
        }
        if self.is_banned(ip) {
            return Err(RelayError::Banned);
        }

        let nickname = unique_nickname(&clients, username);
        if nickname != username {
            warn!("duplicate nick '{username}', chose '{nickname}'");
        }
        let colour = free_colour(&clients);
        let uid = self.fuid.fetch_add(1, Ordering::Relaxed);
        let broadcaster = Broadcaster::new(uid, DEFAULT_QUEUE_CAPACITY);

        let mut client = Client::new(
            uid,
            nickname,
            unique_id.to_string(),
            colour,
            auth,
            ip,
            Arc::clone(&broadcaster),
        );
        client.slot = clients.len();
        debug!(uid, slot = client.slot, colour, "sending welcome");

        // Welcome is queued first so it is the first frame the new client
        // observes, ahead of its own join broadcast.
        broadcaster.queue(
            MessageType::Welcome,
            SERVER_UID,
            0,
            Bytes::copy_from_slice(&colour.to_le_bytes()),
        );
        let info_payload = user_info_payload(&client).encode();
        clients.push(client);
        for c in clients.iter() {
            c.broadcaster
                .queue(MessageType::UserJoin, uid, 0, info_payload.clone());
        }
        Ok((uid, broadcaster))
    }

    /// Marks the client ready for stream traffic and greets it with the
    /// message of the day.
    pub fn enable_flow(&self, uid: u32) {
        {
            let mut clients = self.clients.lock();
            let Some(client) = clients.iter_mut().find(|c| c.uid == uid) else {
                return;
            };
            client.flow = true;
        }
        self.print_stats();
        for line in &self.motd {
            self.server_say(line, uid as i64, 1);
        }
    }

    /// Removes the client from the table, tells every peer (`Delete` when
    /// errored, `UserLeave` otherwise, the victim included so a kicked
    /// client learns why) and hands the record to the killer.
    ///
    /// Safe to call from any task context, and tolerant of uids that were
    /// already reaped.
    pub fn disconnect(&self, uid: u32, reason: &str, is_error: bool) -> bool {
        let victim = {
            let mut clients = self.clients.lock();
            let Some(pos) = clients.iter().position(|c| c.uid == uid) else {
                debug!(uid, "disconnect for unknown uid ignored");
                return false;
            };
            let ty = if is_error {
                MessageType::Delete
            } else {
                MessageType::UserLeave
            };
            let payload = Bytes::copy_from_slice(reason.as_bytes());
            for c in clients.iter() {
                c.broadcaster.queue(ty, uid, 0, payload.clone());
            }
            clients.remove(pos)
        };

        info!(uid, nickname = %victim.nickname, is_error, "disconnecting: {reason}");
        let (count, crashes) = self.stats.record_disconnect(is_error);
        info!("crash statistic: {crashes} of {count} deletes crashed");

        if victim.auth.contains(AuthMask::RANKED) {
            if let Some(auth) = &self.auth {
                auth.emit_event(
                    &victim.unique_id,
                    if is_error {
                        UserEventKind::Crash
                    } else {
                        UserEventKind::Leave
                    },
                    &victim.nickname,
                    &victim.vehicle_name,
                );
            }
        }
        if let Some(script) = &self.script {
            script.player_deleted(uid, is_error);
        }

        // Only the killer frees; a closed channel means shutdown is already
        // tearing everything down.
        if self.kill_tx.send(victim).is_err() {
            debug!(uid, "killer queue closed, dropping victim inline");
        }
        self.print_stats();
        true
    }

    /// Kicks `uid` on behalf of `mod_uid`. The moderator must hold MOD or
    /// ADMIN.
    pub fn kick(&self, uid: u32, mod_uid: u32, msg: &str) -> Result<(), RelayError> {
        let (victim_nick, mod_nick) = {
            let clients = self.clients.lock();
            let moderator = clients
                .iter()
                .find(|c| c.uid == mod_uid)
                .ok_or(RelayError::UnknownUid(mod_uid))?;
            if !moderator.auth.can_moderate() {
                return Err(RelayError::NotAuthorized);
            }
            let victim = clients
                .iter()
                .find(|c| c.uid == uid)
                .ok_or(RelayError::UnknownUid(uid))?;
            (victim.nickname.clone(), moderator.nickname.clone())
        };
        info!("player '{victim_nick}' kicked by '{mod_nick}'");
        let kickmsg = if msg.is_empty() {
            format!("kicked by {mod_nick}")
        } else {
            format!("kicked by {mod_nick}: {msg}")
        };
        self.disconnect(uid, &kickmsg, false);
        Ok(())
    }

    /// Bans `uid`'s address, then tears the session down with an errored
    /// `Delete` so the victim sees the ban message.
    pub fn ban(&self, uid: u32, mod_uid: u32, msg: &str) -> Result<(), RelayError> {
        let (record, mod_nick) = {
            let clients = self.clients.lock();
            let moderator = clients
                .iter()
                .find(|c| c.uid == mod_uid)
                .ok_or(RelayError::UnknownUid(mod_uid))?;
            if !moderator.auth.can_moderate() {
                return Err(RelayError::NotAuthorized);
            }
            let victim = clients
                .iter()
                .find(|c| c.uid == uid)
                .ok_or(RelayError::UnknownUid(uid))?;
            (
                BanRecord {
                    uid,
                    ip: victim.ip,
                    nickname: victim.nickname.clone(),
                    banned_by: moderator.nickname.clone(),
                    message: msg.to_string(),
                },
                moderator.nickname.clone(),
            )
        };
        info!("new ban added: '{}' by '{mod_nick}'", record.nickname);
        self.bans.lock().push(record);
        self.persist_bans();

        let reason = format!("kicked by {mod_nick}: banned: {msg}");
        self.disconnect(uid, &reason, true);
        Ok(())
    }

    /// Removes the ban record recorded for `uid`. Returns whether a record
    /// was removed; an absent uid leaves the list untouched.
    pub fn unban(&self, uid: u32) -> bool {
        let removed = {
            let mut bans = self.bans.lock();
            let before = bans.len();
            bans.retain(|b| b.uid != uid);
            bans.len() != before
        };
        if removed {
            info!(uid, "uid unbanned");
            self.persist_bans();
        }
        removed
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.bans.lock().iter().any(|b| b.ip == ip)
    }

    pub fn ban_list(&self) -> Vec<BanRecord> {
        self.bans.lock().clone()
    }

    /// Sends a chat line from the server. `uid == -1` addresses every
    /// flow-enabled client; type 0 marks a plain server message and gets the
    /// "SERVER: " prefix.
    pub fn server_say(&self, msg: &str, uid: i64, say_type: i32) {
        let msg = if say_type == 0 {
            format!("SERVER: {msg}")
        } else {
            msg.to_string()
        };
        let payload = Bytes::from(msg.into_bytes());
        let clients = self.clients.lock();
        for c in clients.iter() {
            if c.status == ClientStatus::Used
                && c.flow
                && (uid == -1 || c.uid as i64 == uid)
            {
                c.broadcaster
                    .queue(MessageType::Chat, SERVER_UID, 0, payload.clone());
            }
        }
    }

    /// Sends a game command frame (source uid -1) to one client.
    pub fn send_game_command(&self, uid: u32, cmd: &str) -> Result<(), RelayError> {
        let clients = self.clients.lock();
        let client = clients
            .iter()
            .find(|c| c.uid == uid)
            .ok_or(RelayError::UnknownUid(uid))?;
        client.broadcaster.queue(
            MessageType::GameCmd,
            SERVER_UID,
            0,
            Bytes::copy_from_slice(cmd.as_bytes()),
        );
        Ok(())
    }

    /// Serialises the roster for the external registry. Line format:
    /// challenge, "version4", client count, then one
    /// `index;vehicle;nickname;x,y,z;ip;unique_id;auth_chars` line per
    /// client.
    pub fn heartbeat_snapshot(&self, challenge: &str) -> String {
        let clients = self.clients.lock();
        let mut out = format!("{challenge}\nversion4\n{}\n", clients.len());
        for (i, c) in clients.iter().enumerate() {
            let position = format!(
                "{:.2},{:.2},{:.2}",
                c.position[0], c.position[1], c.position[2]
            );
            out.push_str(&format!(
                "{i};{};{};{position};{};{};{}\n",
                c.vehicle_name,
                c.nickname,
                c.ip,
                c.unique_id,
                c.auth.letters(false)
            ));
        }
        out
    }

    /// Snapshot of the chat ring, oldest first.
    pub fn chat_history(&self) -> Vec<ChatLogEntry> {
        self.chat_history.lock().iter().cloned().collect()
    }

    /// Queues a shutdown notice to every connected client. Used by the
    /// accept loop when the process is going down.
    pub fn broadcast_shutdown(&self, msg: &str) {
        let payload = Bytes::copy_from_slice(msg.as_bytes());
        let clients = self.clients.lock();
        for c in clients.iter() {
            c.broadcaster
                .queue(MessageType::Delete, c.uid, 0, payload.clone());
        }
    }

    pub(crate) fn emit_user_event(&self, uid: u32, kind: UserEventKind) {
        let Some(auth) = &self.auth else { return };
        let data = {
            let clients = self.clients.lock();
            clients
                .iter()
                .find(|c| c.uid == uid)
                .map(|c| (c.unique_id.clone(), c.nickname.clone(), c.vehicle_name.clone()))
        };
        if let Some((unique_id, nick, vehicle)) = data {
            auth.emit_event(&unique_id, kind, &nick, &vehicle);
        }
    }

    fn persist_bans(&self) {
        let Some(path) = &self.config.server.ban_file else {
            return;
        };
        let bans = self.bans.lock().clone();
        match serde_json::to_vec_pretty(&bans) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("could not write ban file {path}: {e}");
                }
            }
            Err(e) => warn!("could not serialise ban list: {e}"),
        }
    }
}

/// The event loop that turns worker io-failures into disconnects.
pub async fn run_event_loop(
    sequencer: Arc<Sequencer>,
    mut event_rx: EventReceiver,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => match event {
                Some(SequencerEvent::IoFailure { uid, reason }) => {
                    sequencer.disconnect(uid, &reason, true);
                }
                None => break,
            }
        }
    }
}

fn load_bans(config: &Config) -> Vec<BanRecord> {
    let Some(path) = &config.server.ban_file else {
        return Vec::new();
    };
    match std::fs::read(path) {
        Ok(contents) => match serde_json::from_slice::<Vec<BanRecord>>(&contents) {
            Ok(bans) => {
                info!("loaded {} ban(s) from {path}", bans.len());
                bans
            }
            Err(e) => {
                warn!("ban file {path} is unreadable, starting empty: {e}");
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!("could not read ban file {path}: {e}");
            Vec::new()
        }
    }
}

/// The join-state payload for one table entry.
pub(crate) fn user_info_payload(client: &Client) -> UserInfoPayload {
    UserInfoPayload {
        version: 1,
        slot: client.slot as u32,
        colour: client.colour,
        auth: client.auth.0,
        nickname: client.nickname.clone(),
    }
}

/// Truncates to a byte budget without splitting a UTF-8 character.
fn truncate_to(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Resolves a wire-legal, table-unique nickname. Conflicts get a decimal
/// counter appended, shrinking the base so the result still fits the 20-byte
/// wire field; the N-th conflicting join ends up suffixed with N.
fn unique_nickname(clients: &[Client], wanted: &str) -> String {
    const MAX: usize = crate::core::protocol::NICKNAME_LEN;
    let taken = |nick: &str| {
        clients
            .iter()
            .any(|c| c.status == ClientStatus::Used && c.nickname == nick)
    };
    let base = truncate_to(wanted, MAX);
    if !taken(base) {
        return base.to_string();
    }
    let mut counter: u64 = 2;
    loop {
        let suffix = counter.to_string();
        let candidate = format!("{}{suffix}", truncate_to(base, MAX - suffix.len()));
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// The smallest non-negative integer not currently used as a colour.
fn free_colour(clients: &[Client]) -> u32 {
    let used: HashSet<u32> = clients
        .iter()
        .filter(|c| c.status == ClientStatus::Used)
        .map(|c| c.colour)
        .collect();
    (0..).find(|c| !used.contains(c)).unwrap_or(0)
}
