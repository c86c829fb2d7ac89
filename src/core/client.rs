// src/core/client.rs

//! Per-session client state: identity, authorization, registered streams and
//! traffic accounting. Entries live in the sequencer's client table and are
//! only ever mutated under its lock.

use crate::connection::{Broadcaster, ReceiverHandle};
use crate::core::protocol::StreamRegistration;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Upper bound on registered streams per client; registrations beyond this
/// are dropped silently.
pub const MAX_STREAMS_PER_CLIENT: usize = 20;

/// Hard cap on the opaque beam blob a client may park on the server.
pub const BEAM_BUFFER_CAP: usize = 512 * 1024;

/// Authorization bitmask. The bit values are an external wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthMask(pub u32);

impl AuthMask {
    pub const NONE: AuthMask = AuthMask(0x00);
    pub const ADMIN: AuthMask = AuthMask(0x01);
    pub const MOD: AuthMask = AuthMask(0x02);
    pub const RANKED: AuthMask = AuthMask(0x04);
    pub const BOT: AuthMask = AuthMask(0x08);
    pub const BANNED: AuthMask = AuthMask(0x10);

    pub fn contains(self, other: AuthMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: AuthMask) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AuthMask) {
        self.0 &= !other.0;
    }

    /// True for moderators and admins, the gate for kick/ban/unban.
    pub fn can_moderate(self) -> bool {
        self.contains(AuthMask::MOD) || self.contains(AuthMask::ADMIN)
    }

    /// The compact letter form used in the roster snapshot ("AMRB"). The
    /// occupancy table and `!list` additionally mark banned users with `X`.
    pub fn letters(self, include_banned: bool) -> String {
        let mut s = String::with_capacity(5);
        if self.contains(AuthMask::ADMIN) {
            s.push('A');
        }
        if self.contains(AuthMask::MOD) {
            s.push('M');
        }
        if self.contains(AuthMask::RANKED) {
            s.push('R');
        }
        if self.contains(AuthMask::BOT) {
            s.push('B');
        }
        if include_banned && self.contains(AuthMask::BANNED) {
            s.push('X');
        }
        s
    }
}

impl fmt::Display for AuthMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.letters(true))
    }
}

/// Occupancy state of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Free,
    Busy,
    Used,
}

/// Cumulative and per-minute traffic counters for one stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTraffic {
    pub incoming: u64,
    pub incoming_last_minute: u64,
    pub incoming_rate: u64,
    pub outgoing: u64,
    pub outgoing_last_minute: u64,
    pub outgoing_rate: u64,
}

impl StreamTraffic {
    /// Folds a minute of cumulative counters into per-second rates.
    pub fn roll_minute(&mut self) {
        self.incoming_rate = (self.incoming - self.incoming_last_minute) / 60;
        self.incoming_last_minute = self.incoming;
        self.outgoing_rate = (self.outgoing - self.outgoing_last_minute) / 60;
        self.outgoing_last_minute = self.outgoing;
    }
}

/// One client session. Owned by the sequencer's table while live, moved onto
/// the killer queue for teardown.
pub struct Client {
    pub uid: u32,
    /// Table index at the moment of join; shifts on compaction and is used
    /// only for presentation.
    pub slot: usize,
    pub nickname: String,
    pub unique_id: String,
    pub colour: u32,
    pub auth: AuthMask,
    pub status: ClientStatus,
    /// True once the post-welcome handshake completed; stream and chat
    /// traffic flows only afterwards.
    pub flow: bool,
    /// True once the first stream data arrived and join state was replayed.
    pub initialized: bool,
    pub streams: HashMap<u32, StreamRegistration>,
    pub streams_traffic: HashMap<u32, StreamTraffic>,
    /// Name of the first registered truck stream, for rosters and `!list`.
    pub vehicle_name: String,
    /// Position hint taken from vehicle data, for the registry heartbeat.
    pub position: [f32; 3],
    pub ip: IpAddr,
    pub beam_buffer: Option<Bytes>,
    pub broadcaster: Arc<Broadcaster>,
    pub receiver: Option<ReceiverHandle>,
}

impl Client {
    pub fn new(
        uid: u32,
        nickname: String,
        unique_id: String,
        colour: u32,
        auth: AuthMask,
        ip: IpAddr,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            uid,
            slot: 0,
            nickname,
            unique_id,
            colour,
            auth,
            status: ClientStatus::Used,
            flow: false,
            initialized: false,
            streams: HashMap::new(),
            streams_traffic: HashMap::new(),
            vehicle_name: String::new(),
            position: [0.0; 3],
            ip,
            beam_buffer: None,
            broadcaster,
            receiver: None,
        }
    }

    /// Adds `len` bytes to a stream's incoming counter. The traffic map is
    /// total over observed stream ids, so missing entries are created.
    pub fn account_incoming(&mut self, stream_id: u32, len: u64) {
        self.streams_traffic.entry(stream_id).or_default().incoming += len;
    }

    /// Adds `len` bytes to a stream's outgoing counter.
    pub fn account_outgoing(&mut self, stream_id: u32, len: u64) {
        self.streams_traffic.entry(stream_id).or_default().outgoing += len;
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("uid", &self.uid)
            .field("nickname", &self.nickname)
            .field("colour", &self.colour)
            .field("auth", &self.auth)
            .field("flow", &self.flow)
            .field("streams", &self.streams.len())
            .finish()
    }
}
