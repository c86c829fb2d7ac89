// src/core/sequencer/dispatch.rs

//! Message dispatch: classifies every inbound frame into a publish mode and
//! fans it out onto the target broadcasters.
//!
//! Queueing onto a broadcaster never blocks, so fan-out may run while the
//! table lock is held; a slow receiver costs that receiver dropped frames,
//! never dispatch throughput.

use super::Sequencer;
use crate::core::client::{AuthMask, ClientStatus, MAX_STREAMS_PER_CLIENT};
use crate::core::protocol::{Frame, MessageType, StreamRegistration};
use bytes::Buf;
use tracing::{debug, info, trace, warn};

/// Byte length of the opaque out-of-band block that precedes the three
/// little-endian position floats in vehicle data.
const VEHICLE_OOB_LEN: usize = 16;

/// The four-valued broadcast policy applied to every inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Not forwarded.
    Drop,
    /// Every flow-enabled peer except the sender.
    Others,
    /// Flow-enabled peers with the ADMIN bit (bot relay).
    Admins,
    /// Every flow-enabled peer, the sender included.
    All,
}

impl PublishMode {
    /// Script hooks override the mode with a raw positive integer.
    pub fn from_script(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Others),
            2 => Some(Self::Admins),
            3 => Some(Self::All),
            _ => None,
        }
    }
}

impl Sequencer {
    /// Entry point for the receiver tasks: classify and forward one frame.
    /// Unknown and out-of-place types are logged and dropped; nothing a
    /// client sends here can fail the dispatcher.
    pub fn dispatch(&self, uid: u32, frame: Frame) {
        match frame.message_type() {
            Some(MessageType::EnableFlow) => self.enable_flow(uid),
            Some(MessageType::Delete) => {
                info!(uid, "user disconnects on request");
                self.disconnect(uid, "disconnected on request", false);
            }
            Some(MessageType::StreamData) => self.relay_stream_data(uid, frame),
            Some(MessageType::StreamRegister) => self.register_stream(uid, frame),
            Some(MessageType::Chat) => self.handle_chat(uid, frame),
            Some(MessageType::PrivChat) => self.handle_private_chat(uid, frame),
            Some(MessageType::VehicleData) => self.relay_vehicle_data(uid, frame),
            Some(other) => {
                debug!(uid, ?other, "ignoring unexpected message type from client");
            }
            None => {
                warn!(uid, ty = frame.ty, "unknown message type, dropping");
            }
        }
    }

    /// Fan-out per the publish mode, with per-stream accounting: the
    /// sender's incoming counter once, every recipient's outgoing counter.
    pub(crate) fn publish(&self, sender_uid: u32, frame: &Frame, mode: PublishMode) {
        if mode == PublishMode::Drop {
            return;
        }
        let len = frame.payload.len() as u64;
        let mut clients = self.clients.lock();
        let Some(sender_pos) = clients.iter().position(|c| c.uid == sender_uid) else {
            return;
        };
        clients[sender_pos].account_incoming(frame.stream_id, len);
        self.stats.record_incoming(len);

        let out = Frame {
            ty: frame.ty,
            source_uid: sender_uid,
            stream_id: frame.stream_id,
            payload: frame.payload.clone(),
        };
        for (i, c) in clients.iter_mut().enumerate() {
            if c.status != ClientStatus::Used || !c.flow {
                continue;
            }
            let wanted = match mode {
                PublishMode::Others => i != sender_pos,
                PublishMode::All => true,
                PublishMode::Admins => i != sender_pos && c.auth.contains(AuthMask::ADMIN),
                PublishMode::Drop => false,
            };
            if !wanted {
                continue;
            }
            c.account_outgoing(out.stream_id, len);
            self.stats.record_outgoing(len);
            c.broadcaster.queue_frame(out.clone());
        }
    }

    /// Stream data is relayed to everyone else. The first data frame from a
    /// client triggers the join-state replay before anything is forwarded.
    fn relay_stream_data(&self, uid: u32, frame: Frame) {
        let needs_replay = {
            let mut clients = self.clients.lock();
            match clients.iter_mut().find(|c| c.uid == uid) {
                Some(c) if !c.initialized => {
                    c.initialized = true;
                    true
                }
                Some(_) => false,
                None => return,
            }
        };
        if needs_replay {
            self.replay_join_state(uid);
        }
        self.publish(uid, &frame, PublishMode::Others);
    }

    /// Replays join state when a client first produces data: every existing
    /// client's info (and registered streams) to the newcomer, and the
    /// newcomer's info to every other client.
    fn replay_join_state(&self, uid: u32) {
        let clients = self.clients.lock();
        let Some(newcomer) = clients.iter().find(|c| c.uid == uid) else {
            return;
        };
        let own_info = super::user_info_payload(newcomer).encode();

        for c in clients.iter() {
            if c.status != ClientStatus::Used {
                continue;
            }
            let info = super::user_info_payload(c).encode();
            newcomer
                .broadcaster
                .queue(MessageType::UserInfo, c.uid, 0, info);
            if c.uid != uid {
                c.broadcaster
                    .queue(MessageType::UserInfo, uid, 0, own_info.clone());
                trace!(
                    "replaying {} stream registration(s) of uid {} to uid {uid}",
                    c.streams.len(),
                    c.uid
                );
                for (stream_id, reg) in &c.streams {
                    newcomer.broadcaster.queue(
                        MessageType::StreamRegister,
                        c.uid,
                        *stream_id,
                        reg.encode(),
                    );
                }
            }
        }
    }

    /// Records a stream registration and relays it. The per-client cap and a
    /// script veto both drop the registration silently.
    fn register_stream(&self, uid: u32, frame: Frame) {
        let reg = match StreamRegistration::decode(frame.payload.clone()) {
            Ok(reg) => reg,
            Err(e) => {
                debug!(uid, "discarding bad stream registration: {e}");
                return;
            }
        };
        info!(
            "new stream registered: {uid}:{}, type: {} name: '{}' status: {}",
            frame.stream_id,
            reg.kind_str(),
            reg.name_str(),
            reg.status
        );

        if let Some(script) = &self.script {
            if script.stream_added(uid, &reg) > 0 {
                debug!(uid, stream = frame.stream_id, "stream registration vetoed by script");
                return;
            }
        }

        {
            let mut clients = self.clients.lock();
            let Some(client) = clients.iter_mut().find(|c| c.uid == uid) else {
                return;
            };
            if client.streams.len() >= MAX_STREAMS_PER_CLIENT {
                debug!(uid, "stream registration dropped, too many streams");
                return;
            }
            if reg.kind == 0 && client.vehicle_name.is_empty() {
                client.vehicle_name = reg.name_str().to_string();
            }
            client.streams.insert(frame.stream_id, reg.clone());
            // A re-registered stream starts its accounting over.
            client.streams_traffic.insert(frame.stream_id, Default::default());
        }
        self.stream_debug();

        // Relay the sanitised record, not the raw client bytes.
        let out = Frame {
            ty: frame.ty,
            source_uid: uid,
            stream_id: frame.stream_id,
            payload: reg.encode(),
        };
        self.publish(uid, &out, PublishMode::Others);
    }

    /// Private chat: unicast a `Chat` frame to the uid carried in the first
    /// four payload bytes. Never broadcast.
    fn handle_private_chat(&self, uid: u32, frame: Frame) {
        if frame.payload.len() < 4 {
            debug!(uid, "private chat without target uid, dropping");
            return;
        }
        let mut payload = frame.payload.clone();
        let target_uid = payload.get_u32_le();
        let clients = self.clients.lock();
        let Some(target) = clients.iter().find(|c| c.uid == target_uid) else {
            debug!(uid, target_uid, "private chat target unknown, dropping");
            return;
        };
        target
            .broadcaster
            .queue(MessageType::Chat, uid, frame.stream_id, payload);
    }

    /// Vehicle data also refreshes the sender's position hint for the
    /// registry roster.
    fn relay_vehicle_data(&self, uid: u32, frame: Frame) {
        if frame.payload.len() >= VEHICLE_OOB_LEN + 12 {
            let mut floats = frame.payload.slice(VEHICLE_OOB_LEN..VEHICLE_OOB_LEN + 12);
            let position = [
                floats.get_f32_le(),
                floats.get_f32_le(),
                floats.get_f32_le(),
            ];
            let mut clients = self.clients.lock();
            if let Some(client) = clients.iter_mut().find(|c| c.uid == uid) {
                client.position = position;
            }
        }
        self.publish(uid, &frame, PublishMode::Others);
    }
}
