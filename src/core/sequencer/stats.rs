// src/core/sequencer/stats.rs

//! Server-wide counters, the periodic rate roll-up and the occupancy dump.

use super::Sequencer;
use crate::core::client::{ClientStatus, StreamTraffic};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, trace};

/// Process-wide statistics. Written from the dispatch path, read by the
/// stats logging; everything is atomic or behind its own small lock.
#[derive(Debug, Default)]
pub struct ServerStats {
    conn_count: AtomicU32,
    conn_crash: AtomicU32,
    traffic: Mutex<StreamTraffic>,
}

impl ServerStats {
    /// Bumps the disconnect counters and returns (total, crashed).
    pub fn record_disconnect(&self, crashed: bool) -> (u32, u32) {
        let count = self.conn_count.fetch_add(1, Ordering::Relaxed) + 1;
        let crashes = if crashed {
            self.conn_crash.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.conn_crash.load(Ordering::Relaxed)
        };
        (count, crashes)
    }

    pub fn record_incoming(&self, len: u64) {
        self.traffic.lock().incoming += len;
    }

    pub fn record_outgoing(&self, len: u64) {
        self.traffic.lock().outgoing += len;
    }

    pub fn traffic(&self) -> StreamTraffic {
        *self.traffic.lock()
    }

    fn roll_minute(&self) {
        self.traffic.lock().roll_minute();
    }
}

impl Sequencer {
    /// Logs the occupancy table and traffic totals. Gated by `server.debug`
    /// so a busy production server is not spammed on every join and leave.
    pub fn print_stats(&self) {
        if !self.config.server.debug {
            return;
        }
        info!("Server occupancy:");
        info!("Slot Status   UID IP               Auth Colour, Nickname, Vehicle");
        info!("--------------------------------------------------");
        {
            let clients = self.clients.lock();
            for (slot, c) in clients.iter().enumerate() {
                match c.status {
                    ClientStatus::Free => info!("{slot:>4} Free"),
                    ClientStatus::Busy => info!(
                        "{slot:>4} Busy {:>5} {:<16} {:>4} {}, {}, {}",
                        c.uid, "-", c.auth.letters(true), c.colour, c.nickname, c.vehicle_name
                    ),
                    ClientStatus::Used => info!(
                        "{slot:>4} Used {:>5} {:<16} {:>4} {}, {}, {}",
                        c.uid,
                        c.ip.to_string(),
                        c.auth.letters(true),
                        c.colour,
                        c.nickname,
                        c.vehicle_name
                    ),
                }
            }
        }
        info!("--------------------------------------------------");

        let uptime = self.start_time.elapsed();
        let hours = uptime.as_secs() / 3600;
        let minutes = (uptime.as_secs() % 3600) / 60;
        let traffic = self.stats.traffic();
        info!("- traffic statistics (uptime: {hours} hours, {minutes} minutes):");
        info!(
            "- total: incoming: {:.2}MB, outgoing: {:.2}MB",
            traffic.incoming as f64 / 1024.0 / 1024.0,
            traffic.outgoing as f64 / 1024.0 / 1024.0
        );
        info!(
            "- rate (last minute): incoming: {:.1}kB/s, outgoing: {:.1}kB/s",
            traffic.incoming_rate as f64 / 1024.0,
            traffic.outgoing_rate as f64 / 1024.0
        );
    }

    /// Folds the last minute of cumulative counters into per-second rates,
    /// for every stream of every client and for the global totals.
    pub fn update_minute_stats(&self) {
        {
            let mut clients = self.clients.lock();
            for c in clients.iter_mut() {
                if c.status != ClientStatus::Used {
                    continue;
                }
                for traffic in c.streams_traffic.values_mut() {
                    traffic.roll_minute();
                }
            }
        }
        self.stats.roll_minute();
    }

    /// Verbose dump of every registered stream.
    pub(crate) fn stream_debug(&self) {
        let clients = self.clients.lock();
        for (slot, c) in clients.iter().enumerate() {
            if c.status != ClientStatus::Used {
                continue;
            }
            trace!(" * {} {} (slot {slot}):", c.uid, c.nickname);
            if c.streams.is_empty() {
                trace!("  * no streams registered for user {}", c.uid);
            } else {
                for (stream_id, reg) in &c.streams {
                    trace!(
                        "  * {}:{stream_id}, type:{} status:{} name:'{}'",
                        c.uid,
                        reg.kind_str(),
                        reg.status,
                        reg.name_str()
                    );
                }
            }
        }
    }
}
