// src/connection/mod.rs

//! The two per-client I/O pipelines: a receiver that reads framed messages
//! into the sequencer and a broadcaster that drains queued frames back onto
//! the socket.

mod broadcaster;
mod receiver;

pub use broadcaster::{Broadcaster, DEFAULT_QUEUE_CAPACITY};
pub use receiver::{ReceiverHandle, spawn_receiver};
