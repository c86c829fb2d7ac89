// src/core/events.rs

//! Events posted to the sequencer from contexts that must not call into it
//! directly. I/O workers report failures here instead of invoking
//! `disconnect` themselves, which keeps the broadcaster free of a cyclic
//! dependency on the sequencer.

use tokio::sync::mpsc;

/// An event drained by the sequencer's event loop.
#[derive(Debug, Clone)]
pub enum SequencerEvent {
    /// A receiver or broadcaster hit a fatal I/O error. The sequencer turns
    /// this into `disconnect(uid, reason, is_error = true)`.
    IoFailure { uid: u32, reason: String },
}

pub type EventSender = mpsc::UnboundedSender<SequencerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SequencerEvent>;

/// Stages of a single victim's teardown, in the order the killer performs
/// them. Emitted to an optional observer channel so the stop-before-close-
/// before-free ordering is verifiable from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStage {
    BeamBufferFreed,
    BroadcasterStopped,
    ReceiverStopped,
    SocketClosed,
    Freed,
}

pub type KillObserver = mpsc::UnboundedSender<(u32, KillStage)>;
