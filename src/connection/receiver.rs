// src/connection/receiver.rs

//! The incoming half of a client connection: a task that reads framed
//! messages and hands them to the sequencer's dispatcher.
//!
//! The receiver never calls back into the sequencer while any lock is held;
//! fatal read errors are posted as io-failure events and the task exits.

use crate::core::events::{EventSender, SequencerEvent};
use crate::core::protocol::FrameCodec;
use crate::core::sequencer::Sequencer;
use futures::StreamExt;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace};

/// Handle to a running receiver task, owned by the client record.
pub struct ReceiverHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    /// Signals cooperative shutdown and waits for the task to exit. The stop
    /// flag is observed between frames.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

impl std::fmt::Debug for ReceiverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverHandle").finish_non_exhaustive()
    }
}

/// Spawns the read loop for an admitted client.
pub fn spawn_receiver(
    uid: u32,
    read_half: OwnedReadHalf,
    sequencer: Arc<Sequencer>,
    events: EventSender,
) -> ReceiverHandle {
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move {
        let mut framed = FramedRead::new(read_half, FrameCodec);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!(uid, "receiver stopping on request");
                    break;
                }
                result = framed.next() => {
                    match result {
                        Some(Ok(frame)) => {
                            trace!(uid, ty = frame.ty, stream = frame.stream_id, len = frame.payload.len(), "frame received");
                            sequencer.dispatch(uid, frame);
                        }
                        Some(Err(e)) => {
                            let _ = events.send(SequencerEvent::IoFailure {
                                uid,
                                reason: format!("read error: {e}"),
                            });
                            break;
                        }
                        None => {
                            let _ = events.send(SequencerEvent::IoFailure {
                                uid,
                                reason: "connection closed by peer".to_string(),
                            });
                            break;
                        }
                    }
                }
            }
        }
    });
    ReceiverHandle { shutdown_tx, task }
}
