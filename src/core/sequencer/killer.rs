// src/core/sequencer/killer.rs

//! The killer: a background reaper that serialises the destruction of
//! everything a client session owns.
//!
//! Teardown order per victim is strict: beam buffer, broadcaster, receiver,
//! socket, record. A broadcaster still running against a closed socket
//! would fault, so the socket is only shut down once both workers stopped.

use super::Sequencer;
use crate::core::client::Client;
use crate::core::events::{KillObserver, KillStage};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

pub struct Killer {
    sequencer: Arc<Sequencer>,
    kill_rx: mpsc::UnboundedReceiver<Client>,
}

impl Killer {
    pub fn new(sequencer: Arc<Sequencer>, kill_rx: mpsc::UnboundedReceiver<Client>) -> Self {
        Self { sequencer, kill_rx }
    }

    /// Drains the kill queue until shutdown. A panic inside one victim's
    /// cleanup is contained and logged, never propagated.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("killer task ready");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                victim = self.kill_rx.recv() => {
                    let Some(victim) = victim else { break };
                    let observer = self.sequencer.kill_observer.lock().clone();
                    let nickname = victim.nickname.clone();
                    debug!("killer called to kill {nickname}");
                    let handle = tokio::spawn(reap(victim, observer));
                    if let Err(e) = handle.await {
                        if e.is_panic() {
                            error!("cleanup of client '{nickname}' panicked: {e:?}");
                        }
                    }
                }
            }
        }
        debug!("killer task exiting");
    }
}

fn observe(observer: &Option<KillObserver>, uid: u32, stage: KillStage) {
    if let Some(tx) = observer {
        let _ = tx.send((uid, stage));
    }
}

/// Tears one victim down in the required order.
async fn reap(mut victim: Client, observer: Option<KillObserver>) {
    let uid = victim.uid;

    if victim.beam_buffer.take().is_some() {
        debug!(uid, "freed beam buffer");
    }
    observe(&observer, uid, KillStage::BeamBufferFreed);

    // Stopping the broadcaster hands back the write half so the socket
    // shutdown below cannot race a concurrent write.
    let write_half = victim.broadcaster.stop().await;
    observe(&observer, uid, KillStage::BroadcasterStopped);

    if let Some(receiver) = victim.receiver.take() {
        receiver.stop().await;
    }
    observe(&observer, uid, KillStage::ReceiverStopped);

    if let Some(mut write_half) = write_half {
        let _ = write_half.shutdown().await;
    }
    observe(&observer, uid, KillStage::SocketClosed);

    drop(victim);
    observe(&observer, uid, KillStage::Freed);
}
