// src/connection/broadcaster.rs

//! The outgoing half of a client connection: a bounded frame queue drained
//! by a writer task.
//!
//! `queue` never blocks the caller. When the queue is full, the oldest frame
//! of the lowest-priority class is discarded and counted; control frames are
//! never dropped. The writer drains in FIFO order and writes whole frames; a
//! short write is fatal to the connection.

use crate::core::events::{EventSender, SequencerEvent};
use crate::core::protocol::{Frame, FrameClass, FrameCodec, MessageType};
use bytes::Bytes;
use futures::SinkExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

/// Default bound of the outgoing frame queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// How long `stop` waits for the writer to drain before aborting it.
const STOP_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct Broadcaster {
    uid: u32,
    queue: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
    stopping: AtomicBool,
    dropped: AtomicU64,
    writer: Mutex<Option<JoinHandle<OwnedWriteHalf>>>,
}

impl Broadcaster {
    pub fn new(uid: u32, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            uid,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            stopping: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            writer: Mutex::new(None),
        })
    }

    /// Spawns the writer task over the write half of the socket. Frames
    /// queued before the writer starts stay buffered and flow once it runs,
    /// which lets admission enqueue the welcome and join frames under the
    /// table lock before the socket halves are handed over.
    pub fn start(self: &Arc<Self>, write_half: OwnedWriteHalf, events: EventSender) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(write_loop(this, write_half, events));
        *self.writer.lock() = Some(handle);
    }

    /// Enqueues one frame without blocking. See the module docs for the
    /// overflow policy.
    pub fn queue_frame(&self, frame: Frame) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        {
            let mut q = self.queue.lock();
            if q.len() >= self.capacity {
                if let Some(idx) = q.iter().position(|f| f.class() == FrameClass::Bulk) {
                    q.remove(idx);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(uid = self.uid, "outgoing queue full, dropped oldest bulk frame");
                } else if frame.class() == FrameClass::Bulk {
                    // Queue is all control traffic; the new bulk frame loses.
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // A control frame is enqueued regardless, transiently
                // exceeding the cap.
            }
            q.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub fn queue(&self, ty: MessageType, source_uid: u32, stream_id: u32, payload: Bytes) {
        self.queue_frame(Frame::new(ty, source_uid, stream_id, payload));
    }

    /// Number of frames discarded due to backpressure so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.lock().len()
    }

    /// Cooperative shutdown: wakes the writer, lets it drain what is already
    /// queued (so a kicked client still sees its teardown notice) and
    /// returns the write half so the caller can close the socket afterwards.
    /// A peer that stopped reading cannot hang the reaper; the drain is
    /// abandoned after [`STOP_DRAIN_TIMEOUT`].
    pub async fn stop(&self) -> Option<OwnedWriteHalf> {
        self.stopping.store(true, Ordering::Release);
        self.notify.notify_one();
        let handle = self.writer.lock().take();
        let Some(mut handle) = handle else {
            return None;
        };
        match tokio::time::timeout(STOP_DRAIN_TIMEOUT, &mut handle).await {
            Ok(Ok(write_half)) => Some(write_half),
            Ok(Err(e)) => {
                debug!(uid = self.uid, "broadcaster writer task failed: {e}");
                None
            }
            Err(_) => {
                debug!(uid = self.uid, "broadcaster drain timed out, aborting writer");
                handle.abort();
                let _ = handle.await;
                None
            }
        }
    }

    fn pop(&self) -> Option<Frame> {
        self.queue.lock().pop_front()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("uid", &self.uid)
            .field("queued", &self.queued_frames())
            .field("dropped", &self.dropped_frames())
            .finish()
    }
}

/// Drains the queue onto the socket until stopped or the write side fails.
async fn write_loop(
    bc: Arc<Broadcaster>,
    write_half: OwnedWriteHalf,
    events: EventSender,
) -> OwnedWriteHalf {
    let mut framed = FramedWrite::new(write_half, FrameCodec);
    loop {
        while let Some(frame) = bc.pop() {
            if let Err(e) = framed.send(frame).await {
                if !bc.is_stopping() {
                    let _ = events.send(SequencerEvent::IoFailure {
                        uid: bc.uid,
                        reason: format!("write error: {e}"),
                    });
                }
                return framed.into_inner();
            }
        }
        if bc.is_stopping() {
            break;
        }
        // notify_one stores a permit, so a frame queued between the empty
        // check and this await wakes us immediately.
        bc.notify.notified().await;
    }
    framed.into_inner()
}
