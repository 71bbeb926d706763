//! Bounded, lossy frame queue between receiver and processor.
//!
//! The receiver never blocks on a full queue: depending on the
//! [`DropPolicy`] either the oldest queued frame or the incoming one is
//! discarded and counted. Dropping the [`FrameProducer`] disconnects the
//! queue, which the processor reads as end of stream once it is drained.
//!
//! The producer keeps its own handle on the consumer side for eviction, so
//! a push never observes a vanished processor. The receiver therefore ends
//! only through its stop flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::config::DropPolicy;

use super::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame.
    DroppedOldest,
    /// The incoming frame was discarded.
    DroppedNewest,
}

pub struct FrameProducer {
    tx: Sender<Frame>,
    // Held only to evict under `DropOldest`.
    evict: Receiver<Frame>,
    policy: DropPolicy,
    drops: Arc<AtomicU64>,
}

/// Create a queue holding at most `capacity` frames. Drops are added to
/// `drops`, which outlives the queue across pipeline restarts.
pub fn frame_queue(
    capacity: usize,
    policy: DropPolicy,
    drops: Arc<AtomicU64>,
) -> (FrameProducer, Receiver<Frame>) {
    let (tx, rx) = bounded(capacity.max(1));
    let producer = FrameProducer {
        tx,
        evict: rx.clone(),
        policy,
        drops,
    };
    (producer, rx)
}

impl FrameProducer {
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let frame = match self.tx.try_send(frame) {
            Ok(()) => return PushOutcome::Queued,
            // `evict` keeps the channel connected.
            Err(TrySendError::Full(frame) | TrySendError::Disconnected(frame)) => frame,
        };

        self.drops.fetch_add(1, Ordering::Relaxed);
        match self.policy {
            DropPolicy::DropNewest => PushOutcome::DroppedNewest,
            DropPolicy::DropOldest => {
                let _ = self.evict.try_recv();
                match self.tx.try_send(frame) {
                    Ok(()) => PushOutcome::DroppedOldest,
                    // Lost the race for the freed slot.
                    Err(_) => PushOutcome::DroppedNewest,
                }
            }
        }
    }

    /// Frames discarded so far.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}
