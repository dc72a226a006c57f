//! Outbound audio queue
//!
//! Bounded queue between the capture path and the audio drain loop. Pushing
//! never blocks: when the queue is full the oldest unsent frame is dropped.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Result of [`AudioSendQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest frame
    DroppedOldest,
    Closed,
}

pub struct AudioSendQueue {
    queue: ArrayQueue<Bytes>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl AudioSendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame without waiting
    pub fn push(&self, frame: Bytes) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = if self.queue.force_push(frame).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            PushOutcome::DroppedOldest
        } else {
            PushOutcome::Queued
        };
        self.notify.notify_one();
        outcome
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.queue.pop()
    }

    /// Wait for the next frame. Returns `None` once closed.
    pub async fn next(&self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.queue.pop() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting frames, discard what is queued and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.queue.pop().is_some() {}
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Frames discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
