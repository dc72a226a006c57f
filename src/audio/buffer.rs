//! Lock-free sample ring for playback
//!
//! Single-producer single-consumer queue of interleaved samples between the
//! inbound network loop and the output device callback. When full, the
//! oldest unplayed samples are discarded so playback never blocks the
//! network side and never falls behind by more than the ring length.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free ring of interleaved 16-bit samples
pub struct SampleRing {
    queue: ArrayQueue<i16>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl SampleRing {
    /// Create a new ring holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Ring sized for `millis` of audio at the given rate and channel count
    pub fn for_duration(millis: u32, sample_rate: u32, channels: u16) -> Self {
        let capacity = sample_rate as usize * channels as usize * millis as usize / 1000;
        Self::new(capacity)
    }

    /// Append samples, discarding the oldest ones on overflow.
    /// Returns the number of samples discarded.
    pub fn push_slice(&self, samples: &[i16]) -> usize {
        let mut dropped = 0;
        for &sample in samples {
            if self.queue.force_push(sample).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.overflow_count.fetch_add(dropped, Ordering::Relaxed);
        }
        dropped
    }

    /// Fill `out` with queued samples, padding with silence on underrun.
    /// Returns the number of real samples written.
    pub fn pop_into(&self, out: &mut [i16]) -> usize {
        let mut written = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(sample) => {
                    *slot = sample;
                    written += 1;
                }
                None => *slot = 0,
            }
        }
        if written < out.len() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        written
    }

    /// Discard everything queued
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Samples discarded because the ring was full
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Device callbacks that ran out of samples
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a sample ring
pub type SharedSampleRing = Arc<SampleRing>;
