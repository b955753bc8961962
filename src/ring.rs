//! Per-source frame ring buffer.
//!
//! Lossless recent-past storage for one source within one tenant. Capacity is
//! fixed at construction to cover the long analysis window at the target
//! frame rate; appending at capacity evicts the oldest frame, so a source
//! producing faster than expected loses its oldest footage, never its newest,
//! and ingest never blocks.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::{now_epoch_s, Frame};

/// Fixed-capacity ring of timestamped JPEG frames.
///
/// Frames within the ring are strictly increasing in `captured_at`; appends
/// that would violate this (clock steps, batched uploads with equal stamps)
/// are clamped forward by a microsecond rather than rejected.
pub struct FrameRing {
    frames: VecDeque<Arc<Frame>>,
    capacity: usize,
    next_seq: u64,
}

impl FrameRing {
    /// `capacity` is `ceil(long_window_s * fps)`; the constructor enforces a
    /// floor of one frame.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    /// Append a frame captured now.
    pub fn append(&mut self, jpeg: Vec<u8>) -> Arc<Frame> {
        self.append_at(jpeg, now_epoch_s())
    }

    /// Append a frame with an explicit capture timestamp. O(1).
    pub fn append_at(&mut self, jpeg: Vec<u8>, captured_at: f64) -> Arc<Frame> {
        let captured_at = match self.frames.back() {
            Some(last) if captured_at <= last.captured_at => last.captured_at + 1e-6,
            _ => captured_at,
        };
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        let frame = Frame::new(self.next_seq, captured_at, jpeg);
        self.next_seq += 1;
        self.frames.push_back(frame.clone());
        frame
    }

    /// Frames in the trailing `duration_s` seconds relative to now, oldest
    /// first.
    pub fn recent(&self, duration_s: f64) -> Vec<Arc<Frame>> {
        self.window_ending_at(duration_s, now_epoch_s())
    }

    /// Same as [`recent`](Self::recent) but the returned frames are an
    /// independent sequence the caller may retain past subsequent appends.
    /// (Frames are shared immutably, so this is the same operation; the
    /// distinct name documents the retention contract.)
    pub fn snapshot(&self, duration_s: f64) -> Vec<Arc<Frame>> {
        self.recent(duration_s)
    }

    /// Trailing window relative to an explicit instant instead of now.
    pub fn window_ending_at(&self, duration_s: f64, at: f64) -> Vec<Arc<Frame>> {
        let cutoff = at - duration_s;
        // Frames are ordered; find the first one inside the window.
        let start = self
            .frames
            .iter()
            .position(|f| f.captured_at >= cutoff)
            .unwrap_or(self.frames.len());
        self.frames.iter().skip(start).cloned().collect()
    }

    /// Newest frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.frames.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wall-clock span currently covered by the ring, in seconds.
    pub fn covered_seconds(&self) -> f64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.captured_at - first.captured_at,
            _ => 0.0,
        }
    }

    /// Total payload bytes held (for status reporting).
    pub fn memory_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.jpeg.len()).sum()
    }
}
