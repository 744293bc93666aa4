//! Outbound Queue
//!
//! Bounded per-connection send buffer. Publishers never wait on it: when it
//! is full the oldest frame is discarded to make room and the connection's
//! drop counter goes up. A single writer task drains it into the socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Result of [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended with room to spare.
    Queued,
    /// Appended after discarding the oldest frame.
    DroppedOldest,
    /// Queue is closed; the frame was discarded.
    Closed,
}

/// Bounded drop-oldest frame queue.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: Mutex<VecDeque<Utf8Bytes>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl OutboundQueue {
    /// Queue holding at most `capacity` frames (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a frame, evicting the oldest one if full.
    pub fn push(&self, frame: Utf8Bytes) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut frames = self.frames.lock();
            let outcome = if frames.len() >= self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            frames.push_back(frame);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next frame. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Utf8Bytes> {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(frame) = self.frames.lock().pop_front() {
                return Some(frame);
            }
            notified.await;
        }
    }

    /// Next frame if one is ready.
    #[must_use]
    pub fn try_pop(&self) -> Option<Utf8Bytes> {
        if self.is_closed() {
            return None;
        }
        self.frames.lock().pop_front()
    }

    /// Count a frame lost in transit as dropped.
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop accepting frames, discard what is buffered and wake the writer.
    /// Returns how many buffered frames were discarded.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let discarded = {
            let mut frames = self.frames.lock();
            let n = frames.len();
            frames.clear();
            n
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        discarded
    }

    /// Whether [`Self::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum buffered frames.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames dropped since the queue was created.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn frame(n: usize) -> Utf8Bytes {
        Utf8Bytes::from(n.to_string())
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = OutboundQueue::new(3);
        for n in 0..3 {
            assert_eq!(queue.push(frame(n)), PushOutcome::Queued);
        }
        assert_eq!(queue.push(frame(3)), PushOutcome::DroppedOldest);
        assert_eq!(queue.push(frame(4)), PushOutcome::DroppedOldest);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        let drained: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|f| f.as_str().to_string())
            .collect();
        assert_eq!(drained, vec!["2", "3", "4"]);
    }

    #[test]
    fn closed_queue_rejects_frames() {
        let queue = OutboundQueue::new(4);
        queue.push(frame(1));
        assert_eq!(queue.close(), 1);
        assert_eq!(queue.push(frame(2)), PushOutcome::Closed);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.push(frame(7));

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().as_str(), "7");
    }

    #[test]
    fn push_wakes_pending_pop() {
        let queue = OutboundQueue::new(4);
        let mut pop = tokio_test::task::spawn(queue.pop());
        tokio_test::assert_pending!(pop.poll());

        queue.push(frame(3));
        assert!(pop.is_woken());
        let got = tokio_test::assert_ready!(pop.poll());
        assert_eq!(got.unwrap().as_str(), "3");
    }

    #[tokio::test]
    async fn close_wakes_waiting_reader() {
        let queue = Arc::new(OutboundQueue::new(4));
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }
}
