use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::Notify;

use crate::LandmarkFrame;

/// Default number of undelivered frames kept per stream.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<LandmarkFrame>,
    closed: bool,
    dropped: u64,
}

/// Bounded single-consumer frame buffer that prefers fresh frames: pushing
/// into a full queue evicts the oldest undelivered frame.
#[derive(Debug)]
pub struct FrameQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl FrameQueue {
    /// Creates an empty queue holding at most `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        }
    }

    /// Maximum number of undelivered frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueues `frame`. Returns `true` when an older frame was evicted to
    /// make room. Frames pushed after [`close`](Self::close) are discarded.
    pub fn push(&self, frame: LandmarkFrame) -> bool {
        let evicted = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let evicted = if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.dropped += 1;
                true
            } else {
                false
            };
            state.frames.push_back(frame);
            evicted
        };
        self.ready.notify_one();
        evicted
    }

    /// Waits for the next frame. Returns `None` once the queue is closed and
    /// drained. Cancel safe: a frame is only removed when it is returned.
    pub async fn pop(&self) -> Option<LandmarkFrame> {
        loop {
            {
                let mut state = self.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Stops accepting frames; already queued frames can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    /// Frames waiting to be popped.
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    /// Returns `true` when no frame is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    // The critical sections never panic, so a poisoned lock still holds
    // consistent data.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
