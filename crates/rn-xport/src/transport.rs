//! Framed packet transports.
//!
//! The control plane only needs three things from a link: send a frame with
//! a deadline, receive a frame with a deadline, and report how many more
//! frames the link will accept right now.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rn_core::{RnError, RnResult};
use tracing::trace;

pub trait Transport: Send + Sync {
    /// Send one frame; returns the number of bytes sent.
    fn send(&self, frame: &[u8], timeout: Duration) -> RnResult<usize>;

    /// Receive one frame, or `None` if nothing arrived before the deadline.
    fn recv(&self, timeout: Duration) -> RnResult<Option<Vec<u8>>>;

    /// Frames that can be sent right now without blocking.
    fn send_buff_space(&self) -> usize;
}

#[derive(Debug, Default)]
struct Queue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    changed: Condvar,
}

/// One end of a bounded in-memory link.
///
/// Frames sent on one end are received on the other, in order.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    name: String,
    capacity: usize,
    tx: Arc<Queue>,
    rx: Arc<Queue>,
}

impl LoopbackTransport {
    /// Two connected ends, each direction holding at most `capacity` frames.
    pub fn pair(name: &str, capacity: usize) -> (Self, Self) {
        let a_to_b = Arc::new(Queue::default());
        let b_to_a = Arc::new(Queue::default());
        let capacity = capacity.max(1);
        (
            Self {
                name: format!("{name}.a"),
                capacity,
                tx: a_to_b.clone(),
                rx: b_to_a.clone(),
            },
            Self {
                name: format!("{name}.b"),
                capacity,
                tx: b_to_a,
                rx: a_to_b,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frames waiting to be received on this end.
    pub fn pending(&self) -> usize {
        self.rx
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, frame: &[u8], timeout: Duration) -> RnResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.tx.frames.lock().unwrap_or_else(PoisonError::into_inner);
        while frames.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(RnError::timeout(
                    format!("{}: send queue full", self.name),
                    timeout,
                ));
            }
            frames = self
                .tx
                .changed
                .wait_timeout(frames, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        frames.push_back(frame.to_vec());
        trace!(xport = %self.name, bytes = frame.len(), "frame sent");
        self.tx.changed.notify_all();
        Ok(frame.len())
    }

    fn recv(&self, timeout: Duration) -> RnResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.rx.frames.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(frame) = frames.pop_front() {
                self.rx.changed.notify_all();
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            frames = self
                .rx
                .changed
                .wait_timeout(frames, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn send_buff_space(&self) -> usize {
        let used = self
            .tx
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        self.capacity.saturating_sub(used)
    }
}
