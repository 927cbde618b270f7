//! Bounded concurrent FIFO shared between pipeline stages.
//!
//! Every stage thread blocks only on `pop_wait_for` of its input queue.
//! `stop()` wakes all waiters so threads can observe shutdown.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a pop returned without an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Deadline elapsed with the queue empty.
    Timeout,
    /// `stop()` was called and the queue is drained.
    Stopped,
}

struct Inner<T> {
    queue: VecDeque<T>,
    stopped: bool,
}

/// Multi-producer multi-consumer FIFO with an optional capacity bound.
pub struct ConcurrentFifo<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl<T> ConcurrentFifo<T> {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Blocking push. Waits while the queue is at capacity.
    /// Returns false if the queue was stopped (element is dropped).
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while !inner.stopped {
            match self.capacity {
                Some(cap) if inner.queue.len() >= cap => {
                    inner = self.not_full.wait(inner).unwrap();
                }
                _ => {
                    inner.queue.push_back(item);
                    drop(inner);
                    self.not_empty.notify_one();
                    return true;
                }
            }
        }
        false
    }

    /// Non-blocking push. Returns the item back if the queue is full or stopped.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return Err(item);
        }
        if let Some(cap) = self.capacity {
            if inner.queue.len() >= cap {
                return Err(item);
            }
        }
        inner.queue.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocking pop. Returns None once stopped and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.stopped {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Pop with a deadline. Elements still queued after `stop()` are drained
    /// before `Stopped` is reported.
    pub fn pop_wait_for(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(item);
            }
            if inner.stopped {
                return Err(PopError::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PopError::Timeout);
            }
            let (guard, wait) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if wait.timed_out() && inner.queue.is_empty() {
                if inner.stopped {
                    return Err(PopError::Stopped);
                }
                return Err(PopError::Timeout);
            }
        }
    }

    /// Wake all waiters. Queued elements remain poppable; pushes fail.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all queued elements.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        drop(inner);
        self.not_full.notify_all();
    }
}

impl<T> Default for ConcurrentFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}
