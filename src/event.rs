//! Per-snapshot event queue, the same shape as the kernel module's
//! `event_queue` (a lock-protected FIFO plus a wait primitive) but built on
//! `Mutex`+`Condvar` instead of a wait queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use block_device::DeviceId;

/// One of the four events spec.md §6 names. Every variant carries the
/// monotonic `timestamp` its [`EventQueue`] assigned it at push time, so
/// consumers can order events even across the four kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    LowFreeSpace { timestamp: u64, sectors_free: u64 },
    OutOfSpace { timestamp: u64 },
    Corrupted { timestamp: u64, device_id: DeviceId, error: String },
    Terminate { timestamp: u64 },
}

#[derive(Default)]
pub struct EventQueue {
    state: Mutex<VecDeque<Event>>,
    cv: Condvar,
    next_timestamp: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            next_timestamp: AtomicU64::new(0),
        }
    }

    /// Monotonic tick to stamp the next event with. Callers building an
    /// [`Event`] for this queue call this before [`EventQueue::push`].
    pub fn timestamp(&self) -> u64 {
        self.next_timestamp.fetch_add(1, Ordering::SeqCst)
    }

    pub fn push(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        state.push_back(event);
        self.cv.notify_all();
    }

    /// Pop the oldest pending event, blocking up to `timeout` if the queue
    /// is empty. `None` means the wait timed out with nothing to report.
    pub fn wait(&self, timeout: Duration) -> Option<Event> {
        let state = self.state.lock().unwrap();
        let (mut state, _timed_out) = self
            .cv
            .wait_timeout_while(state, timeout, |q| q.is_empty())
            .unwrap();
        state.pop_front()
    }

    /// Pop the oldest pending event without blocking.
    pub fn try_pop(&self) -> Option<Event> {
        self.state.lock().unwrap().pop_front()
    }
}
