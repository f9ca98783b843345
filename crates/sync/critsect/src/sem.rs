//! Event semaphore used by critical sections to park and hand over.

use std::sync::PoisonError;
#[cfg(not(loom))]
use std::time::Duration;

use crate::loom_compat::{Condvar, Mutex};

/// An auto-reset event whose signals are counted.
///
/// Each [`signal`](Self::signal) releases exactly one [`wait`](Self::wait),
/// whether the waiter arrives before or after the signal.
pub struct EventSem {
    pending: Mutex<u32>,
    cond: Condvar,
}

impl EventSem {
    /// Creates an event with no pending signal.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Releases one current or future waiter.
    pub fn signal(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_add(1);
        drop(pending);
        self.cond.notify_one();
    }

    /// Blocks until a signal is available and consumes it.
    pub fn wait(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while *pending == 0 {
            pending = self.cond.wait(pending).unwrap_or_else(PoisonError::into_inner);
        }
        *pending -= 1;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns
    /// `true` if a signal was consumed.
    #[cfg(not(loom))]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(pending, timeout, |n| *n == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *pending == 0 {
            return false;
        }
        *pending -= 1;
        true
    }

    /// Consumes a pending signal without blocking.
    pub fn try_wait(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if *pending == 0 {
            return false;
        }
        *pending -= 1;
        true
    }

    /// Number of signals not yet consumed.
    pub fn pending(&self) -> u32 {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventSem {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventSem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSem").field("pending", &self.pending()).finish()
    }
}
