//! Per-section contention statistics.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Nanoseconds since the first call in this process.
fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    u64::try_from(EPOCH.get_or_init(Instant::now).elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Lock statistics of a critical section.
///
/// All fields are updated with relaxed atomics; values are approximate under
/// concurrent updates.
#[derive(Default)]
pub(crate) struct CritSectStats {
    /// Successful outermost acquisitions.
    acquisitions: AtomicU64,
    /// Enters that found the section owned and had to wait.
    contention_lock: AtomicU64,
    /// Leaves that handed the section over to a waiter.
    contention_unlock: AtomicU64,
    max_hold_ns: AtomicU64,
    total_hold_ns: AtomicU64,
    /// Timestamp of the current outermost acquisition.
    acquired_at: AtomicU64,
}

impl CritSectStats {
    pub(crate) fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.acquired_at.store(now_ns(), Ordering::Relaxed);
    }

    pub(crate) fn record_lock_contention(&self) {
        self.contention_lock.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unlock_contention(&self) {
        self.contention_unlock.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self) {
        let held = now_ns().saturating_sub(self.acquired_at.load(Ordering::Relaxed));
        self.total_hold_ns.fetch_add(held, Ordering::Relaxed);
        // Relaxed max update: may race, but close enough for stats.
        let mut cur = self.max_hold_ns.load(Ordering::Relaxed);
        while held > cur {
            match self
                .max_hold_ns
                .compare_exchange_weak(cur, held, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contention_lock: self.contention_lock.load(Ordering::Relaxed),
            contention_unlock: self.contention_unlock.load(Ordering::Relaxed),
            max_hold_ns: self.max_hold_ns.load(Ordering::Relaxed),
            total_hold_ns: self.total_hold_ns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a section's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful outermost acquisitions.
    pub acquisitions: u64,
    /// Enters that had to wait.
    pub contention_lock: u64,
    /// Leaves that handed over to a waiter.
    pub contention_unlock: u64,
    /// Longest hold in nanoseconds.
    pub max_hold_ns: u64,
    /// Cumulative hold time in nanoseconds.
    pub total_hold_ns: u64,
}
