//! Instrumentation hooks (component G).
//!
//! Small integer counters keyed by a well-known ID, incremented at the
//! error points named in spec §4.G / §7. No policy lives here: the core
//! only counts; exporting to a monitoring backend is the embedder's job.

use std::sync::atomic::{AtomicU64, Ordering};

/// A well-known counter ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// `ctrl_add`/`ctrl_del`/event dispatch found no fd-reference record.
    FdLookupMiss = 0,
    /// `epoll_ctl` failed with an errno not on the benign allow-list.
    EpollCtlError = 1,
    /// An `Fd-waiter` tried to attach to an already-claimed notify slot.
    Conflict = 2,
    /// A parked coroutine woke with reason `TIMEOUT`.
    Timeout = 3,
    /// A parked coroutine woke with reason `HANG_UP`.
    HangUp = 4,
}

const COUNTER_COUNT: usize = 5;
const ALL_COUNTERS: [Counter; COUNTER_COUNT] = [
    Counter::FdLookupMiss,
    Counter::EpollCtlError,
    Counter::Conflict,
    Counter::Timeout,
    Counter::HangUp,
];

/// Process-wide counter bank.
pub struct Metrics {
    counters: [AtomicU64; COUNTER_COUNT],
}

impl Metrics {
    const fn new() -> Self {
        Metrics {
            counters: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    /// Bump a counter by one.
    pub fn incr(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// A point-in-time snapshot of every counter, for export.
    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        ALL_COUNTERS.iter().map(|&c| (c, self.get(c))).collect()
    }
}

/// The single process-wide counter bank.
pub static METRICS: Metrics = Metrics::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_is_observable_through_get_and_snapshot() {
        let before = METRICS.get(Counter::Conflict);
        METRICS.incr(Counter::Conflict);
        assert_eq!(METRICS.get(Counter::Conflict), before + 1);

        let snap = METRICS.snapshot();
        let (_, v) = snap.iter().find(|(c, _)| *c == Counter::Conflict).unwrap();
        assert_eq!(*v, before + 1);
    }
}
