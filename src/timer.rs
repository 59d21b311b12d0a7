//! Hashed time wheel (component B).
//!
//! O(1) insertion of deadlines, O(buckets swept) expiry. Ties within a
//! bucket break in insertion order (spec §4.B).
//!
//! Timers are identified by a [`TimerToken`] handed back from
//! [`TimerWheel::insert`]. Every suspension-releasing path (normal
//! resume, timeout, hang-up) must call [`TimerWheel::cancel`] on its
//! token even when the wake reason was `TIMEOUT`, to keep the
//! scheduler's "disarm interest AND remove the deadline" obligation
//! (spec §5) true uniformly.

use std::collections::{HashSet, VecDeque};

use crate::coroutine::CoroutineId;

/// Default tick granularity, in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 1;
/// Default wheel width: the worst-case deadline a single bucket lap
/// covers before wrapping around.
pub const DEFAULT_WHEEL_SPAN_MS: u64 = 60_000;

/// Opaque handle to a single scheduled deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct Entry {
    token: TimerToken,
    coro: CoroutineId,
    deadline_ms: u64,
}

/// A single-level hashed wheel of FIFO buckets.
pub struct TimerWheel {
    tick_ms: u64,
    buckets: Vec<VecDeque<Entry>>,
    /// Tick number (`deadline_ms / tick_ms`) that has already been swept
    /// up to and including.
    swept_tick: u64,
    cancelled: HashSet<TimerToken>,
    next_token: u64,
}

impl TimerWheel {
    /// Build a wheel with the given tick granularity and span. `span_ms`
    /// is rounded up to a whole number of ticks.
    pub fn new(tick_ms: u64, span_ms: u64) -> Self {
        assert!(tick_ms > 0, "tick granularity must be positive");
        let bucket_count = ((span_ms + tick_ms - 1) / tick_ms).max(1) as usize;
        TimerWheel {
            tick_ms,
            buckets: (0..bucket_count).map(|_| VecDeque::new()).collect(),
            swept_tick: 0,
            cancelled: HashSet::new(),
            next_token: 0,
        }
    }

    /// A wheel using the spec's defaults (1ms tick, 60s span).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TICK_MS, DEFAULT_WHEEL_SPAN_MS)
    }

    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn slot_for(&self, tick: u64) -> usize {
        (tick as usize) % self.bucket_count()
    }

    /// Insert a new deadline (absolute milliseconds on the same clock
    /// passed to [`Self::expire_due`]). O(1).
    pub fn insert(&mut self, coro: CoroutineId, deadline_ms: u64) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;

        let tick = deadline_ms / self.tick_ms;
        let slot = self.slot_for(tick);
        self.buckets[slot].push_back(Entry {
            token,
            coro,
            deadline_ms,
        });
        token
    }

    /// Cancel a previously inserted timer before it fires. A no-op if
    /// the timer already fired or was already cancelled — callers on
    /// every wake path call this unconditionally.
    pub fn cancel(&mut self, token: TimerToken) {
        self.cancelled.insert(token);
    }

    /// The earliest outstanding deadline across every non-cancelled
    /// entry, or `None` if the wheel is empty. Used by the dispatch loop
    /// to size its `wait()` timeout.
    pub fn earliest_deadline_ms(&self) -> Option<u64> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter(|e| !self.cancelled.contains(&e.token))
            .map(|e| e.deadline_ms)
            .min()
    }

    /// Sweep every bucket whose tick has passed, returning the
    /// coroutines whose deadlines are `<= now_ms`, oldest-inserted
    /// first. Entries whose bucket came due but whose absolute deadline
    /// is still in the future (a wheel wraparound collision) are
    /// reinserted into their correct future slot.
    pub fn expire_due(&mut self, now_ms: u64) -> Vec<CoroutineId> {
        let now_tick = now_ms / self.tick_ms;
        let mut due = Vec::new();

        if now_tick < self.swept_tick {
            // Clock did not advance (or went backwards); nothing new is due.
            return due;
        }

        // Never sweep more than a full lap in one call: that would just
        // mean "every bucket", which happens naturally once per
        // bucket_count() ticks anyway.
        let laps = (now_tick - self.swept_tick).min(self.bucket_count() as u64);
        for offset in 0..=laps {
            let tick = self.swept_tick + offset;
            let slot = self.slot_for(tick);
            let bucket = std::mem::take(&mut self.buckets[slot]);
            for entry in bucket {
                if self.cancelled.remove(&entry.token) {
                    continue;
                }
                if entry.deadline_ms <= now_ms {
                    due.push(entry.coro);
                } else {
                    // Wrapped around the wheel before its real deadline;
                    // put it back in the slot matching its actual tick.
                    let real_slot = self.slot_for(entry.deadline_ms / self.tick_ms);
                    self.buckets[real_slot].push_back(entry);
                }
            }
        }
        self.swept_tick = now_tick + 1;

        due
    }
}
