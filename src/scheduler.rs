//! Runnable queue, IO-wait/sleep bookkeeping and the dispatch loop
//! (component C).
//!
//! One `Scheduler` lives on exactly one OS thread for its whole life;
//! there is no cross-thread coroutine migration (see the hosting model
//! in `SPEC_FULL.md` §5 — unlike `Pursuit92-mioco`'s `FifoScheduler` /
//! `CoroutineControl::migrate`, load is distributed across threads only
//! by which thread a coroutine is spawned on, never rebalanced after).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Instant;

use log::warn;
use slab::Slab;

use crate::coroutine::{self, CoroutineId, ExitStatus, RcCoroutine, Status, WakeReason};
use crate::epoll::Epoll;
use crate::timer::TimerWheel;

thread_local! {
    /// Set for the duration of `Scheduler::run_until_empty`'s stack frame,
    /// which strictly outlives every coroutine it resumes. Lets the
    /// blocking-style primitives in `crate::io` reach the scheduler that
    /// is driving the coroutine currently running on this thread.
    static CURRENT: RefCell<Option<*mut Scheduler>> = RefCell::new(None);
    static RUNNING: RefCell<Option<CoroutineId>> = RefCell::new(None);
}

/// The id of the coroutine executing on this thread right now.
///
/// # Panics
/// Panics if called from outside a running coroutine.
pub(crate) fn current_coroutine_id() -> CoroutineId {
    RUNNING
        .with(|r| *r.borrow())
        .expect("current_coroutine_id() called outside a running coroutine")
}

/// Run `f` with mutable access to the scheduler driving this thread.
///
/// # Panics
/// Panics if called from outside `Scheduler::run_until_empty`.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let ptr = CURRENT
        .with(|c| *c.borrow())
        .expect("with_current() called without an active Scheduler on this thread");
    // SAFETY: `ptr` is only ever set to a live `&mut Scheduler` for the
    // duration of `run_until_empty`'s stack frame below.
    f(unsafe { &mut *ptr })
}

/// Like [`with_current`], but `None` instead of a panic when this thread
/// isn't hosting a scheduler — the syscall hooks in `crate::hook` can run
/// on threads this runtime never started.
pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    let ptr = CURRENT.with(|c| *c.borrow())?;
    Some(f(unsafe { &mut *ptr }))
}

pub(crate) struct Scheduler {
    coroutines: Slab<RcCoroutine>,
    runnable: VecDeque<CoroutineId>,
    timers: TimerWheel,
    pub(crate) epoll: Epoll,
    start: Instant,
}

impl Scheduler {
    pub(crate) fn new(epoll_capacity: usize) -> std::io::Result<Self> {
        Ok(Scheduler {
            coroutines: Slab::with_capacity(512),
            runnable: VecDeque::new(),
            timers: TimerWheel::with_defaults(),
            epoll: Epoll::new(epoll_capacity)?,
            start: Instant::now(),
        })
    }

    /// Milliseconds elapsed since this scheduler was created. The clock
    /// every `deadline_ms` on this thread is measured against.
    pub(crate) fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.coroutines.is_empty()
    }

    /// Lay down a new coroutine and enqueue it as runnable. Does not run
    /// a single instruction of `entry`.
    pub(crate) fn spawn(&mut self, stack_bytes: usize, entry: impl FnOnce() + 'static) -> CoroutineId {
        let vacant = self.coroutines.vacant_entry();
        let id = CoroutineId::from_raw(vacant.key());
        let co = crate::coroutine::Coroutine::spawn(id, stack_bytes, entry);
        vacant.insert(Rc::new(RefCell::new(co)));
        self.runnable.push_back(id);
        id
    }

    /// Move a parked coroutine back onto the runnable queue. A no-op if
    /// it's already there, already running, or already gone (e.g. a
    /// readiness event racing a timeout that already fired it).
    pub(crate) fn wake(&mut self, id: CoroutineId, reason: WakeReason) {
        let rc = match self.coroutines.get(id.as_usize()) {
            Some(rc) => rc,
            None => return,
        };
        let mut c = rc.borrow_mut();
        if c.flags.has_run_list() {
            return;
        }
        c.wake_reason = reason;
        c.status = Status::Runnable;
        c.flags.set_run_list(true);
        drop(c);
        self.runnable.push_back(id);
    }

    /// Park the currently running coroutine off the runnable queue,
    /// recording a deadline if one applies. Must be called from inside
    /// the coroutine being parked; returns once something wakes it.
    ///
    /// `io`/`sleep` mark which of the scheduler's wait-sets the
    /// coroutine belongs to while parked (spec §3's `IO_LIST`/
    /// `SLEEP_LIST` flags) — a coroutine waiting on a fd *with* a
    /// deadline carries both.
    pub(crate) fn park_current(
        &mut self,
        status: Status,
        io: bool,
        sleep: bool,
        deadline_ms: Option<u64>,
    ) -> Option<crate::timer::TimerToken> {
        let id = current_coroutine_id();
        let rc = self
            .coroutines
            .get(id.as_usize())
            .expect("current coroutine missing from the scheduler's slab")
            .clone();

        let token = deadline_ms.map(|d| self.timers.insert(id, d));

        {
            let mut c = rc.borrow_mut();
            c.status = status;
            c.flags.set_io_list(io);
            c.flags.set_sleep_list(sleep);
            c.flags.set_run_list(false);
            c.deadline_ms = deadline_ms.unwrap_or(0);
            c.wake_reason = WakeReason::None;
        }

        coroutine::jump_out();
        token
    }

    /// Cancel a deadline registered by [`Self::park_current`]. Every wake
    /// path — readiness, timeout, hang-up — must call this exactly once,
    /// even when the wake reason *was* the timeout, so a fired timer
    /// entry never lingers as a dangling wheel slot.
    pub(crate) fn cancel_timer(&mut self, token: crate::timer::TimerToken) {
        self.timers.cancel(token);
    }

    /// The reason the currently running coroutine most recently woke.
    pub(crate) fn current_wake_reason(&self) -> WakeReason {
        let id = current_coroutine_id();
        self.coroutines
            .get(id.as_usize())
            .map(|rc| rc.borrow().wake_reason)
            .unwrap_or(WakeReason::None)
    }

    /// Cooperatively yield: re-enqueue the running coroutine at the back
    /// of the runnable queue and let another runnable coroutine go next.
    pub(crate) fn yield_now(&mut self) {
        let id = current_coroutine_id();
        if let Some(rc) = self.coroutines.get(id.as_usize()) {
            let mut c = rc.borrow_mut();
            c.status = Status::Runnable;
            c.wake_reason = WakeReason::None;
            c.flags.set_run_list(true);
        }
        self.runnable.push_back(id);
        coroutine::jump_out();
    }

    /// Drive every spawned coroutine to completion. Returns once the
    /// slab is empty. A coroutine whose entry closure panicked has its
    /// payload re-raised here, on the hosting thread's own stack — the
    /// same place a panic on a plain `thread::spawn`'d closure surfaces
    /// for its joiner.
    pub(crate) fn run_until_empty(&mut self) {
        let self_ptr = self as *mut Scheduler;
        CURRENT.with(|c| *c.borrow_mut() = Some(self_ptr));
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.drive()));
        CURRENT.with(|c| *c.borrow_mut() = None);
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    fn drive(&mut self) {
        loop {
            while let Some(id) = self.runnable.pop_front() {
                self.run_one(id);
            }
            if self.is_idle() {
                return;
            }

            let now = self.now_ms();
            let timeout_ms = self
                .timers
                .earliest_deadline_ms()
                .map(|d| d.saturating_sub(now) as i32);

            match self.epoll.wait(timeout_ms) {
                Ok(woken) => {
                    for (id, reason) in woken {
                        self.wake(id, reason);
                    }
                }
                Err(err) => warn!("epoll_wait failed: {}", err),
            }

            let due = self.timers.expire_due(self.now_ms());
            for id in due {
                self.wake(id, WakeReason::Timeout);
            }
        }
    }

    fn run_one(&mut self, id: CoroutineId) {
        let rc = match self.coroutines.get(id.as_usize()) {
            Some(rc) => rc.clone(),
            None => return,
        };
        rc.borrow_mut().flags.set_run_list(false);

        RUNNING.with(|r| *r.borrow_mut() = Some(id));
        coroutine::jump_in(&rc);
        RUNNING.with(|r| *r.borrow_mut() = None);

        let finished = matches!(rc.borrow().status, Status::Done);
        if finished {
            let exit = rc.borrow_mut().exit.take();
            self.coroutines.remove(id.as_usize());
            if let Some(ExitStatus::Panicked(payload)) = exit {
                std::panic::resume_unwind(payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn spawned_coroutines_run_to_completion_without_touching_epoll() {
        let mut sched = Scheduler::new(16).expect("Scheduler::new");
        let ran = Rc::new(Cell::new(0));

        for _ in 0..5 {
            let ran = ran.clone();
            sched.spawn(crate::coroutine::DEFAULT_STACK_BYTES, move || {
                ran.set(ran.get() + 1);
            });
        }

        sched.run_until_empty();
        assert_eq!(ran.get(), 5);
        assert!(sched.is_idle());
    }

    #[test]
    fn yield_now_interleaves_two_coroutines() {
        let mut sched = Scheduler::new(16).expect("Scheduler::new");
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        sched.spawn(crate::coroutine::DEFAULT_STACK_BYTES, move || {
            o1.borrow_mut().push('a');
            with_current(|s| s.yield_now());
            o1.borrow_mut().push('c');
        });
        let o2 = order.clone();
        sched.spawn(crate::coroutine::DEFAULT_STACK_BYTES, move || {
            o2.borrow_mut().push('b');
            with_current(|s| s.yield_now());
            o2.borrow_mut().push('d');
        });

        sched.run_until_empty();
        assert_eq!(*order.borrow(), vec!['a', 'b', 'c', 'd']);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn a_coroutine_panic_propagates_out_of_run_until_empty() {
        let mut sched = Scheduler::new(16).expect("Scheduler::new");
        sched.spawn(crate::coroutine::DEFAULT_STACK_BYTES, || panic!("boom"));
        sched.run_until_empty();
    }
}
