//! Stackful coroutine primitive (component A).
//!
//! A coroutine owns a private stack and a saved machine context. `spawn`
//! lays down an initial context whose resume point is a trampoline that
//! invokes the entry closure and, on return, parks the coroutine as
//! `Done`. `jump_in`/`jump_out` are a matched pair of context switches:
//! the scheduler's dispatch-loop stack is always the "caller" a
//! coroutine switches back to.
//!
//! Built on `context-rs`, the same stack-switching crate
//! `Pursuit92-mioco` depends on — no inline assembly here, just
//! `context::Context` and a guard-paged stack.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use context::stack::ProtectedFixedSizeStack;
use context::{Context as RawContext, Transfer};

/// Default private stack size for a spawned coroutine (spec §3: "128 KiB,
/// configurable").
pub const DEFAULT_STACK_BYTES: usize = 128 * 1024;

/// Opaque identifier of a coroutine, stable for its lifetime. Used to
/// index the scheduler's runnable queue, IO-wait set and timer wheel
/// without carrying the coroutine's `Rc` around everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(usize);

impl CoroutineId {
    /// Wrap a raw slab index as a `CoroutineId`.
    pub fn from_raw(raw: usize) -> Self {
        CoroutineId(raw)
    }

    /// The underlying slab index.
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Why a parked coroutine was moved back onto the runnable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Not parked, or not yet woken.
    None,
    /// A kernel readiness event fired for one of its fd-waiters.
    Io,
    /// Its deadline expired before any fd-waiter became ready.
    Timeout,
    /// The kernel reported `EPOLLERR | EPOLLHUP` for one of its fds.
    HangUp,
}

/// Flags a coroutine can carry simultaneously (spec §3: `IO_LIST`,
/// `SLEEP_LIST`, `RUN_LIST`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    const IO_LIST: u8 = 0b001;
    const SLEEP_LIST: u8 = 0b010;
    const RUN_LIST: u8 = 0b100;

    pub fn none() -> Self {
        Flags(0)
    }
    pub fn set_io_list(&mut self, v: bool) {
        self.set(Self::IO_LIST, v)
    }
    pub fn set_sleep_list(&mut self, v: bool) {
        self.set(Self::SLEEP_LIST, v)
    }
    pub fn set_run_list(&mut self, v: bool) {
        self.set(Self::RUN_LIST, v)
    }
    pub fn has_io_list(&self) -> bool {
        self.0 & Self::IO_LIST != 0
    }
    pub fn has_sleep_list(&self) -> bool {
        self.0 & Self::SLEEP_LIST != 0
    }
    pub fn has_run_list(&self) -> bool {
        self.0 & Self::RUN_LIST != 0
    }
    fn set(&mut self, bit: u8, v: bool) {
        if v {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Coroutine lifecycle state (spec §4.C). A coroutine is constructed
/// directly into `Runnable`; there is no separate pre-allocation `Free`
/// state in this implementation since stacks are allocated on `spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Runnable,
    Running,
    IoWait,
    Sleep,
    Done,
}

/// Outcome of a finished coroutine.
pub enum ExitStatus {
    /// The entry closure returned normally.
    Finished,
    /// The entry closure panicked; carries the panic payload so the
    /// host can choose to propagate or log it.
    Panicked(Box<dyn Any + Send + 'static>),
}

type Entry = Box<dyn FnOnce() + 'static>;

/// Handed from the resuming side to the trampoline on the very first
/// switch into a freshly spawned coroutine.
struct StartPayload {
    entry: Entry,
}

pub(crate) struct Coroutine {
    pub id: CoroutineId,
    /// The context to resume *into* on the next `jump_in`. Always
    /// `Some` while the coroutine is parked anywhere (runnable, IO-wait,
    /// sleep) and briefly `None` only for the duration of `jump_in`
    /// itself.
    context: Option<RawContext>,
    /// Not yet run: `Some` until the first `jump_in` consumes it.
    pending_entry: Option<Entry>,
    /// Kept alive for the coroutine's lifetime; dropped (unmapping the
    /// guard-paged stack) once the coroutine itself is dropped.
    _stack: ProtectedFixedSizeStack,
    pub status: Status,
    pub flags: Flags,
    /// Absolute deadline in milliseconds, 0 = none (spec §3).
    pub deadline_ms: u64,
    pub wake_reason: WakeReason,
    pub exit: Option<ExitStatus>,
}

pub(crate) type RcCoroutine = Rc<RefCell<Coroutine>>;

thread_local! {
    /// While a coroutine is running, this holds the context to switch
    /// back to when it yields (always the dispatch loop's resume call
    /// site — coroutines never jump directly to one another in this
    /// runtime, only to/from the scheduler, see spec §4.A/§5).
    static CURRENT_PARENT: RefCell<Option<RawContext>> = RefCell::new(None);
}

extern "C" fn trampoline(t: Transfer) -> ! {
    // SAFETY: `jump_in` leaks exactly one `Box<StartPayload>` and hands
    // us its address as `t.data` on the first resume into this stack.
    let payload = unsafe { Box::from_raw(t.data as *mut StartPayload) };
    CURRENT_PARENT.with(|p| *p.borrow_mut() = Some(t.context));

    let exit = match panic::catch_unwind(AssertUnwindSafe(payload.entry)) {
        Ok(()) => ExitStatus::Finished,
        Err(panic) => ExitStatus::Panicked(panic),
    };

    let parent = CURRENT_PARENT.with(|p| p.borrow_mut().take())
        .expect("parent context missing at coroutine exit");
    let exit_ptr = Box::into_raw(Box::new(exit));
    // This switch never returns: the scheduler must not resume a
    // finished coroutine's stack again.
    let _ = parent.resume(exit_ptr as usize);
    unreachable!("a finished coroutine's stack must never be resumed again");
}

impl Coroutine {
    /// Allocate a private stack and lay down the initial context. The
    /// coroutine is left `Runnable`; not a single instruction of `entry`
    /// has executed yet.
    pub fn spawn(id: CoroutineId, stack_bytes: usize, entry: impl FnOnce() + 'static) -> Self {
        let stack = ProtectedFixedSizeStack::new(stack_bytes)
            .expect("failed to allocate a guard-paged coroutine stack");
        let context = RawContext::new(&stack, trampoline);

        Coroutine {
            id,
            context: Some(context),
            pending_entry: Some(Box::new(entry)),
            _stack: stack,
            status: Status::Runnable,
            flags: Flags::none(),
            deadline_ms: 0,
            wake_reason: WakeReason::None,
            exit: None,
        }
    }
}

/// Switch the OS thread onto `co`'s stack. Must only be called when
/// `co.status == Runnable`. Returns once the coroutine either yields
/// (via [`jump_out`]) or runs to completion.
///
/// On return, `co.status` is `Done` if the coroutine finished, or
/// whatever the coroutine itself set before yielding (the scheduler is
/// responsible for having set `IoWait`/`Sleep`/`Runnable` *before*
/// calling the primitive that leads to `jump_out`).
pub(crate) fn jump_in(co: &RcCoroutine) {
    let (context, data) = {
        let mut c = co.borrow_mut();
        debug_assert!(matches!(c.status, Status::Runnable));
        c.status = Status::Running;
        let context = c
            .context
            .take()
            .expect("coroutine has no context to resume into");
        let data = match c.pending_entry.take() {
            Some(entry) => Box::into_raw(Box::new(StartPayload { entry })) as usize,
            None => 0,
        };
        (context, data)
    };

    let transfer = context.resume(data);

    let mut c = co.borrow_mut();
    if transfer.data != 0 {
        // SAFETY: non-zero `data` on the way back out of a coroutine's
        // stack only ever carries an `ExitStatus` boxed by `trampoline`.
        let exit = unsafe { *Box::from_raw(transfer.data as *mut ExitStatus) };
        c.status = Status::Done;
        c.exit = Some(exit);
        // `transfer.context` belongs to a stack that will never run
        // again; let it drop.
    } else {
        c.context = Some(transfer.context);
    }
}

/// Suspend the *currently running* coroutine, switching back to the
/// scheduler. Callers (the primitives in [`crate::io`], `sleep`,
/// `yield_now`) must set `status`/`flags`/`deadline_ms` on the
/// coroutine *before* calling this, since it's the only thing that
/// hands control back to the dispatch loop.
///
/// # Panics
/// Panics if called while not actually running inside a coroutine
/// spawned by this module (i.e. outside any `jump_in`).
pub(crate) fn jump_out() {
    let parent = CURRENT_PARENT
        .with(|p| p.borrow_mut().take())
        .expect("jump_out() called outside a running coroutine");
    let transfer = parent.resume(0);
    CURRENT_PARENT.with(|p| *p.borrow_mut() = Some(transfer.context));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    thread_local! {
        static CURRENT: RefCell<Option<RcCoroutine>> = RefCell::new(None);
    }

    fn spawn_on_thread(f: impl FnOnce() + 'static) -> RcCoroutine {
        let co = Rc::new(RefCell::new(Coroutine::spawn(
            CoroutineId::from_raw(0),
            DEFAULT_STACK_BYTES,
            f,
        )));
        co
    }

    #[test]
    fn a_coroutine_that_returns_immediately_finishes_on_first_resume() {
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let co = spawn_on_thread(move || {
            ran2.set(true);
        });

        jump_in(&co);

        assert!(ran.get());
        assert!(matches!(co.borrow().status, Status::Done));
        assert!(matches!(co.borrow().exit, Some(ExitStatus::Finished)));
    }

    #[test]
    fn yielding_returns_control_to_the_resumer_and_can_be_resumed_again() {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let steps2 = steps.clone();
        let co = spawn_on_thread(move || {
            steps2.borrow_mut().push(1);
            jump_out();
            steps2.borrow_mut().push(2);
        });

        CURRENT.with(|c| *c.borrow_mut() = Some(co.clone()));

        co.borrow_mut().status = Status::Runnable;
        jump_in(&co);
        assert_eq!(*steps.borrow(), vec![1]);
        assert!(matches!(co.borrow().status, Status::Running));

        co.borrow_mut().status = Status::Runnable;
        jump_in(&co);
        assert_eq!(*steps.borrow(), vec![1, 2]);
        assert!(matches!(co.borrow().status, Status::Done));
    }

    #[test]
    fn a_panic_inside_the_coroutine_is_captured_not_propagated() {
        let co = spawn_on_thread(|| panic!("boom"));
        jump_in(&co);
        assert!(matches!(co.borrow().exit, Some(ExitStatus::Panicked(_))));
    }
}
