//! Per-OS-thread bootstrap.
//!
//! Each hosting thread owns exactly one [`Scheduler`] for its whole
//! life and runs it to completion independently — there is no shared
//! event loop and no cross-thread coroutine migration here, unlike
//! `Pursuit92-mioco`'s `mio::EventLoop` + `Message::Migration` plumbing,
//! which this runtime has no use for (see `SPEC_FULL.md` §5's hosting
//! model).

use std::io;
use std::thread::{self, JoinHandle};

use crate::scheduler::Scheduler;

/// Spawn a dedicated OS thread that builds its own `Scheduler`, seeds it
/// with one root coroutine running `entry`, and drives it until every
/// coroutine on that thread (including any it spawns along the way) has
/// finished.
pub(crate) fn spawn_hosting_thread(
    name: String,
    stack_bytes: usize,
    epoll_capacity: usize,
    entry: impl FnOnce() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(move || {
        let mut scheduler = Scheduler::new(epoll_capacity)
            .expect("failed to initialize the readiness multiplexer for this hosting thread");
        scheduler.spawn(stack_bytes, entry);
        scheduler.run_until_empty();
    })
}
