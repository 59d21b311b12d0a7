//! Readiness multiplexer proxy (component D).
//!
//! A thin, intentionally un-abstracted wrapper over
//! `epoll_create1`/`epoll_ctl`/`epoll_wait`. `mio`'s safe `Poll`/
//! `Evented` API assumes it owns every descriptor it multiplexes as a
//! typed `Source`; the syscall hooks in [`crate::hook`] must attach
//! interest to file descriptors the *application* created and owns, so
//! this module calls `libc` directly and keeps the literal
//! `EPOLL_CTL_ADD`/`MOD`/`DEL` and `EEXIST`/`ENOENT`-swallowing
//! semantics the hook layer depends on in plain view.
//!
//! Each registered fd has exactly one "notify target": the coroutine
//! parked on it. Two waiters racing to attach to the same fd without
//! the first detaching is a programming error in the hook layer and is
//! reported as [`HookError::Conflict`], not silently overwritten.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use slab::Slab;

use crate::coroutine::{CoroutineId, WakeReason};
use crate::error::HookError;
use crate::metrics::{Counter, METRICS};

/// Which directions a waiter is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub fn read() -> Self {
        Interest { readable: true, writable: false }
    }
    pub fn write() -> Self {
        Interest { readable: false, writable: true }
    }
    pub fn read_write() -> Self {
        Interest { readable: true, writable: true }
    }

    fn to_epoll_bits(self) -> u32 {
        let mut bits = libc::EPOLLET as u32;
        if self.readable {
            bits |= libc::EPOLLIN as u32;
        }
        if self.writable {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

/// Bookkeeping for one fd registered with the kernel event channel.
///
/// `read_refcount`/`write_refcount` count the coroutines currently
/// awaiting each direction (spec §3: "independent read-refcount and
/// write-refcount"). `listen` is the mask actually registered with the
/// kernel; the invariant (spec §3) is `listen.readable ⇔ read_refcount >
/// 0 ∨ an explicit unconditional arm`, and symmetrically for write.
struct FdRef {
    fd: RawFd,
    listen: Interest,
    read_refcount: u32,
    write_refcount: u32,
    notify: Option<CoroutineId>,
}

/// Raw `epoll` proxy plus the fd-reference table that maps kernel events
/// back to the coroutine parked on each fd.
pub(crate) struct Epoll {
    epfd: RawFd,
    refs: Slab<FdRef>,
    by_fd: HashMap<RawFd, usize>,
    events_buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub(crate) fn new(event_buf_capacity: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll {
            epfd,
            refs: Slab::with_capacity(event_buf_capacity),
            by_fd: HashMap::with_capacity(event_buf_capacity),
            events_buf: vec![unsafe { std::mem::zeroed() }; event_buf_capacity.max(64)],
        })
    }

    /// Arm interest (spec §4.D `ctrl_add`): increment the per-direction
    /// refcounts for `mask`, widen the kernel registration if the
    /// resulting listened mask grew, and leave it untouched (no syscall)
    /// if it didn't. This is how a pooled, long-lived connection used by
    /// several coroutines accumulates interest without one coroutine's
    /// arm clobbering another's.
    pub(crate) fn ctrl_add(&mut self, fd: RawFd, mask: Interest) -> Result<(), HookError> {
        let key = match self.by_fd.get(&fd) {
            Some(&key) => key,
            None => {
                let key = self.refs.insert(FdRef {
                    fd,
                    listen: Interest { readable: false, writable: false },
                    read_refcount: 0,
                    write_refcount: 0,
                    notify: None,
                });
                self.by_fd.insert(fd, key);
                key
            }
        };

        self.attach_events(key, mask);

        let current = self.refs[key].listen;
        let new = Interest {
            readable: current.readable || mask.readable,
            writable: current.writable || mask.writable,
        };
        if new == current {
            return Ok(());
        }

        let mut event = libc::epoll_event {
            events: new.to_epoll_bits(),
            u64: key as u64,
        };
        let op = if current.readable || current.writable {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event as *mut _) };
        if rc < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // `EEXIST` on add means another path already attached this fd
            // to the kernel's interest list (e.g. re-armed after a
            // short-lived detach race); our bookkeeping is authoritative.
            if op == libc::EPOLL_CTL_ADD && errno == libc::EEXIST {
                self.refs[key].listen = new;
                return Ok(());
            }
            self.detach_events(key, mask);
            METRICS.incr(Counter::EpollCtlError);
            return Err(HookError::Kernel(fd, errno));
        }
        self.refs[key].listen = new;
        Ok(())
    }

    /// Disarm interest (spec §4.D `ctrl_del`). `detach_events` always
    /// runs first and is never rolled back. The resulting mask depends on
    /// `use_refcount`:
    ///
    /// - `true` (pooled/shared-fd mode): a direction stays armed iff its
    ///   refcount is still positive after the decrement — this is what
    ///   lets one coroutine's timeout on a shared fd narrow the listened
    ///   mask without disturbing a sibling coroutine still awaiting the
    ///   other direction (spec S3).
    /// - `false` (unconditional mode): the requested directions are
    ///   dropped outright regardless of outstanding refcounts.
    pub(crate) fn ctrl_del(&mut self, fd: RawFd, mask: Interest, use_refcount: bool) {
        let key = match self.by_fd.get(&fd) {
            Some(&key) => key,
            None => return,
        };

        self.detach_events(key, mask);

        let current = self.refs[key].listen;
        let new = if use_refcount {
            Interest {
                readable: self.refs[key].read_refcount > 0,
                writable: self.refs[key].write_refcount > 0,
            }
        } else {
            Interest {
                readable: current.readable && !mask.readable,
                writable: current.writable && !mask.writable,
            }
        };
        if new == current {
            return;
        }

        if !new.readable && !new.writable {
            let rc = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rc < 0 {
                let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno != libc::ENOENT {
                    METRICS.incr(Counter::EpollCtlError);
                }
            }
            self.refs[key].listen = new;
            return;
        }

        let mut event = libc::epoll_event {
            events: new.to_epoll_bits(),
            u64: key as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event as *mut _) };
        if rc < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::ENOENT {
                METRICS.incr(Counter::EpollCtlError);
            }
        }
        self.refs[key].listen = new;
    }

    fn attach_events(&mut self, key: usize, mask: Interest) {
        let r = &mut self.refs[key];
        if mask.readable {
            r.read_refcount += 1;
        }
        if mask.writable {
            r.write_refcount += 1;
        }
    }

    fn detach_events(&mut self, key: usize, mask: Interest) {
        let r = &mut self.refs[key];
        if mask.readable {
            r.read_refcount = r.read_refcount.saturating_sub(1);
        }
        if mask.writable {
            r.write_refcount = r.write_refcount.saturating_sub(1);
        }
    }

    /// Unconditionally drop a fd's entire kernel registration and
    /// bookkeeping, ignoring outstanding refcounts — used when the
    /// descriptor itself is going away (`close()`), not when one
    /// direction's wait completed. `ENOENT` is swallowed.
    pub(crate) fn remove(&mut self, fd: RawFd) {
        let key = match self.by_fd.remove(&fd) {
            Some(key) => key,
            None => return,
        };
        self.refs.remove(key);
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::ENOENT {
                METRICS.incr(Counter::EpollCtlError);
            }
        }
    }

    /// Attach (or replace) the notify target for an already-registered fd.
    /// Returns [`HookError::Conflict`] if a *different* coroutine already
    /// holds the slot — the caller must detach before re-arming with a
    /// new waiter.
    pub(crate) fn set_notify(
        &mut self,
        fd: RawFd,
        waiter: CoroutineId,
    ) -> Result<(), HookError> {
        let key = *self.by_fd.get(&fd).ok_or_else(|| {
            METRICS.incr(Counter::FdLookupMiss);
            HookError::UnknownFd(fd)
        })?;
        let entry = &mut self.refs[key];
        match entry.notify {
            Some(existing) if existing != waiter => {
                METRICS.incr(Counter::Conflict);
                Err(HookError::Conflict(fd))
            }
            _ => {
                entry.notify = Some(waiter);
                Ok(())
            }
        }
    }

    /// Clear the notify target without dropping the fd's kernel
    /// registration (used once a wait completes, before the next arm).
    pub(crate) fn clear_notify(&mut self, fd: RawFd) {
        if let Some(&key) = self.by_fd.get(&fd) {
            self.refs[key].notify = None;
        }
    }

    /// Block for up to `timeout_ms` (or indefinitely if `None`) waiting
    /// for kernel readiness events, translating each into the coroutine
    /// parked on it and why it woke. A fd with no notify target attached
    /// (a spurious or already-handled event) is silently skipped.
    ///
    /// Hang-up (`EPOLLERR | EPOLLHUP`) takes precedence over readable,
    /// which takes precedence over writable, when a single event carries
    /// more than one bit (spec §4.D).
    pub(crate) fn wait(&mut self, timeout_ms: Option<i32>) -> io::Result<Vec<(CoroutineId, WakeReason)>> {
        let timeout = timeout_ms.unwrap_or(-1);
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events_buf.as_mut_ptr(),
                self.events_buf.len() as i32,
                timeout,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut woken = Vec::with_capacity(n as usize);
        for event in &self.events_buf[..n as usize] {
            let key = event.u64 as usize;
            let notify = match self.refs.get(key) {
                Some(r) => r.notify,
                None => continue,
            };
            let waiter = match notify {
                Some(w) => w,
                None => continue,
            };

            let bits = event.events;
            let reason = if bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                METRICS.incr(Counter::HangUp);
                WakeReason::HangUp
            } else {
                WakeReason::Io
            };
            woken.push((waiter, reason));
        }
        Ok(woken)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_add_then_set_notify_then_remove_round_trips_bookkeeping() {
        let mut epoll = Epoll::new(16).expect("epoll_create1");
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        use std::os::unix::io::IntoRawFd;
        let fd = r.into_raw_fd();

        epoll.ctrl_add(fd, Interest::read()).expect("ctrl_add");
        epoll.set_notify(fd, CoroutineId::from_raw(7)).expect("set_notify");

        assert!(matches!(
            epoll.set_notify(fd, CoroutineId::from_raw(8)),
            Err(HookError::Conflict(_))
        ));

        epoll.clear_notify(fd);
        epoll.set_notify(fd, CoroutineId::from_raw(8)).expect("re-arm after clear");

        epoll.remove(fd);
        assert!(matches!(
            epoll.set_notify(fd, CoroutineId::from_raw(8)),
            Err(HookError::UnknownFd(_))
        ));

        unsafe { libc::close(fd) };
    }

    #[test]
    fn double_remove_is_a_silent_no_op() {
        let mut epoll = Epoll::new(16).expect("epoll_create1");
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        use std::os::unix::io::IntoRawFd;
        let fd = r.into_raw_fd();

        epoll.ctrl_add(fd, Interest::read()).expect("ctrl_add");
        epoll.remove(fd);
        epoll.remove(fd);

        unsafe { libc::close(fd) };
    }

    /// Property 1 (spec §8): `ctrl_add(fd,m1); ctrl_add(fd,m2)` leaves the
    /// listened mask at `m1|m2`, and matching `ctrl_del` pairs restore the
    /// original mask when refcounts are balanced.
    #[test]
    fn overlapping_arms_union_and_balanced_disarms_restore_original_mask() {
        let mut epoll = Epoll::new(16).expect("epoll_create1");
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        use std::os::unix::io::IntoRawFd;
        let fd = r.into_raw_fd();

        epoll.ctrl_add(fd, Interest::read()).expect("arm read");
        epoll.ctrl_add(fd, Interest::write()).expect("arm write");
        assert_eq!(epoll.refs[*epoll.by_fd.get(&fd).unwrap()].listen, Interest::read_write());

        epoll.ctrl_del(fd, Interest::write(), true);
        assert_eq!(
            epoll.refs[*epoll.by_fd.get(&fd).unwrap()].listen,
            Interest::read()
        );

        epoll.ctrl_del(fd, Interest::read(), true);
        assert_eq!(
            epoll.refs[*epoll.by_fd.get(&fd).unwrap()].listen,
            Interest { readable: false, writable: false }
        );

        unsafe { libc::close(fd) };
    }

    /// Scenario S3 (spec §8): a reader and a writer sharing one fd each
    /// hold their own refcount. The reader's disarm (its wait timed out)
    /// must not touch the writer's still-outstanding interest.
    #[test]
    fn shared_fd_read_refcount_survives_unrelated_write_side_disarm() {
        let mut epoll = Epoll::new(16).expect("epoll_create1");
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        use std::os::unix::io::IntoRawFd;
        let fd = r.into_raw_fd();

        // Reader R and writer W both arm their direction on the same fd.
        epoll.ctrl_add(fd, Interest::read()).expect("R arms read");
        epoll.ctrl_add(fd, Interest::write()).expect("W arms write");
        let key = *epoll.by_fd.get(&fd).unwrap();
        assert_eq!(epoll.refs[key].read_refcount, 1);
        assert_eq!(epoll.refs[key].write_refcount, 1);
        assert_eq!(epoll.refs[key].listen, Interest::read_write());

        // R's wait times out and disarms read, refcounted: write must
        // stay armed because W's refcount is still outstanding.
        epoll.ctrl_del(fd, Interest::read(), true);
        assert_eq!(epoll.refs[key].read_refcount, 0);
        assert_eq!(epoll.refs[key].write_refcount, 1);
        assert_eq!(epoll.refs[key].listen, Interest::write());

        // W completes and disarms write: mask drops to empty and the
        // kernel registration is fully removed (no dangling epoll entry).
        epoll.ctrl_del(fd, Interest::write(), true);
        assert_eq!(epoll.refs[key].listen, Interest { readable: false, writable: false });

        unsafe { libc::close(fd) };
    }

    /// Pooled connections share one fd-reference across many sequential
    /// waiters on the *same* direction; the refcount must track how many
    /// are outstanding, not just whether any are.
    #[test]
    fn same_direction_refcount_accumulates_and_drains() {
        let mut epoll = Epoll::new(16).expect("epoll_create1");
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        use std::os::unix::io::IntoRawFd;
        let fd = r.into_raw_fd();

        epoll.ctrl_add(fd, Interest::read()).expect("first reader arms");
        epoll.ctrl_add(fd, Interest::read()).expect("second reader arms");
        let key = *epoll.by_fd.get(&fd).unwrap();
        assert_eq!(epoll.refs[key].read_refcount, 2);
        assert_eq!(epoll.refs[key].listen, Interest::read());

        epoll.ctrl_del(fd, Interest::read(), true);
        assert_eq!(epoll.refs[key].read_refcount, 1);
        assert_eq!(epoll.refs[key].listen, Interest::read());

        epoll.ctrl_del(fd, Interest::read(), true);
        assert_eq!(epoll.refs[key].read_refcount, 0);
        assert_eq!(epoll.refs[key].listen, Interest { readable: false, writable: false });

        unsafe { libc::close(fd) };
    }

    /// Unconditional disarm (the non-pooled fast path) drops exactly the
    /// requested directions regardless of any outstanding refcount —
    /// strictly stronger than the ref-counted form (spec §9).
    #[test]
    fn unconditional_disarm_ignores_refcount() {
        let mut epoll = Epoll::new(16).expect("epoll_create1");
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        use std::os::unix::io::IntoRawFd;
        let fd = r.into_raw_fd();

        epoll.ctrl_add(fd, Interest::read()).expect("first reader arms");
        epoll.ctrl_add(fd, Interest::read()).expect("second reader arms");
        let key = *epoll.by_fd.get(&fd).unwrap();
        assert_eq!(epoll.refs[key].read_refcount, 2);

        epoll.ctrl_del(fd, Interest::read(), false);
        assert_eq!(epoll.refs[key].listen, Interest { readable: false, writable: false });

        unsafe { libc::close(fd) };
    }

    /// Event pump precedence (spec §4.D/§5): hang-up takes priority over
    /// plain readability/writability for the same reported event.
    #[test]
    fn wait_reports_hangup_instead_of_io_when_both_bits_set() {
        let mut epoll = Epoll::new(16).expect("epoll_create1");
        let (mut rs, ws) = std::os::unix::net::UnixStream::pair().expect("socketpair");
        use std::os::unix::io::AsRawFd;
        let fd = rs.as_raw_fd();

        epoll.ctrl_add(fd, Interest::read()).expect("arm read");
        epoll.set_notify(fd, CoroutineId::from_raw(1)).expect("set_notify");

        drop(ws);
        // Closing the peer delivers EPOLLHUP (and often EPOLLIN for the
        // trailing EOF) on the remaining end; either way HangUp must win.
        let woken = epoll.wait(Some(1000)).expect("epoll_wait");
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].1, WakeReason::HangUp);

        let mut buf = [0u8; 1];
        let _ = std::io::Read::read(&mut rs, &mut buf);
    }
}
