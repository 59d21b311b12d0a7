//! Syscall interposition (component F).
//!
//! When this crate is built as a `cdylib` and loaded via `LD_PRELOAD`,
//! the symbols below shadow libc's own `socket`/`read`/`write`/etc. for
//! every process that links against it. A freshly created socket is
//! immediately switched to kernel-level non-blocking mode and marked
//! "ours" in the hook-fd table; every subsequent call against it is
//! routed through `crate::io`'s blocking-style primitives instead of the
//! real libc symbol, so application code that was written against plain
//! synchronous sockets runs, unmodified, on top of the coroutine
//! scheduler.
//!
//! Real symbols are resolved lazily via `dlsym(RTLD_NEXT, ...)` and
//! cached behind a `spin::Once` per symbol — no allocation, no lock that
//! could itself reenter a hooked function, safe to call from the very
//! first moments after the dynamic linker maps this library in.

use std::io;
use std::os::raw::{c_int, c_long, c_ulong, c_void};
use std::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, Once};

use crate::error::IoError;
use crate::io as blocking;
use crate::scheduler;

/// Size of the hook-fd table: twice the default Linux fd-count ceiling,
/// matching the original implementation's sizing headroom.
const MT_HOOK_MAX_FD: usize = 65535 * 2;

/// Process-wide hook-enable flag (component L, `SPEC_FULL.md` §2),
/// mirroring the original's `g_mt_hook_flag`/`mt_hook_active()`. Every
/// hooked symbol in the original guards its coroutine-aware path behind
/// this flag first; a process that links this library but never starts
/// a `Runtime` must see every hooked call behave exactly like the real
/// libc symbol, since there is no scheduler anywhere to park on.
/// Starts disabled; [`enable_hook`] is called once a hosting thread's
/// scheduler is actually about to run.
static HOOK_ENABLED: AtomicBool = AtomicBool::new(false);

/// Turn on syscall interposition process-wide. Called by
/// [`crate::thread::spawn_hosting_thread`]/`Runtime::start` before a
/// scheduler starts driving coroutines on a hosting thread. Idempotent.
pub(crate) fn enable_hook() {
    HOOK_ENABLED.store(true, Ordering::SeqCst);
}

/// Turn off syscall interposition process-wide, the `mt_unset_hook_flag`
/// counterpart. Not called anywhere in this crate's own runtime today —
/// kept for an embedder that wants to pass a descriptor back to raw,
/// unhooked blocking use after the scheduler hosting it has stopped.
#[allow(dead_code)]
pub(crate) fn disable_hook() {
    HOOK_ENABLED.store(false, Ordering::SeqCst);
}

fn hook_active() -> bool {
    HOOK_ENABLED.load(Ordering::SeqCst)
}

const IN_USE: u8 = 0x1;
const USER_NONBLOCK: u8 = 0x2;

#[derive(Clone, Copy)]
struct HookFd {
    flags: u8,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
}

impl Default for HookFd {
    fn default() -> Self {
        HookFd {
            flags: 0,
            read_timeout_ms: blocking::DEFAULT_TIMEOUT_MS,
            write_timeout_ms: blocking::DEFAULT_TIMEOUT_MS,
        }
    }
}

struct HookTable {
    entries: Mutex<Vec<HookFd>>,
}

impl HookTable {
    fn new() -> Self {
        HookTable {
            entries: Mutex::new(vec![HookFd::default(); MT_HOOK_MAX_FD]),
        }
    }

    fn in_range(fd: c_int) -> bool {
        fd >= 0 && (fd as usize) < MT_HOOK_MAX_FD
    }

    fn mark_in_use(&self, fd: c_int) {
        if !Self::in_range(fd) {
            return;
        }
        let mut entries = self.entries.lock();
        entries[fd as usize] = HookFd {
            flags: IN_USE,
            ..HookFd::default()
        };
    }

    fn clear(&self, fd: c_int) {
        if !Self::in_range(fd) {
            return;
        }
        self.entries.lock()[fd as usize] = HookFd::default();
    }

    fn is_in_use(&self, fd: c_int) -> bool {
        Self::in_range(fd) && self.entries.lock()[fd as usize].flags & IN_USE != 0
    }

    /// Whether a call against `fd` should be routed through the
    /// coroutine-aware path, ignoring the process-wide hook-enable flag
    /// (see [`gate`]). False for fds we don't own, and false for fds the
    /// application itself put in non-blocking mode (it asked for raw
    /// `EAGAIN` semantics; honor that instead of parking it).
    fn should_intercept(&self, fd: c_int) -> bool {
        if !Self::in_range(fd) {
            return false;
        }
        let e = self.entries.lock()[fd as usize];
        e.flags & IN_USE != 0 && e.flags & USER_NONBLOCK == 0
    }

    fn set_user_nonblock(&self, fd: c_int, v: bool) {
        if !Self::in_range(fd) {
            return;
        }
        let mut entries = self.entries.lock();
        let e = &mut entries[fd as usize];
        if v {
            e.flags |= USER_NONBLOCK;
        } else {
            e.flags &= !USER_NONBLOCK;
        }
    }

    fn set_timeout(&self, fd: c_int, is_read: bool, ms: u64) {
        if !Self::in_range(fd) {
            return;
        }
        let mut entries = self.entries.lock();
        let e = &mut entries[fd as usize];
        if is_read {
            e.read_timeout_ms = ms;
        } else {
            e.write_timeout_ms = ms;
        }
    }

    fn read_timeout(&self, fd: c_int) -> u64 {
        if !Self::in_range(fd) {
            return blocking::DEFAULT_TIMEOUT_MS;
        }
        self.entries.lock()[fd as usize].read_timeout_ms
    }

    fn write_timeout(&self, fd: c_int) -> u64 {
        if !Self::in_range(fd) {
            return blocking::DEFAULT_TIMEOUT_MS;
        }
        self.entries.lock()[fd as usize].write_timeout_ms
    }
}

static HOOK_TABLE: Once<HookTable> = Once::new();

fn table() -> &'static HookTable {
    HOOK_TABLE.call_once(HookTable::new)
}

/// Combines the process-wide enable flag with a table's per-fd
/// bookkeeping. Split out from [`is_hooked`] so a test can exercise the
/// decision against a private `HookTable` instead of the process-wide
/// singleton, the same way the rest of this module's tests avoid
/// touching the shared table.
fn gate(enabled: bool, t: &HookTable, fd: c_int) -> bool {
    enabled && t.should_intercept(fd)
}

/// Whether a call against `fd` should be routed through the
/// coroutine-aware path. Requires both the process-wide hook-enable
/// flag (a process/thread with no `Runtime` started must see every
/// hooked symbol behave exactly like the real libc one) and the per-fd
/// bookkeeping in [`HookTable::should_intercept`].
fn is_hooked(fd: c_int) -> bool {
    gate(hook_active(), table(), fd)
}

fn set_errno(err: io::Error) {
    let code = if let Some(errno) = err.raw_os_error() {
        errno
    } else if let Some(inner) = err.get_ref().and_then(|b| b.downcast_ref::<IoError>()) {
        inner.to_errno()
    } else {
        libc::EIO
    };
    unsafe {
        *libc::__errno_location() = code;
    }
}

/// Resolve and cache the real libc symbol behind `$name`, transmuted to
/// `$ty`. One `spin::Once` per call site — each hooked function gets its
/// own cache cell via macro expansion, not a shared map, so there is no
/// lock contention between unrelated symbols.
macro_rules! real_symbol {
    ($name:literal, $ty:ty) => {{
        static CACHE: Once<usize> = Once::new();
        let addr = CACHE.call_once(|| unsafe {
            let cname = concat!($name, "\0");
            libc::dlsym(libc::RTLD_NEXT, cname.as_ptr() as *const libc::c_char) as usize
        });
        debug_assert_ne!(*addr, 0, concat!("dlsym(RTLD_NEXT, \"", $name, "\") returned NULL"));
        unsafe { std::mem::transmute::<usize, $ty>(*addr) }
    }};
}

type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, usize) -> isize;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, usize) -> isize;
type ConnectFn = unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int;
type SendFn = unsafe extern "C" fn(c_int, *const c_void, usize, c_int) -> isize;
type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, usize, c_int) -> isize;
type SendtoFn = unsafe extern "C" fn(
    c_int,
    *const c_void,
    usize,
    c_int,
    *const libc::sockaddr,
    libc::socklen_t,
) -> isize;
type RecvfromFn = unsafe extern "C" fn(
    c_int,
    *mut c_void,
    usize,
    c_int,
    *mut libc::sockaddr,
    *mut libc::socklen_t,
) -> isize;
type SetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, libc::socklen_t) -> c_int;
type FcntlFn = unsafe extern "C" fn(c_int, c_int, c_long) -> c_int;
type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int;

#[ctor::ctor]
fn install() {
    // Touch the table once at load time so the first real hooked call
    // doesn't pay for the `Vec` allocation mid-syscall.
    let _ = table();
    log::trace!("micro_thread: syscall hooks attached");
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let real: SocketFn = real_symbol!("socket", SocketFn);
    let fd = real(domain, ty, protocol);
    // Mirrors the original's `if (!mt_hook_active()) return mt_real_func(...)`:
    // with hooking off there is no scheduler to park this fd on anywhere in
    // the process, so leave it exactly as the real syscall made it.
    if fd >= 0 && hook_active() {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        table().mark_in_use(fd);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let real: CloseFn = real_symbol!("close", CloseFn);
    if table().is_in_use(fd) {
        scheduler::try_with_current(|s| s.epoll.remove(fd));
        table().clear(fd);
    }
    real(fd)
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: usize) -> isize {
    if is_hooked(fd) {
        let slice = std::slice::from_raw_parts_mut(buf as *mut u8, count);
        match blocking::read(fd, slice, table().read_timeout(fd)) {
            Ok(n) => n as isize,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    } else {
        real_symbol!("read", ReadFn)(fd, buf, count)
    }
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: usize) -> isize {
    if is_hooked(fd) {
        let slice = std::slice::from_raw_parts(buf as *const u8, count);
        match blocking::write(fd, slice, table().write_timeout(fd)) {
            Ok(n) => n as isize,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    } else {
        real_symbol!("write", WriteFn)(fd, buf, count)
    }
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    fd: c_int,
    addr: *const libc::sockaddr,
    addr_len: libc::socklen_t,
) -> c_int {
    if is_hooked(fd) {
        match blocking::connect(fd, addr, addr_len, table().write_timeout(fd)) {
            Ok(()) => 0,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    } else {
        real_symbol!("connect", ConnectFn)(fd, addr, addr_len)
    }
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, count: usize, flags: c_int) -> isize {
    if is_hooked(fd) {
        let slice = std::slice::from_raw_parts(buf as *const u8, count);
        match blocking::send(fd, slice, flags, table().write_timeout(fd)) {
            Ok(n) => n as isize,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    } else {
        real_symbol!("send", SendFn)(fd, buf, count, flags)
    }
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, count: usize, flags: c_int) -> isize {
    if is_hooked(fd) {
        let slice = std::slice::from_raw_parts_mut(buf as *mut u8, count);
        match blocking::recv(fd, slice, flags, table().read_timeout(fd)) {
            Ok(n) => n as isize,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    } else {
        real_symbol!("recv", RecvFn)(fd, buf, count, flags)
    }
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    count: usize,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addr_len: libc::socklen_t,
) -> isize {
    if is_hooked(fd) {
        let slice = std::slice::from_raw_parts(buf as *const u8, count);
        match blocking::sendto(fd, slice, flags, dest_addr, addr_len, table().write_timeout(fd)) {
            Ok(n) => n as isize,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    } else {
        real_symbol!("sendto", SendtoFn)(fd, buf, count, flags, dest_addr, addr_len)
    }
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    count: usize,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addr_len: *mut libc::socklen_t,
) -> isize {
    if is_hooked(fd) {
        let slice = std::slice::from_raw_parts_mut(buf as *mut u8, count);
        match blocking::recvfrom(fd, slice, flags, src_addr, addr_len, table().read_timeout(fd)) {
            Ok(n) => n as isize,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    } else {
        real_symbol!("recvfrom", RecvfromFn)(fd, buf, count, flags, src_addr, addr_len)
    }
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` are captured into the hook-fd table
/// instead of reaching the kernel: the underlying fd is always
/// non-blocking, so a kernel-level socket timeout would never fire the
/// way the application expects. Every other option passes straight
/// through.
#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> c_int {
    let real: SetsockoptFn = real_symbol!("setsockopt", SetsockoptFn);
    if level == libc::SOL_SOCKET
        && table().is_in_use(fd)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        let tv = *(optval as *const libc::timeval);
        let ms = (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000;
        table().set_timeout(fd, optname == libc::SO_RCVTIMEO, ms);
        return 0;
    }
    real(fd, level, optname, optval, optlen)
}

/// Only `F_SETFL` touching `O_NONBLOCK` is special-cased: we record the
/// application's intent but never actually clear the kernel-level
/// non-blocking flag our `socket()` hook set.
#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    let real: FcntlFn = real_symbol!("fcntl", FcntlFn);
    if cmd == libc::F_SETFL && table().is_in_use(fd) {
        let wants_nonblock = (arg as c_int) & libc::O_NONBLOCK != 0;
        table().set_user_nonblock(fd, wants_nonblock);
        return real(fd, cmd, arg | libc::O_NONBLOCK as c_long);
    }
    real(fd, cmd, arg)
}

/// `FIONBIO` is the `ioctl`-based equivalent of `fcntl(F_SETFL,
/// O_NONBLOCK)`; handled the same way, and never reaches the real
/// syscall for an in-use fd since there is nothing left for the kernel
/// to change.
#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    let real: IoctlFn = real_symbol!("ioctl", IoctlFn);
    if request == libc::FIONBIO as c_ulong && table().is_in_use(fd) {
        let wants_nonblock = if arg.is_null() {
            false
        } else {
            *(arg as *const c_int) != 0
        };
        table().set_user_nonblock(fd, wants_nonblock);
        return 0;
    }
    real(fd, request, arg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_fd_slots_default_to_not_in_use() {
        let t = HookTable::new();
        assert!(!t.is_in_use(3));
        assert!(!t.should_intercept(3));
    }

    #[test]
    fn mark_in_use_then_clear_round_trips() {
        let t = HookTable::new();
        t.mark_in_use(5);
        assert!(t.is_in_use(5));
        assert!(t.should_intercept(5));

        t.set_user_nonblock(5, true);
        assert!(t.is_in_use(5));
        assert!(!t.should_intercept(5), "user-requested nonblock opts the fd out of parking");

        t.clear(5);
        assert!(!t.is_in_use(5));
    }

    #[test]
    fn per_fd_timeouts_default_then_override() {
        let t = HookTable::new();
        t.mark_in_use(9);
        assert_eq!(t.read_timeout(9), blocking::DEFAULT_TIMEOUT_MS);
        t.set_timeout(9, true, 250);
        assert_eq!(t.read_timeout(9), 250);
        assert_eq!(t.write_timeout(9), blocking::DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn out_of_range_fds_are_inert() {
        let t = HookTable::new();
        t.mark_in_use(-1);
        assert!(!t.is_in_use(-1));
        t.mark_in_use(i32::MAX);
        assert!(!t.is_in_use(i32::MAX));
    }

    #[test]
    fn disabled_hook_passes_an_in_use_fd_through() {
        let t = HookTable::new();
        t.mark_in_use(7);
        assert!(t.should_intercept(7), "fd bookkeeping alone still says intercept");

        assert!(!gate(false, &t, 7), "hook-enable off must override in-use bookkeeping");
        assert!(gate(true, &t, 7), "hook-enable on restores the per-fd decision");
    }
}
