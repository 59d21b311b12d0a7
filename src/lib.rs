// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! # micro_thread
//!
//! A cooperative, stackful-coroutine scheduler with a transparent
//! syscall hook: application code written against plain synchronous
//! sockets runs unmodified on top of an `epoll`-driven event loop,
//! because `read`/`write`/`send`/`recv`/`connect` (and friends) are
//! intercepted and rewritten into "arm interest, park the coroutine,
//! resume on readiness" without the application ever calling
//! non-blocking APIs itself.
//!
//! Each hosting OS thread owns exactly one scheduler for its whole
//! life; coroutines never migrate between threads once spawned (see
//! `Config::set_thread_num`). Cross-thread distribution is the
//! embedder's problem to divide at spawn time, same as a thread-per-core
//! server divides listening sockets.
//!
//! # Features
//!
//! ```norust
//! * stackful coroutines over a guard-paged stack (see `spawn`)
//! * a raw epoll readiness multiplexer, not `mio` (see `epoll`)
//! * an `LD_PRELOAD`-able syscall hook for unmodified synchronous code
//!   (see `hook`, enabled by building this crate as a `cdylib`)
//! * a hashed timing wheel for O(1) deadline scheduling (see `timer`)
//! * typed error categories and process-wide counters (see `error`,
//!   `metrics`)
//! * a read-only view over the load-balancing agent's shared-memory
//!   policy table (see `shm`)
//! ```
//!
//! # Example
//!
//! See `demos/echo.rs` for a TCP echo server built directly against the
//! coroutine API (no `LD_PRELOAD` involved).

#![warn(missing_docs)]

use std::sync::Arc;

use log::info;

mod coroutine;
mod epoll;
mod hook;
mod scheduler;
mod thread;
mod timer;

/// Blocking-style socket and timer primitives for coroutines that use
/// this crate's API directly, without going through the syscall hook.
pub mod io;
/// Typed error categories the runtime distinguishes.
pub mod error;
/// Process-wide instrumentation counters.
pub mod metrics;
/// Read-only view over the load-balancing agent's shared-memory policy
/// table.
pub mod shm;

pub use coroutine::ExitStatus;
pub use error::{HookError, IoError};

/// Runtime instance builder.
///
/// Mirrors the shape of `Pursuit92-mioco`'s `Config` (a `&mut Self`
/// setter chain defaulting from `num_cpus::get()`), simplified: there is
/// no pluggable `Scheduler` trait or `mio::EventLoopConfig` to thread
/// through, since every hosting thread's scheduler is this crate's own
/// and unconfigurable beyond stack size and epoll capacity.
pub struct Config {
    thread_num: usize,
    stack_size: usize,
    epoll_capacity: usize,
}

impl Config {
    /// A `Config` defaulting to one hosting thread per CPU, a 128KiB
    /// coroutine stack, and room for 1024 simultaneously-registered fds
    /// per thread.
    pub fn new() -> Self {
        Config {
            thread_num: num_cpus::get(),
            stack_size: coroutine::DEFAULT_STACK_BYTES,
            epoll_capacity: 1024,
        }
    }

    /// Number of hosting OS threads, each with its own independent
    /// scheduler. Default: one per CPU.
    pub fn set_thread_num(&mut self, thread_num: usize) -> &mut Self {
        self.thread_num = thread_num;
        self
    }

    /// Default stack size for spawned coroutines, in bytes. Should be a
    /// power of two; the sane minimum is 128KiB (two 64KiB pages) once
    /// the guard page is accounted for.
    ///
    /// # Safety
    /// Too small a stack will segfault a coroutine that recurses or
    /// allocates more than it has room for.
    pub unsafe fn set_stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    /// Initial capacity of each hosting thread's epoll event buffer and
    /// fd-reference table. Not a hard ceiling: the underlying
    /// collections grow past it, this just sizes the first allocation.
    pub fn set_epoll_capacity(&mut self, capacity: usize) -> &mut Self {
        self.epoll_capacity = capacity;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

/// A running (or about-to-run) micro_thread instance: `Config::thread_num`
/// independent hosting threads, each with its own scheduler, each
/// running its own copy of the root closure passed to [`Runtime::start`].
pub struct Runtime {
    config: Config,
}

impl Runtime {
    /// A `Runtime` with default configuration.
    pub fn new() -> Self {
        Runtime::new_configured(Config::new())
    }

    /// A `Runtime` with the given configuration.
    pub fn new_configured(config: Config) -> Self {
        Runtime { config }
    }

    /// Run `f` as the root coroutine on every hosting thread, blocking
    /// the calling thread until every hosting thread's scheduler has run
    /// out of coroutines (for a server whose root coroutine loops
    /// forever on `accept`, that means forever).
    ///
    /// `f` runs once per hosting thread, independently — there is no
    /// shared state between the copies beyond what `f` itself captures
    /// (e.g. an `Arc`'d listening socket for `SO_REUSEPORT`-style
    /// thread-per-core fan-out).
    pub fn start<F>(&mut self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        info!(
            "starting micro_thread runtime with {} hosting threads",
            self.config.thread_num
        );
        // Flip the process-wide hook-enable flag before any hosting
        // thread's scheduler starts running: from this point on, a
        // hooked syscall on any thread is guaranteed to find a running
        // scheduler to park against.
        hook::enable_hook();
        let f = Arc::new(f);
        let mut joins = Vec::with_capacity(self.config.thread_num.saturating_sub(1));

        for i in 1..self.config.thread_num {
            let f = f.clone();
            let stack_size = self.config.stack_size;
            let epoll_capacity = self.config.epoll_capacity;
            let join = thread::spawn_hosting_thread(
                format!("micro_thread_{}", i),
                stack_size,
                epoll_capacity,
                move || f(),
            )
            .unwrap_or_else(|err| panic!("couldn't spawn hosting thread {}: {}", i, err));
            joins.push(join);
        }

        // Thread 0 runs on the caller's own stack rather than a spawned
        // one, so `start()` blocks its caller the same way a plain
        // single-threaded event loop would.
        let mut scheduler = scheduler_for(&self.config);
        {
            let f = f.clone();
            scheduler.spawn(self.config.stack_size, move || f());
        }
        scheduler.run_until_empty();

        for join in joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

fn scheduler_for(config: &Config) -> scheduler::Scheduler {
    scheduler::Scheduler::new(config.epoll_capacity)
        .expect("failed to initialize the readiness multiplexer")
}

/// Start a micro_thread runtime with default configuration (one hosting
/// thread per CPU) and block until it's done. Shorthand for
/// `Runtime::new().start(f)`.
pub fn start<F>(f: F)
where
    F: Fn() + Send + Sync + 'static,
{
    Runtime::new().start(f);
}

/// Start a micro_thread runtime with a specific hosting thread count.
/// Shorthand for `Runtime::new_configured` with `set_thread_num`.
pub fn start_threads<F>(thread_num: usize, f: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let mut config = Config::new();
    config.set_thread_num(thread_num);
    Runtime::new_configured(config).start(f);
}

/// Spawn a new coroutine on the scheduler driving the calling coroutine.
///
/// # Panics
/// Panics if called from outside a running coroutine — unlike
/// `Pursuit92-mioco`'s `spawn()`, this never falls back to starting a
/// whole new runtime on a fresh thread; there is no implicit
/// "background instance" in this hosting model.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + 'static,
{
    scheduler::with_current(|s| {
        s.spawn(coroutine::DEFAULT_STACK_BYTES, f);
    });
}

/// Cooperatively suspend the calling coroutine for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    io::sleep_ms(ms);
}

/// Yield the remainder of the current scheduling slice. The coroutine is
/// immediately runnable again, after every other currently-runnable
/// coroutine gets a turn.
pub fn yield_now() {
    io::yield_now();
}

/// A TCP listener bound and accepted through the coroutine scheduler
/// instead of blocking the hosting thread.
pub mod tcp {
    use std::io;
    use std::net::SocketAddr;
    use std::os::unix::io::{AsRawFd, FromRawFd};

    use crate::io as blocking;
    use crate::scheduler;

    /// A coroutine-aware TCP stream. Every read/write parks the calling
    /// coroutine instead of blocking the hosting thread.
    pub struct TcpStream {
        inner: std::net::TcpStream,
    }

    impl TcpStream {
        /// Connect, completing asynchronously under the hood.
        pub fn connect(addr: SocketAddr) -> io::Result<Self> {
            let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
            let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

            let (sockaddr, len) = sockaddr_from(addr);
            blocking::connect(fd, &sockaddr as *const _ as *const libc::sockaddr, len, blocking::DEFAULT_TIMEOUT_MS)
                .map_err(|e| {
                    unsafe { libc::close(fd) };
                    e
                })?;

            let inner = unsafe { std::net::TcpStream::from_raw_fd(fd) };
            Ok(TcpStream { inner })
        }

        fn from_accepted(inner: std::net::TcpStream) -> io::Result<Self> {
            let fd = inner.as_raw_fd();
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(TcpStream { inner })
        }

        /// Read into `buf`, parking the calling coroutine until data
        /// arrives, the peer hangs up, or `timeout_ms` elapses.
        pub fn read(&mut self, buf: &mut [u8], timeout_ms: u64) -> io::Result<usize> {
            blocking::read(self.inner.as_raw_fd(), buf, timeout_ms)
        }

        /// Write all of `buf`, parking as needed (see
        /// [`blocking::write`]'s short-write-on-timeout behavior).
        pub fn write(&mut self, buf: &[u8], timeout_ms: u64) -> io::Result<usize> {
            blocking::write(self.inner.as_raw_fd(), buf, timeout_ms)
        }
    }

    impl Drop for TcpStream {
        fn drop(&mut self) {
            scheduler::try_with_current(|s| s.epoll.remove(self.inner.as_raw_fd()));
        }
    }

    /// A coroutine-aware TCP listener.
    pub struct TcpListener {
        inner: std::net::TcpListener,
    }

    impl TcpListener {
        /// Bind and listen, setting the listening fd non-blocking.
        pub fn bind(addr: SocketAddr) -> io::Result<Self> {
            let inner = std::net::TcpListener::bind(addr)?;
            inner.set_nonblocking(true)?;
            Ok(TcpListener { inner })
        }

        /// The address actually bound, useful when `bind` was given port 0.
        pub fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }

        /// Accept a connection, parking the calling coroutine while none
        /// is pending. Unlike the data-path primitives in `crate::io`,
        /// `accept` never times out — callers that want a bounded wait
        /// should race it against [`crate::sleep_ms`] in a sibling
        /// coroutine instead (see `SPEC_FULL.md` §9: `accept` stays
        /// pass-through, unconverted).
        pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            loop {
                match self.inner.accept() {
                    Ok((stream, addr)) => return Ok((TcpStream::from_accepted(stream)?, addr)),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        let fd = self.inner.as_raw_fd();
                        let read = crate::epoll::Interest::read();
                        scheduler::with_current(|s| s.epoll.ctrl_add(fd, read))?;
                        let id = scheduler::current_coroutine_id();
                        scheduler::with_current(|s| s.epoll.set_notify(fd, id))
                            .expect("listening fd already parked on a different coroutine");
                        scheduler::with_current(|s| {
                            s.park_current(crate::coroutine::Status::IoWait, true, false, None)
                        });
                        scheduler::with_current(|s| s.epoll.clear_notify(fd));
                        scheduler::with_current(|s| s.epoll.ctrl_del(fd, read, true));
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    impl Drop for TcpListener {
        fn drop(&mut self) {
            scheduler::try_with_current(|s| s.epoll.remove(self.inner.as_raw_fd()));
        }
    }

    fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_in, libc::socklen_t) {
        match addr {
            SocketAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                (sa, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            SocketAddr::V6(_) => panic!("IPv6 not supported by this minimal TCP helper"),
        }
    }
}
