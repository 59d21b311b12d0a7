//! Typed error categories distinguished by the runtime (see spec §7).
//!
//! `would-block` is deliberately not a variant here: it is an internal,
//! transient retry signal inside [`crate::io`] and must never reach a
//! caller.

use thiserror::Error;

/// Failures raised by the readiness multiplexer proxy and the fd tables
/// it drives (component D).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
    /// No fd-reference (or hook-fd) record exists for this descriptor.
    #[error("no fd record for fd {0}")]
    UnknownFd(i32),

    /// `epoll_ctl` failed with an errno outside the benign allow-list
    /// (`EEXIST` on add, `ENOENT` on delete are swallowed, not surfaced).
    #[error("kernel event channel rejected fd {0}: errno {1}")]
    Kernel(i32, i32),

    /// Two different waiters tried to claim the same fd-reference's
    /// notify slot without detaching the previous holder first.
    #[error("fd {0} notify slot already held by a different waiter")]
    Conflict(i32),
}

/// Failures surfaced to callers of the blocking-style socket primitives
/// (component E), carrying enough information to set the caller's errno.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The per-direction deadline fired before the operation completed.
    #[error("timed out waiting for readiness")]
    TimedOut,

    /// The kernel reported `EPOLLERR | EPOLLHUP`; `.0` is the error read
    /// back via `getsockopt(SO_ERROR)` (for `connect`) or the errno of the
    /// failed data operation.
    #[error("peer hung up (errno {0})")]
    HangUp(i32),
}

impl IoError {
    /// The errno an application expects to find in `errno` after a
    /// hooked call fails with this error.
    pub fn to_errno(self) -> i32 {
        match self {
            IoError::TimedOut => libc::ETIMEDOUT,
            IoError::HangUp(errno) => errno,
        }
    }
}

impl From<HookError> for std::io::Error {
    fn from(e: HookError) -> std::io::Error {
        match e {
            HookError::UnknownFd(_) | HookError::Conflict(_) => {
                std::io::Error::new(std::io::ErrorKind::Other, e)
            }
            HookError::Kernel(_, errno) => std::io::Error::from_raw_os_error(errno),
        }
    }
}

impl From<IoError> for std::io::Error {
    fn from(e: IoError) -> std::io::Error {
        match e {
            IoError::TimedOut => std::io::Error::new(std::io::ErrorKind::TimedOut, e),
            IoError::HangUp(_) => std::io::Error::new(std::io::ErrorKind::Other, e),
        }
    }
}
