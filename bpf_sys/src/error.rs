//! Raw kernel error codes

use core::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A raw error code returned by a kernel request
///
/// Values follow the Linux numbering, including the kernel-internal
/// `ENOTSUPP` (524) which leaks out of the program/map subsystem.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(transparent)]
#[error("{} (errno {})", describe(.0), .0)]
pub struct Errno(i32);

impl Errno {
    pub const EPERM: Errno = Errno(1);
    pub const ENOENT: Errno = Errno(2);
    pub const EINTR: Errno = Errno(4);
    pub const E2BIG: Errno = Errno(7);
    pub const EBADF: Errno = Errno(9);
    pub const EAGAIN: Errno = Errno(11);
    pub const ENOMEM: Errno = Errno(12);
    pub const EACCES: Errno = Errno(13);
    pub const EFAULT: Errno = Errno(14);
    pub const EEXIST: Errno = Errno(17);
    pub const EINVAL: Errno = Errno(22);
    pub const ENOSPC: Errno = Errno(28);
    pub const EOPNOTSUPP: Errno = Errno(95);
    pub const ENOTSUPP: Errno = Errno(524);

    /// Creates an errno from its raw value
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Reads the calling thread's last OS error
    pub fn last() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

fn describe(raw: &i32) -> &'static str {
    match Errno(*raw) {
        Errno::EPERM => "operation not permitted",
        Errno::ENOENT => "no such file or directory",
        Errno::EINTR => "interrupted system call",
        Errno::E2BIG => "argument list too long",
        Errno::EBADF => "bad file descriptor",
        Errno::EAGAIN => "resource temporarily unavailable",
        Errno::ENOMEM => "cannot allocate memory",
        Errno::EACCES => "permission denied",
        Errno::EFAULT => "bad address",
        Errno::EEXIST => "file exists",
        Errno::EINVAL => "invalid argument",
        Errno::ENOSPC => "no space left on device",
        Errno::EOPNOTSUPP => "operation not supported",
        Errno::ENOTSUPP => "operation not supported by the kernel",
        _ => "unknown error",
    }
}
