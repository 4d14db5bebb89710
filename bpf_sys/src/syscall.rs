//! Backend trait, client and owned handles

use crate::{Errno, MapCreateAttr, MapUpdateBatchAttr, ProgLoadAttr};
use core::fmt;
use std::sync::Arc;

/// The kernel request boundary
///
/// Each method submits one attribute block and returns the kernel's answer
/// unmodified. Multiple implementations are possible:
/// - Real kernel (the `bpf(2)` system call)
/// - Simulated kernel (for testing)
///
/// Requests are synchronous. Implementations hold no locks across calls
/// that callers can observe, so one backend may be shared by any number of
/// threads.
pub trait BpfSyscall: Send + Sync {
    /// Creates a map and returns its raw handle
    fn map_create(&self, attr: &MapCreateAttr) -> Result<u32, Errno>;

    /// Verifies and loads a program and returns its raw handle
    fn prog_load(&self, attr: &mut ProgLoadAttr<'_>) -> Result<u32, Errno>;

    /// Creates or updates `attr.count` elements
    ///
    /// On return `attr.count` holds the number of processed elements, also
    /// when the request fails part-way.
    fn map_update_batch(&self, attr: &mut MapUpdateBatchAttr<'_>) -> Result<(), Errno>;

    /// Releases a raw handle
    fn close(&self, fd: u32) -> Result<(), Errno>;
}

/// Cloneable entry point for kernel requests
///
/// Wraps a shared backend and hands out owned [`Fd`]s, so every object a
/// request creates is released exactly once.
#[derive(Clone)]
pub struct SyscallClient {
    backend: Arc<dyn BpfSyscall>,
    host: bool,
}

impl SyscallClient {
    /// Creates a client over an existing backend
    pub fn new(backend: Arc<dyn BpfSyscall>) -> Self {
        Self {
            backend,
            host: false,
        }
    }

    /// Creates a client issuing real system calls
    #[cfg(target_os = "linux")]
    pub fn linux() -> Self {
        Self {
            backend: Arc::new(crate::LinuxBpf::new()),
            host: true,
        }
    }

    /// Whether requests go to the running kernel
    pub fn is_host(&self) -> bool {
        self.host
    }

    /// Submits `BPF_MAP_CREATE`
    pub fn map_create(&self, attr: &MapCreateAttr) -> Result<Fd, Errno> {
        let raw = self.backend.map_create(attr)?;
        Ok(Fd::new(raw, Arc::clone(&self.backend)))
    }

    /// Submits `BPF_PROG_LOAD`
    pub fn prog_load(&self, attr: &mut ProgLoadAttr<'_>) -> Result<Fd, Errno> {
        let raw = self.backend.prog_load(attr)?;
        Ok(Fd::new(raw, Arc::clone(&self.backend)))
    }

    /// Submits `BPF_MAP_UPDATE_BATCH`
    pub fn map_update_batch(&self, attr: &mut MapUpdateBatchAttr<'_>) -> Result<(), Errno> {
        self.backend.map_update_batch(attr)
    }
}

impl fmt::Debug for SyscallClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallClient")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// An owned kernel handle
///
/// The handle is released when the `Fd` is dropped. Use [`Fd::close`] to
/// observe the result of releasing it.
pub struct Fd {
    raw: Option<u32>,
    backend: Arc<dyn BpfSyscall>,
}

impl Fd {
    fn new(raw: u32, backend: Arc<dyn BpfSyscall>) -> Self {
        Self {
            raw: Some(raw),
            backend,
        }
    }

    /// Returns the raw handle value
    pub fn raw(&self) -> u32 {
        self.raw.unwrap_or(u32::MAX)
    }

    /// Releases the handle and reports the result
    pub fn close(mut self) -> Result<(), Errno> {
        match self.raw.take() {
            Some(raw) => self.backend.close(raw),
            None => Ok(()),
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            let _ = self.backend.close(raw);
        }
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fd({})", self.raw())
    }
}
