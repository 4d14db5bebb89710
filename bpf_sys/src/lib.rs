//! # Kernel Request Boundary
//!
//! This crate defines the interface between the loader and the kernel's
//! program/map subsystem.
//!
//! ## Philosophy
//!
//! The kernel understands fixed-layout attribute blocks and answers with a
//! handle or a raw error code. This crate models exactly that and nothing
//! more:
//! - Attribute blocks are `#[repr(C)]` and match the kernel's layout
//! - Variable-length fields are pointer/count pairs tied to borrowed buffers
//! - Errors are raw [`Errno`] values; classification happens one layer up
//!
//! ## Backends
//!
//! [`BpfSyscall`] can be implemented many ways:
//! - [`LinuxBpf`] issues the real system call (Linux only)
//! - `sim_bpf_kernel::SimulatedKernel` runs in-process for tests

pub mod attr;
pub mod error;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod syscall;
pub mod types;

pub use attr::{
    Command, MapCreateAttr, MapUpdateBatchAttr, ObjName, Pointer, ProgLoadAttr, BPF_ANY,
    BPF_EXIST, BPF_F_INNER_MAP, BPF_F_MMAPABLE, BPF_F_NO_PREALLOC, BPF_F_RDONLY_PROG,
    BPF_F_WRONLY_PROG, BPF_NOEXIST, BPF_OBJ_NAME_LEN,
};
pub use error::Errno;
#[cfg(target_os = "linux")]
pub use linux::LinuxBpf;
pub use syscall::{BpfSyscall, Fd, SyscallClient};
pub use types::{MapType, ProgramType};
