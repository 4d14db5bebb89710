//! Real `bpf(2)` backend
//!
//! All unsafe code talking to the kernel is isolated in [`sys_bpf`] and
//! [`LinuxBpf::close`].

use crate::{BpfSyscall, Command, Errno, MapCreateAttr, MapUpdateBatchAttr, ProgLoadAttr};
use core::mem;

/// Backend issuing the `bpf(2)` system call
///
/// ## Safety
///
/// The attribute blocks handed to the kernel only contain addresses of
/// buffers borrowed for the duration of the call (see [`crate::Pointer`]),
/// so the kernel never reads or writes freed memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxBpf;

impl LinuxBpf {
    /// Creates the backend
    pub fn new() -> Self {
        Self
    }
}

fn sys_bpf<T>(cmd: Command, attr: &mut T) -> Result<u32, Errno> {
    loop {
        // SAFETY: `attr` is a live, exclusively borrowed `#[repr(C)]` block
        // whose size is passed alongside it, and every pointer it contains
        // is tied to a buffer that outlives this call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                cmd as libc::c_int,
                attr as *mut T as *mut libc::c_void,
                mem::size_of::<T>() as libc::c_uint,
            )
        };
        if ret >= 0 {
            return Ok(ret as u32);
        }

        let errno = Errno::last();
        if errno != Errno::EINTR {
            return Err(errno);
        }
    }
}

impl BpfSyscall for LinuxBpf {
    fn map_create(&self, attr: &MapCreateAttr) -> Result<u32, Errno> {
        let mut attr = *attr;
        sys_bpf(Command::MapCreate, &mut attr)
    }

    fn prog_load(&self, attr: &mut ProgLoadAttr<'_>) -> Result<u32, Errno> {
        sys_bpf(Command::ProgLoad, attr)
    }

    fn map_update_batch(&self, attr: &mut MapUpdateBatchAttr<'_>) -> Result<(), Errno> {
        sys_bpf(Command::MapUpdateBatch, attr).map(|_| ())
    }

    fn close(&self, fd: u32) -> Result<(), Errno> {
        // SAFETY: `fd` was returned by the kernel for a request made through
        // this backend and is owned by exactly one `Fd`.
        let ret = unsafe { libc::close(fd as libc::c_int) };
        if ret < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}
