//! Fixed-layout attribute blocks
//!
//! Each block mirrors the part of the kernel's `bpf_attr` union used by one
//! command. Field order and widths must not change: the kernel reads these
//! structures byte for byte and rejects non-zero bytes it does not know.

use core::ffi::CStr;
use core::fmt;
use core::marker::PhantomData;
use serde::{Deserialize, Serialize};

/// Width of the kernel's object name field, including the terminating NUL
pub const BPF_OBJ_NAME_LEN: usize = 16;

/// Do not preallocate hash map entries
pub const BPF_F_NO_PREALLOC: u32 = 1 << 0;
/// Programs may only read the map
pub const BPF_F_RDONLY_PROG: u32 = 1 << 7;
/// Programs may only write the map
pub const BPF_F_WRONLY_PROG: u32 = 1 << 8;
/// Map memory may be mapped into user space
pub const BPF_F_MMAPABLE: u32 = 1 << 10;
/// Map is only used as an inner map template
pub const BPF_F_INNER_MAP: u32 = 1 << 12;

/// Create or update an element
pub const BPF_ANY: u64 = 0;
/// Create an element only if it does not exist
pub const BPF_NOEXIST: u64 = 1;
/// Update an element only if it exists
pub const BPF_EXIST: u64 = 2;

/// Commands understood by the kernel request boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Command {
    MapCreate = 0,
    ProgLoad = 5,
    MapUpdateBatch = 26,
}

/// A user-space address handed to the kernel
///
/// The lifetime ties the address to the buffer it was taken from, so an
/// attribute block can never outlive the data it points at.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Pointer<'a> {
    addr: u64,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> Pointer<'a> {
    /// The null pointer
    pub const fn null() -> Self {
        Self {
            addr: 0,
            _marker: PhantomData,
        }
    }

    /// Points at the first element of `slice`
    pub fn from_slice<T>(slice: &'a [T]) -> Self {
        Self {
            addr: slice.as_ptr() as usize as u64,
            _marker: PhantomData,
        }
    }

    /// Points at the first element of a buffer the kernel may write to
    pub fn from_mut_slice<T>(slice: &'a mut [T]) -> Self {
        Self {
            addr: slice.as_mut_ptr() as usize as u64,
            _marker: PhantomData,
        }
    }

    /// Points at a NUL-terminated string
    pub fn from_cstr(s: &'a CStr) -> Self {
        Self {
            addr: s.as_ptr() as usize as u64,
            _marker: PhantomData,
        }
    }

    /// Returns the raw address
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Whether this is the null pointer
    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Reads `len` elements starting at this address
    ///
    /// # Safety
    ///
    /// The pointer must have been created from a slice of `T` holding at
    /// least `len` elements. Lengths come from the attribute block's count
    /// fields, so the caller must trust that the block was filled in
    /// consistently.
    pub unsafe fn as_slice<T>(&self, len: usize) -> &'a [T] {
        if self.is_null() || len == 0 {
            return &[];
        }
        // SAFETY: upheld by the caller, see above.
        unsafe { core::slice::from_raw_parts(self.addr as usize as *const T, len) }
    }

    /// Reads the NUL-terminated string at this address
    ///
    /// # Safety
    ///
    /// The pointer must have been created with [`Pointer::from_cstr`].
    pub unsafe fn as_cstr(&self) -> Option<&'a CStr> {
        if self.is_null() {
            return None;
        }
        // SAFETY: upheld by the caller, see above.
        Some(unsafe { CStr::from_ptr(self.addr as usize as *const core::ffi::c_char) })
    }
}

impl fmt::Debug for Pointer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pointer({:#x})", self.addr)
    }
}

/// A fixed-width, NUL-terminated object name
///
/// Longer names are truncated, never rejected.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ObjName([u8; BPF_OBJ_NAME_LEN]);

impl ObjName {
    /// Copies at most `BPF_OBJ_NAME_LEN - 1` bytes of `name`
    pub fn new(name: &str) -> Self {
        let mut raw = [0u8; BPF_OBJ_NAME_LEN];
        let len = name.len().min(BPF_OBJ_NAME_LEN - 1);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(raw)
    }

    /// Returns the raw field
    pub fn as_bytes(&self) -> &[u8; BPF_OBJ_NAME_LEN] {
        &self.0
    }

    /// Returns the name up to the first NUL
    ///
    /// A multi-byte character split by truncation is dropped.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(BPF_OBJ_NAME_LEN);
        let bytes = &self.0[..end];
        match core::str::from_utf8(bytes) {
            Ok(name) => name,
            Err(err) => core::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or_default(),
        }
    }

    /// Whether no name is set
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl fmt::Debug for ObjName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjName({:?})", self.as_str())
    }
}

/// Attributes of `BPF_MAP_CREATE`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MapCreateAttr {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub inner_map_fd: u32,
    pub numa_node: u32,
    pub map_name: ObjName,
    pub map_ifindex: u32,
    pub btf_fd: u32,
    pub btf_key_type_id: u32,
    pub btf_value_type_id: u32,
    pub btf_vmlinux_value_type_id: u32,
    pub map_extra: u64,
}

/// Attributes of `BPF_PROG_LOAD`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgLoadAttr<'a> {
    pub prog_type: u32,
    pub insn_cnt: u32,
    pub insns: Pointer<'a>,
    pub license: Pointer<'a>,
    pub log_level: u32,
    pub log_size: u32,
    pub log_buf: Pointer<'a>,
    pub kern_version: u32,
    pub prog_flags: u32,
    pub prog_name: ObjName,
    pub prog_ifindex: u32,
    pub expected_attach_type: u32,
    pub prog_btf_fd: u32,
    pub func_info_rec_size: u32,
    pub func_info: Pointer<'a>,
    pub func_info_cnt: u32,
    pub line_info_rec_size: u32,
    pub line_info: Pointer<'a>,
    pub line_info_cnt: u32,
    pub attach_btf_id: u32,
    pub attach_prog_fd: u32,
    pub core_relo_cnt: u32,
}

/// Attributes of `BPF_MAP_UPDATE_BATCH`
///
/// The kernel writes back the number of processed elements into `count`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MapUpdateBatchAttr<'a> {
    pub in_batch: Pointer<'a>,
    pub out_batch: Pointer<'a>,
    pub keys: Pointer<'a>,
    pub values: Pointer<'a>,
    pub count: u32,
    pub map_fd: u32,
    pub elem_flags: u64,
    pub flags: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_map_create_layout() {
        assert_eq!(offset_of!(MapCreateAttr, map_name), 28);
        assert_eq!(offset_of!(MapCreateAttr, map_ifindex), 44);
        assert_eq!(offset_of!(MapCreateAttr, map_extra), 64);
        assert_eq!(size_of::<MapCreateAttr>(), 72);
    }

    #[test]
    fn test_prog_load_layout() {
        assert_eq!(offset_of!(ProgLoadAttr<'static>, insns), 8);
        assert_eq!(offset_of!(ProgLoadAttr<'static>, prog_name), 48);
        assert_eq!(offset_of!(ProgLoadAttr<'static>, func_info), 80);
        assert_eq!(offset_of!(ProgLoadAttr<'static>, func_info_cnt), 88);
        assert_eq!(offset_of!(ProgLoadAttr<'static>, attach_prog_fd), 112);
        assert_eq!(size_of::<ProgLoadAttr<'static>>(), 120);
    }

    #[test]
    fn test_map_update_batch_layout() {
        assert_eq!(offset_of!(MapUpdateBatchAttr<'static>, count), 32);
        assert_eq!(offset_of!(MapUpdateBatchAttr<'static>, map_fd), 36);
        assert_eq!(size_of::<MapUpdateBatchAttr<'static>>(), 56);
    }

    #[test]
    fn test_obj_name_truncates() {
        let name = ObjName::new("a_name_that_is_far_too_long");
        assert_eq!(name.as_str(), "a_name_that_is_");
        assert_eq!(name.as_bytes()[BPF_OBJ_NAME_LEN - 1], 0);
    }

    #[test]
    fn test_obj_name_empty() {
        assert!(ObjName::new("").is_empty());
        assert!(ObjName::default().is_empty());
        assert!(!ObjName::new("x").is_empty());
    }

    #[test]
    fn test_pointer_round_trip() {
        let data = [1u32, 2, 3];
        let ptr = Pointer::from_slice(&data);
        assert!(!ptr.is_null());
        let read: &[u32] = unsafe { ptr.as_slice(3) };
        assert_eq!(read, &data);

        let empty: &[u32] = unsafe { Pointer::null().as_slice(4) };
        assert!(empty.is_empty());
    }
}
