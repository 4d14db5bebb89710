//! The kernel request gateway
//!
//! [`Kernel`] turns typed requests into attribute blocks, gates optional
//! features on their probes and translates raw error codes into [`Error`]
//! kinds callers can act on.

use crate::features::Features;
use crate::linker::relocated;
use crate::prog::{Program, ProgramSpec};
use crate::{Error, NotSupported};
use bpf_asm::{marshal, Endian, Instruction, INSTRUCTION_SIZE};
use bpf_sys::{
    Errno, Fd, MapCreateAttr, MapType, MapUpdateBatchAttr, ObjName, Pointer, ProgLoadAttr,
    ProgramType, SyscallClient, BPF_F_INNER_MAP, BPF_F_MMAPABLE, BPF_F_NO_PREALLOC,
    BPF_F_RDONLY_PROG, BPF_F_WRONLY_PROG,
};
use core::ops::BitOr;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Kernel> = OnceLock::new();
static HOST_FEATURES: OnceLock<Arc<Features>> = OnceLock::new();

/// Flags of a map, as understood by `BPF_MAP_CREATE`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapFlags(u32);

impl MapFlags {
    pub const NO_PREALLOC: MapFlags = MapFlags(BPF_F_NO_PREALLOC);
    pub const RDONLY_PROG: MapFlags = MapFlags(BPF_F_RDONLY_PROG);
    pub const WRONLY_PROG: MapFlags = MapFlags(BPF_F_WRONLY_PROG);
    pub const MMAPABLE: MapFlags = MapFlags(BPF_F_MMAPABLE);
    pub const INNER_MAP: MapFlags = MapFlags(BPF_F_INNER_MAP);

    pub const fn empty() -> Self {
        MapFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether any flag of `other` is set
    pub const fn intersects(self, other: MapFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for MapFlags {
    type Output = MapFlags;

    fn bitor(self, rhs: MapFlags) -> MapFlags {
        MapFlags(self.0 | rhs.0)
    }
}

/// A map that has not been created yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    #[serde(default)]
    pub flags: MapFlags,
}

impl MapSpec {
    pub fn new(map_type: MapType, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        Self {
            name: String::new(),
            map_type,
            key_size,
            value_size,
            max_entries,
            flags: MapFlags::empty(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A map created in the kernel
#[derive(Debug)]
pub struct Map {
    fd: Fd,
    map_type: MapType,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
}

impl Map {
    pub fn fd(&self) -> &Fd {
        &self.fd
    }

    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }
}

/// A kernel to submit requests to, with its capability cache
///
/// The gateway itself holds no mutable state; only the feature probes are
/// cached. Every `Kernel` talking to the running kernel shares one cache,
/// so each probe runs once per process. Other backends get a cache of
/// their own.
#[derive(Debug)]
pub struct Kernel {
    client: SyscallClient,
    features: Arc<Features>,
}

impl Kernel {
    pub fn new(client: SyscallClient) -> Self {
        let features = if client.is_host() {
            Arc::clone(HOST_FEATURES.get_or_init(|| Arc::new(Features::new())))
        } else {
            Arc::new(Features::new())
        };
        Self { client, features }
    }

    /// A kernel issuing real system calls
    #[cfg(target_os = "linux")]
    pub fn linux() -> Self {
        Self::new(SyscallClient::linux())
    }

    /// The process-wide kernel
    ///
    /// Initialized on first use with the running kernel, unless
    /// [`Kernel::set_global`] installed another one before. Returns `None`
    /// on platforms without a kernel backend when nothing was installed.
    pub fn global() -> Option<&'static Kernel> {
        #[cfg(target_os = "linux")]
        {
            Some(GLOBAL.get_or_init(Kernel::linux))
        }
        #[cfg(not(target_os = "linux"))]
        {
            GLOBAL.get()
        }
    }

    /// Installs the process-wide kernel
    ///
    /// Fails, returning `kernel`, once the global kernel is initialized.
    pub fn set_global(kernel: Kernel) -> Result<(), Kernel> {
        GLOBAL.set(kernel)
    }

    pub fn client(&self) -> &SyscallClient {
        &self.client
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    /// Loads already linked instructions without a name
    pub fn prog_load(
        &self,
        insns: &[Instruction],
        program_type: ProgramType,
        license: &str,
    ) -> Result<Fd, Error> {
        self.load(insns, program_type, license, ObjName::default())
    }

    /// Relocates and loads a program
    ///
    /// The program must already contain every function it calls,
    /// see [`link`](crate::linker::link).
    pub fn load_program(&self, spec: &ProgramSpec) -> Result<Program, Error> {
        let insns = relocated(&spec.instructions)?;
        let name = self.maybe_fill_obj_name(&spec.name);
        let fd = self.load(&insns, spec.program_type, &spec.license, name)?;
        log::debug!("loaded program {} ({:?})", spec.name, fd);
        Ok(Program::new(fd, spec.name.clone(), spec.program_type))
    }

    fn load(
        &self,
        insns: &[Instruction],
        program_type: ProgramType,
        license: &str,
        name: ObjName,
    ) -> Result<Fd, Error> {
        let bytecode = marshal(insns, Endian::NATIVE)?;
        let license =
            CString::new(license).map_err(|_| Error::InvalidLicense(license.to_string()))?;

        assert_eq!(bytecode.len() % INSTRUCTION_SIZE, 0, "bytecode is not slot aligned");
        let mut attr = ProgLoadAttr {
            prog_type: program_type.raw(),
            insns: Pointer::from_slice(&bytecode),
            insn_cnt: (bytecode.len() / INSTRUCTION_SIZE) as u32,
            license: Pointer::from_cstr(&license),
            prog_name: name,
            ..Default::default()
        };

        self.client.prog_load(&mut attr).map_err(Error::Sys)
    }

    /// Creates a map
    ///
    /// Optional flags and map-in-map types are checked against their
    /// feature probes first; a missing feature is reported as
    /// [`Error::NotSupported`] without sending the request.
    pub fn map_create(&self, spec: &MapSpec, inner: Option<&Map>) -> Result<Map, Error> {
        let flags = spec.flags;
        if flags.intersects(MapFlags::RDONLY_PROG | MapFlags::WRONLY_PROG) {
            self.have_map_mutability_modifiers()?;
        }
        if flags.intersects(MapFlags::MMAPABLE) {
            self.have_mmapable_maps()?;
        }
        if flags.intersects(MapFlags::INNER_MAP) {
            self.have_inner_maps()?;
        }
        if flags.intersects(MapFlags::NO_PREALLOC) {
            self.have_no_prealloc_maps()?;
        }
        if spec.map_type.has_inner_map() {
            self.have_nested_maps()?;
        }

        let attr = MapCreateAttr {
            map_type: spec.map_type.raw(),
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
            map_flags: flags.bits(),
            inner_map_fd: inner.map(|map| map.fd.raw()).unwrap_or(0),
            map_name: self.maybe_fill_obj_name(&spec.name),
            ..Default::default()
        };
        let fd = self.client.map_create(&attr).map_err(wrap_map_error)?;
        log::debug!("created map {:?} ({:?})", spec.name, fd);

        Ok(Map {
            fd,
            map_type: spec.map_type,
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
        })
    }

    /// Creates or updates `count` elements and returns how many were processed
    ///
    /// `keys` and `values` hold `count` packed keys and values of the map's
    /// sizes.
    ///
    /// # Panics
    ///
    /// Panics if a buffer does not hold exactly `count` elements.
    pub fn map_update_batch(
        &self,
        map: &Map,
        keys: &[u8],
        values: &[u8],
        count: u32,
        elem_flags: u64,
    ) -> Result<u32, Error> {
        assert_eq!(
            keys.len(),
            count as usize * map.key_size as usize,
            "keys buffer doesn't hold {count} keys"
        );
        assert_eq!(
            values.len(),
            count as usize * map.value_size as usize,
            "values buffer doesn't hold {count} values"
        );
        self.have_batch_api()?;

        let mut attr = MapUpdateBatchAttr {
            map_fd: map.fd.raw(),
            keys: Pointer::from_slice(keys),
            values: Pointer::from_slice(values),
            count,
            elem_flags,
            ..Default::default()
        };
        self.client
            .map_update_batch(&mut attr)
            .map_err(wrap_map_error)?;
        Ok(attr.count)
    }

    /// Returns `name` as the kernel will accept it
    ///
    /// Without object name support the name is dropped. Without support for
    /// dots they are removed. Probe failures other than a missing feature
    /// leave the name as is; the request itself will report the problem.
    pub fn maybe_fill_obj_name(&self, name: &str) -> ObjName {
        if matches!(self.have_obj_name(), Err(ref err) if err.is_not_supported()) {
            if !name.is_empty() {
                log::trace!("dropping name {:?}: object names not supported", name);
            }
            return ObjName::default();
        }

        let mut name = sanitize_name(name, None);
        if matches!(self.have_obj_name_allows_dot(), Err(ref err) if err.is_not_supported()) {
            name.retain(|c| c != '.');
        }
        ObjName::new(&name)
    }
}

/// Keeps ASCII alphanumerics, `.` and `_`
///
/// Other characters are replaced with `replacement`, or deleted if it is
/// `None`.
pub fn sanitize_name(name: &str, replacement: Option<char>) -> String {
    name.chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                Some(c)
            } else {
                replacement
            }
        })
        .collect()
}

/// Translates the error of a map request
pub fn wrap_map_error(errno: Errno) -> Error {
    match errno {
        Errno::ENOENT => Error::EntryNotFound(errno),
        Errno::EEXIST => Error::EntryAlreadyExists(errno),
        Errno::ENOTSUPP => Error::NotSupported(NotSupported::Kernel(errno)),
        Errno::E2BIG => Error::KeyTooBig(errno),
        _ => Error::Sys(errno),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpf_asm::Register;
    use sim_bpf_kernel::{KernelVersion, SimulatedKernel};
    use std::sync::Arc;

    fn kernel(major: u32, minor: u32) -> (Arc<SimulatedKernel>, Kernel) {
        let sim = Arc::new(SimulatedKernel::with_version(KernelVersion::new(major, minor)));
        let kernel = Kernel::new(SyscallClient::new(sim.clone()));
        (sim, kernel)
    }

    #[test]
    fn test_kernel_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Kernel>();
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_host_kernels_share_features() {
        let first = Kernel::linux();
        let second = Kernel::new(SyscallClient::linux());
        assert!(Arc::ptr_eq(&first.features, &second.features));

        // The outcome depends on the privileges of the test run.
        let _ = first.have_obj_name();
        let runs = first.features().trial_runs();
        let _ = second.have_obj_name();
        assert_eq!(second.features().trial_runs(), runs);
    }

    #[test]
    fn test_backend_kernels_have_own_features() {
        let (_, first) = kernel(6, 1);
        let (_, second) = kernel(6, 1);
        assert!(!Arc::ptr_eq(&first.features, &second.features));

        first.have_obj_name().unwrap();
        assert_eq!(first.features().trial_runs(), 1);
        assert_eq!(second.features().trial_runs(), 0);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("my-map.v1", Some('_')), "my_map.v1");
        assert_eq!(sanitize_name("my-map.v1", None), "mymap.v1");
        assert_eq!(sanitize_name("ünï cödé", None), "ncd");
    }

    #[test]
    fn test_wrap_map_error() {
        assert_eq!(wrap_map_error(Errno::ENOENT), Error::EntryNotFound(Errno::ENOENT));
        assert_eq!(
            wrap_map_error(Errno::EEXIST),
            Error::EntryAlreadyExists(Errno::EEXIST)
        );
        assert!(wrap_map_error(Errno::ENOTSUPP).is_not_supported());
        assert!(!wrap_map_error(Errno::EOPNOTSUPP).is_not_supported());

        let err = wrap_map_error(Errno::E2BIG);
        assert_eq!(err.errno(), Some(Errno::E2BIG));
        assert!(err.to_string().starts_with("key too big for map"));

        assert_eq!(wrap_map_error(Errno::EPERM), Error::Sys(Errno::EPERM));
    }

    #[test]
    fn test_obj_name_dots_stripped() {
        let (_, k51) = kernel(5, 1);
        assert_eq!(k51.maybe_fill_obj_name("my.map-1").as_str(), "mymap1");

        let (_, k52) = kernel(5, 2);
        assert_eq!(k52.maybe_fill_obj_name("my.map-1").as_str(), "my.map1");
    }

    #[test]
    fn test_obj_name_dropped_without_support() {
        let (sim, kernel) = kernel(4, 14);
        assert!(kernel.maybe_fill_obj_name("counters").is_empty());
        assert_eq!(sim.invocations(bpf_sys::Command::MapCreate), 1);
    }

    #[test]
    fn test_obj_name_truncated() {
        let (_, kernel) = kernel(6, 1);
        let name = kernel.maybe_fill_obj_name("a_very_long_map_name_indeed");
        assert_eq!(name.as_str(), "a_very_long_map");
    }

    #[test]
    fn test_map_create_named() {
        let (sim, kernel) = kernel(6, 1);
        let spec = MapSpec::new(MapType::Hash, 4, 8, 16).with_name("stats.v2");
        let map = kernel.map_create(&spec, None).unwrap();

        assert_eq!(sim.object_name(map.fd().raw()).as_deref(), Some("stats.v2"));
        assert_eq!(map.value_size(), 8);
    }

    #[test]
    fn test_gated_flag_not_submitted() {
        let (sim, kernel) = kernel(5, 4);
        let spec = MapSpec::new(MapType::Array, 4, 4, 1).with_flags(MapFlags::MMAPABLE);

        let err = kernel.map_create(&spec, None).unwrap_err();
        assert!(err.is_not_supported());
        assert_eq!(err.to_string(), "mmapable maps not supported (requires >= 5.5)");
        // One request for the probe, none for the map itself.
        assert_eq!(sim.invocations(bpf_sys::Command::MapCreate), 1);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_nested_map_with_inner() {
        let (sim, kernel) = kernel(6, 1);
        let inner = kernel
            .map_create(&MapSpec::new(MapType::Array, 4, 4, 1), None)
            .unwrap();
        let outer = kernel
            .map_create(&MapSpec::new(MapType::ArrayOfMaps, 4, 4, 1), Some(&inner))
            .unwrap();

        drop(outer);
        drop(inner);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_prog_load_runs() {
        let (sim, kernel) = kernel(6, 1);
        let insns = [Instruction::load_imm64(Register::R0, 1 << 40), Instruction::exit()];
        let fd = kernel
            .prog_load(&insns, ProgramType::SocketFilter, "MIT")
            .unwrap();
        assert_eq!(sim.run_program(fd.raw()), Ok(1 << 40));
    }

    #[test]
    fn test_prog_load_invalid_license() {
        let (_, kernel) = kernel(6, 1);
        let err = kernel
            .prog_load(&[Instruction::exit()], ProgramType::SocketFilter, "M\0T")
            .unwrap_err();
        assert_eq!(err, Error::InvalidLicense("M\0T".to_string()));
    }

    #[test]
    #[should_panic(expected = "keys buffer")]
    fn test_batch_count_mismatch_panics() {
        let (_, kernel) = kernel(6, 1);
        let map = kernel
            .map_create(&MapSpec::new(MapType::Hash, 4, 4, 4), None)
            .unwrap();
        let _ = kernel.map_update_batch(&map, &[0u8; 4], &[0u8; 8], 2, 0);
    }
}
