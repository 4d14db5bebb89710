//! # Simulated Kernel
//!
//! This crate provides an in-process implementation of [`BpfSyscall`].
//!
//! ## Purpose
//!
//! Feature probes and the request gateway are only interesting against
//! kernels that *lack* features. The simulated kernel lets tests pick the
//! kernel they run against:
//! - Runs under `cargo test`, without privileges
//! - Deterministic (features follow a [`KernelProfile`] version)
//! - Inspectable (live objects, map contents and an audit log)
//! - Faultable (a [`FaultPlan`] forces chosen error codes)
//!
//! ## Fidelity
//!
//! Requests are validated the way the real kernel validates them where it
//! matters for callers: unknown flags, fields and helpers are rejected with
//! `EINVAL`, unknown trailing attributes with `E2BIG`, stale handles with
//! `EBADF`, and map updates report `ENOENT`/`EEXIST`/`E2BIG` exactly like
//! the kernel's map implementations.

pub mod audit;
pub mod fault_injection;
pub mod interpreter;
pub mod profile;

pub use audit::{SyscallAuditLog, SyscallEvent};
pub use fault_injection::{FaultInjector, FaultPlan, SyscallFault};
pub use profile::{KernelProfile, KernelVersion, ProfileError};

use bpf_asm::{
    unmarshal_raw, BuiltinFunc, Endian, OpCode, RawInstruction, Register, INSTRUCTION_SIZE,
};
use bpf_sys::{
    BpfSyscall, Command, Errno, MapCreateAttr, MapType, MapUpdateBatchAttr, ObjName,
    ProgLoadAttr, ProgramType, BPF_ANY, BPF_EXIST, BPF_F_INNER_MAP, BPF_F_MMAPABLE,
    BPF_F_NO_PREALLOC, BPF_F_RDONLY_PROG, BPF_F_WRONLY_PROG, BPF_NOEXIST,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Largest program the simulated verifier accepts, in raw slots
pub const MAX_INSNS: u32 = 4096;

const KNOWN_MAP_FLAGS: u32 =
    BPF_F_NO_PREALLOC | BPF_F_RDONLY_PROG | BPF_F_WRONLY_PROG | BPF_F_MMAPABLE | BPF_F_INNER_MAP;

/// Simulated kernel state
///
/// All state sits behind one lock, so the kernel can be shared between
/// threads like the real one.
pub struct SimulatedKernel {
    profile: KernelProfile,
    state: Mutex<KernelState>,
}

struct KernelState {
    next_fd: u32,
    objects: HashMap<u32, KernelObject>,
    audit: SyscallAuditLog,
    fault_injector: Option<FaultInjector>,
}

enum KernelObject {
    Map(SimMap),
    Program(SimProgram),
}

struct SimMap {
    map_type: MapType,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    name: String,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

struct SimProgram {
    name: String,
    insns: Vec<RawInstruction>,
}

impl SimulatedKernel {
    /// Creates a simulated kernel with the given profile
    pub fn new(profile: KernelProfile) -> Self {
        Self {
            profile,
            state: Mutex::new(KernelState {
                next_fd: 3,
                objects: HashMap::new(),
                audit: SyscallAuditLog::new(),
                fault_injector: None,
            }),
        }
    }

    /// Creates a simulated kernel of the given version
    pub fn with_version(version: KernelVersion) -> Self {
        Self::new(KernelProfile::new(version))
    }

    /// Sets the fault injector for this kernel
    pub fn with_fault_injector(self, injector: FaultInjector) -> Self {
        self.lock().fault_injector = Some(injector);
        self
    }

    /// Replaces the fault injector of a running kernel
    ///
    /// Lets a test warm up feature probes before faults start to apply.
    pub fn inject_faults(&self, injector: FaultInjector) {
        self.lock().fault_injector = Some(injector);
    }

    /// Returns the profile this kernel simulates
    pub fn profile(&self) -> &KernelProfile {
        &self.profile
    }

    /// Returns a snapshot of the audit log
    pub fn audit_log(&self) -> SyscallAuditLog {
        self.lock().audit.clone()
    }

    /// Number of requests of `command` received so far
    pub fn invocations(&self, command: Command) -> usize {
        self.lock().audit.invocations(command)
    }

    /// Number of objects whose handles are still open
    pub fn live_objects(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns the name a map or program was created with
    pub fn object_name(&self, fd: u32) -> Option<String> {
        match self.lock().objects.get(&fd)? {
            KernelObject::Map(map) => Some(map.name.clone()),
            KernelObject::Program(prog) => Some(prog.name.clone()),
        }
    }

    /// Returns the value stored under `key` in a map
    pub fn map_lookup(&self, fd: u32, key: &[u8]) -> Option<Vec<u8>> {
        match self.lock().objects.get(&fd)? {
            KernelObject::Map(map) => map.entries.get(key).cloned(),
            KernelObject::Program(_) => None,
        }
    }

    /// Runs a loaded program and returns its result
    pub fn run_program(&self, fd: u32) -> Result<u64, Errno> {
        let insns = match self.lock().objects.get(&fd) {
            Some(KernelObject::Program(prog)) => prog.insns.clone(),
            _ => return Err(Errno::EBADF),
        };
        interpreter::run(&insns)
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn version(&self) -> KernelVersion {
        self.profile.version
    }

    /// Common prologue: audit, injected faults and privileges
    fn admit(&self, state: &mut KernelState, command: Command) -> Result<(), Errno> {
        state.audit.record(SyscallEvent::Invoked { command });
        if let Some(errno) = state.fault_injector.as_mut().and_then(|f| f.check(command)) {
            return Err(errno);
        }
        if self.profile.unprivileged {
            return Err(Errno::EPERM);
        }
        Ok(())
    }

    fn finish<T>(
        state: &mut KernelState,
        command: Command,
        result: Result<T, Errno>,
        fd: Option<u32>,
    ) -> Result<T, Errno> {
        match &result {
            Ok(_) => state.audit.record(SyscallEvent::Completed { command, fd }),
            Err(errno) => {
                log::trace!("simulated {:?} rejected: {}", command, errno);
                state.audit.record(SyscallEvent::Rejected {
                    command,
                    errno: *errno,
                })
            }
        }
        result
    }

    fn insert(state: &mut KernelState, object: KernelObject) -> u32 {
        let fd = state.next_fd;
        state.next_fd += 1;
        state.objects.insert(fd, object);
        fd
    }

    fn check_name(&self, name: &ObjName) -> Result<String, Errno> {
        if name.is_empty() {
            return Ok(String::new());
        }
        if !self.version().at_least(4, 15) {
            return Err(Errno::EINVAL);
        }

        let name = name.as_str();
        for c in name.chars() {
            let allowed = c.is_ascii_alphanumeric()
                || c == '_'
                || (c == '.' && self.version().at_least(5, 2));
            if !allowed {
                return Err(Errno::EINVAL);
            }
        }
        Ok(name.to_string())
    }

    fn check_map_flags(&self, map_type: MapType, flags: u32) -> Result<(), Errno> {
        let version = self.version();
        if flags & !KNOWN_MAP_FLAGS != 0 {
            return Err(Errno::EINVAL);
        }
        if flags & BPF_F_NO_PREALLOC != 0 && (!version.at_least(4, 6) || map_type.is_array()) {
            return Err(Errno::EINVAL);
        }
        let access = flags & (BPF_F_RDONLY_PROG | BPF_F_WRONLY_PROG);
        let both = BPF_F_RDONLY_PROG | BPF_F_WRONLY_PROG;
        if access != 0 && (!version.at_least(5, 2) || access == both) {
            return Err(Errno::EINVAL);
        }
        if flags & BPF_F_MMAPABLE != 0 && (!version.at_least(5, 5) || map_type != MapType::Array) {
            return Err(Errno::EINVAL);
        }
        if flags & BPF_F_INNER_MAP != 0 && !version.at_least(5, 10) {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn create_map(&self, state: &KernelState, attr: &MapCreateAttr) -> Result<SimMap, Errno> {
        let map_type = MapType::from_raw(attr.map_type).ok_or(Errno::EINVAL)?;
        if attr.key_size == 0 || attr.value_size == 0 || attr.max_entries == 0 {
            return Err(Errno::EINVAL);
        }
        if map_type.is_array() && attr.key_size != 4 {
            return Err(Errno::EINVAL);
        }
        self.check_map_flags(map_type, attr.map_flags)?;
        let name = self.check_name(&attr.map_name)?;

        if map_type.has_inner_map() {
            if !self.version().at_least(4, 12) {
                return Err(Errno::EINVAL);
            }
            if attr.value_size != 4 {
                return Err(Errno::EINVAL);
            }
            match state.objects.get(&attr.inner_map_fd) {
                Some(KernelObject::Map(_)) => {}
                _ => return Err(Errno::EBADF),
            }
        }

        Ok(SimMap {
            map_type,
            key_size: attr.key_size,
            value_size: attr.value_size,
            max_entries: attr.max_entries,
            name,
            entries: BTreeMap::new(),
        })
    }

    fn load_program(
        &self,
        state: &KernelState,
        attr: &ProgLoadAttr<'_>,
    ) -> Result<SimProgram, Errno> {
        let version = self.version();
        let prog_type = ProgramType::from_raw(attr.prog_type).ok_or(Errno::EINVAL)?;
        if attr.insn_cnt == 0 {
            return Err(Errno::EINVAL);
        }
        if attr.insn_cnt > MAX_INSNS {
            return Err(Errno::E2BIG);
        }
        if attr.func_info_cnt != 0 || attr.line_info_cnt != 0 {
            if !version.at_least(5, 0) {
                return Err(Errno::E2BIG);
            }
            // BTF objects are never created by the simulation.
            return match state.objects.get(&attr.prog_btf_fd) {
                Some(_) => Err(Errno::EINVAL),
                None => Err(Errno::EBADF),
            };
        }

        // SAFETY: `license` is set from a CStr owned by the caller for the
        // duration of the request.
        let license = unsafe { attr.license.as_cstr() }.ok_or(Errno::EFAULT)?;
        let gpl_compatible = matches!(
            license.to_str(),
            Ok("GPL" | "GPL v2" | "GPL and additional rights" | "Dual BSD/GPL" | "Dual MIT/GPL")
        );
        let name = self.check_name(&attr.prog_name)?;

        // SAFETY: `insns` points at `insn_cnt` slots of encoded bytecode,
        // which the gateway derives from the buffer's own length.
        let bytecode: &[u8] =
            unsafe { attr.insns.as_slice(attr.insn_cnt as usize * INSTRUCTION_SIZE) };
        let insns = unmarshal_raw(bytecode, Endian::NATIVE).map_err(|_| Errno::EINVAL)?;
        self.verify(prog_type, &insns, gpl_compatible)?;

        Ok(SimProgram { name, insns })
    }

    fn verify(
        &self,
        prog_type: ProgramType,
        insns: &[RawInstruction],
        gpl_compatible: bool,
    ) -> Result<(), Errno> {
        let version = self.version();
        let mut pc = 0;
        while pc < insns.len() {
            let ins = &insns[pc];
            if usize::from(ins.dst.raw()) >= Register::COUNT
                || usize::from(ins.src.raw()) >= Register::COUNT
            {
                return Err(Errno::EINVAL);
            }
            match ins.op {
                OpCode::MOV_REG
                | OpCode::MOV_IMM
                | OpCode::MOV32_IMM
                | OpCode::ADD_IMM
                | OpCode::ADD_REG => {}
                OpCode::LOAD_IMM_DW => {
                    match insns.get(pc + 1) {
                        Some(high) if high.op.raw() == 0 => {}
                        _ => return Err(Errno::EINVAL),
                    }
                    pc += 1;
                }
                OpCode::CALL if ins.src == Register::PSEUDO_CALL => {
                    if !version.at_least(4, 16) {
                        return Err(Errno::EINVAL);
                    }
                    interpreter::jump_target(pc, ins.constant, insns.len())?;
                }
                OpCode::CALL => {
                    let helper = ins.constant;
                    let known = if helper == BuiltinFunc::ProbeReadKernel.number() {
                        version.at_least(5, 5)
                            && gpl_compatible
                            && prog_type == ProgramType::Kprobe
                    } else {
                        helper == BuiltinFunc::KtimeGetNs.number()
                            || helper == BuiltinFunc::MapLookupElem.number()
                            || (helper == BuiltinFunc::ProbeRead.number()
                                && prog_type == ProgramType::Kprobe)
                    };
                    if !known {
                        return Err(Errno::EINVAL);
                    }
                }
                OpCode::EXIT => {}
                _ => return Err(Errno::EINVAL),
            }
            pc += 1;
        }

        match insns.last() {
            Some(last) if last.op == OpCode::EXIT => Ok(()),
            _ => Err(Errno::EINVAL),
        }
    }

    fn update_batch(
        &self,
        state: &mut KernelState,
        attr: &mut MapUpdateBatchAttr<'_>,
    ) -> Result<(), Errno> {
        let count = attr.count as usize;
        attr.count = 0;

        if !self.version().at_least(5, 6) {
            return Err(Errno::EINVAL);
        }
        if attr.flags != 0 || ![BPF_ANY, BPF_NOEXIST, BPF_EXIST].contains(&attr.elem_flags) {
            return Err(Errno::EINVAL);
        }

        let live_maps: Vec<u32> = state
            .objects
            .iter()
            .filter(|(_, object)| matches!(object, KernelObject::Map(_)))
            .map(|(fd, _)| *fd)
            .collect();
        let map = match state.objects.get_mut(&attr.map_fd) {
            Some(KernelObject::Map(map)) => map,
            _ => return Err(Errno::EBADF),
        };

        let key_size = map.key_size as usize;
        let value_size = map.value_size as usize;
        // SAFETY: `keys` and `values` point at `count` elements of the map's
        // key and value size, derived by the gateway from the buffers.
        let keys: &[u8] = unsafe { attr.keys.as_slice(count * key_size) };
        let values: &[u8] = unsafe { attr.values.as_slice(count * value_size) };

        for (key, value) in keys.chunks_exact(key_size).zip(values.chunks_exact(value_size)) {
            map.update(key, value, attr.elem_flags, &live_maps)?;
            attr.count += 1;
        }
        Ok(())
    }
}

impl SimMap {
    fn update(
        &mut self,
        key: &[u8],
        value: &[u8],
        elem_flags: u64,
        live_maps: &[u32],
    ) -> Result<(), Errno> {
        if self.map_type.has_inner_map() {
            let inner = u32::from_ne_bytes([value[0], value[1], value[2], value[3]]);
            if !live_maps.contains(&inner) {
                return Err(Errno::EBADF);
            }
        }

        if self.map_type.is_array() {
            let index = u32::from_ne_bytes([key[0], key[1], key[2], key[3]]);
            if index >= self.max_entries {
                return Err(Errno::E2BIG);
            }
            if elem_flags == BPF_NOEXIST {
                return Err(Errno::EEXIST);
            }
        } else {
            let exists = self.entries.contains_key(key);
            if exists && elem_flags == BPF_NOEXIST {
                return Err(Errno::EEXIST);
            }
            if !exists && elem_flags == BPF_EXIST {
                return Err(Errno::ENOENT);
            }
            if !exists && self.entries.len() >= self.max_entries as usize {
                return Err(Errno::E2BIG);
            }
        }

        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new(KernelProfile::latest())
    }
}

impl BpfSyscall for SimulatedKernel {
    fn map_create(&self, attr: &MapCreateAttr) -> Result<u32, Errno> {
        let mut state = self.lock();
        let command = Command::MapCreate;
        let result = self
            .admit(&mut state, command)
            .and_then(|_| self.create_map(&state, attr))
            .map(|map| Self::insert(&mut state, KernelObject::Map(map)));
        let fd = result.as_ref().ok().copied();
        Self::finish(&mut state, command, result, fd)
    }

    fn prog_load(&self, attr: &mut ProgLoadAttr<'_>) -> Result<u32, Errno> {
        let mut state = self.lock();
        let command = Command::ProgLoad;
        let result = self
            .admit(&mut state, command)
            .and_then(|_| self.load_program(&state, attr))
            .map(|prog| Self::insert(&mut state, KernelObject::Program(prog)));
        let fd = result.as_ref().ok().copied();
        Self::finish(&mut state, command, result, fd)
    }

    fn map_update_batch(&self, attr: &mut MapUpdateBatchAttr<'_>) -> Result<(), Errno> {
        let mut state = self.lock();
        let command = Command::MapUpdateBatch;
        let result = self
            .admit(&mut state, command)
            .and_then(|_| self.update_batch(&mut state, attr));
        Self::finish(&mut state, command, result, None)
    }

    fn close(&self, fd: u32) -> Result<(), Errno> {
        let mut state = self.lock();
        if state.objects.remove(&fd).is_none() {
            return Err(Errno::EBADF);
        }
        state.audit.record(SyscallEvent::Closed { fd });
        Ok(())
    }
}
