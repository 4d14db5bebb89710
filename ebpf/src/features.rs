//! Kernel feature probes
//!
//! Each probe asks the kernel to do the smallest thing that exercises the
//! feature and reads the answer:
//! - `EINVAL` means the kernel did not understand the request: unsupported
//! - `EBADF` on a deliberately invalid handle means the request itself was
//!   understood: supported
//! - anything else says nothing about the feature and is reported as
//!   [`Error::FeatureProbe`]
//!
//! Trials run at most once per capability cache, and every [`Kernel`] backed
//! by the host shares one cache; every object a trial creates is
//! an owned [`Fd`](bpf_sys::Fd) and released before the trial returns.

use crate::linker::relocate_calls;
use crate::syscalls::Kernel;
use crate::Error;
use bpf_asm::{BuiltinFunc, Instruction, Register, INSTRUCTION_SIZE};
use bpf_features::{FeatureTest, Outcome};
use bpf_sys::{
    Errno, MapCreateAttr, MapType, MapUpdateBatchAttr, ObjName, Pointer, ProgLoadAttr,
    ProgramType, SyscallClient, BPF_F_INNER_MAP, BPF_F_MMAPABLE, BPF_F_NO_PREALLOC,
    BPF_F_RDONLY_PROG,
};
use std::ffi::CString;

/// The capability cache of one kernel
#[derive(Debug)]
pub struct Features {
    obj_name: FeatureTest<Error>,
    obj_name_allows_dot: FeatureTest<Error>,
    nested_maps: FeatureTest<Error>,
    map_mutability_modifiers: FeatureTest<Error>,
    mmapable_maps: FeatureTest<Error>,
    inner_maps: FeatureTest<Error>,
    no_prealloc_maps: FeatureTest<Error>,
    batch_api: FeatureTest<Error>,
    probe_read_kernel: FeatureTest<Error>,
    bpf_to_bpf_calls: FeatureTest<Error>,
    program_ext_infos: FeatureTest<Error>,
}

impl Features {
    pub fn new() -> Self {
        Self {
            obj_name: FeatureTest::new("object names", "4.15"),
            obj_name_allows_dot: FeatureTest::new("dot in object names", "5.2"),
            nested_maps: FeatureTest::new("nested maps", "4.12"),
            map_mutability_modifiers: FeatureTest::new("read- and write-only maps", "5.2"),
            mmapable_maps: FeatureTest::new("mmapable maps", "5.5"),
            inner_maps: FeatureTest::new("inner maps", "5.10"),
            no_prealloc_maps: FeatureTest::new("prealloc maps", "4.6"),
            batch_api: FeatureTest::new("map batch api", "5.6"),
            probe_read_kernel: FeatureTest::new("bpf_probe_read_kernel", "5.5"),
            bpf_to_bpf_calls: FeatureTest::new("bpf2bpf calls", "4.16"),
            program_ext_infos: FeatureTest::new("program ext_infos", "5.0"),
        }
    }

    /// Total number of trials run so far, across all probes
    pub fn trial_runs(&self) -> usize {
        [
            &self.obj_name,
            &self.obj_name_allows_dot,
            &self.nested_maps,
            &self.map_mutability_modifiers,
            &self.mmapable_maps,
            &self.inner_maps,
            &self.no_prealloc_maps,
            &self.batch_api,
            &self.probe_read_kernel,
            &self.bpf_to_bpf_calls,
            &self.program_ext_infos,
        ]
        .iter()
        .map(|test| test.trial_runs())
        .sum()
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns a cached outcome into the caller-facing result
fn check<F>(test: &FeatureTest<Error>, trial: F) -> Result<(), Error>
where
    F: FnOnce() -> Result<bool, Error>,
{
    match test.resolve(trial) {
        Outcome::Supported => Ok(()),
        Outcome::Unsupported => Err(test.unsupported().into()),
        Outcome::Failed(err @ Error::FeatureProbe { .. }) => Err(err.clone()),
        Outcome::Failed(err) => Err(Error::FeatureProbe {
            feature: test.name(),
            source: Box::new(err.clone()),
        }),
    }
}

/// Classifies the answer to a trial request
fn classify<T>(
    result: Result<T, Errno>,
    unsupported: &[Errno],
    supported: &[Errno],
) -> Result<bool, Error> {
    match result {
        Ok(_) => Ok(true),
        Err(errno) if unsupported.contains(&errno) => Ok(false),
        Err(errno) if supported.contains(&errno) => Ok(true),
        Err(errno) => Err(Error::Sys(errno)),
    }
}

fn array_attr(flags: u32) -> MapCreateAttr {
    MapCreateAttr {
        map_type: MapType::Array.raw(),
        key_size: 4,
        value_size: 4,
        max_entries: 1,
        map_flags: flags,
        ..Default::default()
    }
}

fn probe_map(client: &SyscallClient, attr: &MapCreateAttr) -> Result<bool, Error> {
    classify(client.map_create(attr), &[Errno::EINVAL], &[])
}

fn probe_prog(
    client: &SyscallClient,
    insns: &[Instruction],
    program_type: ProgramType,
    license: &str,
) -> Result<bool, Error> {
    let bytecode = bpf_asm::marshal(insns, bpf_asm::Endian::NATIVE)?;
    let license = CString::new(license).map_err(|_| Error::InvalidLicense(license.to_string()))?;
    let mut attr = ProgLoadAttr {
        prog_type: program_type.raw(),
        insns: Pointer::from_slice(&bytecode),
        insn_cnt: (bytecode.len() / INSTRUCTION_SIZE) as u32,
        license: Pointer::from_cstr(&license),
        ..Default::default()
    };
    // The verifier answers EACCES for helpers it does not offer.
    classify(client.prog_load(&mut attr), &[Errno::EINVAL, Errno::EACCES], &[])
}

impl Kernel {
    /// Whether maps and programs can be named
    pub fn have_obj_name(&self) -> Result<(), Error> {
        check(&self.features().obj_name, || {
            let attr = MapCreateAttr {
                map_name: ObjName::new("feature_test"),
                ..array_attr(0)
            };
            probe_map(self.client(), &attr)
        })
    }

    /// Whether object names may contain dots
    pub fn have_obj_name_allows_dot(&self) -> Result<(), Error> {
        let names = self.have_obj_name();
        check(&self.features().obj_name_allows_dot, || {
            match names {
                Ok(()) => {}
                Err(err) if err.is_not_supported() => return Ok(false),
                Err(err) => return Err(err),
            }

            let attr = MapCreateAttr {
                map_name: ObjName::new(".test"),
                ..array_attr(0)
            };
            probe_map(self.client(), &attr)
        })
    }

    /// Whether maps may hold other maps
    pub fn have_nested_maps(&self) -> Result<(), Error> {
        check(&self.features().nested_maps, || {
            let attr = MapCreateAttr {
                map_type: MapType::ArrayOfMaps.raw(),
                inner_map_fd: u32::MAX,
                ..array_attr(0)
            };
            classify(self.client().map_create(&attr), &[Errno::EINVAL], &[Errno::EBADF])
        })
    }

    /// Whether maps can be read-only or write-only for programs
    pub fn have_map_mutability_modifiers(&self) -> Result<(), Error> {
        check(&self.features().map_mutability_modifiers, || {
            probe_map(self.client(), &array_attr(BPF_F_RDONLY_PROG))
        })
    }

    /// Whether array maps can be mapped into user space
    pub fn have_mmapable_maps(&self) -> Result<(), Error> {
        check(&self.features().mmapable_maps, || {
            probe_map(self.client(), &array_attr(BPF_F_MMAPABLE))
        })
    }

    /// Whether maps can be flagged as inner map templates
    pub fn have_inner_maps(&self) -> Result<(), Error> {
        check(&self.features().inner_maps, || {
            probe_map(self.client(), &array_attr(BPF_F_INNER_MAP))
        })
    }

    /// Whether hash maps can skip preallocation
    pub fn have_no_prealloc_maps(&self) -> Result<(), Error> {
        check(&self.features().no_prealloc_maps, || {
            let attr = MapCreateAttr {
                map_type: MapType::Hash.raw(),
                ..array_attr(BPF_F_NO_PREALLOC)
            };
            probe_map(self.client(), &attr)
        })
    }

    /// Whether map elements can be updated in batches
    pub fn have_batch_api(&self) -> Result<(), Error> {
        check(&self.features().batch_api, || {
            let attr = MapCreateAttr {
                map_type: MapType::Hash.raw(),
                max_entries: 2,
                ..array_attr(0)
            };
            let map = self.client().map_create(&attr).map_err(Error::Sys)?;

            let keys: Vec<u8> = [1u32, 2].iter().flat_map(|k| k.to_ne_bytes()).collect();
            let values: Vec<u8> = [3u32, 4].iter().flat_map(|v| v.to_ne_bytes()).collect();
            let mut batch = MapUpdateBatchAttr {
                map_fd: map.raw(),
                keys: Pointer::from_slice(&keys),
                values: Pointer::from_slice(&values),
                count: 2,
                ..Default::default()
            };
            classify(self.client().map_update_batch(&mut batch), &[Errno::EINVAL], &[])
        })
    }

    /// Whether kprobes can call `bpf_probe_read_kernel`
    pub fn have_probe_read_kernel(&self) -> Result<(), Error> {
        check(&self.features().probe_read_kernel, || {
            let insns = [
                Instruction::mov_reg(Register::R1, Register::R10),
                Instruction::add_imm(Register::R1, -8),
                Instruction::mov_imm(Register::R2, 8),
                Instruction::mov_imm(Register::R3, 0),
                Instruction::call_builtin(BuiltinFunc::ProbeReadKernel),
                Instruction::exit(),
            ];
            probe_prog(self.client(), &insns, ProgramType::Kprobe, "GPL")
        })
    }

    /// Whether programs can call functions of their own
    pub fn have_bpf_to_bpf_calls(&self) -> Result<(), Error> {
        check(&self.features().bpf_to_bpf_calls, || {
            let mut insns = [
                Instruction::call_label("prog2").with_symbol("prog1"),
                Instruction::exit(),
                Instruction::mov_imm(Register::R0, 0).with_symbol("prog2"),
                Instruction::exit(),
            ];
            relocate_calls(&mut insns)?;
            probe_prog(self.client(), &insns, ProgramType::SocketFilter, "MIT")
        })
    }

    /// Whether programs accept function and line info records
    pub fn have_program_ext_infos(&self) -> Result<(), Error> {
        check(&self.features().program_ext_infos, || {
            let insns = [Instruction::mov_imm(Register::R0, 0), Instruction::exit()];
            let bytecode = bpf_asm::marshal(&insns, bpf_asm::Endian::NATIVE)?;
            let license = c"MIT";
            let mut attr = ProgLoadAttr {
                prog_type: ProgramType::SocketFilter.raw(),
                insns: Pointer::from_slice(&bytecode),
                insn_cnt: (bytecode.len() / INSTRUCTION_SIZE) as u32,
                license: Pointer::from_cstr(license),
                func_info_cnt: 1,
                prog_btf_fd: u32::MAX,
                ..Default::default()
            };
            classify(self.client().prog_load(&mut attr), &[Errno::E2BIG], &[Errno::EBADF])
        })
    }
}
