//! # eBPF Loader Core
//!
//! This crate links kernel bytecode programs, finds out what the running
//! kernel supports and submits programs and maps to it.
//!
//! ## Philosophy
//!
//! - **Link by name**: Programs call each other through symbols. The
//!   [`linker`] merges everything an entry point reaches into one stream and
//!   relocates the calls.
//! - **Ask by trying**: The kernel has no capability query. [`features`]
//!   probes each feature once with a minimal request and caches the answer.
//! - **Errors mean something**: Raw codes become [`Error`] kinds, and a
//!   probe that could not decide is never reported as "not supported".
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use bpf_asm::{Instruction, Register};
//! use bpf_sys::{ProgramType, SyscallClient};
//! use ebpf::{CollectionSpec, Kernel, ProgramSpec};
//! use sim_bpf_kernel::SimulatedKernel;
//!
//! let kernel = Kernel::new(SyscallClient::new(Arc::new(SimulatedKernel::default())));
//!
//! let mut coll = CollectionSpec::new();
//! coll.add(ProgramSpec::new(
//!     "entry",
//!     ProgramType::SocketFilter,
//!     "MIT",
//!     vec![Instruction::call_label("helper"), Instruction::exit()],
//! ));
//! coll.add(ProgramSpec::new(
//!     "helper",
//!     ProgramType::SocketFilter,
//!     "MIT",
//!     vec![Instruction::mov_imm(Register::R0, 1), Instruction::exit()],
//! ));
//!
//! let prog = coll.load_program(&kernel, "entry").unwrap();
//! assert_eq!(prog.name(), "entry");
//! ```

pub mod collection;
pub mod error;
pub mod features;
pub mod linker;
pub mod prog;
pub mod syscalls;

pub use collection::CollectionSpec;
pub use error::{Error, NotSupported};
pub use features::Features;
pub use linker::{link, split_symbols, LinkError, SymbolTable};
pub use prog::{Program, ProgramSpec};
pub use syscalls::{sanitize_name, wrap_map_error, Kernel, Map, MapFlags, MapSpec};
