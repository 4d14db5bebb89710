//! Programs before and after loading

use bpf_asm::Instruction;
use bpf_sys::{Fd, ProgramType};
use serde::{Deserialize, Serialize};

/// A program that has not been loaded yet
///
/// Front-ends may hand programs over as JSON:
///
/// ```
/// use ebpf::ProgramSpec;
///
/// let spec: ProgramSpec = serde_json::from_str(r#"{
///     "name": "noop",
///     "type": "SocketFilter",
///     "license": "MIT",
///     "instructions": [
///         { "op": 183, "dst": 0, "src": 0, "offset": 0, "constant": 0 },
///         { "op": 149, "dst": 0, "src": 0, "offset": 0, "constant": 0 }
///     ]
/// }"#).unwrap();
/// assert_eq!(spec.instructions.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub program_type: ProgramType,
    pub license: String,
    pub instructions: Vec<Instruction>,
}

impl ProgramSpec {
    pub fn new(
        name: impl Into<String>,
        program_type: ProgramType,
        license: impl Into<String>,
        instructions: Vec<Instruction>,
    ) -> Self {
        Self {
            name: name.into(),
            program_type,
            license: license.into(),
            instructions,
        }
    }
}

/// A program loaded into the kernel
///
/// Only the handle is kept; the bytecode is not needed after loading.
#[derive(Debug)]
pub struct Program {
    fd: Fd,
    name: String,
    program_type: ProgramType,
}

impl Program {
    pub(crate) fn new(fd: Fd, name: String, program_type: ProgramType) -> Self {
        Self {
            fd,
            name,
            program_type,
        }
    }

    pub fn fd(&self) -> &Fd {
        &self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program_type(&self) -> ProgramType {
        self.program_type
    }
}
