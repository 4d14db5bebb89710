//! A named set of programs that may call each other

use crate::linker::{self, LinkError};
use crate::prog::{Program, ProgramSpec};
use crate::syscalls::Kernel;
use crate::Error;
use bpf_asm::Instruction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Programs keyed by name
///
/// Every program is a possible call target of every other, by the symbol on
/// its first instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub programs: HashMap<String, ProgramSpec>,
}

impl CollectionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a program, replacing one of the same name
    pub fn add(&mut self, spec: ProgramSpec) -> Option<ProgramSpec> {
        self.programs.insert(spec.name.clone(), spec)
    }

    /// Links the program `entry`, see [`linker::link`]
    pub fn link(&mut self, entry: &str) -> Result<&[Instruction], Error> {
        linker::link(&mut self.programs, entry).map_err(|err| match err {
            LinkError::UnknownEntry(name) => Error::UnknownProgram(name),
            err => Error::Link(err),
        })
    }

    /// Appends the callees of every program in `names`, without relocating
    pub fn flatten(&mut self, names: &[&str]) {
        linker::flatten_programs(&mut self.programs, names);
    }

    /// Links and loads the program `name`
    pub fn load_program(&mut self, kernel: &Kernel, name: &str) -> Result<Program, Error> {
        self.link(name)?;
        let spec = self
            .programs
            .get(name)
            .ok_or_else(|| Error::UnknownProgram(name.to_string()))?;
        kernel.load_program(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpf_asm::Register;
    use bpf_sys::{ProgramType, SyscallClient};
    use sim_bpf_kernel::SimulatedKernel;
    use std::sync::Arc;

    #[test]
    fn test_load_linked_program() {
        let sim = Arc::new(SimulatedKernel::default());
        let kernel = Kernel::new(SyscallClient::new(sim.clone()));

        let mut coll = CollectionSpec::new();
        coll.add(ProgramSpec::new(
            "entry",
            ProgramType::SocketFilter,
            "MIT",
            vec![
                Instruction::mov_reg(Register::R0, Register::R1),
                Instruction::call_label("answer"),
                Instruction::exit(),
            ],
        ));
        coll.add(ProgramSpec::new(
            "answer",
            ProgramType::SocketFilter,
            "MIT",
            vec![Instruction::mov_imm(Register::R0, 42), Instruction::exit()],
        ));

        let prog = coll.load_program(&kernel, "entry").unwrap();
        assert_eq!(prog.name(), "entry");
        assert_eq!(sim.run_program(prog.fd().raw()), Ok(42));
        assert_eq!(sim.object_name(prog.fd().raw()).as_deref(), Some("entry"));
    }

    #[test]
    fn test_unknown_program() {
        let kernel = Kernel::new(SyscallClient::new(Arc::new(SimulatedKernel::default())));
        let mut coll = CollectionSpec::new();

        let err = coll.load_program(&kernel, "nope").unwrap_err();
        assert_eq!(err, Error::UnknownProgram("nope".to_string()));
    }

    #[test]
    fn test_collection_from_json() {
        let json = r#"{
            "programs": {
                "xdp_pass": {
                    "name": "xdp_pass",
                    "type": "Xdp",
                    "license": "GPL",
                    "instructions": [
                        { "op": 183, "dst": 0, "src": 0, "offset": 0, "constant": 2, "symbol": "xdp_pass" },
                        { "op": 149, "dst": 0, "src": 0, "offset": 0, "constant": 0 }
                    ]
                }
            }
        }"#;
        let coll: CollectionSpec = serde_json::from_str(json).unwrap();
        let spec = &coll.programs["xdp_pass"];
        assert_eq!(spec.program_type, ProgramType::Xdp);
        assert_eq!(spec.instructions[0].symbol(), Some("xdp_pass"));
    }
}
