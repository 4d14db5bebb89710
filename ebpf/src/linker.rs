//! Symbol splitting and reference linking
//!
//! Programs call each other by name. Before a program can be loaded, every
//! block it reaches through calls is appended to it and each call is
//! rewritten into a pc-relative jump, so the kernel receives one
//! self-contained stream per entry point.
//!
//! Offsets are counted in raw slots: a double-width load occupies two. A
//! relocated call at slot `site` with constant `c` targets slot
//! `site + 1 + c`, which is how the kernel interprets pseudo calls.

use crate::prog::ProgramSpec;
use bpf_asm::{function_references, Instruction};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Errors produced while splitting or linking
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The stream is empty or does not start with a symbol
    #[error("instructions don't start with a symbol")]
    MissingLeadingSymbol,

    /// A symbol is defined more than once
    #[error("duplicate symbol {0}")]
    DuplicateSymbol(String),

    /// A call names a symbol that is not defined anywhere
    #[error("unsatisfied program reference to {0}")]
    UnsatisfiedReference(String),

    /// The entry point is not a program of the collection
    #[error("no program named {0}")]
    UnknownEntry(String),
}

/// Named blocks of an instruction stream, in input order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTable<'a> {
    blocks: Vec<(&'a str, &'a [Instruction])>,
}

impl<'a> SymbolTable<'a> {
    /// Returns the block starting at `symbol`
    pub fn get(&self, symbol: &str) -> Option<&'a [Instruction]> {
        self.blocks
            .iter()
            .find(|(name, _)| *name == symbol)
            .map(|(_, block)| *block)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a [Instruction])> + '_ {
        self.blocks.iter().copied()
    }
}

/// Splits `insns` at every symbol
///
/// Each block runs from a symbol-tagged instruction up to the next symbol
/// or the end of the stream. Block contents are not inspected.
pub fn split_symbols(insns: &[Instruction]) -> Result<SymbolTable<'_>, LinkError> {
    let mut current = insns
        .first()
        .and_then(Instruction::symbol)
        .ok_or(LinkError::MissingLeadingSymbol)?;

    let mut seen = HashSet::from([current]);
    let mut blocks = Vec::new();
    let mut start = 0;

    for (index, ins) in insns.iter().enumerate().skip(1) {
        let Some(symbol) = ins.symbol() else {
            continue;
        };
        if !seen.insert(symbol) {
            return Err(LinkError::DuplicateSymbol(symbol.to_string()));
        }
        blocks.push((current, &insns[start..index]));
        current = symbol;
        start = index;
    }
    blocks.push((current, &insns[start..]));

    Ok(SymbolTable { blocks })
}

/// Maps every program to the names its calls refer to
pub fn collect_references(progs: &HashMap<String, ProgramSpec>) -> HashMap<&str, Vec<&str>> {
    progs
        .iter()
        .map(|(name, prog)| (name.as_str(), function_references(&prog.instructions)))
        .filter(|(_, refs)| !refs.is_empty())
        .collect()
}

/// Returns the instructions of `name` with every reachable callee appended
///
/// Programs without references are returned as they are, without copying
/// or allocating. Callees that already have a symbol in the program are not
/// appended again, including blocks a callee picked up when it was linked
/// itself, and names that are not programs of `progs` are left for
/// relocation to report. Returns `None` if `name` is not in `progs`.
pub fn flatten_instructions<'a>(
    name: &str,
    progs: &'a HashMap<String, ProgramSpec>,
    refs: &HashMap<&str, Vec<&str>>,
) -> Option<Cow<'a, [Instruction]>> {
    let prog = progs.get(name)?;
    let Some(entry_refs) = refs.get(name) else {
        return Some(Cow::Borrowed(&prog.instructions));
    };

    let mut insns = prog.instructions.clone();
    if let Some(first) = insns.first_mut() {
        if first.symbol().is_none() {
            first.set_symbol(name);
        }
    }

    // The entry goes first, so calls back into it end the walk.
    let mut visited: HashSet<&str> = HashSet::from([name]);
    visited.extend(prog.instructions.iter().filter_map(Instruction::symbol));
    let mut queue: VecDeque<&str> = entry_refs.iter().copied().collect();

    while let Some(callee) = queue.pop_front() {
        if !visited.insert(callee) {
            continue;
        }
        let Some(spec) = progs.get(callee) else {
            continue;
        };

        // A callee that was linked before carries its own callees; blocks
        // whose symbol is already merged are left out.
        let start = insns.len();
        let mut keep = true;
        for (index, ins) in spec.instructions.iter().enumerate() {
            if index > 0 {
                if let Some(symbol) = ins.symbol() {
                    keep = visited.insert(symbol);
                }
            }
            if keep {
                insns.push(ins.clone());
            }
        }
        if let Some(first) = insns.get_mut(start) {
            if first.symbol().is_none() {
                first.set_symbol(callee);
            }
        }
        log::debug!("linked {} into {} at instruction {}", callee, name, start);

        if let Some(next) = refs.get(callee) {
            queue.extend(next.iter().copied());
        }
    }

    Some(Cow::Owned(insns))
}

/// Flattens every program in `names`
///
/// All programs are flattened against the unmodified set before any of them
/// is replaced. Calls are not relocated; see [`relocate_calls`].
pub fn flatten_programs(progs: &mut HashMap<String, ProgramSpec>, names: &[&str]) {
    let flattened: Vec<(String, Vec<Instruction>)> = {
        let refs = collect_references(progs);
        names
            .iter()
            .filter_map(|name| match flatten_instructions(name, progs, &refs)? {
                Cow::Borrowed(_) => None,
                Cow::Owned(insns) => Some((name.to_string(), insns)),
            })
            .collect()
    };

    for (name, insns) in flattened {
        if let Some(prog) = progs.get_mut(&name) {
            prog.instructions = insns;
        }
    }
}

/// Rewrites every call by name into a pc-relative call
///
/// Reference tags are kept, so relocating twice gives the same result.
pub fn relocate_calls(insns: &mut [Instruction]) -> Result<(), LinkError> {
    let fixups = {
        let mut symbols: HashMap<&str, i64> = HashMap::new();
        let mut slot = 0i64;
        for ins in insns.iter() {
            if let Some(symbol) = ins.symbol() {
                if symbols.insert(symbol, slot).is_some() {
                    return Err(LinkError::DuplicateSymbol(symbol.to_string()));
                }
            }
            slot += ins.width() as i64;
        }

        let mut fixups = Vec::new();
        let mut slot = 0i64;
        for (index, ins) in insns.iter().enumerate() {
            if let Some(name) = ins.reference().filter(|_| ins.is_function_call()) {
                let target = symbols
                    .get(name)
                    .ok_or_else(|| LinkError::UnsatisfiedReference(name.to_string()))?;
                fixups.push((index, target - slot - 1));
            }
            slot += ins.width() as i64;
        }
        fixups
    };

    for (index, constant) in fixups {
        insns[index].constant = constant;
    }
    Ok(())
}

/// Returns `insns` with calls relocated, copying only if there are calls
pub fn relocated(insns: &[Instruction]) -> Result<Cow<'_, [Instruction]>, LinkError> {
    if !insns.iter().any(has_reference) {
        return Ok(Cow::Borrowed(insns));
    }
    let mut owned = insns.to_vec();
    relocate_calls(&mut owned)?;
    Ok(Cow::Owned(owned))
}

/// Links the program `entry` in place and returns its final instructions
///
/// This is the single merge entry point: callees are appended to the entry
/// and all calls are relocated. A program without calls is returned
/// untouched. On error the program is left as it was, so a missing
/// definition can be appended and the link retried.
///
/// Linking mutates the entry; `&mut` keeps two links of the same collection
/// from running at once.
pub fn link<'a>(
    progs: &'a mut HashMap<String, ProgramSpec>,
    entry: &str,
) -> Result<&'a [Instruction], LinkError> {
    let needs_linking = match progs.get(entry) {
        Some(prog) => prog.instructions.iter().any(has_reference),
        None => return Err(LinkError::UnknownEntry(entry.to_string())),
    };
    if !needs_linking {
        return Ok(&progs[entry].instructions);
    }

    let mut insns = {
        let refs = collect_references(progs);
        flatten_instructions(entry, progs, &refs)
            .map(Cow::into_owned)
            .ok_or_else(|| LinkError::UnknownEntry(entry.to_string()))?
    };
    relocate_calls(&mut insns)?;

    let prog = progs
        .get_mut(entry)
        .ok_or_else(|| LinkError::UnknownEntry(entry.to_string()))?;
    prog.instructions = insns;
    Ok(&prog.instructions)
}

fn has_reference(ins: &Instruction) -> bool {
    ins.is_function_call() && ins.reference().is_some()
}
