//! Backward slicing over an aligned trace.
//!
//! Walk the aligned sequence of one translation block in reverse, keeping a
//! working set of live location names. An instruction that defines a live
//! location is marked, its defs are retired, and its uses become live.
//! Crossing a call site going backward pushes the formal-to-actual name
//! bindings that the callee body (walked next) remaps its uses through;
//! crossing the callee's entry instruction pops them again.

use crate::align::TraceEntry;
use crate::ir::{Function, FuncId, InstKind, Module};
use crate::names::{self, NameSet};
use crate::usedef;
use anyhow::{bail, Result};
use bit_set::BitSet;
use fxhash::FxHashMap;

/// Default bound on instructions per block in the marked map.
pub const DEFAULT_MAX_BLOCK_INSTS: usize = 2048;

/// Slice membership: per `(function, block ordinal)`, a bitset over
/// instruction positions within the block.
#[derive(Debug)]
pub struct Marked {
    blocks: FxHashMap<(FuncId, u32), BitSet>,
    max_block_insts: usize,
}

impl Marked {
    pub fn new(max_block_insts: usize) -> Marked {
        Marked {
            blocks: FxHashMap::default(),
            max_block_insts,
        }
    }

    fn mark(&mut self, module: &Module, e: &TraceEntry) -> Result<()> {
        let bb = e.index >> 16;
        let pos = (e.index & 0xffff) as usize;
        if pos >= self.max_block_insts {
            bail!(
                "block {} of @{} has more than {} instructions",
                bb,
                module.funcs[e.func].name,
                self.max_block_insts
            );
        }
        log::debug!(
            "marking @{}, block {}, instruction {}",
            module.funcs[e.func].name,
            bb,
            pos
        );
        self.blocks.entry((e.func, bb)).or_default().insert(pos);
        Ok(())
    }

    pub fn contains(&self, func: FuncId, block: u32, pos: usize) -> bool {
        self.blocks
            .get(&(func, block))
            .map_or(false, |bits| bits.contains(pos))
    }

    /// Number of blocks with at least one marked instruction.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Total marked instructions across all blocks.
    pub fn num_insts(&self) -> usize {
        self.blocks.values().map(|bits| bits.len()).sum()
    }
}

/// Callees the backward walk must not bind arguments for: the aligner never
/// inlines their bodies, so there is no entry instruction below the call
/// site to pop the binding.
fn is_ignored(f: &Function) -> bool {
    f.name.starts_with("__ld")
        || f.name.starts_with("__st")
        || f.name.starts_with("llvm.memcpy")
        || f.name.starts_with("llvm.memset")
        || f.name.starts_with("helper_in")
        || f.name.starts_with("helper_out")
        || f.name == "log_dynval"
        || f.is_declaration()
        || f.is_intrinsic()
}

/// Slice one aligned translation block, updating `work` and `marked`.
pub fn slice_trace(
    module: &Module,
    trace: &[TraceEntry],
    work: &mut NameSet,
    marked: &mut Marked,
    include_branches: bool,
) -> Result<()> {
    // An exception before the first instruction leaves nothing to walk.
    let Some(first) = trace.first() else {
        return Ok(());
    };
    let entry_func = first.func;

    // Formal-to-actual bindings for the calls currently open below us.
    let mut argmaps: Vec<FxHashMap<String, String>> = Vec::new();

    for e in trace.iter().rev() {
        let inst = module.funcs[e.func].inst(e.index);
        log::trace!(">> {}", inst.kind.mnemonic());

        let (mut uses, defs) = usedef::uses_and_defs(module, e);
        log::trace!("uses: {}", names::fmt_set(&uses));
        log::trace!("defs: {}", names::fmt_set(&defs));

        if e.func != entry_func {
            // Inside an inlined callee, route uses through the argument
            // bindings. Defs need no remap; a formal cannot be redefined
            // inside its own function.
            if let Some(argmap) = argmaps.last() {
                uses = uses
                    .into_iter()
                    .map(|u| argmap.get(&u).cloned().unwrap_or(u))
                    .collect();
                log::trace!("uses (remapped): {}", names::fmt_set(&uses));
            }
        }

        let overlap = defs.iter().any(|d| work.contains(d));
        if overlap {
            marked.mark(module, e)?;
            for d in &defs {
                work.remove(d);
            }
            work.extend(uses);
        } else if include_branches
            && inst.kind.is_terminator()
            && !matches!(inst.kind, InstKind::Ret { .. })
        {
            marked.mark(module, e)?;
            work.extend(uses);
        }

        match &inst.kind {
            InstKind::Call { callee, args } => {
                let sub = &module.funcs[*callee];
                if !is_ignored(sub) {
                    let mut argmap = FxHashMap::default();
                    for (&formal, &actual) in sub.params.iter().zip(args.iter()) {
                        let formal = names::value_name(module, formal);
                        let actual = names::operand_name(module, actual);
                        log::trace!("argmap {} => {}", formal, actual);
                        argmap.insert(formal, actual);
                    }
                    argmaps.push(argmap);
                }
            }
            _ if e.index == 0 => {
                // The first instruction of a function's entry block:
                // walking backward we are about to leave that function, so
                // its call site's bindings are done.
                argmaps.pop();
            }
            _ => {}
        }

        log::trace!("working set: {}", names::fmt_set(work));
    }

    if !argmaps.is_empty() {
        // Only a truncated callee can leave bindings open.
        log::warn!("argument bindings left open after backward walk");
    }

    // The block function's first formal is the translator's context
    // pointer: state, not dataflow.
    if let Some(&ctx) = module.funcs[entry_func].params.first() {
        work.remove(&names::value_name(module, ctx));
    }
    Ok(())
}
