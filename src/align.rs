//! Trace alignment: reconstruct the dynamic instruction sequence of one
//! translated block from its static CFG and the dynamic value log.
//!
//! Alignment walks the CFG the way the guest executed it, steered by the
//! dynamic branch/switch records, descending into called functions. Each
//! dynamic occurrence becomes a `TraceEntry`; instructions with a runtime
//! payload carry their record by value. Call sites are appended *after*
//! their callee's body so the backward walk of the slicer sees the call,
//! and can bind its arguments, before walking the body.

use crate::ir::{self, FuncId, InstKind, Module, Operand};
use crate::memlog::{Cursor, Record, RecordKind};
use anyhow::{bail, Result};
use cranelift_entity::EntityRef;

/// One aligned dynamic instruction occurrence.
#[derive(Debug, Clone, Copy)]
pub struct TraceEntry {
    /// Packed static position: `(block ordinal << 16) | position in block`.
    pub index: u32,
    pub func: FuncId,
    /// Dynamic record for this occurrence, when the instruction produces
    /// one. Synthesized for phis.
    pub rec: Option<Record>,
    /// Second record for block-copy calls that log one load and one store.
    pub rec2: Option<Record>,
}

/// Whether alignment ran to the end of the function or was cut short by an
/// exception record. Truncation unwinds through every enclosing function of
/// the translation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignStatus {
    Completed,
    Truncated,
}

pub fn process_func<'a>(
    module: &Module,
    func: FuncId,
    mut cur: Cursor<'a>,
    out: &mut Vec<TraceEntry>,
) -> Result<(Cursor<'a>, AlignStatus)> {
    let f = &module.funcs[func];
    if f.is_declaration() {
        bail!("cannot align declaration @{}", f.name);
    }

    let mut block = ir::BlockId::from_u32(0);
    let mut have_successor = true;
    while have_successor {
        have_successor = false;

        'insts: for (pos, inst) in f.blocks[block].insts.iter().enumerate() {
            // An exception in the log means no further dynamic values were
            // recorded for this function or any enclosing one.
            if let Some(next) = cur.peek() {
                if next.kind() == Some(RecordKind::Exception) {
                    cur.bump();
                    return Ok((cur, AlignStatus::Truncated));
                }
            }

            let mut entry = TraceEntry {
                index: ir::pack_index(block, pos),
                func,
                rec: None,
                rec2: None,
            };

            match &inst.kind {
                InstKind::Load { .. } => {
                    entry.rec = Some(cur.expect(RecordKind::DynLoad)?);
                    out.push(entry);
                }
                InstKind::Store { volatile, .. } => {
                    // Volatile stores produce no record and no entry.
                    if !*volatile {
                        entry.rec = Some(cur.expect(RecordKind::DynStore)?);
                        out.push(entry);
                    }
                }
                InstKind::Br { succs, .. } => {
                    let rec = cur.expect(RecordKind::DynBranch)?;
                    let Some(&taken) = succs.get(rec.arg1 as usize) else {
                        bail!(
                            "branch record {} names successor {} of a {}-way branch",
                            cur.pos() - 1,
                            rec.arg1,
                            succs.len()
                        );
                    };
                    log::debug!("br -> {}", taken.index());
                    entry.rec = Some(rec);
                    out.push(entry);
                    block = taken;
                    have_successor = true;
                    break 'insts;
                }
                InstKind::Switch { default, cases, .. } => {
                    let rec = cur.expect(RecordKind::DynSwitch)?;
                    let taken = cases
                        .iter()
                        .find(|(key, _)| *key == rec.arg1)
                        .map(|(_, target)| *target)
                        .unwrap_or(*default);
                    log::debug!("switch {} -> {}", rec.arg1, taken.index());
                    entry.rec = Some(rec);
                    out.push(entry);
                    block = taken;
                    have_successor = true;
                    break 'insts;
                }
                InstKind::Select { .. } => {
                    entry.rec = Some(cur.expect(RecordKind::DynSelect)?);
                    out.push(entry);
                }
                InstKind::Phi { incoming } => {
                    entry.rec = Some(synthesize_phi_record(module, func, out, incoming, cur.pos())?);
                    out.push(entry);
                }
                InstKind::Call { callee, .. } => {
                    let sub = &module.funcs[*callee];
                    let name = sub.name.as_str();
                    if name.starts_with("__ld") {
                        entry.rec = Some(cur.expect(RecordKind::DynLoad)?);
                        out.push(entry);
                    } else if name.starts_with("__st") {
                        entry.rec = Some(cur.expect(RecordKind::DynStore)?);
                        out.push(entry);
                    } else if name.starts_with("llvm.memcpy") {
                        entry.rec = Some(cur.expect(RecordKind::DynLoad)?);
                        entry.rec2 = Some(cur.expect(RecordKind::DynStore)?);
                        out.push(entry);
                    } else if name.starts_with("llvm.memset") {
                        entry.rec = Some(cur.expect(RecordKind::DynStore)?);
                        out.push(entry);
                    } else if name.starts_with("helper_in") {
                        entry.rec = Some(cur.expect(RecordKind::DynLoad)?);
                        out.push(entry);
                    } else if name.starts_with("helper_out") {
                        entry.rec = Some(cur.expect(RecordKind::DynStore)?);
                        out.push(entry);
                    } else if name == "log_dynval" || sub.is_declaration() || sub.is_intrinsic() {
                        // No dynamic payload, but the occurrence still
                        // participates in the slice.
                        out.push(entry);
                    } else {
                        let (next, status) = process_func(module, *callee, cur, out)?;
                        cur = next;
                        out.push(entry);
                        if status == AlignStatus::Truncated {
                            return Ok((cur, AlignStatus::Truncated));
                        }
                    }
                }
                InstKind::Ret { .. } | InstKind::Unreachable | InstKind::Other { .. } => {
                    out.push(entry);
                }
            }
        }
    }

    Ok((cur, AlignStatus::Completed))
}

/// Phis have no log record. The block we arrived from is the parent block
/// of the last non-phi entry already appended, so synthesize a record whose
/// `arg1` is that incoming edge's index.
fn synthesize_phi_record(
    module: &Module,
    func: FuncId,
    out: &[TraceEntry],
    incoming: &[(ir::BlockId, Operand)],
    record_pos: usize,
) -> Result<Record> {
    for prev in out.iter().rev() {
        if module.funcs[prev.func].inst(prev.index).kind.is_phi() {
            continue;
        }
        if prev.func != func {
            break;
        }
        let pred = ir::index_block(prev.index);
        let Some(edge) = incoming.iter().position(|(b, _)| *b == pred) else {
            bail!(
                "phi near record {} has no incoming edge from {}",
                record_pos,
                pred.index()
            );
        };
        return Ok(Record {
            arg1: edge as u64,
            ..Record::default()
        });
    }
    bail!("phi near record {} has no resolvable predecessor", record_pos)
}
