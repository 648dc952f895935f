//! Per-instruction use/def extraction.
//!
//! Given one aligned dynamic occurrence, compute the abstract locations it
//! reads and writes. Total over everything the aligner can produce, and
//! free of side effects on shared state; anomalies are logged and the
//! default model applied.

use crate::align::TraceEntry;
use crate::ir::{Inst, InstKind, Module};
use crate::memlog::{decode_addr_entry, AddrKind, Record, FLAG_IRRELEVANT};
use crate::names::{self, NameSet};

/// Opcodes whose dataflow really is "uses = operands, defs = result".
/// Anything else that reaches the generic path gets a note first.
const DEFAULT_MODEL_OPS: &[&str] = &[
    "add", "sub", "mul", "udiv", "urem", "sdiv", "srem", "inttoptr", "ptrtoint", "and", "xor",
    "or", "zext", "sext", "trunc", "bitcast", "getelementptr", "extractvalue", "insertvalue",
    "shl", "ashr", "lshr", "icmp", "alloca",
];

pub fn uses_and_defs(module: &Module, e: &TraceEntry) -> (NameSet, NameSet) {
    let mut uses = NameSet::new();
    let mut defs = NameSet::new();
    let func = &module.funcs[e.func];
    let inst = func.inst(e.index);

    match &inst.kind {
        InstKind::Load { ptr } => {
            let rec = dynrec(e, inst);
            let addr = decode_addr_entry(rec.arg1);
            if addr.flag != FLAG_IRRELEVANT {
                if let Some(loc) = machine_loc(&rec, addr.kind) {
                    uses.insert(loc);
                }
            }
            names::insert_value(module, &mut uses, *ptr);
            // Even an irrelevant load defines its result.
            insert_result(module, &mut defs, inst);
        }
        InstKind::Store {
            value,
            ptr,
            volatile,
        } => {
            let rec = dynrec(e, inst);
            let addr = decode_addr_entry(rec.arg1);
            if !*volatile && addr.flag != FLAG_IRRELEVANT {
                if let Some(loc) = machine_loc(&rec, addr.kind) {
                    defs.insert(loc);
                }
                names::insert_value(module, &mut uses, *value);
                names::insert_value(module, &mut uses, *ptr);
            }
        }
        InstKind::Call { callee, args } => {
            let fname = module.funcs[*callee].name.as_str();
            if let Some(sz) = fname.strip_prefix("__ld") {
                let rec = dynrec(e, inst);
                if let Some(size) = access_size(sz) {
                    for off in 0..size {
                        uses.insert(names::loc_mem(rec.arg2.wrapping_add(off)));
                    }
                } else {
                    log::warn!("unknown access size in call to {}", fname);
                }
                if let Some(&addr) = args.first() {
                    names::insert_value(module, &mut uses, addr);
                }
                insert_result(module, &mut defs, inst);
            } else if let Some(sz) = fname.strip_prefix("__st") {
                let rec = dynrec(e, inst);
                if let Some(size) = access_size(sz) {
                    for off in 0..size {
                        defs.insert(names::loc_mem(rec.arg2.wrapping_add(off)));
                    }
                } else {
                    log::warn!("unknown access size in call to {}", fname);
                }
                if let Some(&addr) = args.first() {
                    names::insert_value(module, &mut uses, addr);
                }
                if let Some(&value) = args.get(1) {
                    names::insert_value(module, &mut uses, value);
                }
            } else if fname.starts_with("llvm.memcpy")
                || fname.starts_with("llvm.memset")
                || fname.starts_with("helper_in")
                || fname.starts_with("helper_out")
            {
                // Consumed by the aligner but not yet modeled here: the
                // slice will not follow dataflow through this call.
                log::warn!("no dataflow model for {}; slice may be imprecise", fname);
            } else if fname == "log_dynval" {
                // Instrumentation only.
            } else {
                if inst.result.is_some() {
                    insert_result(module, &mut defs, inst);
                }
                // The arguments are deliberately not used here; if the
                // return value needs them they become live inside the
                // callee body, bound back through the argument stack.
                uses.insert(names::retval(fname));
            }
        }
        InstKind::Ret { value } => {
            if let Some(v) = *value {
                names::insert_value(module, &mut uses, v);
            }
            defs.insert(names::retval(&func.name));
        }
        InstKind::Phi { incoming } => {
            // arg1 is the incoming-edge index synthesized during alignment.
            let rec = dynrec(e, inst);
            let (_, value) = incoming[rec.arg1 as usize];
            names::insert_value(module, &mut uses, value);
            insert_result(module, &mut defs, inst);
        }
        InstKind::Select {
            cond,
            on_true,
            on_false,
        } => {
            let rec = dynrec(e, inst);
            // The producer logs the selector inverted: 1 means the false
            // side was taken.
            let chosen = if rec.arg1 == 1 { *on_false } else { *on_true };
            names::insert_value(module, &mut uses, chosen);
            names::insert_value(module, &mut uses, *cond);
            insert_result(module, &mut defs, inst);
        }
        InstKind::Unreachable => {}
        InstKind::Br { cond, .. } => {
            if let Some(c) = *cond {
                names::insert_value(module, &mut uses, c);
            }
            insert_result(module, &mut defs, inst);
        }
        InstKind::Switch { cond, .. } => {
            names::insert_value(module, &mut uses, *cond);
            insert_result(module, &mut defs, inst);
        }
        InstKind::Other { op, operands } => {
            if !DEFAULT_MODEL_OPS.contains(&op.as_str()) {
                log::warn!("no model for {}, assuming uses = operands, defs = result", op);
            }
            for &operand in operands {
                names::insert_value(module, &mut uses, operand);
            }
            insert_result(module, &mut defs, inst);
        }
    }

    (uses, defs)
}

fn insert_result(module: &Module, defs: &mut NameSet, inst: &Inst) {
    if let Some(r) = inst.result {
        defs.insert(names::value_name(module, r));
    }
}

fn dynrec(e: &TraceEntry, inst: &Inst) -> Record {
    e.rec
        .unwrap_or_else(|| panic!("{} entry without a dynamic record", inst.kind.mnemonic()))
}

/// Guest access width from the size letter of a `__ld`/`__st` helper name.
fn access_size(name_rest: &str) -> Option<u64> {
    match name_rest.chars().next()? {
        'q' => Some(8),
        'l' => Some(4),
        'w' => Some(2),
        'b' => Some(1),
        _ => None,
    }
}

/// Machine location named by a load/store record, by address kind.
fn machine_loc(rec: &Record, kind: u8) -> Option<String> {
    match AddrKind::from_raw(kind) {
        Some(AddrKind::Greg) => Some(names::loc_reg(rec.arg2)),
        Some(AddrKind::Maddr) => Some(names::loc_host(rec.arg2)),
        Some(AddrKind::Gspec) => Some(names::loc_spec(rec.arg2)),
        _ => {
            log::warn!("unhandled address entry kind {}", kind);
            None
        }
    }
}
