//! Top-level slicing loop over translation-block entries.
//!
//! The log is a sequence of translation-block executions, each opened by a
//! function-entry record naming the `tcg-llvm-tb-<num>-<pc>` function that
//! was run. Each block is aligned against the IR, then sliced backward with
//! the shared working set; slicing stops early once the working set empties.

use crate::align::{self, TraceEntry};
use crate::ir::Module;
use crate::memlog::{Log, RecordKind};
use crate::names::{self, NameSet};
use crate::slice::{self, Marked, DEFAULT_MAX_BLOCK_INSTS};
use anyhow::{anyhow, bail, Result};
use std::io::Write;

#[derive(Clone, Debug)]
pub struct Options {
    /// Mark branch/switch terminators even when their defs are dead.
    pub include_branches: bool,
    /// Print the working set after each translation block.
    pub print_work: bool,
    /// Skip ahead to the translation-block entry with this `(num, pc)`.
    pub start: Option<(u64, u64)>,
    /// Bound on instructions per block in the marked map.
    pub max_block_insts: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            include_branches: false,
            print_work: false,
            start: None,
            max_block_insts: DEFAULT_MAX_BLOCK_INSTS,
        }
    }
}

pub fn run(module: &Module, log: &Log, work: &mut NameSet, opts: &Options) -> Result<Marked> {
    let mut marked = Marked::new(opts.max_block_insts);
    let total = log.num_records();
    let mut cur = log.records();

    if let Some((num, pc)) = opts.start {
        while let Some(rec) = cur.peek() {
            if rec.kind() == Some(RecordKind::FuncEntry) && rec.pc == pc && rec.arg1 == num {
                break;
            }
            cur.bump();
        }
        if cur.at_end() {
            log::warn!(
                "no translation-block entry matching num={} pc={:x}; nothing to slice",
                num,
                pc
            );
        }
    }

    println!("Slicing trace...");
    while let Some(rec) = cur.peek() {
        if rec.kind() != Some(RecordKind::FuncEntry) {
            bail!(
                "expected a translation-block entry at record {}, found type {}",
                cur.pos(),
                rec.ty
            );
        }
        let name = format!("tcg-llvm-tb-{}-{:x}", rec.arg1, rec.pc);
        log::debug!("********** {} **********", name);
        let func = module
            .func_by_name(&name)
            .ok_or_else(|| anyhow!("log names translation block {} but the module has no such function", name))?;
        // The entry record itself carries no dynamic value.
        cur.bump();

        let mut trace: Vec<TraceEntry> = Vec::new();
        let (next, _status) = align::process_func(module, func, cur, &mut trace)?;
        cur = next;

        slice::slice_trace(module, &trace, work, &mut marked, opts.include_branches)?;

        if opts.print_work {
            println!("Working set: {}", names::fmt_set(work));
        }

        update_progress(cur.pos() as u64, total as u64);

        if work.is_empty() {
            println!();
            println!("Note: working set is empty, will stop slicing.");
            break;
        }
    }
    println!();

    Ok(marked)
}

fn update_progress(cur: u64, total: u64) {
    let pct = if total == 0 {
        1.0
    } else {
        cur as f64 / total as f64
    };
    const COLUMNS: usize = 80;
    let pos = (COLUMNS as f64 * pct) as usize;
    let mut bar = String::with_capacity(COLUMNS + 8);
    bar.push('[');
    for i in 0..COLUMNS {
        bar.push(if i < pos {
            '='
        } else if i == pos {
            '>'
        } else {
            ' '
        });
    }
    print!("{}] {:02}%\r", bar, (pct * 100.0) as u32);
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlog::{Log, HEADER_LEN};
    use crate::parse::parse_module;
    use crate::test_util::{addr_entry, log_body, rec};

    const GREG: u8 = 5;

    fn write_log(records: &[Vec<u8>]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; HEADER_LEN]).unwrap();
        f.write_all(&log_body(records)).unwrap();
        f.flush().unwrap();
        f
    }

    fn work_of(criteria: &[&str]) -> NameSet {
        criteria.iter().map(|s| s.to_string()).collect()
    }

    const TWO_TB_MODULE: &str = "\
func @tcg-llvm-tb-1-1000(%env) {
block0:
  %r1 = add %r0, 1
  store %r1, %env
  ret
}
func @tcg-llvm-tb-2-2000(%env) {
block0:
  %v = load %env
  store %v, %env
  ret
}
";

    #[test]
    fn first_block_explaining_the_criterion_wins() {
        let m = parse_module(TWO_TB_MODULE).unwrap();
        let f = write_log(&[
            rec(RecordKind::FuncEntry, 0x1000, 1, 0),
            rec(RecordKind::DynStore, 0, addr_entry(GREG, 0, 0), 0),
            rec(RecordKind::FuncEntry, 0x2000, 2, 0),
            rec(RecordKind::DynLoad, 0, addr_entry(GREG, 0, 0), 1),
            rec(RecordKind::DynStore, 0, addr_entry(GREG, 0, 0), 0),
        ]);
        let log = Log::open(f.path()).unwrap();

        // Blocks are sliced in log order, so tb-1's store retires REG_0
        // from the working set before tb-2 is ever considered.
        let mut work = work_of(&["REG_0"]);
        let marked = run(&m, &log, &mut work, &Options::default()).unwrap();

        let tb1 = m.func_by_name("tcg-llvm-tb-1-1000").unwrap();
        let tb2 = m.func_by_name("tcg-llvm-tb-2-2000").unwrap();
        assert!(marked.contains(tb1, 0, 0));
        assert!(marked.contains(tb1, 0, 1));
        assert!(!marked.contains(tb2, 0, 1));
        assert_eq!(marked.num_blocks(), 1);
        assert_eq!(marked.num_insts(), 2);
        assert!(work.contains("r0"));
    }

    #[test]
    fn exception_resumes_at_next_block_entry() {
        let m = parse_module(TWO_TB_MODULE).unwrap();
        let f = write_log(&[
            rec(RecordKind::FuncEntry, 0x2000, 2, 0),
            rec(RecordKind::DynLoad, 0, addr_entry(GREG, 0, 0), 1),
            rec(RecordKind::Exception, 0, 0, 0),
            rec(RecordKind::FuncEntry, 0x1000, 1, 0),
            rec(RecordKind::DynStore, 0, addr_entry(GREG, 0, 0), 0),
        ]);
        let log = Log::open(f.path()).unwrap();

        let mut work = work_of(&["REG_0"]);
        let marked = run(&m, &log, &mut work, &Options::default()).unwrap();

        let tb1 = m.func_by_name("tcg-llvm-tb-1-1000").unwrap();
        let tb2 = m.func_by_name("tcg-llvm-tb-2-2000").unwrap();
        // tb-1 (after the exception) explains REG_0.
        assert!(marked.contains(tb1, 0, 1));
        // tb-2's store never executed: the load aligned, the store did not.
        assert!(!marked.contains(tb2, 0, 1));
    }

    #[test]
    fn stops_when_working_set_empties() {
        // tb-3 stores a constant, which fully explains the criterion; the
        // record after it names a function the module does not have, so
        // reaching it would be fatal. Stopping early never looks at it.
        let m = parse_module(
            "func @tcg-llvm-tb-3-3000(%env) {\nblock0:\n  store 5, %env\n  ret\n}\n",
        )
        .unwrap();
        let f = write_log(&[
            rec(RecordKind::FuncEntry, 0x3000, 3, 0),
            rec(RecordKind::DynStore, 0, addr_entry(GREG, 0, 0), 0),
            rec(RecordKind::FuncEntry, 0xffff, 9, 0),
        ]);
        let log = Log::open(f.path()).unwrap();

        let mut work = work_of(&["REG_0"]);
        let marked = run(&m, &log, &mut work, &Options::default()).unwrap();
        let tb3 = m.func_by_name("tcg-llvm-tb-3-3000").unwrap();
        assert!(marked.contains(tb3, 0, 0));
        assert!(work.is_empty());
    }

    #[test]
    fn fast_forward_skips_earlier_blocks() {
        let m = parse_module(TWO_TB_MODULE).unwrap();
        let f = write_log(&[
            rec(RecordKind::FuncEntry, 0x1000, 1, 0),
            rec(RecordKind::DynStore, 0, addr_entry(GREG, 0, 0), 0),
            rec(RecordKind::FuncEntry, 0x2000, 2, 0),
            rec(RecordKind::DynLoad, 0, addr_entry(GREG, 0, 0), 1),
            rec(RecordKind::DynStore, 0, addr_entry(GREG, 0, 0), 0),
        ]);
        let log = Log::open(f.path()).unwrap();

        let mut work = work_of(&["REG_0"]);
        let opts = Options {
            start: Some((2, 0x2000)),
            ..Options::default()
        };
        let marked = run(&m, &log, &mut work, &opts).unwrap();

        let tb1 = m.func_by_name("tcg-llvm-tb-1-1000").unwrap();
        let tb2 = m.func_by_name("tcg-llvm-tb-2-2000").unwrap();
        assert!(marked.contains(tb2, 0, 1));
        assert!(!marked.contains(tb1, 0, 1));
    }

    #[test]
    fn missing_function_is_fatal() {
        let m = parse_module(TWO_TB_MODULE).unwrap();
        let f = write_log(&[rec(RecordKind::FuncEntry, 0xffff, 9, 0)]);
        let log = Log::open(f.path()).unwrap();
        let mut work = work_of(&["REG_0"]);
        assert!(run(&m, &log, &mut work, &Options::default()).is_err());
    }

    #[test]
    fn desynchronized_log_is_fatal() {
        let m = parse_module(TWO_TB_MODULE).unwrap();
        let f = write_log(&[rec(RecordKind::DynLoad, 0, 0, 0)]);
        let log = Log::open(f.path()).unwrap();
        let mut work = work_of(&["REG_0"]);
        assert!(run(&m, &log, &mut work, &Options::default()).is_err());
    }
}
