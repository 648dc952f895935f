#![allow(dead_code)]

use anyhow::bail;
use log::LevelFilter;
use std::path::PathBuf;
use structopt::StructOpt;

mod align;
mod driver;
mod ir;
mod memlog;
mod names;
mod parse;
mod slice;
#[cfg(test)]
mod test_util;
mod usedef;

/// Compute a dynamic backward slice over a recorded execution trace of a
/// binary-translated program.
#[derive(Clone, Debug, StructOpt)]
struct Options {
    /// Include branch and switch conditions in the slice.
    #[structopt(short = "b")]
    include_branches: bool,

    /// Verbose per-instruction tracing.
    #[structopt(short = "d")]
    debug: bool,

    /// Print the working set after each translation block.
    #[structopt(short = "w")]
    print_work: bool,

    /// Skip ahead to translation block NUM (requires -p).
    #[structopt(short = "n")]
    start_num: Option<u64>,

    /// Guest pc of the translation block to skip to, in hex (requires -n).
    #[structopt(short = "p", parse(try_from_str = parse_hex))]
    start_pc: Option<u64>,

    /// Bound on instructions per block in the marked map.
    #[structopt(long = "max-block-insts", default_value = "2048")]
    max_block_insts: usize,

    /// The translator IR module.
    ir_module: PathBuf,

    /// The dynamic value log.
    log_file: PathBuf,

    /// Slicing criteria, e.g. REG_0 or MEM_1000.
    criteria: Vec<String>,
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn main() -> anyhow::Result<()> {
    let opts = Options::from_args();

    let mut logger = env_logger::Builder::new();
    logger
        .target(env_logger::Target::Stdout)
        .filter_level(if opts.debug {
            LevelFilter::Trace
        } else {
            LevelFilter::Warn
        })
        .parse_default_env();
    let _ = logger.try_init();

    if opts.start_num.is_some() != opts.start_pc.is_some() {
        bail!("cannot specify -p without -n (and vice versa)");
    }
    if opts.criteria.is_empty() {
        log::warn!("no slicing criteria given; this is probably not what you want");
    }

    let module = parse::parse_module_file(&opts.ir_module)?;
    let log_file = memlog::Log::open(&opts.log_file)?;

    let mut work: names::NameSet = opts.criteria.iter().cloned().collect();

    let driver_opts = driver::Options {
        include_branches: opts.include_branches,
        print_work: opts.print_work,
        start: opts.start_num.zip(opts.start_pc),
        max_block_insts: opts.max_block_insts,
    };
    let marked = driver::run(&module, &log_file, &mut work, &driver_opts)?;

    println!(
        "Done slicing. Marked {} blocks, {} instructions.",
        marked.num_blocks(),
        marked.num_insts()
    );
    Ok(())
}
