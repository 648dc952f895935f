//! The dynamic value log: a memory-mapped array of fixed-size records
//! written by the trace producer, behind a copyable forward cursor.

use anyhow::{anyhow, bail, Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Opaque producer header preceding the record array.
pub const HEADER_LEN: usize = 20;
/// On-disk size of one packed record.
pub const RECORD_LEN: usize = 56;

/// One dynamic log record: a runtime event attributed to a guest pc.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Record {
    pub asid: u64,
    pub pc: u64,
    pub ty: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
}

impl Record {
    // The header leaves records misaligned for a direct cast, so decode
    // field-wise. Byte order is the host's.
    fn decode(bytes: &[u8]) -> Record {
        let field = |i: usize| u64::from_ne_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        Record {
            asid: field(0),
            pc: field(1),
            ty: field(2),
            arg1: field(3),
            arg2: field(4),
            arg3: field(5),
            arg4: field(6),
        }
    }

    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_raw(self.ty)
    }
}

/// Record type enumerators shared with the trace producer. The producer also
/// emits lower type values; none of those are consumed here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    FuncEntry,
    DynLoad,
    DynStore,
    DynBranch,
    DynSelect,
    DynSwitch,
    Exception,
}

impl RecordKind {
    pub fn from_raw(ty: u64) -> Option<RecordKind> {
        match ty {
            30 => Some(RecordKind::FuncEntry),
            31 => Some(RecordKind::DynLoad),
            32 => Some(RecordKind::DynStore),
            33 => Some(RecordKind::DynBranch),
            34 => Some(RecordKind::DynSelect),
            35 => Some(RecordKind::DynSwitch),
            36 => Some(RecordKind::Exception),
            _ => None,
        }
    }

    pub fn raw(self) -> u64 {
        match self {
            RecordKind::FuncEntry => 30,
            RecordKind::DynLoad => 31,
            RecordKind::DynStore => 32,
            RecordKind::DynBranch => 33,
            RecordKind::DynSelect => 34,
            RecordKind::DynSwitch => 35,
            RecordKind::Exception => 36,
        }
    }
}

/// Address kinds in the low byte of a load/store record's `arg1`.
/// Producer-shared; only the guest register, host cell, and special-register
/// kinds are modeled by the extractor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrKind {
    Haddr,
    Maddr,
    Iaddr,
    Paddr,
    Laddr,
    Greg,
    Gspec,
    Unk,
    Const,
    Ret,
}

impl AddrKind {
    pub fn from_raw(kind: u8) -> Option<AddrKind> {
        match kind {
            0 => Some(AddrKind::Haddr),
            1 => Some(AddrKind::Maddr),
            2 => Some(AddrKind::Iaddr),
            3 => Some(AddrKind::Paddr),
            4 => Some(AddrKind::Laddr),
            5 => Some(AddrKind::Greg),
            6 => Some(AddrKind::Gspec),
            7 => Some(AddrKind::Unk),
            8 => Some(AddrKind::Const),
            9 => Some(AddrKind::Ret),
            _ => None,
        }
    }
}

/// Flag value marking an access as irrelevant to dataflow: it suppresses
/// register/memory use-def generation, but never a load's SSA def.
pub const FLAG_IRRELEVANT: u8 = 5;

/// Decoded addr-entry from a load/store record's `arg1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrEntry {
    pub kind: u8,
    pub flag: u8,
    pub offset: u64,
}

pub fn decode_addr_entry(entry: u64) -> AddrEntry {
    AddrEntry {
        kind: (entry & 0xff) as u8,
        flag: ((entry >> 8) & 0xff) as u8,
        offset: entry >> 16,
    }
}

/// A memory-mapped log. The mapping is read-only and lives for the process
/// lifetime.
pub struct Log {
    map: Mmap,
}

impl Log {
    pub fn open(path: &Path) -> Result<Log> {
        let file = File::open(path).with_context(|| format!("opening log {}", path.display()))?;
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mapping log {}", path.display()))?;
        if map.len() < HEADER_LEN || (map.len() - HEADER_LEN) % RECORD_LEN != 0 {
            bail!(
                "log {} is not a header plus a whole number of {}-byte records ({} bytes)",
                path.display(),
                RECORD_LEN,
                map.len()
            );
        }
        Ok(Log { map })
    }

    /// The record array, with the header stripped.
    pub fn body(&self) -> &[u8] {
        &self.map[HEADER_LEN..]
    }

    pub fn num_records(&self) -> usize {
        self.body().len() / RECORD_LEN
    }

    pub fn records(&self) -> Cursor<'_> {
        Cursor::new(self.body())
    }
}

/// Forward cursor over a record array. Copyable, so the aligner can thread
/// updated positions through its recursion.
#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(body: &'a [u8]) -> Cursor<'a> {
        debug_assert_eq!(body.len() % RECORD_LEN, 0);
        Cursor { body, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos * RECORD_LEN >= self.body.len()
    }

    /// Record index from the start of the log body.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn peek(&self) -> Option<Record> {
        if self.at_end() {
            return None;
        }
        let off = self.pos * RECORD_LEN;
        Some(Record::decode(&self.body[off..off + RECORD_LEN]))
    }

    pub fn bump(&mut self) {
        self.pos += 1;
    }

    /// Consume one record whose type must be `kind`. Anything else means the
    /// log and the IR have desynchronized, which is unrecoverable.
    pub fn expect(&mut self, kind: RecordKind) -> Result<Record> {
        let rec = self
            .peek()
            .ok_or_else(|| anyhow!("log exhausted at record {} while expecting {:?}", self.pos, kind))?;
        if rec.kind() != Some(kind) {
            bail!(
                "log/IR desynchronization at record {}: expected {:?}, found type {}",
                self.pos,
                kind,
                rec.ty
            );
        }
        self.bump();
        Ok(rec)
    }
}
