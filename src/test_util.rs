//! Shared helpers for building synthetic logs in tests.

use crate::memlog::{Record, RecordKind, RECORD_LEN};

/// An in-memory record with the given type and first two arguments.
pub fn record(kind: RecordKind, arg1: u64, arg2: u64) -> Record {
    Record {
        ty: kind.raw(),
        arg1,
        arg2,
        ..Record::default()
    }
}

/// One on-disk record image.
pub fn rec(kind: RecordKind, pc: u64, arg1: u64, arg2: u64) -> Vec<u8> {
    let mut out = vec![0u8; RECORD_LEN];
    out[8..16].copy_from_slice(&pc.to_ne_bytes());
    out[16..24].copy_from_slice(&kind.raw().to_ne_bytes());
    out[24..32].copy_from_slice(&arg1.to_ne_bytes());
    out[32..40].copy_from_slice(&arg2.to_ne_bytes());
    out
}

/// Concatenate record images into a log body (no header).
pub fn log_body(records: &[Vec<u8>]) -> Vec<u8> {
    records.iter().flatten().copied().collect()
}

/// Pack an addr-entry the way load/store records carry it in `arg1`.
pub fn addr_entry(kind: u8, flag: u8, off: u64) -> u64 {
    (kind as u64) | ((flag as u64) << 8) | (off << 16)
}
