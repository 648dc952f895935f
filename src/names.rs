//! Canonical abstract-location names.
//!
//! The slicer compares locations by name equality only: guest registers,
//! physical memory bytes, host cells, IR values and return-value slots all
//! share one flat string namespace. That makes cross-function argument
//! binding a plain substitution over the working set.

use crate::ir::{Module, Operand, Value};
use std::collections::BTreeSet;

/// A set of location names: uses, defs, or the working set. Ordered, so
/// printed sets are deterministic.
pub type NameSet = BTreeSet<String>;

/// Declared name of a value, or a stable synthetic derived from its
/// identity.
pub fn value_name(module: &Module, v: Value) -> String {
    match &module.values[v].name {
        Some(name) => name.clone(),
        None => v.to_string(),
    }
}

/// Name an operand binds to at a call site. Constants get a name no
/// instruction ever defines, so a formal bound to a constant actual simply
/// ends that liveness chain.
pub fn operand_name(module: &Module, op: Operand) -> String {
    match op {
        Operand::Value(v) => value_name(module, v),
        Operand::Const(k) => format!("const_{:x}", k),
    }
}

/// Insert the operand's name into `set`, skipping compile-time constants.
pub fn insert_value(module: &Module, set: &mut NameSet, op: Operand) {
    if let Operand::Value(v) = op {
        set.insert(value_name(module, v));
    }
}

/// Guest CPU register slot.
pub fn loc_reg(n: u64) -> String {
    format!("REG_{}", n)
}

/// Host (translator-internal) address cell.
pub fn loc_host(n: u64) -> String {
    format!("HOST_{}", n)
}

/// Guest special-purpose register slot.
pub fn loc_spec(n: u64) -> String {
    format!("SPEC_{}", n)
}

/// Guest physical memory byte.
pub fn loc_mem(addr: u64) -> String {
    format!("MEM_{:x}", addr)
}

/// The abstract return-value slot of a function.
pub fn retval(fname: &str) -> String {
    format!("{}.retval", fname)
}

pub fn fmt_set(set: &NameSet) -> String {
    let mut out = String::from("{");
    for name in set {
        out.push(' ');
        out.push_str(name);
    }
    out.push_str(" }");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_formats() {
        assert_eq!(loc_reg(3), "REG_3");
        assert_eq!(loc_host(12), "HOST_12");
        assert_eq!(loc_spec(0), "SPEC_0");
        assert_eq!(loc_mem(0x1000), "MEM_1000");
        assert_eq!(retval("helper_foo"), "helper_foo.retval");
    }

    #[test]
    fn declared_and_synthetic_names() {
        let mut m = Module::new();
        let named = m.make_value(Some("env".to_string()));
        let anon = m.make_value(None);
        assert_eq!(value_name(&m, named), "env");
        // Synthetic names come from the value's entity identity.
        assert_eq!(value_name(&m, anon), "v1");
    }

    #[test]
    fn insert_skips_constants() {
        let mut m = Module::new();
        let v = m.make_value(Some("x".to_string()));
        let mut set = NameSet::new();
        insert_value(&m, &mut set, Operand::Const(7));
        assert!(set.is_empty());
        insert_value(&m, &mut set, Operand::Value(v));
        assert_eq!(fmt_set(&set), "{ x }");
    }

    #[test]
    fn constants_bind_to_inert_names() {
        let m = Module::new();
        assert_eq!(operand_name(&m, Operand::Const(0x2a)), "const_2a");
    }
}
