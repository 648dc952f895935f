//! Translator IR: a module of functions, blocks, and tagged instructions.
//!
//! This is the static side of the slicer's input. Instructions carry a
//! dedicated variant wherever alignment or use/def extraction needs to see
//! structure (loads, stores, terminators, calls, phis, selects); everything
//! else parses into `Other` and takes the default paths.

use cranelift_entity::{entity_impl, PrimaryMap};
use fxhash::FxHashMap;
use smallvec::SmallVec;

/// An IR function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
entity_impl!(FuncId, "fn");

/// A basic block. The entity index is the block's ordinal in its function's
/// block list.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "block");

/// An SSA value. Values are module-global entities so that a value's
/// identity, and the synthetic name derived from it, is unique across
/// functions; cross-function argument binding depends on that.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

#[derive(Debug, Clone)]
pub struct ValueData {
    /// Declared textual name, if the value has one.
    pub name: Option<String>,
}

/// An instruction operand: an SSA value or a compile-time constant. Block
/// references are typed successor fields on the owning instruction, never
/// operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Value(Value),
    Const(u64),
}

#[derive(Debug, Clone)]
pub enum InstKind {
    Load {
        ptr: Operand,
    },
    Store {
        value: Operand,
        ptr: Operand,
        volatile: bool,
    },
    Br {
        cond: Option<Operand>,
        succs: SmallVec<[BlockId; 2]>,
    },
    Switch {
        cond: Operand,
        default: BlockId,
        cases: Vec<(u64, BlockId)>,
    },
    Select {
        cond: Operand,
        on_true: Operand,
        on_false: Operand,
    },
    Call {
        callee: FuncId,
        args: SmallVec<[Operand; 4]>,
    },
    Ret {
        value: Option<Operand>,
    },
    Phi {
        incoming: Vec<(BlockId, Operand)>,
    },
    Unreachable,
    /// Arithmetic, comparisons, casts, GEPs, and anything else with plain
    /// operands-to-result dataflow.
    Other {
        op: String,
        operands: SmallVec<[Operand; 4]>,
    },
}

impl InstKind {
    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. } | InstKind::Switch { .. } | InstKind::Ret { .. } | InstKind::Unreachable
        )
    }

    pub fn mnemonic(&self) -> &str {
        match self {
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::Br { .. } => "br",
            InstKind::Switch { .. } => "switch",
            InstKind::Select { .. } => "select",
            InstKind::Call { .. } => "call",
            InstKind::Ret { .. } => "ret",
            InstKind::Phi { .. } => "phi",
            InstKind::Unreachable => "unreachable",
            InstKind::Other { op, .. } => op,
        }
    }
}

/// One instruction. `result` is the SSA value the instruction defines, when
/// it has a non-void result.
#[derive(Debug, Clone)]
pub struct Inst {
    pub result: Option<Value>,
    pub kind: InstKind,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub insts: Vec<Inst>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Value>,
    pub blocks: PrimaryMap<BlockId, Block>,
}

impl Function {
    /// A function with no body; the aligner never descends into these.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_intrinsic(&self) -> bool {
        self.name.starts_with("llvm.")
    }

    /// Resolve a packed `(block << 16) | pos` index.
    pub fn inst(&self, index: u32) -> &Inst {
        &self.blocks[index_block(index)].insts[index_pos(index)]
    }
}

/// Pack a static instruction position into the index format shared by
/// aligned entries and the marked map.
pub fn pack_index(block: BlockId, pos: usize) -> u32 {
    (block.as_u32() << 16) | pos as u32
}

pub fn index_block(index: u32) -> BlockId {
    BlockId::from_u32(index >> 16)
}

pub fn index_pos(index: u32) -> usize {
    (index & 0xffff) as usize
}

#[derive(Debug, Default)]
pub struct Module {
    pub funcs: PrimaryMap<FuncId, Function>,
    pub values: PrimaryMap<Value, ValueData>,
    by_name: FxHashMap<String, FuncId>,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    /// Look up `name`, creating a declaration stub if it is new. A later
    /// definition fills in the stub's params and blocks.
    pub fn declare_func(&mut self, name: &str) -> FuncId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.funcs.push(Function {
            name: name.to_string(),
            params: Vec::new(),
            blocks: PrimaryMap::new(),
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn make_value(&mut self, name: Option<String>) -> Value {
        self.values.push(ValueData { name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_index_round_trip() {
        let idx = pack_index(BlockId::from_u32(3), 17);
        assert_eq!(index_block(idx), BlockId::from_u32(3));
        assert_eq!(index_pos(idx), 17);
        assert_eq!(pack_index(BlockId::from_u32(0), 0), 0);
    }

    #[test]
    fn declare_is_idempotent() {
        let mut m = Module::new();
        let a = m.declare_func("helper_foo");
        let b = m.declare_func("helper_foo");
        assert_eq!(a, b);
        assert!(m.funcs[a].is_declaration());
        assert_eq!(m.func_by_name("helper_foo"), Some(a));
        assert_eq!(m.func_by_name("helper_bar"), None);
    }

    #[test]
    fn intrinsic_by_name() {
        let mut m = Module::new();
        let id = m.declare_func("llvm.memcpy.p0i8.p0i8.i64");
        assert!(m.funcs[id].is_intrinsic());
        let id = m.declare_func("helper_foo");
        assert!(!m.funcs[id].is_intrinsic());
    }

    #[test]
    fn terminator_classification() {
        assert!(InstKind::Unreachable.is_terminator());
        assert!(InstKind::Ret { value: None }.is_terminator());
        assert!(!InstKind::Load {
            ptr: Operand::Const(0)
        }
        .is_terminator());
    }
}
