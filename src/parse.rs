//! Textual loader for translator IR modules.
//!
//! The format is line oriented: one instruction per line, `;` starts a
//! comment, `declare @name` introduces a bodyless helper, and a definition
//! looks like
//!
//! ```text
//! func @tcg-llvm-tb-5-deadbeef(%env) {
//! block0:
//!   %a = load %env
//!   store %a, %env
//!   br block1
//! block1:
//!   ret
//! }
//! ```
//!
//! Block labels must appear in ordinal order, so a label is also the
//! block's position in the function. Values are `%name`, constants are bare
//! integers (decimal or `0x` hex), and `@name` references a function,
//! forward-declaring it if necessary. Unrecognized mnemonics parse into the
//! generic instruction form.

use crate::ir::{Block, BlockId, FuncId, Inst, InstKind, Module, Operand, Value};
use anyhow::{anyhow, bail, Context, Result};
use cranelift_entity::PrimaryMap;
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::path::Path;

pub fn parse_module_file(path: &Path) -> Result<Module> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading IR module {}", path.display()))?;
    parse_module(&text).with_context(|| format!("parsing IR module {}", path.display()))
}

pub fn parse_module(text: &str) -> Result<Module> {
    let mut parser = Parser {
        module: Module::new(),
        cur: None,
    };
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        parser
            .line(line)
            .with_context(|| format!("line {}: {}", lineno + 1, raw.trim()))?;
    }
    if let Some(cur) = &parser.cur {
        bail!("unterminated function @{}", parser.module.funcs[cur.id].name);
    }
    Ok(parser.module)
}

/// A definition being accumulated between `func ... {` and `}`.
struct FuncInProgress {
    id: FuncId,
    params: Vec<Value>,
    blocks: PrimaryMap<BlockId, Block>,
    /// Textual value scope; `%name` tokens are function-local.
    scope: FxHashMap<String, Value>,
    /// Highest block ordinal referenced by a terminator or phi, checked
    /// against the block count when the body closes.
    max_block_ref: u32,
}

struct Parser {
    module: Module,
    cur: Option<FuncInProgress>,
}

impl Parser {
    fn line(&mut self, line: &str) -> Result<()> {
        if let Some(rest) = line.strip_prefix("declare ") {
            if self.cur.is_some() {
                bail!("declare inside a function body");
            }
            let toks = tokenize(rest)?;
            let mut toks = Toks::new(&toks);
            let name = toks.expect_func()?;
            toks.expect_done()?;
            self.module.declare_func(&name);
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix("func ") {
            if self.cur.is_some() {
                bail!("nested function definition");
            }
            let toks = tokenize(rest)?;
            let mut toks = Toks::new(&toks);
            let name = toks.expect_func()?;
            let id = self.module.declare_func(&name);
            if !self.module.funcs[id].is_declaration() {
                bail!("duplicate definition of @{}", name);
            }
            let mut cur = FuncInProgress {
                id,
                params: Vec::new(),
                blocks: PrimaryMap::new(),
                scope: FxHashMap::default(),
                max_block_ref: 0,
            };
            toks.expect_punct('(')?;
            while !toks.eat_punct(')') {
                if !cur.params.is_empty() {
                    toks.expect_punct(',')?;
                }
                let pname = toks.expect_value()?;
                let v = value_for(&mut self.module, &mut cur, &pname);
                cur.params.push(v);
            }
            toks.expect_punct('{')?;
            toks.expect_done()?;
            self.cur = Some(cur);
            return Ok(());
        }

        if line == "}" {
            let cur = self.cur.take().ok_or_else(|| anyhow!("stray '}}'"))?;
            if cur.blocks.is_empty() {
                bail!(
                    "function @{} has a body but no blocks",
                    self.module.funcs[cur.id].name
                );
            }
            if cur.max_block_ref as usize >= cur.blocks.len() {
                bail!(
                    "function @{} references block{} but has {} blocks",
                    self.module.funcs[cur.id].name,
                    cur.max_block_ref,
                    cur.blocks.len()
                );
            }
            let f = &mut self.module.funcs[cur.id];
            f.params = cur.params;
            f.blocks = cur.blocks;
            return Ok(());
        }

        if let Some(label) = line.strip_suffix(':') {
            if let Some(ord) = label.strip_prefix("block") {
                let cur = self
                    .cur
                    .as_mut()
                    .ok_or_else(|| anyhow!("block label outside of a function"))?;
                let ord: u32 = ord.parse().map_err(|_| anyhow!("bad block label"))?;
                if ord as usize != cur.blocks.len() {
                    bail!("expected block{} here, labels are ordinal", cur.blocks.len());
                }
                cur.blocks.push(Block::default());
                return Ok(());
            }
        }

        let cur = self
            .cur
            .as_mut()
            .ok_or_else(|| anyhow!("instruction outside of a function"))?;
        if cur.blocks.is_empty() {
            bail!("instruction before the first block label");
        }
        let toks = tokenize(line)?;
        let inst = parse_inst(&mut self.module, cur, &toks)?;
        let last = cur.blocks.keys().last().unwrap();
        cur.blocks[last].insts.push(inst);
        Ok(())
    }
}

fn value_for(module: &mut Module, cur: &mut FuncInProgress, name: &str) -> Value {
    if let Some(&v) = cur.scope.get(name) {
        return v;
    }
    let v = module.make_value(Some(name.to_string()));
    cur.scope.insert(name.to_string(), v);
    v
}

fn parse_inst(module: &mut Module, cur: &mut FuncInProgress, toks: &[Tok]) -> Result<Inst> {
    let mut toks = Toks::new(toks);

    let result = if toks.peek2_is_assign() {
        let name = toks.expect_value()?;
        toks.expect_punct('=')?;
        Some(value_for(module, cur, &name))
    } else {
        None
    };

    let mnemonic = toks.expect_ident()?;
    let kind = match mnemonic.as_str() {
        "load" => InstKind::Load {
            ptr: toks.expect_operand(module, cur)?,
        },
        "store" => {
            let volatile = toks.eat_ident("volatile");
            let value = toks.expect_operand(module, cur)?;
            toks.expect_punct(',')?;
            let ptr = toks.expect_operand(module, cur)?;
            InstKind::Store {
                value,
                ptr,
                volatile,
            }
        }
        "br" => {
            if toks.peek_is_block() {
                let succ = toks.expect_block(cur)?;
                InstKind::Br {
                    cond: None,
                    succs: SmallVec::from_slice(&[succ]),
                }
            } else {
                let cond = toks.expect_operand(module, cur)?;
                toks.expect_punct(',')?;
                let t = toks.expect_block(cur)?;
                toks.expect_punct(',')?;
                let f = toks.expect_block(cur)?;
                InstKind::Br {
                    cond: Some(cond),
                    succs: SmallVec::from_slice(&[t, f]),
                }
            }
        }
        "switch" => {
            let cond = toks.expect_operand(module, cur)?;
            toks.expect_punct(',')?;
            let default = toks.expect_block(cur)?;
            toks.expect_punct('[')?;
            let mut cases = Vec::new();
            while !toks.eat_punct(']') {
                if !cases.is_empty() {
                    toks.expect_punct(',')?;
                }
                let key = toks.expect_num()?;
                toks.expect_punct(':')?;
                let target = toks.expect_block(cur)?;
                cases.push((key, target));
            }
            InstKind::Switch {
                cond,
                default,
                cases,
            }
        }
        "select" => {
            let cond = toks.expect_operand(module, cur)?;
            toks.expect_punct(',')?;
            let on_true = toks.expect_operand(module, cur)?;
            toks.expect_punct(',')?;
            let on_false = toks.expect_operand(module, cur)?;
            InstKind::Select {
                cond,
                on_true,
                on_false,
            }
        }
        "call" => {
            let callee = toks.expect_func()?;
            let callee = module.declare_func(&callee);
            toks.expect_punct('(')?;
            let mut args = SmallVec::new();
            while !toks.eat_punct(')') {
                if !args.is_empty() {
                    toks.expect_punct(',')?;
                }
                args.push(toks.expect_operand(module, cur)?);
            }
            InstKind::Call { callee, args }
        }
        "ret" => {
            let value = if toks.done() {
                None
            } else {
                Some(toks.expect_operand(module, cur)?)
            };
            InstKind::Ret { value }
        }
        "phi" => {
            toks.expect_punct('[')?;
            let mut incoming = Vec::new();
            while !toks.eat_punct(']') {
                if !incoming.is_empty() {
                    toks.expect_punct(',')?;
                }
                let pred = toks.expect_block(cur)?;
                toks.expect_punct(':')?;
                let value = toks.expect_operand(module, cur)?;
                incoming.push((pred, value));
            }
            InstKind::Phi { incoming }
        }
        "unreachable" => InstKind::Unreachable,
        _ => {
            let mut operands = SmallVec::new();
            while !toks.done() {
                if !operands.is_empty() {
                    toks.expect_punct(',')?;
                }
                operands.push(toks.expect_operand(module, cur)?);
            }
            InstKind::Other {
                op: mnemonic,
                operands,
            }
        }
    };
    toks.expect_done()?;
    Ok(Inst { result, kind })
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Value(String),
    Func(String),
    Ident(String),
    Num(u64),
    Punct(char),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn tokenize(line: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            ',' | '(' | ')' | '[' | ']' | ':' | '=' | '{' | '}' => {
                toks.push(Tok::Punct(c));
                chars.next();
            }
            '%' | '@' => {
                chars.next();
                let name = take_while(&mut chars, is_ident_char);
                if name.is_empty() {
                    bail!("empty name after '{}'", c);
                }
                toks.push(if c == '%' {
                    Tok::Value(name)
                } else {
                    Tok::Func(name)
                });
            }
            '-' | '0'..='9' => {
                let neg = c == '-';
                if neg {
                    chars.next();
                }
                let digits = take_while(&mut chars, is_ident_char);
                let n = parse_num(&digits)?;
                toks.push(Tok::Num(if neg { n.wrapping_neg() } else { n }));
            }
            c if is_ident_char(c) => {
                toks.push(Tok::Ident(take_while(&mut chars, is_ident_char)));
            }
            _ => bail!("unexpected character '{}'", c),
        }
    }
    Ok(toks)
}

fn take_while(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    pred: fn(char) -> bool,
) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if !pred(c) {
            break;
        }
        out.push(c);
        chars.next();
    }
    out
}

fn parse_num(digits: &str) -> Result<u64> {
    let parsed = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse()
    };
    parsed.map_err(|_| anyhow!("bad integer literal '{}'", digits))
}

/// A small cursor over a tokenized line.
struct Toks<'a> {
    toks: &'a [Tok],
    i: usize,
}

impl<'a> Toks<'a> {
    fn new(toks: &'a [Tok]) -> Toks<'a> {
        Toks { toks, i: 0 }
    }

    fn done(&self) -> bool {
        self.i >= self.toks.len()
    }

    fn expect_done(&self) -> Result<()> {
        if !self.done() {
            bail!("trailing tokens: {:?}", &self.toks[self.i..]);
        }
        Ok(())
    }

    fn next(&mut self) -> Result<&'a Tok> {
        let tok = self.toks.get(self.i).ok_or_else(|| anyhow!("unexpected end of line"))?;
        self.i += 1;
        Ok(tok)
    }

    fn peek2_is_assign(&self) -> bool {
        matches!(self.toks.get(self.i), Some(Tok::Value(_)))
            && matches!(self.toks.get(self.i + 1), Some(Tok::Punct('=')))
    }

    fn peek_is_block(&self) -> bool {
        matches!(self.toks.get(self.i), Some(Tok::Ident(s)) if s.starts_with("block"))
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        match self.next()? {
            Tok::Punct(p) if *p == c => Ok(()),
            tok => bail!("expected '{}', found {:?}", c, tok),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if matches!(self.toks.get(self.i), Some(Tok::Punct(p)) if *p == c) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.toks.get(self.i), Some(Tok::Ident(s)) if s == word) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next()? {
            Tok::Ident(s) => Ok(s.clone()),
            tok => bail!("expected an identifier, found {:?}", tok),
        }
    }

    fn expect_value(&mut self) -> Result<String> {
        match self.next()? {
            Tok::Value(s) => Ok(s.clone()),
            tok => bail!("expected a %value, found {:?}", tok),
        }
    }

    fn expect_func(&mut self) -> Result<String> {
        match self.next()? {
            Tok::Func(s) => Ok(s.clone()),
            tok => bail!("expected a @function, found {:?}", tok),
        }
    }

    fn expect_num(&mut self) -> Result<u64> {
        match self.next()? {
            Tok::Num(n) => Ok(*n),
            tok => bail!("expected an integer, found {:?}", tok),
        }
    }

    fn expect_block(&mut self, cur: &mut FuncInProgress) -> Result<BlockId> {
        match self.next()? {
            Tok::Ident(s) => {
                let ord: u32 = s
                    .strip_prefix("block")
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| anyhow!("expected a block reference, found '{}'", s))?;
                cur.max_block_ref = cur.max_block_ref.max(ord);
                Ok(BlockId::from_u32(ord))
            }
            tok => bail!("expected a block reference, found {:?}", tok),
        }
    }

    fn expect_operand(&mut self, module: &mut Module, cur: &mut FuncInProgress) -> Result<Operand> {
        match self.next()? {
            Tok::Value(name) => Ok(Operand::Value(value_for(module, cur, name))),
            Tok::Num(n) => Ok(Operand::Const(*n)),
            tok => bail!("expected an operand, found {:?}", tok),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::index_pos;

    #[test]
    fn parses_every_instruction_form() {
        let text = r#"
; a comment
declare @__ldl_mmu
declare @log_dynval

func @helper_foo(%a, %b) {
block0:
  %s = add %a, %b
  ret %s
}

func @tcg-llvm-tb-5-deadbeef(%env) {
block0:
  %p = getelementptr %env, 16
  %x = load %p
  %m = call @__ldl_mmu(%x, 1)
  %r = call @helper_foo(%m, 0x10)
  call @log_dynval(%r)
  %c = icmp %r, 0
  br %c, block1, block2
block1:
  %q = phi [ block0: %r, block1: %q ]
  store volatile %q, %p
  switch %q, block1 [ 1: block2, 2: block0 ]
block2:
  %sel = select %c, %q, %r
  unreachable
}
"#;
        let m = parse_module(text).unwrap();
        assert_eq!(m.funcs.len(), 4);

        let tb = m.func_by_name("tcg-llvm-tb-5-deadbeef").unwrap();
        let f = &m.funcs[tb];
        assert_eq!(f.params.len(), 1);
        assert_eq!(f.blocks.len(), 3);

        let ld = m.func_by_name("__ldl_mmu").unwrap();
        assert!(m.funcs[ld].is_declaration());
        let helper = m.func_by_name("helper_foo").unwrap();
        assert!(!m.funcs[helper].is_declaration());
        assert_eq!(m.funcs[helper].params.len(), 2);

        let entry = &f.blocks[BlockId::from_u32(0)];
        assert!(matches!(entry.insts[0].kind, InstKind::Other { ref op, .. } if op == "getelementptr"));
        assert!(matches!(entry.insts[1].kind, InstKind::Load { .. }));
        match &entry.insts[3].kind {
            InstKind::Call { callee, args } => {
                assert_eq!(*callee, helper);
                assert_eq!(args.len(), 2);
                assert_eq!(args[1], Operand::Const(0x10));
            }
            other => panic!("expected call, got {:?}", other),
        }
        assert!(entry.insts[4].result.is_none());
        match &entry.insts[6].kind {
            InstKind::Br { cond, succs } => {
                assert!(cond.is_some());
                assert_eq!(succs.len(), 2);
            }
            other => panic!("expected br, got {:?}", other),
        }

        let b1 = &f.blocks[BlockId::from_u32(1)];
        match &b1.insts[0].kind {
            InstKind::Phi { incoming } => {
                assert_eq!(incoming.len(), 2);
                assert_eq!(incoming[0].0, BlockId::from_u32(0));
            }
            other => panic!("expected phi, got {:?}", other),
        }
        assert!(matches!(
            b1.insts[1].kind,
            InstKind::Store { volatile: true, .. }
        ));
        match &b1.insts[2].kind {
            InstKind::Switch { default, cases, .. } => {
                assert_eq!(*default, BlockId::from_u32(1));
                assert_eq!(cases, &[(1, BlockId::from_u32(2)), (2, BlockId::from_u32(0))]);
            }
            other => panic!("expected switch, got {:?}", other),
        }

        // Packed index resolution agrees with the layout.
        let inst = f.inst(crate::ir::pack_index(BlockId::from_u32(2), 1));
        assert!(matches!(inst.kind, InstKind::Unreachable));
        assert_eq!(index_pos(crate::ir::pack_index(BlockId::from_u32(2), 1)), 1);
    }

    #[test]
    fn values_are_scoped_per_function() {
        let text = r#"
func @f(%env) {
block0:
  ret %env
}
func @g(%env) {
block0:
  ret %env
}
"#;
        let m = parse_module(text).unwrap();
        let f = m.func_by_name("f").unwrap();
        let g = m.func_by_name("g").unwrap();
        assert_ne!(m.funcs[f].params[0], m.funcs[g].params[0]);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_module("func @f(%a) {\nblock0:\n  ret\n").is_err()); // unterminated
        assert!(parse_module("  %x = load %p\n").is_err()); // outside function
        assert!(parse_module("func @f() {\nblock1:\n  ret\n}\n").is_err()); // label order
        assert!(parse_module("func @f() {\nblock0:\n  br block7\n}\n").is_err()); // bad block ref
        assert!(
            parse_module("func @f() {\nblock0:\n  ret\n}\nfunc @f() {\nblock0:\n  ret\n}\n")
                .is_err()
        ); // duplicate
    }

    #[test]
    fn negative_and_hex_constants() {
        let text = "func @f() {\nblock0:\n  %x = add -1, 0xff\n  ret\n}\n";
        let m = parse_module(text).unwrap();
        let f = m.func_by_name("f").unwrap();
        match &m.funcs[f].blocks[BlockId::from_u32(0)].insts[0].kind {
            InstKind::Other { operands, .. } => {
                assert_eq!(operands[0], Operand::Const(u64::MAX));
                assert_eq!(operands[1], Operand::Const(0xff));
            }
            other => panic!("expected generic op, got {:?}", other),
        }
    }
}
