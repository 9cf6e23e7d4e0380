// This module defines the in-memory IR every obfuscation pass reads and rewrites. A Module
// owns its functions, global variables and a constant pool of string literals. A Function
// owns three arenas (blocks, instructions, values) indexed by stable integer IDs, plus a
// layout vector giving the block order with the entry block first. Instructions reference
// operands by ValueId and successors by BlockId, never by pointer, so passes can split,
// clone and delete blocks without lifetime hazards. Use-lists are not stored; they are
// computed on demand by the analysis module. Removed blocks leave a tombstone in the arena
// so existing BlockIds stay meaningful.

//! Obfuscator IR.
//!
//! The textual form handled by [`parser`] and [`printer`] looks like:
//!
//! ```text
//! global @counter: i32 = 0
//! string @.msg = "hello"
//! declare @puts(ptr) -> i32
//!
//! define @main(%n: i32) -> i32 {
//! entry:
//!   %zero = const i32 0
//!   %neg = icmp slt %n, %zero
//!   condbr %neg, ^flip, ^done
//! flip:
//!   %m = sub i32 %zero, %n
//!   br ^done
//! done:
//!   %r = phi i32 [^entry, %n], [^flip, %m]
//!   ret %r
//! }
//! ```

use hashbrown::{HashMap, HashSet};
use std::fmt;

pub mod builder;
pub mod constants;
pub mod parser;
pub mod printer;

pub use builder::FunctionBuilder;
pub use constants::{ConstOrigin, ConstantPool, StringConstant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ConstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Scalar types understood by the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    I1,
    I8,
    I32,
    I64,
    Ptr,
}

impl Type {
    pub fn name(self) -> &'static str {
        match self {
            Type::Void => "void",
            Type::I1 => "i1",
            Type::I8 => "i8",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::Ptr => "ptr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "void" => Some(Type::Void),
            "i1" => Some(Type::I1),
            "i8" => Some(Type::I8),
            "i32" => Some(Type::I32),
            "i64" => Some(Type::I64),
            "ptr" => Some(Type::Ptr),
            _ => None,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, Type::I1 | Type::I8 | Type::I32 | Type::I64)
    }

    /// Width in bits. Pointers are 64 bits wide.
    pub fn bits(self) -> u32 {
        match self {
            Type::Void => 0,
            Type::I1 => 1,
            Type::I8 => 8,
            Type::I32 => 32,
            Type::I64 | Type::Ptr => 64,
        }
    }

    /// Size in memory.
    pub fn byte_size(self) -> u64 {
        match self {
            Type::Void => 0,
            Type::I1 | Type::I8 => 1,
            Type::I32 => 4,
            Type::I64 | Type::Ptr => 8,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    UDiv,
    URem,
    SDiv,
    SRem,
}

impl BinOp {
    pub const ALL: [BinOp; 13] = [
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::And,
        BinOp::Or,
        BinOp::Xor,
        BinOp::Shl,
        BinOp::LShr,
        BinOp::AShr,
        BinOp::UDiv,
        BinOp::URem,
        BinOp::SDiv,
        BinOp::SRem,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
            BinOp::UDiv => "udiv",
            BinOp::URem => "urem",
            BinOp::SDiv => "sdiv",
            BinOp::SRem => "srem",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl CmpPred {
    pub const ALL: [CmpPred; 10] = [
        CmpPred::Eq,
        CmpPred::Ne,
        CmpPred::Slt,
        CmpPred::Sle,
        CmpPred::Sgt,
        CmpPred::Sge,
        CmpPred::Ult,
        CmpPred::Ule,
        CmpPred::Ugt,
        CmpPred::Uge,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Slt => "slt",
            CmpPred::Sle => "sle",
            CmpPred::Sgt => "sgt",
            CmpPred::Sge => "sge",
            CmpPred::Ult => "ult",
            CmpPred::Ule => "ule",
            CmpPred::Ugt => "ugt",
            CmpPred::Uge => "uge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == s)
    }

    /// Predicate with the opposite truth value.
    pub fn inverse(self) -> Self {
        match self {
            CmpPred::Eq => CmpPred::Ne,
            CmpPred::Ne => CmpPred::Eq,
            CmpPred::Slt => CmpPred::Sge,
            CmpPred::Sle => CmpPred::Sgt,
            CmpPred::Sgt => CmpPred::Sle,
            CmpPred::Sge => CmpPred::Slt,
            CmpPred::Ult => CmpPred::Uge,
            CmpPred::Ule => CmpPred::Ugt,
            CmpPred::Ugt => CmpPred::Ule,
            CmpPred::Uge => CmpPred::Ult,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Zext,
    Sext,
    Trunc,
}

impl CastOp {
    pub fn name(self) -> &'static str {
        match self {
            CastOp::Zext => "zext",
            CastOp::Sext => "sext",
            CastOp::Trunc => "trunc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zext" => Some(CastOp::Zext),
            "sext" => Some(CastOp::Sext),
            "trunc" => Some(CastOp::Trunc),
            _ => None,
        }
    }
}

/// Instruction payload. Result types live on [`Inst::ty`].
#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Const { value: i64 },
    Binary { op: BinOp, lhs: ValueId, rhs: ValueId },
    Icmp { pred: CmpPred, lhs: ValueId, rhs: ValueId },
    Select { cond: ValueId, on_true: ValueId, on_false: ValueId },
    Cast { op: CastOp, value: ValueId },
    Alloca { elem: Type, count: u32 },
    Load { ptr: ValueId, volatile: bool },
    Store { value: ValueId, ptr: ValueId, volatile: bool },
    /// Byte offset from a pointer.
    Gep { base: ValueId, offset: ValueId },
    StrRef { constant: ConstId },
    GlobalAddr { global: String },
    BlockAddr { block: BlockId },
    Call { callee: String, args: Vec<ValueId> },
    /// Call through a function pointer.
    CallIndirect { callee: ValueId, args: Vec<ValueId> },
    Phi { incoming: Vec<(BlockId, ValueId)> },
    Br { target: BlockId },
    CondBr { cond: ValueId, then_dest: BlockId, else_dest: BlockId },
    Switch { value: ValueId, default: BlockId, cases: Vec<(i64, BlockId)> },
    IndirectBr { addr: ValueId, dests: Vec<BlockId> },
    Ret { value: Option<ValueId> },
    Unreachable,
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Switch { .. }
                | InstKind::IndirectBr { .. }
                | InstKind::Ret { .. }
                | InstKind::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    /// Mnemonic used by the printer and in diagnostics.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            InstKind::Const { .. } => "const",
            InstKind::Binary { op, .. } => op.name(),
            InstKind::Icmp { .. } => "icmp",
            InstKind::Select { .. } => "select",
            InstKind::Cast { op, .. } => op.name(),
            InstKind::Alloca { .. } => "alloca",
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::Gep { .. } => "gep",
            InstKind::StrRef { .. } => "str",
            InstKind::GlobalAddr { .. } => "global",
            InstKind::BlockAddr { .. } => "blockaddr",
            InstKind::Call { .. } | InstKind::CallIndirect { .. } => "call",
            InstKind::Phi { .. } => "phi",
            InstKind::Br { .. } => "br",
            InstKind::CondBr { .. } => "condbr",
            InstKind::Switch { .. } => "switch",
            InstKind::IndirectBr { .. } => "indirectbr",
            InstKind::Ret { .. } => "ret",
            InstKind::Unreachable => "unreachable",
        }
    }

    /// Value operands in source order.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::Const { .. }
            | InstKind::Alloca { .. }
            | InstKind::StrRef { .. }
            | InstKind::GlobalAddr { .. }
            | InstKind::BlockAddr { .. }
            | InstKind::Br { .. }
            | InstKind::Unreachable => Vec::new(),
            InstKind::Binary { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            InstKind::Select { cond, on_true, on_false } => vec![*cond, *on_true, *on_false],
            InstKind::Cast { value, .. } => vec![*value],
            InstKind::Load { ptr, .. } => vec![*ptr],
            InstKind::Store { value, ptr, .. } => vec![*value, *ptr],
            InstKind::Gep { base, offset } => vec![*base, *offset],
            InstKind::Call { args, .. } => args.clone(),
            InstKind::CallIndirect { callee, args } => {
                std::iter::once(*callee).chain(args.iter().copied()).collect()
            }
            InstKind::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            InstKind::CondBr { cond, .. } => vec![*cond],
            InstKind::Switch { value, .. } => vec![*value],
            InstKind::IndirectBr { addr, .. } => vec![*addr],
            InstKind::Ret { value } => value.iter().copied().collect(),
        }
    }

    /// Mutable access to every value operand.
    pub fn operands_mut(&mut self) -> Vec<&mut ValueId> {
        match self {
            InstKind::Const { .. }
            | InstKind::Alloca { .. }
            | InstKind::StrRef { .. }
            | InstKind::GlobalAddr { .. }
            | InstKind::BlockAddr { .. }
            | InstKind::Br { .. }
            | InstKind::Unreachable => Vec::new(),
            InstKind::Binary { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            InstKind::Select { cond, on_true, on_false } => vec![cond, on_true, on_false],
            InstKind::Cast { value, .. } => vec![value],
            InstKind::Load { ptr, .. } => vec![ptr],
            InstKind::Store { value, ptr, .. } => vec![value, ptr],
            InstKind::Gep { base, offset } => vec![base, offset],
            InstKind::Call { args, .. } => args.iter_mut().collect(),
            InstKind::CallIndirect { callee, args } => {
                std::iter::once(callee).chain(args.iter_mut()).collect()
            }
            InstKind::Phi { incoming } => incoming.iter_mut().map(|(_, v)| v).collect(),
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::Switch { value, .. } => vec![value],
            InstKind::IndirectBr { addr, .. } => vec![addr],
            InstKind::Ret { value } => value.iter_mut().collect(),
        }
    }

    /// Successor blocks of a terminator, duplicates included.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr { then_dest, else_dest, .. } => vec![*then_dest, *else_dest],
            InstKind::Switch { default, cases, .. } => {
                let mut succs = vec![*default];
                succs.extend(cases.iter().map(|(_, b)| *b));
                succs
            }
            InstKind::IndirectBr { dests, .. } => dests.clone(),
            _ => Vec::new(),
        }
    }

    /// Mutable access to successor slots of a terminator.
    pub fn successors_mut(&mut self) -> Vec<&mut BlockId> {
        match self {
            InstKind::Br { target } => vec![target],
            InstKind::CondBr { then_dest, else_dest, .. } => vec![then_dest, else_dest],
            InstKind::Switch { default, cases, .. } => {
                let mut succs = vec![default];
                succs.extend(cases.iter_mut().map(|(_, b)| b));
                succs
            }
            InstKind::IndirectBr { dests, .. } => dests.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// Every block the instruction names, including phi sources and block addresses.
    pub fn block_refs_mut(&mut self) -> Vec<&mut BlockId> {
        match self {
            InstKind::Phi { incoming } => incoming.iter_mut().map(|(b, _)| b).collect(),
            InstKind::BlockAddr { block } => vec![block],
            other => other.successors_mut(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub kind: InstKind,
    /// Result type; `Void` for instructions without a result.
    pub ty: Type,
    pub result: Option<ValueId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    Param(u32),
    Inst(InstId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueData {
    pub name: String,
    pub ty: Type,
    pub def: ValueDef,
}

/// Why a block exists. Passes tag what they create so later stages can tell
/// intentional dead code apart from orphaned blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    Original,
    SplitTail,
    OpaqueDead,
    Dispatch,
    DispatchDefault,
    OutlinedCall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockData {
    pub name: String,
    pub insts: Vec<InstId>,
    pub role: BlockRole,
    removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attr {
    OptNone,
    NoInline,
}

impl Attr {
    pub fn name(self) -> &'static str {
        match self {
            Attr::OptNone => "optnone",
            Attr::NoInline => "noinline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "optnone" => Some(Attr::OptNone),
            "noinline" => Some(Attr::NoInline),
            _ => None,
        }
    }
}

/// Hands out unique names inside one function.
#[derive(Debug, Clone, Default, PartialEq)]
struct Namer {
    used: HashSet<String>,
    counters: HashMap<String, u32>,
}

impl Namer {
    fn claim(&mut self, base: &str) -> String {
        if self.used.insert(base.to_string()) {
            return base.to_string();
        }
        let counter = self.counters.entry(base.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{base}{counter}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.used.contains(name)
    }
}

/// A function definition or declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValueId>,
    pub ret_ty: Type,
    pub attrs: Vec<Attr>,
    pub is_declaration: bool,
    layout: Vec<BlockId>,
    blocks: Vec<BlockData>,
    insts: Vec<Inst>,
    values: Vec<ValueData>,
    value_names: Namer,
    block_names: Namer,
}

impl Function {
    /// Create an empty function definition with the given parameters.
    pub fn new(name: &str, params: &[(&str, Type)], ret_ty: Type) -> Self {
        let mut func = Self {
            name: name.to_string(),
            params: Vec::new(),
            ret_ty,
            attrs: Vec::new(),
            is_declaration: false,
            layout: Vec::new(),
            blocks: Vec::new(),
            insts: Vec::new(),
            values: Vec::new(),
            value_names: Namer::default(),
            block_names: Namer::default(),
        };
        for (idx, (pname, ty)) in params.iter().enumerate() {
            let name = func.value_names.claim(pname);
            let id = ValueId(func.values.len() as u32);
            func.values.push(ValueData { name, ty: *ty, def: ValueDef::Param(idx as u32) });
            func.params.push(id);
        }
        func
    }

    /// Create an external declaration.
    pub fn declare(name: &str, param_tys: &[Type], ret_ty: Type) -> Self {
        let names: Vec<String> = (0..param_tys.len()).map(|i| format!("a{i}")).collect();
        let params: Vec<(&str, Type)> =
            names.iter().map(String::as_str).zip(param_tys.iter().copied()).collect();
        let mut func = Self::new(name, &params, ret_ty);
        func.is_declaration = true;
        func
    }

    pub fn has_attr(&self, attr: Attr) -> bool {
        self.attrs.contains(&attr)
    }

    pub fn add_attr(&mut self, attr: Attr) {
        if !self.has_attr(attr) {
            self.attrs.push(attr);
            self.attrs.sort();
        }
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.params.iter().map(|p| self.value_ty(*p)).collect()
    }

    // ----- blocks -----

    /// Blocks in layout order. The first one is the entry.
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn block_count(&self) -> usize {
        self.layout.len()
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BlockData {
        &mut self.blocks[id.index()]
    }

    pub fn block_name(&self, id: BlockId) -> &str {
        &self.blocks[id.index()].name
    }

    /// Block name, tolerating ids that do not exist (used when printing broken IR).
    pub fn block_name_or_placeholder(&self, id: BlockId) -> String {
        match self.blocks.get(id.index()) {
            Some(data) => data.name.clone(),
            None => format!("<invalid {}>", id.0),
        }
    }

    pub fn is_live_block(&self, id: BlockId) -> bool {
        id.index() < self.blocks.len() && !self.blocks[id.index()].removed
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.layout.iter().copied().find(|b| self.block_name(*b) == name)
    }

    fn new_block_data(&mut self, name: &str, role: BlockRole) -> BlockId {
        let name = self.block_names.claim(name);
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData { name, insts: Vec::new(), role, removed: false });
        id
    }

    /// Append a new block at the end of the layout.
    pub fn add_block(&mut self, name: &str) -> BlockId {
        self.add_block_with_role(name, BlockRole::Original)
    }

    pub fn add_block_with_role(&mut self, name: &str, role: BlockRole) -> BlockId {
        let id = self.new_block_data(name, role);
        self.layout.push(id);
        id
    }

    /// Insert a new block directly after `after` in the layout.
    pub fn insert_block_after(&mut self, after: BlockId, name: &str, role: BlockRole) -> BlockId {
        let id = self.new_block_data(name, role);
        let pos = self
            .layout
            .iter()
            .position(|b| *b == after)
            .map(|p| p + 1)
            .unwrap_or(self.layout.len());
        self.layout.insert(pos, id);
        id
    }

    /// Insert a new block at the front of the layout, making it the entry.
    pub fn insert_entry_block(&mut self, name: &str, role: BlockRole) -> BlockId {
        let id = self.new_block_data(name, role);
        self.layout.insert(0, id);
        id
    }

    /// Drop a block from the layout. Its instructions are unplaced and the id is
    /// never reused.
    pub fn remove_block(&mut self, id: BlockId) {
        self.layout.retain(|b| *b != id);
        let data = &mut self.blocks[id.index()];
        data.insts.clear();
        data.removed = true;
    }

    pub fn block_insts(&self, id: BlockId) -> &[InstId] {
        &self.blocks[id.index()].insts
    }

    pub fn block_insts_mut(&mut self, id: BlockId) -> &mut Vec<InstId> {
        &mut self.blocks[id.index()].insts
    }

    /// The terminator of a block, if its last instruction is one.
    pub fn terminator(&self, id: BlockId) -> Option<InstId> {
        let last = *self.block_insts(id).last()?;
        self.inst(last).kind.is_terminator().then_some(last)
    }

    /// Successors of a block according to its terminator.
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.terminator(id)
            .map(|t| self.inst(t).kind.successors())
            .unwrap_or_default()
    }

    /// Number of leading phi instructions.
    pub fn phi_count(&self, id: BlockId) -> usize {
        self.block_insts(id)
            .iter()
            .take_while(|i| self.inst(**i).kind.is_phi())
            .count()
    }

    // ----- instructions and values -----

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn value_ty(&self, id: ValueId) -> Type {
        self.values[id.index()].ty
    }

    pub fn value_name(&self, id: ValueId) -> &str {
        &self.values[id.index()].name
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn is_valid_value(&self, id: ValueId) -> bool {
        id.index() < self.values.len()
    }

    /// Defining instruction of a value, `None` for parameters.
    pub fn def_inst(&self, id: ValueId) -> Option<InstId> {
        match self.values[id.index()].def {
            ValueDef::Inst(inst) => Some(inst),
            ValueDef::Param(_) => None,
        }
    }

    pub fn has_value_name(&self, name: &str) -> bool {
        self.value_names.contains(name)
    }

    /// Create an unplaced instruction. A result value is allocated when `ty` is
    /// not `Void`; `name` is uniquified.
    pub fn create_inst(&mut self, kind: InstKind, ty: Type, name: &str) -> InstId {
        let id = InstId(self.insts.len() as u32);
        let result = if ty == Type::Void {
            None
        } else {
            let name = self.value_names.claim(if name.is_empty() { "v" } else { name });
            let vid = ValueId(self.values.len() as u32);
            self.values.push(ValueData { name, ty, def: ValueDef::Inst(id) });
            Some(vid)
        };
        self.insts.push(Inst { kind, ty, result });
        id
    }

    pub fn result(&self, id: InstId) -> Option<ValueId> {
        self.insts[id.index()].result
    }

    pub fn append_inst(&mut self, block: BlockId, inst: InstId) {
        self.blocks[block.index()].insts.push(inst);
    }

    pub fn insert_inst(&mut self, block: BlockId, index: usize, inst: InstId) {
        self.blocks[block.index()].insts.insert(index, inst);
    }

    /// Position of an instruction inside its block.
    pub fn inst_position(&self, block: BlockId, inst: InstId) -> Option<usize> {
        self.block_insts(block).iter().position(|i| *i == inst)
    }

    /// Block containing a placed instruction.
    pub fn inst_block(&self, inst: InstId) -> Option<BlockId> {
        self.layout
            .iter()
            .copied()
            .find(|b| self.block_insts(*b).contains(&inst))
    }

    /// Map from every placed instruction to its block.
    pub fn inst_blocks(&self) -> HashMap<InstId, BlockId> {
        let mut map = HashMap::new();
        for &block in &self.layout {
            for &inst in self.block_insts(block) {
                map.insert(inst, block);
            }
        }
        map
    }

    /// Remove an instruction from its block. The arena slot stays.
    pub fn unplace_inst(&mut self, block: BlockId, inst: InstId) {
        self.blocks[block.index()].insts.retain(|i| *i != inst);
    }

    /// Rewrite every operand equal to `old` into `new` in placed instructions.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for bi in 0..self.layout.len() {
            let block = self.layout[bi];
            for ii in 0..self.blocks[block.index()].insts.len() {
                let inst = self.blocks[block.index()].insts[ii];
                for op in self.insts[inst.index()].kind.operands_mut() {
                    if *op == old {
                        *op = new;
                    }
                }
            }
        }
    }

    /// Retarget phi entries in `block` that name `old` as source to `new`.
    pub fn retarget_phis(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        let phis: Vec<InstId> = self.block_insts(block)[..self.phi_count(block)].to_vec();
        for phi in phis {
            if let InstKind::Phi { incoming } = &mut self.insts[phi.index()].kind {
                for (src, _) in incoming.iter_mut() {
                    if *src == old {
                        *src = new;
                    }
                }
            }
        }
    }

    /// Non-terminator instructions over all blocks.
    pub fn body_inst_count(&self) -> usize {
        self.layout
            .iter()
            .flat_map(|b| self.block_insts(*b))
            .filter(|i| !self.inst(**i).kind.is_terminator())
            .count()
    }

    /// Placed instructions over all blocks.
    pub fn inst_count(&self) -> usize {
        self.layout.iter().map(|b| self.block_insts(*b).len()).sum()
    }

    /// Iterate `(block, inst)` pairs in layout order.
    pub fn placed_insts(&self) -> impl Iterator<Item = (BlockId, InstId)> + '_ {
        self.layout
            .iter()
            .flat_map(move |b| self.block_insts(*b).iter().map(move |i| (*b, *i)))
    }
}

/// A module-level variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub init: i64,
}

/// Ordered collection of functions plus module-wide data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub name: String,
    pub globals: Vec<Global>,
    pub constants: ConstantPool,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Self::default() }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Add a global unless one with the same name exists.
    pub fn ensure_global(&mut self, name: &str, ty: Type, init: i64) {
        if self.global(name).is_none() {
            self.globals.push(Global { name: name.to_string(), ty, init });
        }
    }

    /// Add an external declaration unless a function with the name exists.
    pub fn ensure_declaration(&mut self, name: &str, params: &[Type], ret: Type) {
        if self.function(name).is_none() {
            self.functions.push(Function::declare(name, params, ret));
        }
    }

    /// Signature lookup used by the verifier and interpreter.
    pub fn signature(&self, name: &str) -> Option<(Vec<Type>, Type)> {
        self.function(name).map(|f| (f.param_types(), f.ret_ty))
    }

    pub fn parse(text: &str) -> Result<Self, crate::core::ParseError> {
        parser::parse_module(text)
    }

    /// Render the module in textual form.
    pub fn print(&self) -> String {
        printer::print_module(self)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_uniquified() {
        let mut func = Function::new("f", &[("x", Type::I32)], Type::I32);
        let a = func.create_inst(InstKind::Const { value: 1 }, Type::I32, "x");
        let b = func.create_inst(InstKind::Const { value: 2 }, Type::I32, "x");
        let na = func.value_name(func.result(a).unwrap()).to_string();
        let nb = func.value_name(func.result(b).unwrap()).to_string();
        assert_eq!(na, "x1");
        assert_eq!(nb, "x2");
    }

    #[test]
    fn test_remove_block_keeps_ids_stable() {
        let mut func = Function::new("f", &[], Type::Void);
        let a = func.add_block("a");
        let b = func.add_block("b");
        let c = func.add_block("c");
        func.remove_block(b);
        assert_eq!(func.layout(), &[a, c]);
        assert!(!func.is_live_block(b));
        assert_eq!(func.block_name(c), "c");
    }

    #[test]
    fn test_switch_successors_include_default() {
        let kind = InstKind::Switch {
            value: ValueId(0),
            default: BlockId(3),
            cases: vec![(1, BlockId(1)), (2, BlockId(2))],
        };
        assert_eq!(kind.successors(), vec![BlockId(3), BlockId(1), BlockId(2)]);
        assert!(kind.is_terminator());
    }
}
