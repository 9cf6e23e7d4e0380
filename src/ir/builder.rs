//! Cursor-based instruction builder.
//!
//! Passes position a [`FunctionBuilder`] inside a block and emit instructions
//! there; every emitted instruction advances the cursor so sequences come out
//! in program order.

use super::{
    BinOp, BlockId, CastOp, CmpPred, ConstId, Function, InstId, InstKind, Type, ValueId,
};

pub struct FunctionBuilder<'f> {
    func: &'f mut Function,
    block: BlockId,
    pos: usize,
}

impl<'f> FunctionBuilder<'f> {
    /// Position at the end of `block`.
    pub fn at_end(func: &'f mut Function, block: BlockId) -> Self {
        let pos = func.block_insts(block).len();
        Self { func, block, pos }
    }

    /// Position directly before the instruction at `index` in `block`.
    pub fn at(func: &'f mut Function, block: BlockId, index: usize) -> Self {
        Self { func, block, pos: index }
    }

    /// Position before the terminator of `block` (or at the end if it has none).
    pub fn before_terminator(func: &'f mut Function, block: BlockId) -> Self {
        let len = func.block_insts(block).len();
        let pos = if func.terminator(block).is_some() { len - 1 } else { len };
        Self { func, block, pos }
    }

    /// Position after the leading phis of `block`.
    pub fn after_phis(func: &'f mut Function, block: BlockId) -> Self {
        let pos = func.phi_count(block);
        Self { func, block, pos }
    }

    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn emit(&mut self, kind: InstKind, ty: Type, name: &str) -> InstId {
        let inst = self.func.create_inst(kind, ty, name);
        self.func.insert_inst(self.block, self.pos, inst);
        self.pos += 1;
        inst
    }

    fn emit_value(&mut self, kind: InstKind, ty: Type, name: &str) -> ValueId {
        let inst = self.emit(kind, ty, name);
        self.func.result(inst).expect("typed instruction has a result")
    }

    pub fn iconst(&mut self, ty: Type, value: i64, name: &str) -> ValueId {
        self.emit_value(InstKind::Const { value }, ty, name)
    }

    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId, name: &str) -> ValueId {
        let ty = self.func.value_ty(lhs);
        self.emit_value(InstKind::Binary { op, lhs, rhs }, ty, name)
    }

    pub fn icmp(&mut self, pred: CmpPred, lhs: ValueId, rhs: ValueId, name: &str) -> ValueId {
        self.emit_value(InstKind::Icmp { pred, lhs, rhs }, Type::I1, name)
    }

    pub fn select(
        &mut self,
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
        name: &str,
    ) -> ValueId {
        let ty = self.func.value_ty(on_true);
        self.emit_value(InstKind::Select { cond, on_true, on_false }, ty, name)
    }

    pub fn cast(&mut self, op: CastOp, value: ValueId, ty: Type, name: &str) -> ValueId {
        self.emit_value(InstKind::Cast { op, value }, ty, name)
    }

    pub fn alloca(&mut self, elem: Type, count: u32, name: &str) -> ValueId {
        self.emit_value(InstKind::Alloca { elem, count }, Type::Ptr, name)
    }

    pub fn load(&mut self, ty: Type, ptr: ValueId, volatile: bool, name: &str) -> ValueId {
        self.emit_value(InstKind::Load { ptr, volatile }, ty, name)
    }

    pub fn store(&mut self, value: ValueId, ptr: ValueId, volatile: bool) -> InstId {
        self.emit(InstKind::Store { value, ptr, volatile }, Type::Void, "")
    }

    pub fn gep(&mut self, base: ValueId, offset: ValueId, name: &str) -> ValueId {
        self.emit_value(InstKind::Gep { base, offset }, Type::Ptr, name)
    }

    pub fn str_ref(&mut self, constant: ConstId, name: &str) -> ValueId {
        self.emit_value(InstKind::StrRef { constant }, Type::Ptr, name)
    }

    pub fn global_addr(&mut self, global: &str, name: &str) -> ValueId {
        self.emit_value(InstKind::GlobalAddr { global: global.to_string() }, Type::Ptr, name)
    }

    /// Emit a call. Returns the result value for non-void callees.
    pub fn call(&mut self, callee: &str, args: Vec<ValueId>, ret: Type, name: &str) -> Option<ValueId> {
        let inst = self.emit(InstKind::Call { callee: callee.to_string(), args }, ret, name);
        self.func.result(inst)
    }

    /// Emit a call to a callee known to return `ret`, which must not be void.
    pub fn call_value(&mut self, callee: &str, args: Vec<ValueId>, ret: Type, name: &str) -> ValueId {
        self.emit_value(InstKind::Call { callee: callee.to_string(), args }, ret, name)
    }

    pub fn null_ptr(&mut self, name: &str) -> ValueId {
        self.emit_value(InstKind::Const { value: 0 }, Type::Ptr, name)
    }

    pub fn phi(&mut self, ty: Type, incoming: Vec<(BlockId, ValueId)>, name: &str) -> ValueId {
        self.emit_value(InstKind::Phi { incoming }, ty, name)
    }

    pub fn br(&mut self, target: BlockId) -> InstId {
        self.emit(InstKind::Br { target }, Type::Void, "")
    }

    pub fn cond_br(&mut self, cond: ValueId, then_dest: BlockId, else_dest: BlockId) -> InstId {
        self.emit(InstKind::CondBr { cond, then_dest, else_dest }, Type::Void, "")
    }

    pub fn switch(&mut self, value: ValueId, default: BlockId, cases: Vec<(i64, BlockId)>) -> InstId {
        self.emit(InstKind::Switch { value, default, cases }, Type::Void, "")
    }

    pub fn ret(&mut self, value: Option<ValueId>) -> InstId {
        self.emit(InstKind::Ret { value }, Type::Void, "")
    }

    pub fn unreachable(&mut self) -> InstId {
        self.emit(InstKind::Unreachable, Type::Void, "")
    }
}
