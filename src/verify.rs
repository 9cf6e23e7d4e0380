// This module is the structural verifier the pipeline runs after passes. It checks one
// function at a time against a Symbols table (signatures of every function, the global
// names and the constant pool) so it can run inside a worker without touching the rest
// of the module. The checks cover block shape (exactly one terminator, placed last; phis
// only at the top), CFG sanity (entry has no predecessors, branch targets are live blocks,
// every block is reachable from the entry unless it is opaque dead code), SSA sanity
// (operands are live definitions that dominate their uses, phis have one entry per
// predecessor, every instruction is placed once) and typing (operand and result types,
// call arity against the callee signature, return values against the function's return
// type). The first violation is reported as a VerifyError that carries the pass which
// produced the IR and the printed offending instruction.

//! Structural IR verifier.

use crate::analysis::{Cfg, DomTree};
use crate::core::VerifyError;
use crate::ir::printer::print_inst;
use crate::ir::{
    BlockId, BlockRole, CastOp, ConstantPool, Function, Global, InstId, InstKind, Module, Type,
    ValueDef, ValueId,
};
use hashbrown::{HashMap, HashSet};

/// Names visible to a function body.
#[derive(Debug, Clone)]
pub struct Symbols<'m> {
    functions: HashMap<String, (Vec<Type>, Type)>,
    globals: HashMap<String, Type>,
    pool: &'m ConstantPool,
}

impl<'m> Symbols<'m> {
    pub fn collect(functions: &[Function], globals: &[Global], pool: &'m ConstantPool) -> Self {
        let mut symbols = Self { functions: HashMap::new(), globals: HashMap::new(), pool };
        for func in functions {
            symbols.add_function(func);
        }
        for global in globals {
            symbols.globals.insert(global.name.clone(), global.ty);
        }
        symbols
    }

    pub fn of_module(module: &'m Module) -> Self {
        Self::collect(&module.functions, &module.globals, &module.constants)
    }

    pub fn add_function(&mut self, func: &Function) {
        self.functions
            .insert(func.name.clone(), (func.param_types(), func.ret_ty));
    }

    pub fn signature(&self, name: &str) -> Option<&(Vec<Type>, Type)> {
        self.functions.get(name)
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    pub fn pool(&self) -> &'m ConstantPool {
        self.pool
    }
}

/// Verify every function of a module.
pub fn verify_module(module: &Module, pass: &str) -> Result<(), VerifyError> {
    let symbols = Symbols::of_module(module);
    for func in &module.functions {
        verify_function(func, &symbols, pass)?;
    }
    Ok(())
}

pub fn verify_function(func: &Function, symbols: &Symbols<'_>, pass: &str) -> Result<(), VerifyError> {
    Verifier { func, symbols, pass }.run()
}

struct Verifier<'a, 'm> {
    func: &'a Function,
    symbols: &'a Symbols<'m>,
    pass: &'a str,
}

impl<'a, 'm> Verifier<'a, 'm> {
    fn fail(&self, block: Option<BlockId>, inst: Option<InstId>, reason: impl Into<String>) -> VerifyError {
        VerifyError {
            pass: self.pass.to_string(),
            function: self.func.name.clone(),
            block: block
                .map(|b| self.func.block_name_or_placeholder(b))
                .unwrap_or_else(|| "-".to_string()),
            inst: inst.map(|i| print_inst(self.func, self.symbols.pool(), i)),
            reason: reason.into(),
        }
    }

    fn run(&self) -> Result<(), VerifyError> {
        let func = self.func;
        if func.is_declaration {
            if func.block_count() != 0 {
                return Err(self.fail(None, None, "declaration has a body"));
            }
            return Ok(());
        }
        let entry = func
            .entry()
            .ok_or_else(|| self.fail(None, None, "function has no blocks"))?;

        let placement = self.check_shape()?;
        let cfg = Cfg::build(func);
        if !cfg.preds(entry).is_empty() {
            return Err(self.fail(Some(entry), None, "entry block has predecessors"));
        }
        let dom = DomTree::build(func, &cfg);
        for &block in func.layout() {
            if !dom.is_reachable(block) && func.block(block).role != BlockRole::OpaqueDead {
                return Err(self.fail(Some(block), None, "block is unreachable from entry"));
            }
        }

        for &block in func.layout() {
            for &inst in func.block_insts(block) {
                self.check_result(block, inst)?;
                self.check_operands(block, inst, &placement, &cfg, &dom)?;
                self.check_types(block, inst)?;
            }
        }
        Ok(())
    }

    /// Terminator placement, phi placement and single placement of every instruction.
    fn check_shape(&self) -> Result<HashMap<InstId, (BlockId, usize)>, VerifyError> {
        let func = self.func;
        let mut placement: HashMap<InstId, (BlockId, usize)> = HashMap::new();
        for &block in func.layout() {
            let insts = func.block_insts(block);
            let last = insts
                .len()
                .checked_sub(1)
                .ok_or_else(|| self.fail(Some(block), None, "block is empty"))?;
            let mut seen_body = false;
            for (pos, &inst) in insts.iter().enumerate() {
                if placement.insert(inst, (block, pos)).is_some() {
                    return Err(self.fail(Some(block), Some(inst), "instruction placed more than once"));
                }
                let kind = &func.inst(inst).kind;
                if kind.is_terminator() != (pos == last) {
                    let reason = if pos == last {
                        "block does not end in a terminator"
                    } else {
                        "terminator in the middle of a block"
                    };
                    return Err(self.fail(Some(block), Some(inst), reason));
                }
                if kind.is_phi() {
                    if seen_body {
                        return Err(self.fail(Some(block), Some(inst), "phi after non-phi instruction"));
                    }
                } else {
                    seen_body = true;
                }
                for target in func.inst(inst).kind.successors() {
                    if !func.is_live_block(target) || !func.layout().contains(&target) {
                        return Err(self.fail(Some(block), Some(inst), "branch to a missing block"));
                    }
                }
            }
        }
        Ok(placement)
    }

    fn check_result(&self, block: BlockId, inst: InstId) -> Result<(), VerifyError> {
        let func = self.func;
        let data = func.inst(inst);
        match data.result {
            None if data.ty != Type::Void => {
                Err(self.fail(Some(block), Some(inst), "typed instruction without result"))
            }
            Some(result) => {
                let value = func.value(result);
                if value.def != ValueDef::Inst(inst) || value.ty != data.ty {
                    return Err(self.fail(Some(block), Some(inst), "result value does not match its definition"));
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_operands(
        &self,
        block: BlockId,
        inst: InstId,
        placement: &HashMap<InstId, (BlockId, usize)>,
        cfg: &Cfg,
        dom: &DomTree,
    ) -> Result<(), VerifyError> {
        let func = self.func;
        let kind = &func.inst(inst).kind;
        let reachable = dom.is_reachable(block);

        if let InstKind::Phi { incoming } = kind {
            let preds: HashSet<BlockId> = cfg.preds(block).iter().copied().collect();
            let mut sources = HashSet::new();
            for (src, _) in incoming {
                if !sources.insert(*src) {
                    return Err(self.fail(Some(block), Some(inst), "duplicate phi entry for a predecessor"));
                }
            }
            if reachable && sources != preds {
                return Err(self.fail(Some(block), Some(inst), "phi entries do not match predecessors"));
            }
            for (src, value) in incoming {
                self.check_value(block, inst, *value)?;
                if let Some((def_block, _)) = self.def_site(*value, placement) {
                    if dom.is_reachable(*src) && !dom.dominates(def_block, *src) {
                        return Err(self.fail(Some(block), Some(inst), "phi operand does not dominate its incoming edge"));
                    }
                }
            }
            return Ok(());
        }

        let (_, use_pos) = placement[&inst];
        for value in kind.operands() {
            self.check_value(block, inst, value)?;
            let Some((def_block, def_pos)) = self.def_site(value, placement) else {
                continue;
            };
            if !reachable {
                continue;
            }
            let dominated = if def_block == block {
                def_pos < use_pos
            } else {
                dom.dominates(def_block, block)
            };
            if !dominated {
                return Err(self.fail(Some(block), Some(inst), format!(
                    "operand %{} does not dominate its use",
                    func.value_name(value)
                )));
            }
        }
        Ok(())
    }

    fn check_value(&self, block: BlockId, inst: InstId, value: ValueId) -> Result<(), VerifyError> {
        if !self.func.is_valid_value(value) {
            return Err(self.fail(Some(block), Some(inst), "operand refers to an unknown value"));
        }
        Ok(())
    }

    /// Block and position of a value's definition; `None` for parameters.
    fn def_site(
        &self,
        value: ValueId,
        placement: &HashMap<InstId, (BlockId, usize)>,
    ) -> Option<(BlockId, usize)> {
        match self.func.value(value).def {
            ValueDef::Param(_) => None,
            // Unplaced definitions sort before everything so they fail dominance.
            ValueDef::Inst(def) => Some(
                placement
                    .get(&def)
                    .copied()
                    .unwrap_or((BlockId(u32::MAX), usize::MAX)),
            ),
        }
    }

    fn check_types(&self, block: BlockId, inst: InstId) -> Result<(), VerifyError> {
        let func = self.func;
        let data = func.inst(inst);
        let ty = |v: ValueId| func.value_ty(v);
        let err = |reason: &str| Err(self.fail(Some(block), Some(inst), reason));

        match &data.kind {
            InstKind::Const { value } => {
                // Pointer constants are limited to null.
                if !(data.ty.is_int() || (data.ty == Type::Ptr && *value == 0)) {
                    return err("constant must be an integer or a null pointer");
                }
            }
            InstKind::Binary { lhs, rhs, .. } => {
                if !data.ty.is_int() || ty(*lhs) != data.ty || ty(*rhs) != data.ty {
                    return err("binary operands must match the integer result type");
                }
            }
            InstKind::Icmp { lhs, rhs, .. } => {
                let t = ty(*lhs);
                if data.ty != Type::I1 || t != ty(*rhs) || !(t.is_int() || t == Type::Ptr) {
                    return err("icmp operands must share an integer or pointer type");
                }
            }
            InstKind::Select { cond, on_true, on_false } => {
                if ty(*cond) != Type::I1 || ty(*on_true) != data.ty || ty(*on_false) != data.ty {
                    return err("select needs an i1 condition and matching arms");
                }
            }
            InstKind::Cast { op, value } => {
                let from = ty(*value);
                let ok = from.is_int()
                    && data.ty.is_int()
                    && match op {
                        CastOp::Zext | CastOp::Sext => from.bits() < data.ty.bits(),
                        CastOp::Trunc => from.bits() > data.ty.bits(),
                    };
                if !ok {
                    return err("invalid integer cast");
                }
            }
            InstKind::Alloca { elem, count } => {
                if data.ty != Type::Ptr || *elem == Type::Void || *count == 0 {
                    return err("invalid alloca");
                }
            }
            InstKind::Load { ptr, .. } => {
                if ty(*ptr) != Type::Ptr || data.ty == Type::Void {
                    return err("load needs a pointer operand and a value type");
                }
            }
            InstKind::Store { value, ptr, .. } => {
                if ty(*ptr) != Type::Ptr || ty(*value) == Type::Void {
                    return err("store needs a value and a pointer operand");
                }
            }
            InstKind::Gep { base, offset } => {
                if data.ty != Type::Ptr || ty(*base) != Type::Ptr || !ty(*offset).is_int() {
                    return err("gep needs a pointer base and an integer offset");
                }
            }
            InstKind::StrRef { constant } => {
                if self.symbols.pool().get(*constant).is_none() {
                    return err("reference to a missing string constant");
                }
            }
            InstKind::GlobalAddr { global } => {
                if !self.symbols.has_global(global) {
                    return err("reference to a missing global");
                }
            }
            InstKind::BlockAddr { block: target } => {
                if !func.is_live_block(*target) {
                    return err("block address of a missing block");
                }
            }
            InstKind::Call { callee, args } => {
                let Some((params, ret)) = self.symbols.signature(callee) else {
                    return err("call to an unknown function");
                };
                if params.len() != args.len() {
                    return err("call argument count does not match the callee");
                }
                if params.iter().zip(args).any(|(p, a)| *p != ty(*a)) {
                    return err("call argument type does not match the callee");
                }
                if *ret != data.ty {
                    return err("call result type does not match the callee");
                }
            }
            InstKind::CallIndirect { callee, args } => {
                if ty(*callee) != Type::Ptr {
                    return err("indirect call target must be a pointer");
                }
                if args.iter().any(|a| ty(*a) == Type::Void) {
                    return err("indirect call argument has no value");
                }
            }
            InstKind::Phi { incoming } => {
                if incoming.iter().any(|(_, v)| ty(*v) != data.ty) {
                    return err("phi incoming value type mismatch");
                }
            }
            InstKind::Br { .. } | InstKind::Unreachable => {}
            InstKind::CondBr { cond, .. } => {
                if ty(*cond) != Type::I1 {
                    return err("condbr condition must be i1");
                }
            }
            InstKind::Switch { value, cases, .. } => {
                if !ty(*value).is_int() {
                    return err("switch value must be an integer");
                }
                let mut seen = HashSet::new();
                if cases.iter().any(|(c, _)| !seen.insert(*c)) {
                    return err("duplicate switch case value");
                }
            }
            InstKind::IndirectBr { addr, .. } => {
                if ty(*addr) != Type::Ptr {
                    return err("indirectbr address must be a pointer");
                }
            }
            InstKind::Ret { value } => match (value, func.ret_ty) {
                (None, Type::Void) => {}
                (Some(v), ret) if ret != Type::Void && ty(*v) == ret => {}
                _ => return err("return value does not match the function type"),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify_text(text: &str) -> Result<(), VerifyError> {
        let module = Module::parse(text).unwrap();
        verify_module(&module, "test")
    }

    #[test]
    fn test_valid_function_passes() {
        verify_text(
            r#"
declare @puts(ptr) -> i32
string @.s = "hi"
define @f(%c: i1, %a: i32) -> i32 {
entry:
  %p = str @.s
  %r = call i32 @puts(%p)
  condbr %c, ^l, ^j
l:
  %x = add i32 %a, %r
  br ^j
j:
  %m = phi i32 [^entry, %a], [^l, %x]
  ret %m
}
"#,
        )
        .unwrap();
    }

    #[test]
    fn test_use_not_dominated() {
        let err = verify_text(
            r#"
define @f(%c: i1, %a: i32) -> i32 {
entry:
  condbr %c, ^l, ^j
l:
  %x = add i32 %a, %a
  br ^j
j:
  ret %x
}
"#,
        )
        .unwrap_err();
        assert!(err.reason.contains("dominate"), "{err}");
        assert_eq!(err.block, "j");
        assert_eq!(err.pass, "test");
    }

    #[test]
    fn test_phi_must_cover_predecessors() {
        let err = verify_text(
            r#"
define @f(%c: i1, %a: i32) -> i32 {
entry:
  condbr %c, ^l, ^j
l:
  br ^j
j:
  %m = phi i32 [^l, %a]
  ret %m
}
"#,
        )
        .unwrap_err();
        assert!(err.reason.contains("predecessors"));
    }

    #[test]
    fn test_unreachable_block_rejected() {
        let err = verify_text(
            "define @f() -> void {\nentry:\n  ret\norphan:\n  ret\n}\n",
        )
        .unwrap_err();
        assert!(err.reason.contains("unreachable"));
    }

    #[test]
    fn test_call_signature_checked() {
        let err = verify_text(
            "declare @g(i32) -> i32\ndefine @f(%a: i64) -> i32 {\nentry:\n  %r = call i32 @g(%a)\n  ret %r\n}\n",
        )
        .unwrap_err();
        assert!(err.reason.contains("argument type"));
        assert!(err.inst.unwrap().contains("call i32 @g"));
    }

    #[test]
    fn test_indirect_call_needs_pointer_target() {
        verify_text("define @f(%p: ptr) -> i32 {\nentry:\n  %r = call i32 %p(%p)\n  ret %r\n}\n")
            .unwrap();
        let err = verify_text("define @f(%a: i32) -> void {\nentry:\n  call %a()\n  ret\n}\n")
            .unwrap_err();
        assert!(err.reason.contains("indirect call target"));
    }

    #[test]
    fn test_missing_terminator() {
        let mut module = Module::parse("define @f() -> void {\nentry:\n  ret\n}\n").unwrap();
        let func = &mut module.functions[0];
        let entry = func.entry().unwrap();
        func.block_insts_mut(entry).clear();
        let err = verify_module(&module, "split").unwrap_err();
        assert!(err.reason.contains("empty"));
    }

    #[test]
    fn test_return_type_checked() {
        let err = verify_text("define @f(%a: i64) -> i32 {\nentry:\n  ret %a\n}\n").unwrap_err();
        assert!(err.reason.contains("return"));
    }
}
