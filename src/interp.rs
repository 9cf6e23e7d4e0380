// This module is a small reference interpreter for the IR. It exists so that passes can be
// checked for behavioral equivalence: the same function is run on the same inputs before
// and after a transformation and the return value and captured output are compared.
//
// Values are u64 bit patterns masked to the width of their type. Memory is a list of
// byte allocations; a pointer is `(allocation << 32) | offset` and allocation 0 is never
// handed out, so 0 is null. Every global and every string constant gets its own
// allocation when the interpreter is created (string constants with an implicit NUL
// after their bytes), allocas get one per execution and are released on return, and the
// `malloc`/`free` builtins manage heap allocations. `puts` and `putchar` append to the
// captured output. `dlsym` looks a function up by its NUL-terminated name and returns a
// pointer in a reserved allocation range that only indirect calls accept. Execution is bounded by a step limit and a call depth limit, and every
// trap (bad access, division by zero, `unreachable`) is reported as an InterpError.

//! Reference interpreter.

use crate::core::{InterpError, InterpResult};
use crate::ir::{
    BinOp, BlockId, CastOp, CmpPred, ConstId, Function, Inst, InstKind, Module, Type, ValueId,
};
use hashbrown::HashMap;

pub const DEFAULT_STEP_LIMIT: u64 = 10_000_000;
pub const MAX_CALL_DEPTH: usize = 256;

/// Allocation index reserved for block addresses.
const BLOCK_ADDR_SPACE: u64 = u32::MAX as u64;

/// Allocation index reserved for function addresses.
const FUNC_ADDR_SPACE: u64 = u32::MAX as u64 - 1;

/// Result of one top-level call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub value: Option<u64>,
    /// Bytes written by `puts`/`putchar` during the call.
    pub output: Vec<u8>,
    pub steps: u64,
}

impl Execution {
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// What executing one instruction does to control flow.
enum Flow {
    Continue,
    Jump(BlockId),
    Return(Option<u64>),
}

pub struct Interpreter<'m> {
    module: &'m Module,
    memory: Vec<Option<Vec<u8>>>,
    globals: HashMap<String, u64>,
    constants: Vec<u64>,
    output: Vec<u8>,
    steps: u64,
    step_limit: u64,
}

fn mask(value: u64, ty: Type) -> u64 {
    match ty.bits() {
        0 => 0,
        64 => value,
        bits => value & ((1u64 << bits) - 1),
    }
}

fn sext(value: u64, ty: Type) -> i64 {
    match ty.bits() {
        0 => 0,
        64 => value as i64,
        bits => {
            let shift = 64 - bits;
            ((value << shift) as i64) >> shift
        }
    }
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        let mut interp = Self {
            module,
            memory: vec![None],
            globals: HashMap::new(),
            constants: Vec::new(),
            output: Vec::new(),
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
        };
        for global in &module.globals {
            let size = global.ty.byte_size() as usize;
            let bytes = (global.init as u64).to_le_bytes()[..size].to_vec();
            let addr = interp.allocate(bytes);
            interp.globals.insert(global.name.clone(), addr);
        }
        for (_, constant) in module.constants.iter() {
            let mut bytes = constant.bytes.clone();
            bytes.push(0);
            let addr = interp.allocate(bytes);
            interp.constants.push(addr);
        }
        interp
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn constant_address(&self, id: ConstId) -> Option<u64> {
        self.constants.get(id.index()).copied()
    }

    pub fn global_address(&self, name: &str) -> Option<u64> {
        self.globals.get(name).copied()
    }

    /// Copy `bytes` into a fresh allocation and return its address.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> u64 {
        self.allocate(bytes.to_vec())
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> InterpResult<Vec<u8>> {
        let (alloc, offset) = self.locate(addr, len as u64)?;
        Ok(alloc[offset..offset + len].to_vec())
    }

    /// Call `name` with raw argument bits.
    pub fn call(&mut self, name: &str, args: &[u64]) -> InterpResult<Execution> {
        let module = self.module;
        let func = module
            .function(name)
            .ok_or_else(|| InterpError::FunctionNotFound { name: name.to_string() })?;
        let start = self.steps;
        let value = self.invoke(func, args, 0)?;
        Ok(Execution {
            value,
            output: std::mem::take(&mut self.output),
            steps: self.steps - start,
        })
    }

    fn allocate(&mut self, bytes: Vec<u8>) -> u64 {
        let id = self.memory.len() as u64;
        self.memory.push(Some(bytes));
        id << 32
    }

    fn locate(&self, addr: u64, size: u64) -> InterpResult<(&Vec<u8>, usize)> {
        let invalid = InterpError::InvalidAccess { addr, size };
        let (alloc, offset) = ((addr >> 32) as usize, (addr & 0xffff_ffff) as usize);
        let bytes = self
            .memory
            .get(alloc)
            .and_then(Option::as_ref)
            .ok_or(invalid.clone())?;
        if offset + size as usize > bytes.len() {
            return Err(invalid);
        }
        Ok((bytes, offset))
    }

    fn load(&self, addr: u64, ty: Type) -> InterpResult<u64> {
        let size = ty.byte_size();
        let (bytes, offset) = self.locate(addr, size)?;
        let mut raw = [0u8; 8];
        raw[..size as usize].copy_from_slice(&bytes[offset..offset + size as usize]);
        Ok(mask(u64::from_le_bytes(raw), ty))
    }

    fn store(&mut self, addr: u64, value: u64, ty: Type) -> InterpResult<()> {
        let size = ty.byte_size() as usize;
        let (_, offset) = self.locate(addr, size as u64)?;
        let alloc = (addr >> 32) as usize;
        if let Some(Some(bytes)) = self.memory.get_mut(alloc) {
            bytes[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
        }
        Ok(())
    }

    fn release(&mut self, addr: u64) -> InterpResult<()> {
        if addr == 0 {
            return Ok(());
        }
        let alloc = (addr >> 32) as usize;
        match self.memory.get_mut(alloc) {
            Some(slot @ Some(_)) if addr & 0xffff_ffff == 0 => {
                *slot = None;
                Ok(())
            }
            _ => Err(InterpError::InvalidAccess { addr, size: 0 }),
        }
    }

    fn c_string(&self, addr: u64) -> InterpResult<Vec<u8>> {
        let (bytes, offset) = self.locate(addr, 0)?;
        bytes[offset..]
            .iter()
            .position(|b| *b == 0)
            .map(|end| bytes[offset..offset + end].to_vec())
            .ok_or(InterpError::InvalidAccess { addr, size: (bytes.len() - offset) as u64 + 1 })
    }

    fn tick(&mut self) -> InterpResult<()> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(InterpError::StepLimit { limit: self.step_limit });
        }
        Ok(())
    }

    fn invoke(&mut self, func: &'m Function, args: &[u64], depth: usize) -> InterpResult<Option<u64>> {
        if args.len() != func.params.len() {
            return Err(InterpError::ArgumentCount {
                function: func.name.clone(),
                expected: func.params.len(),
                got: args.len(),
            });
        }
        if depth >= MAX_CALL_DEPTH {
            return Err(InterpError::CallDepth { limit: MAX_CALL_DEPTH });
        }
        if func.is_declaration {
            return self.builtin(func, args);
        }
        let mut allocas = Vec::new();
        let result = self.execute(func, args, depth, &mut allocas);
        for addr in allocas {
            self.release(addr)?;
        }
        result
    }

    fn builtin(&mut self, func: &Function, args: &[u64]) -> InterpResult<Option<u64>> {
        let arg = |index: usize| {
            args.get(index).copied().ok_or_else(|| InterpError::Malformed {
                function: func.name.clone(),
                reason: format!("builtin declared with {} parameters", args.len()),
            })
        };
        match func.name.as_str() {
            "malloc" => {
                let size = arg(0)? as usize;
                Ok(Some(self.allocate(vec![0; size])))
            }
            "free" => {
                self.release(arg(0)?)?;
                Ok(None)
            }
            "puts" => {
                let text = self.c_string(arg(0)?)?;
                self.output.extend_from_slice(&text);
                self.output.push(b'\n');
                Ok(Some(0))
            }
            "putchar" => {
                let c = arg(0)?;
                self.output.push(c as u8);
                Ok(Some(mask(c, func.ret_ty)))
            }
            "dlsym" => {
                let name = self.c_string(arg(1)?)?;
                let found = self
                    .module
                    .functions
                    .iter()
                    .position(|f| f.name.as_bytes() == name.as_slice());
                Ok(Some(found.map_or(0, |index| (FUNC_ADDR_SPACE << 32) | index as u64)))
            }
            _ => Err(InterpError::Malformed {
                function: func.name.clone(),
                reason: "call to a declaration without a builtin".to_string(),
            }),
        }
    }

    fn execute(
        &mut self,
        func: &'m Function,
        args: &[u64],
        depth: usize,
        allocas: &mut Vec<u64>,
    ) -> InterpResult<Option<u64>> {
        let mut frame = vec![0u64; func.value_count()];
        for (param, arg) in func.params.iter().zip(args) {
            frame[param.index()] = mask(*arg, func.value_ty(*param));
        }
        let mut block = func.entry().ok_or_else(|| InterpError::Malformed {
            function: func.name.clone(),
            reason: "no entry block".to_string(),
        })?;
        let mut prev: Option<BlockId> = None;

        loop {
            let insts = func.block_insts(block);
            let phis = func.phi_count(block);
            // Phis read their inputs before any of them is written.
            let mut incoming = Vec::with_capacity(phis);
            for &inst in &insts[..phis] {
                let InstKind::Phi { incoming: entries } = &func.inst(inst).kind else {
                    continue;
                };
                let value = entries
                    .iter()
                    .find(|(pred, _)| Some(*pred) == prev)
                    .map(|(_, v)| frame[v.index()])
                    .ok_or_else(|| InterpError::Malformed {
                        function: func.name.clone(),
                        reason: format!("phi in {} has no entry for the taken edge", func.block_name(block)),
                    })?;
                incoming.push((inst, value));
            }
            for (inst, value) in incoming {
                if let Some(result) = func.result(inst) {
                    frame[result.index()] = value;
                }
            }

            let mut next = None;
            for &inst in &insts[phis..] {
                self.tick()?;
                match self.step(func, block, func.inst(inst), &mut frame, depth, allocas)? {
                    Flow::Continue => {}
                    Flow::Jump(target) => {
                        next = Some(target);
                        break;
                    }
                    Flow::Return(value) => return Ok(value),
                }
            }
            let Some(target) = next else {
                return Err(InterpError::Malformed {
                    function: func.name.clone(),
                    reason: format!("block {} falls off its end", func.block_name(block)),
                });
            };
            prev = Some(block);
            block = target;
        }
    }

    fn step(
        &mut self,
        func: &'m Function,
        block: BlockId,
        inst: &Inst,
        frame: &mut [u64],
        depth: usize,
        allocas: &mut Vec<u64>,
    ) -> InterpResult<Flow> {
        let get = |frame: &[u64], v: ValueId| frame[v.index()];
        let ty_of = |v: ValueId| func.value_ty(v);
        let value = match &inst.kind {
            InstKind::Const { value } => Some(*value as u64),
            InstKind::Binary { op, lhs, rhs } => {
                Some(self.binary(func, *op, get(frame, *lhs), get(frame, *rhs), inst.ty)?)
            }
            InstKind::Icmp { pred, lhs, rhs } => {
                let ty = ty_of(*lhs);
                let (a, b) = (get(frame, *lhs), get(frame, *rhs));
                let (sa, sb) = (sext(a, ty), sext(b, ty));
                let hit = match pred {
                    CmpPred::Eq => a == b,
                    CmpPred::Ne => a != b,
                    CmpPred::Slt => sa < sb,
                    CmpPred::Sle => sa <= sb,
                    CmpPred::Sgt => sa > sb,
                    CmpPred::Sge => sa >= sb,
                    CmpPred::Ult => a < b,
                    CmpPred::Ule => a <= b,
                    CmpPred::Ugt => a > b,
                    CmpPred::Uge => a >= b,
                };
                Some(hit as u64)
            }
            InstKind::Select { cond, on_true, on_false } => {
                let pick = if get(frame, *cond) != 0 { on_true } else { on_false };
                Some(get(frame, *pick))
            }
            InstKind::Cast { op, value } => {
                let v = get(frame, *value);
                Some(match op {
                    CastOp::Zext | CastOp::Trunc => v,
                    CastOp::Sext => sext(v, ty_of(*value)) as u64,
                })
            }
            InstKind::Alloca { elem, count } => {
                let addr = self.allocate(vec![0; (elem.byte_size() * u64::from(*count)) as usize]);
                allocas.push(addr);
                Some(addr)
            }
            InstKind::Load { ptr, .. } => Some(self.load(get(frame, *ptr), inst.ty)?),
            InstKind::Store { value, ptr, .. } => {
                self.store(get(frame, *ptr), get(frame, *value), ty_of(*value))?;
                None
            }
            InstKind::Gep { base, offset } => {
                let delta = sext(get(frame, *offset), ty_of(*offset));
                Some(get(frame, *base).wrapping_add(delta as u64))
            }
            InstKind::StrRef { constant } => Some(self.constant_address(*constant).ok_or_else(
                || InterpError::Malformed {
                    function: func.name.clone(),
                    reason: format!("missing string constant {}", constant.0),
                },
            )?),
            InstKind::GlobalAddr { global } => Some(self.global_address(global).ok_or_else(|| {
                InterpError::Malformed {
                    function: func.name.clone(),
                    reason: format!("missing global @{global}"),
                }
            })?),
            InstKind::BlockAddr { block } => Some((BLOCK_ADDR_SPACE << 32) | u64::from(block.0)),
            InstKind::Call { callee, args } => {
                let module = self.module;
                let target = module
                    .function(callee)
                    .ok_or_else(|| InterpError::FunctionNotFound { name: callee.clone() })?;
                let values: Vec<u64> = args.iter().map(|a| get(frame, *a)).collect();
                self.invoke(target, &values, depth + 1)?
            }
            InstKind::CallIndirect { callee, args } => {
                let addr = get(frame, *callee);
                let module = self.module;
                let target = (addr >> 32 == FUNC_ADDR_SPACE)
                    .then(|| module.functions.get((addr & 0xffff_ffff) as usize))
                    .flatten()
                    .ok_or(InterpError::InvalidAccess { addr, size: 0 })?;
                let values: Vec<u64> = args.iter().map(|a| get(frame, *a)).collect();
                self.invoke(target, &values, depth + 1)?
            }
            InstKind::Phi { .. } => None,
            InstKind::Br { target } => return Ok(Flow::Jump(*target)),
            InstKind::CondBr { cond, then_dest, else_dest } => {
                let target = if get(frame, *cond) != 0 { then_dest } else { else_dest };
                return Ok(Flow::Jump(*target));
            }
            InstKind::Switch { value, default, cases } => {
                let ty = ty_of(*value);
                let v = get(frame, *value);
                let target = cases
                    .iter()
                    .find(|(case, _)| mask(*case as u64, ty) == v)
                    .map(|(_, b)| *b)
                    .unwrap_or(*default);
                return Ok(Flow::Jump(target));
            }
            InstKind::IndirectBr { addr, dests } => {
                let a = get(frame, *addr);
                let target = BlockId((a & 0xffff_ffff) as u32);
                if a >> 32 != BLOCK_ADDR_SPACE || !dests.contains(&target) {
                    return Err(InterpError::InvalidAccess { addr: a, size: 0 });
                }
                return Ok(Flow::Jump(target));
            }
            InstKind::Ret { value } => {
                return Ok(Flow::Return(value.map(|v| get(frame, v))));
            }
            InstKind::Unreachable => {
                return Err(InterpError::Unreachable {
                    function: func.name.clone(),
                    block: func.block_name(block).to_string(),
                });
            }
        };
        if let (Some(result), Some(value)) = (inst.result, value) {
            frame[result.index()] = mask(value, inst.ty);
        }
        Ok(Flow::Continue)
    }

    fn binary(&self, func: &Function, op: BinOp, a: u64, b: u64, ty: Type) -> InterpResult<u64> {
        let bits = u64::from(ty.bits());
        let div_zero = || InterpError::DivisionByZero { function: func.name.clone() };
        let value = match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => {
                if b >= bits {
                    0
                } else {
                    a << b
                }
            }
            BinOp::LShr => {
                if b >= bits {
                    0
                } else {
                    a >> b
                }
            }
            BinOp::AShr => (sext(a, ty) >> b.min(bits - 1)) as u64,
            BinOp::UDiv => a.checked_div(b).ok_or_else(div_zero)?,
            BinOp::URem => a.checked_rem(b).ok_or_else(div_zero)?,
            BinOp::SDiv => {
                if b == 0 {
                    return Err(div_zero());
                }
                sext(a, ty).wrapping_div(sext(b, ty)) as u64
            }
            BinOp::SRem => {
                if b == 0 {
                    return Err(div_zero());
                }
                sext(a, ty).wrapping_rem(sext(b, ty)) as u64
            }
        };
        Ok(mask(value, ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str, name: &str, args: &[u64]) -> InterpResult<Execution> {
        let module = Module::parse(text).unwrap();
        let mut interp = Interpreter::new(&module);
        interp.call(name, args)
    }

    #[test]
    fn test_arithmetic_wraps_to_width() {
        let text = r#"
define @f(%a: i8, %b: i8) -> i8 {
entry:
  %s = add i8 %a, %b
  ret %s
}
"#;
        assert_eq!(run(text, "f", &[200, 100]).unwrap().value, Some(44));
    }

    #[test]
    fn test_signed_compare_and_division() {
        let text = r#"
define @f(%a: i32, %b: i32) -> i32 {
entry:
  %neg = icmp slt %a, %b
  %q = sdiv i32 %a, %b
  %z = zext i32 %neg
  %r = add i32 %q, %z
  ret %r
}
"#;
        // -7 / 2 == -3, and -7 < 2 adds one.
        let minus_seven = (-7i32) as u32 as u64;
        let out = run(text, "f", &[minus_seven, 2]).unwrap().value.unwrap();
        assert_eq!(out as u32 as i32, -2);
        assert!(matches!(
            run(text, "f", &[1, 0]),
            Err(InterpError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_memory_and_output() {
        let text = r#"
declare @puts(ptr) -> i32
declare @putchar(i32) -> i32
string @.hi = "hi"
global @counter: i32 = 41
define @main() -> i32 {
entry:
  %s = str @.hi
  %r = call i32 @puts(%s)
  %g = global @counter
  %v = load i32 %g
  %one = const i32 1
  %n = add i32 %v, %one
  store %n, %g
  %again = load i32 %g
  %bang = const i32 33
  %c = call i32 @putchar(%bang)
  ret %again
}
"#;
        let exec = run(text, "main", &[]).unwrap();
        assert_eq!(exec.value, Some(42));
        assert_eq!(exec.stdout(), "hi\n!");
    }

    #[test]
    fn test_out_of_bounds_access_traps() {
        let text = r#"
define @f() -> i32 {
entry:
  %p = alloca i32
  %off = const i64 4
  %q = gep %p, %off
  %v = load i32 %q
  ret %v
}
"#;
        assert!(matches!(run(text, "f", &[]), Err(InterpError::InvalidAccess { .. })));
    }

    #[test]
    fn test_step_limit_stops_infinite_loop() {
        let text = r#"
define @spin() -> void {
entry:
  br ^loop
loop:
  %x = const i32 0
  br ^loop
}
"#;
        let module = Module::parse(text).unwrap();
        let err = Interpreter::new(&module).with_step_limit(1000).call("spin", &[]).unwrap_err();
        assert_eq!(err, InterpError::StepLimit { limit: 1000 });
    }

    #[test]
    fn test_builtin_with_wrong_arity_is_malformed() {
        let text = r#"
declare @malloc() -> ptr
define @f() -> ptr {
entry:
  %p = call ptr @malloc()
  ret %p
}
"#;
        assert!(matches!(run(text, "f", &[]), Err(InterpError::Malformed { .. })));
    }

    #[test]
    fn test_call_through_resolved_pointer() {
        let text = r#"
declare @dlsym(ptr, ptr) -> ptr
declare @putchar(i32) -> i32
string @.name = "putchar"
string @.missing = "nope"
define @f(%c: i32) -> i32 {
entry:
  %h = const ptr 0
  %n = str @.name
  %fp = call ptr @dlsym(%h, %n)
  %r = call i32 %fp(%c)
  %m = str @.missing
  %null = call ptr @dlsym(%h, %m)
  %none = const ptr 0
  %absent = icmp eq %null, %none
  %z = zext i32 %absent
  %out = add i32 %r, %z
  ret %out
}
"#;
        let exec = run(text, "f", &[65]).unwrap();
        assert_eq!(exec.stdout(), "A");
        assert_eq!(exec.value, Some(66));

        let bad = "define @f(%p: ptr) -> void {\nentry:\n  call %p()\n  ret\n}\n";
        assert!(matches!(run(bad, "f", &[0]), Err(InterpError::InvalidAccess { .. })));
    }

    #[test]
    fn test_unreachable_and_missing_function() {
        let text = "define @f() -> void {\nentry:\n  unreachable\n}\n";
        assert!(matches!(run(text, "f", &[]), Err(InterpError::Unreachable { .. })));
        assert!(matches!(run(text, "g", &[]), Err(InterpError::FunctionNotFound { .. })));
    }
}
