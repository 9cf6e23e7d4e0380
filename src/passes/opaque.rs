// This module inserts opaque predicates. For every eligible block ending in an unconditional
// branch it builds a condition from an algebraic identity that holds for every runtime
// value under wrapping integer arithmetic, and replaces `br S` with a conditional branch
// whose always-taken edge still leads to S. The other edge leads to a new block tagged
// OpaqueDead that computes plausible arithmetic over the same operand, may read a byte of
// a generated decoy string, and then branches to S as well, so S's phis gain one incoming
// entry mirroring the one from the rewritten block. Polarity is random: an always-false
// form swaps the branch targets. The keyed-zero form reads the module global
// `obf.opaque_key` with a volatile load; the global is zero and nothing ever writes it.

//! Opaque predicate insertion.

use super::{check_well_formed, ineligible, PassContext, PassKind, PassOutcome};
use crate::core::{PassError, PassResult};
use crate::ir::{
    BinOp, BlockId, BlockRole, CastOp, CmpPred, ConstId, Function, FunctionBuilder, InstKind,
    Type, ValueId,
};
use rand::seq::SliceRandom;
use rand::Rng;

/// Module global read by the keyed-zero identity.
pub const OPAQUE_KEY_GLOBAL: &str = "obf.opaque_key";

/// Decoy strings created before the pass runs.
pub const DECOY_STRINGS: [&str; 4] = [
    "invalid license key",
    "checksum mismatch",
    "debugger detected",
    "/etc/machine-id",
];

/// Algebraic identities that are constant for every runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// `(x * (x + 1)) & 1 == 0`
    ConsecutiveProduct,
    /// `(x * x) & 3 <u 2`
    SquareMod4,
    /// `(x | c) & c == c`
    OrMask,
    /// `(x & c) | (x & ~c) == x`
    MaskRecombine,
    /// `k * c1 + c2 == c2` with `k` loaded from the zero key global
    KeyedZero,
}

impl Identity {
    pub const OPERAND: [Identity; 4] = [
        Identity::ConsecutiveProduct,
        Identity::SquareMod4,
        Identity::OrMask,
        Identity::MaskRecombine,
    ];

    /// Evaluate the identity's comparison for `x` at width `bits`.
    ///
    /// Returns the truth value of the always-true form; used to check the
    /// identities independently of the IR.
    pub fn holds(self, x: u64, c: u64, bits: u32) -> bool {
        let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let x = x & mask;
        let c = c & mask;
        match self {
            Identity::ConsecutiveProduct => (x.wrapping_mul(x.wrapping_add(1)) & mask) & 1 == 0,
            Identity::SquareMod4 => (x.wrapping_mul(x) & mask & 3) < 2,
            Identity::OrMask => ((x | c) & c) == c,
            Identity::MaskRecombine => ((x & c) | (x & (!c & mask))) == x,
            // `x` plays the role of the key, which is always zero at runtime.
            Identity::KeyedZero => {
                let k = 0u64;
                (k.wrapping_mul(x).wrapping_add(c) & mask) == c
            }
        }
    }
}

pub fn run(func: &mut Function, ctx: &mut PassContext<'_>) -> PassResult<PassOutcome> {
    if func.is_declaration {
        return Err(ineligible(PassKind::Opaque, func, "declaration"));
    }
    check_well_formed(func)?;

    let blocks: Vec<BlockId> = func.layout().to_vec();
    let mut inserted = 0;
    for block in blocks {
        let Some(term) = func.terminator(block) else {
            continue;
        };
        let InstKind::Br { target } = func.inst(term).kind else {
            continue;
        };
        if func.block(block).role == BlockRole::OpaqueDead {
            continue;
        }
        if !ctx.roll() {
            continue;
        }
        insert_predicate(func, block, target, ctx)?;
        inserted += 1;
    }

    if inserted > 0 {
        log::debug!("opaque: {} predicates inserted in {}", inserted, func.name);
        ctx.stats.predicates_inserted += inserted;
    }
    Ok(PassOutcome::changed(inserted > 0))
}

/// Integer values usable as the identity operand at the end of `block`.
fn candidate_operands(func: &Function, block: BlockId) -> Vec<ValueId> {
    let usable = |v: ValueId| matches!(func.value_ty(v), Type::I8 | Type::I32 | Type::I64);
    let mut candidates: Vec<ValueId> = func.params.iter().copied().filter(|p| usable(*p)).collect();
    for &inst in func.block_insts(block) {
        if let Some(result) = func.result(inst) {
            if usable(result) {
                candidates.push(result);
            }
        }
    }
    candidates
}

fn insert_predicate(
    func: &mut Function,
    block: BlockId,
    target: BlockId,
    ctx: &mut PassContext<'_>,
) -> PassResult<()> {
    let term = func
        .terminator(block)
        .ok_or_else(|| PassError::Malformed {
            function: func.name.clone(),
            block: func.block_name(block).to_string(),
            reason: "block has no terminator".to_string(),
        })?;
    let before: Vec<BlockId> = func.successors(block);

    let candidates = candidate_operands(func, block);
    let operand = candidates.choose(&mut ctx.rng).copied();
    let identity = match operand {
        Some(_) => *Identity::OPERAND.choose(&mut ctx.rng).unwrap_or(&Identity::KeyedZero),
        None => Identity::KeyedZero,
    };
    let always_true = ctx.rng.gen_bool(0.5);

    func.unplace_inst(block, term);
    let cond = {
        let mut b = FunctionBuilder::at_end(func, block);
        build_condition(&mut b, identity, operand, always_true, &mut ctx.rng)
    };

    let dead_name = format!("{}.opaque", func.block_name(block));
    let dead = func.insert_block_after(block, &dead_name, BlockRole::OpaqueDead);
    {
        let mut b = FunctionBuilder::at_end(func, block);
        if always_true {
            b.cond_br(cond, target, dead);
        } else {
            b.cond_br(cond, dead, target);
        }
    }
    build_dead_code(func, dead, target, operand, ctx);

    // The dead edge carries whatever the real edge carries.
    mirror_phi_entries(func, target, block, dead);

    let after = func.successors(block);
    if let Some(missing) = before.iter().find(|s| !after.contains(s)) {
        return Err(PassError::Malformed {
            function: func.name.clone(),
            block: func.block_name(block).to_string(),
            reason: format!("successor edge to {} dropped", func.block_name(*missing)),
        });
    }
    log::trace!(
        "opaque: {:?} ({}) in {}",
        identity,
        if always_true { "true" } else { "false" },
        func.block_name(block)
    );
    Ok(())
}

fn build_condition(
    b: &mut FunctionBuilder<'_>,
    identity: Identity,
    operand: Option<ValueId>,
    always_true: bool,
    rng: &mut impl Rng,
) -> ValueId {
    let (eq, ult) = if always_true {
        (CmpPred::Eq, CmpPred::Ult)
    } else {
        (CmpPred::Ne, CmpPred::Uge)
    };
    let x = match (identity, operand) {
        (Identity::KeyedZero, _) | (_, None) => {
            let key_ptr = b.global_addr(OPAQUE_KEY_GLOBAL, "opq.keyp");
            let key = b.load(Type::I32, key_ptr, true, "opq.key");
            let c1 = b.iconst(Type::I32, rng.gen_range(2..50), "opq.c");
            let c2 = b.iconst(Type::I32, rng.gen_range(2..50), "opq.c");
            let scaled = b.binary(BinOp::Mul, key, c1, "opq.t");
            let sum = b.binary(BinOp::Add, scaled, c2, "opq.t");
            return b.icmp(eq, sum, c2, "opq.cond");
        }
        (_, Some(x)) => x,
    };
    let ty = b.func().value_ty(x);
    match identity {
        Identity::ConsecutiveProduct => {
            let one = b.iconst(ty, 1, "opq.c");
            let zero = b.iconst(ty, 0, "opq.c");
            let next = b.binary(BinOp::Add, x, one, "opq.t");
            let prod = b.binary(BinOp::Mul, x, next, "opq.t");
            let low = b.binary(BinOp::And, prod, one, "opq.t");
            b.icmp(eq, low, zero, "opq.cond")
        }
        Identity::SquareMod4 => {
            let three = b.iconst(ty, 3, "opq.c");
            let two = b.iconst(ty, 2, "opq.c");
            let sq = b.binary(BinOp::Mul, x, x, "opq.t");
            let low = b.binary(BinOp::And, sq, three, "opq.t");
            b.icmp(ult, low, two, "opq.cond")
        }
        Identity::OrMask => {
            let c = b.iconst(ty, random_mask(rng, ty), "opq.c");
            let or = b.binary(BinOp::Or, x, c, "opq.t");
            let masked = b.binary(BinOp::And, or, c, "opq.t");
            b.icmp(eq, masked, c, "opq.cond")
        }
        Identity::MaskRecombine | Identity::KeyedZero => {
            let mask = random_mask(rng, ty);
            let c = b.iconst(ty, mask, "opq.c");
            let all = b.iconst(ty, -1, "opq.c");
            let inv = b.binary(BinOp::Xor, c, all, "opq.t");
            let lo = b.binary(BinOp::And, x, c, "opq.t");
            let hi = b.binary(BinOp::And, x, inv, "opq.t");
            let joined = b.binary(BinOp::Or, lo, hi, "opq.t");
            b.icmp(eq, joined, x, "opq.cond")
        }
    }
}

fn random_mask(rng: &mut impl Rng, ty: Type) -> i64 {
    match ty {
        Type::I8 => rng.gen::<u8>() as i8 as i64,
        Type::I32 => rng.gen::<u32>() as i32 as i64,
        _ => rng.gen::<i64>(),
    }
}

/// Fill the never-executed block with arithmetic that looks like real work.
fn build_dead_code(
    func: &mut Function,
    dead: BlockId,
    target: BlockId,
    operand: Option<ValueId>,
    ctx: &mut PassContext<'_>,
) {
    let decoy: Option<ConstId> = ctx.decoys.choose(&mut ctx.rng).copied();
    let mut b = FunctionBuilder::at_end(func, dead);
    let mut acc = match operand {
        Some(x) => x,
        None => b.iconst(Type::I32, ctx.rng.gen_range(1..1000), "opq.d"),
    };
    let ty = b.func().value_ty(acc);

    if let Some(decoy) = decoy {
        let base = b.str_ref(decoy, "opq.s");
        let offset = b.iconst(Type::I64, ctx.rng.gen_range(0..8), "opq.d");
        let ptr = b.gep(base, offset, "opq.d");
        let byte = b.load(Type::I8, ptr, false, "opq.d");
        let widened = if ty == Type::I8 { byte } else { b.cast(CastOp::Zext, byte, ty, "opq.d") };
        acc = b.binary(BinOp::Xor, acc, widened, "opq.d");
    }

    let ops = [BinOp::Add, BinOp::Mul, BinOp::Xor, BinOp::Sub, BinOp::Shl];
    for _ in 0..ctx.rng.gen_range(2..5) {
        let op = *ops.choose(&mut ctx.rng).unwrap_or(&BinOp::Add);
        let amount = if op == BinOp::Shl {
            ctx.rng.gen_range(1..(ty.bits() as i64))
        } else {
            ctx.rng.gen_range(1..0x7fff)
        };
        let c = b.iconst(ty, amount, "opq.d");
        acc = b.binary(op, acc, c, "opq.d");
    }
    b.br(target);
}

/// Give `target`'s phis an entry from `dead` copying the one from `from`.
fn mirror_phi_entries(func: &mut Function, target: BlockId, from: BlockId, dead: BlockId) {
    let phis: Vec<_> = func.block_insts(target)[..func.phi_count(target)].to_vec();
    for phi in phis {
        if let InstKind::Phi { incoming } = &mut func.inst_mut(phi).kind {
            if let Some(&(_, value)) = incoming.iter().find(|(src, _)| *src == from) {
                incoming.push((dead, value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PassConfig;
    use crate::core::rng::stream_rng;
    use crate::interp::Interpreter;
    use crate::ir::{ConstOrigin, Module};
    use crate::verify::verify_module;

    #[test]
    fn test_identities_exhaustive_i8() {
        for identity in Identity::OPERAND {
            for c in [0u64, 1, 0x55, 0xaa, 0xff] {
                for x in 0..=255u64 {
                    assert!(identity.holds(x, c, 8), "{identity:?} x={x} c={c}");
                }
            }
        }
    }

    #[test]
    fn test_identities_sampled_wide() {
        let mut rng = stream_rng(9, 0, 0);
        for bits in [32, 64] {
            for _ in 0..10_000 {
                let x: u64 = rng.gen();
                let c: u64 = rng.gen();
                for identity in Identity::OPERAND {
                    assert!(identity.holds(x, c, bits), "{identity:?} x={x} c={c} bits={bits}");
                }
                assert!(Identity::KeyedZero.holds(x, c, bits));
            }
        }
    }

    const LOOP: &str = r#"
global @obf.opaque_key: i32 = 0

define @sum(%n: i32) -> i32 {
entry:
  %zero = const i32 0
  %one = const i32 1
  br ^head
head:
  %i = phi i32 [^entry, %zero], [^body, %next]
  %acc = phi i32 [^entry, %zero], [^body, %acc2]
  %done = icmp sge %i, %n
  condbr %done, ^exit, ^body
body:
  %acc2 = add i32 %acc, %i
  %next = add i32 %i, %one
  br ^head
exit:
  ret %acc
}
"#;

    #[test]
    fn test_predicates_preserve_behavior() {
        for seed in 0..8 {
            let mut module = Module::parse(LOOP).unwrap();
            let decoy = module
                .constants
                .push(".obf.decoy", b"checksum mismatch".to_vec(), ConstOrigin::Generated);
            let decoys = [decoy];
            let reference = Module::parse(LOOP).unwrap();
            let config = PassConfig::enabled();
            let mut ctx = PassContext::new(PassKind::Opaque, &config, stream_rng(seed, 2, 0))
                .with_decoys(&decoys);
            let outcome = run(&mut module.functions[0], &mut ctx).unwrap();
            assert!(outcome.changed);
            assert_eq!(ctx.stats.predicates_inserted, 2);
            verify_module(&module, "opaque").unwrap();

            let func = &module.functions[0];
            let dead = func
                .layout()
                .iter()
                .filter(|b| func.block(**b).role == BlockRole::OpaqueDead)
                .count();
            assert_eq!(dead, 2);

            for n in [0u64, 1, 5, 17] {
                let expected = Interpreter::new(&reference).call("sum", &[n]).unwrap();
                let got = Interpreter::new(&module).call("sum", &[n]).unwrap();
                assert_eq!(got.value, expected.value, "seed {seed} n {n}");
            }
        }
    }

    #[test]
    fn test_no_operand_falls_back_to_keyed_zero() {
        let mut module = Module::parse(
            "global @obf.opaque_key: i32 = 0\ndefine @f() -> void {\nentry:\n  br ^x\nx:\n  ret\n}\n",
        )
        .unwrap();
        let config = PassConfig::enabled();
        let mut ctx = PassContext::new(PassKind::Opaque, &config, stream_rng(1, 2, 0));
        run(&mut module.functions[0], &mut ctx).unwrap();
        verify_module(&module, "opaque").unwrap();
        assert!(module.print().contains("load volatile i32"));
    }
}
