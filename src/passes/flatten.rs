// This module implements control-flow flattening. After demoting phis and cross-block
// values to stack slots, every original block except the entry receives a distinct random
// i32 identifier and becomes one case of a switch in a new dispatch block. The entry stays
// the prologue: it runs its own body, stores the identifier of its successor into the
// dispatch state slot and jumps to the dispatcher. Every other terminator is rewritten the
// same way: `br` stores a constant, `condbr` stores a select between two constants keyed
// on the original condition, and `switch` stores the result of an icmp/select chain built
// from the last case to the first so the first matching case wins. Returns and
// unreachables are left as they are. The dispatcher loads the state and switches on it;
// its default edge leads to a block holding only `unreachable`. Functions that take block
// addresses or branch indirectly cannot be given a static identifier set and are skipped.
// A branch back to the entry has no case to dispatch to, so such input is malformed.

//! Control-flow flattening.

use super::demote::{demote_cross_block_values, demote_phis};
use super::{check_well_formed, ineligible, PassContext, PassKind, PassOutcome};
use crate::core::{PassError, PassResult};
use crate::ir::{
    Attr, BlockId, BlockRole, CmpPred, Function, FunctionBuilder, InstKind, Type, ValueId,
};
use hashbrown::{HashMap, HashSet};
use rand::Rng;

/// Functions with fewer blocks are left alone.
pub const DEFAULT_MIN_BLOCKS: usize = 2;

pub fn run(func: &mut Function, ctx: &mut PassContext<'_>) -> PassResult<PassOutcome> {
    if func.is_declaration {
        return Err(ineligible(PassKind::Flattening, func, "declaration"));
    }
    if func.has_attr(Attr::OptNone) {
        return Err(ineligible(PassKind::Flattening, func, "optnone"));
    }
    check_well_formed(func)?;
    let entry = func
        .entry()
        .ok_or_else(|| ineligible(PassKind::Flattening, func, "no entry block"))?;
    if func.layout().iter().any(|b| func.successors(*b).contains(&entry)) {
        return Err(PassError::Malformed {
            function: func.name.clone(),
            block: func.block_name(entry).to_string(),
            reason: "entry block has predecessors".to_string(),
        });
    }
    if func.block_count() < ctx.threshold() {
        return Err(ineligible(
            PassKind::Flattening,
            func,
            &format!("fewer than {} blocks", ctx.threshold()),
        ));
    }
    let computed = func.placed_insts().any(|(_, i)| {
        matches!(func.inst(i).kind, InstKind::IndirectBr { .. } | InstKind::BlockAddr { .. })
    });
    if computed {
        return Err(ineligible(PassKind::Flattening, func, "computed successors"));
    }
    if !ctx.roll() {
        return Ok(PassOutcome::unchanged());
    }

    let original: Vec<BlockId> = func.layout().to_vec();

    let phis = demote_phis(func);
    let values = demote_cross_block_values(func);

    let ids = assign_ids(&original[1..], &mut ctx.rng);
    let state = FunctionBuilder::at(func, entry, 0).alloca(Type::I32, 1, "dispatch.state");

    let dispatch = func.insert_block_after(entry, "dispatch", BlockRole::Dispatch);
    let default = func.add_block_with_role("dispatch.default", BlockRole::DispatchDefault);
    FunctionBuilder::at_end(func, default).unreachable();

    for &block in &original {
        rewrite_terminator(func, block, state, dispatch, &ids)?;
    }

    {
        let mut b = FunctionBuilder::at_end(func, dispatch);
        let current = b.load(Type::I32, state, false, "dispatch.next");
        let cases: Vec<(i64, BlockId)> =
            original[1..].iter().map(|blk| (ids[blk] as i64, *blk)).collect();
        b.switch(current, default, cases);
    }

    log::debug!(
        "flattening: {} with {} cases ({} phis, {} values demoted)",
        func.name,
        original.len() - 1,
        phis,
        values
    );
    ctx.stats.functions_flattened += 1;
    ctx.stats.values_demoted += phis + values;
    Ok(PassOutcome::changed(true))
}

/// Distinct pseudo-random identifiers for the dispatched blocks.
fn assign_ids(blocks: &[BlockId], rng: &mut impl Rng) -> HashMap<BlockId, i32> {
    let mut used = HashSet::new();
    let mut ids = HashMap::new();
    for &block in blocks {
        let id = loop {
            let candidate: i32 = rng.gen();
            if used.insert(candidate) {
                break candidate;
            }
        };
        ids.insert(block, id);
    }
    ids
}

fn rewrite_terminator(
    func: &mut Function,
    block: BlockId,
    state: ValueId,
    dispatch: BlockId,
    ids: &HashMap<BlockId, i32>,
) -> PassResult<()> {
    let Some(term) = func.terminator(block) else {
        return Ok(());
    };
    let kind = func.inst(term).kind.clone();
    if matches!(kind, InstKind::Ret { .. } | InstKind::Unreachable) {
        return Ok(());
    }
    let id_of = |target: BlockId| {
        ids.get(&target).map(|id| i64::from(*id)).ok_or_else(|| PassError::Malformed {
            function: func.name.clone(),
            block: func.block_name(block).to_string(),
            reason: format!("branch to {} has no dispatch case", func.block_name_or_placeholder(target)),
        })
    };

    let next = match kind {
        InstKind::Br { target } => {
            let id = id_of(target)?;
            func.unplace_inst(block, term);
            FunctionBuilder::at_end(func, block).iconst(Type::I32, id, "state.id")
        }
        InstKind::CondBr { cond, then_dest, else_dest } => {
            let (then_id, else_id) = (id_of(then_dest)?, id_of(else_dest)?);
            func.unplace_inst(block, term);
            let mut b = FunctionBuilder::at_end(func, block);
            let t = b.iconst(Type::I32, then_id, "state.id");
            let f = b.iconst(Type::I32, else_id, "state.id");
            b.select(cond, t, f, "state.next")
        }
        InstKind::Switch { value, default, cases } => {
            let default_id = id_of(default)?;
            let case_ids = cases
                .iter()
                .map(|(case, target)| id_of(*target).map(|id| (*case, id)))
                .collect::<PassResult<Vec<(i64, i64)>>>()?;
            func.unplace_inst(block, term);
            let ty = func.value_ty(value);
            let mut b = FunctionBuilder::at_end(func, block);
            let mut acc = b.iconst(Type::I32, default_id, "state.id");
            for (case, id) in case_ids.into_iter().rev() {
                let k = b.iconst(ty, case, "state.case");
                let hit = b.icmp(CmpPred::Eq, value, k, "state.hit");
                let id = b.iconst(Type::I32, id, "state.id");
                acc = b.select(hit, id, acc, "state.next");
            }
            acc
        }
        _ => return Ok(()),
    };
    let mut b = FunctionBuilder::at_end(func, block);
    b.store(next, state, false);
    b.br(dispatch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PassConfig;
    use crate::core::rng::stream_rng;
    use crate::core::PassError;
    use crate::interp::Interpreter;
    use crate::ir::Module;
    use crate::verify::verify_module;

    fn flatten(module: &mut Module, name: &str, seed: u64) -> PassResult<PassOutcome> {
        let config = PassConfig::enabled();
        let mut ctx = PassContext::new(PassKind::Flattening, &config, stream_rng(seed, 3, 0));
        let func = module.function_mut(name).unwrap();
        run(func, &mut ctx)
    }

    const IF_ELSE: &str = r#"
define @pick(%c: i1) -> i32 {
entry:
  condbr %c, ^yes, ^no
yes:
  %a = const i32 11
  ret %a
no:
  %b = const i32 22
  ret %b
}
"#;

    #[test]
    fn test_if_else_has_two_cases() {
        let mut module = Module::parse(IF_ELSE).unwrap();
        flatten(&mut module, "pick", 5).unwrap();
        verify_module(&module, "flattening").unwrap();

        let func = module.function("pick").unwrap();
        let dispatchers: Vec<_> = func
            .layout()
            .iter()
            .filter(|b| func.block(**b).role == BlockRole::Dispatch)
            .collect();
        assert_eq!(dispatchers.len(), 1);
        let term = func.terminator(*dispatchers[0]).unwrap();
        match &func.inst(term).kind {
            InstKind::Switch { cases, .. } => assert_eq!(cases.len(), 2),
            other => panic!("expected switch, got {other:?}"),
        }

        let switches = func
            .placed_insts()
            .filter(|(_, i)| matches!(func.inst(*i).kind, InstKind::Switch { .. }))
            .count();
        assert_eq!(switches, 1);
        let conds = func
            .placed_insts()
            .filter(|(_, i)| matches!(func.inst(*i).kind, InstKind::CondBr { .. }))
            .count();
        assert_eq!(conds, 0);

        assert_eq!(Interpreter::new(&module).call("pick", &[1]).unwrap().value, Some(11));
        assert_eq!(Interpreter::new(&module).call("pick", &[0]).unwrap().value, Some(22));
    }

    #[test]
    fn test_switch_first_match_semantics() {
        let text = r#"
define @classify(%x: i32) -> i32 {
entry:
  switch %x, ^other [1: ^one, 2: ^two, 3: ^one]
one:
  %a = const i32 100
  br ^out
two:
  %b = const i32 200
  br ^out
other:
  %c = const i32 300
  br ^out
out:
  %r = phi i32 [^one, %a], [^two, %b], [^other, %c]
  ret %r
}
"#;
        let reference = Module::parse(text).unwrap();
        let mut module = Module::parse(text).unwrap();
        flatten(&mut module, "classify", 17).unwrap();
        verify_module(&module, "flattening").unwrap();
        for x in 0..6u64 {
            let a = Interpreter::new(&reference).call("classify", &[x]).unwrap();
            let b = Interpreter::new(&module).call("classify", &[x]).unwrap();
            assert_eq!(a.value, b.value, "x = {x}");
        }
    }

    #[test]
    fn test_indirect_branch_skipped() {
        let text = r#"
define @f(%c: i1) -> i32 {
entry:
  %t = blockaddr ^a
  indirectbr %t, [^a]
a:
  %r = const i32 1
  ret %r
}
"#;
        let mut module = Module::parse(text).unwrap();
        let before = module.print();
        let err = flatten(&mut module, "f", 1).unwrap_err();
        assert!(matches!(err, PassError::Ineligible { .. }));
        assert_eq!(module.print(), before);
    }

    #[test]
    fn test_branch_back_to_entry_is_malformed() {
        let text = r#"
define @f(%n: i32) -> i32 {
entry:
  %z = const i32 0
  %c = icmp eq %n, %z
  condbr %c, ^done, ^again
again:
  br ^entry
done:
  ret %n
}
"#;
        let mut module = Module::parse(text).unwrap();
        let before = module.print();
        let err = flatten(&mut module, "f", 2).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, PassError::Malformed { ref block, .. } if block == "entry"));
        assert_eq!(module.print(), before);
    }

    #[test]
    fn test_single_block_skipped() {
        let mut module = Module::parse("define @f() -> void {\nentry:\n  ret\n}\n").unwrap();
        assert!(matches!(
            flatten(&mut module, "f", 1),
            Err(PassError::Ineligible { .. })
        ));
    }
}
