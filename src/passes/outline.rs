//! Function outlining.
//!
//! Extracts straight-line chains of blocks into new functions. A region is a
//! chain `S1 -> ... -> Sk` where every block ends in `br` to the next one,
//! `S1` is entered by exactly one edge and every later block has `Sk-1` as its
//! only predecessor; `Sk` branches out to the exit block. Inputs (values used
//! in the region but defined outside) become parameters in first-use order.
//! Outputs (values defined in the region and used outside) are written through
//! out-pointer parameters appended after the inputs, so every outlined function
//! returns `void`. The caller keeps `S1` as the call block: it calls the new
//! function, reloads the outputs from entry-block slots and branches to the exit.

use super::strings::DECRYPT_FN;
use super::{check_well_formed, ineligible, PassContext, PassKind, PassOutcome};
use crate::analysis::{Cfg, UseMap};
use crate::core::PassResult;
use crate::ir::{
    Attr, BlockId, BlockRole, Function, FunctionBuilder, InstId, InstKind, Module, Type, ValueId,
};
use hashbrown::{HashMap, HashSet};

/// Minimum non-terminator instructions in a region.
pub const DEFAULT_MIN_REGION_SIZE: usize = 2;

/// Marker between the caller's name and the outlined function's number.
pub const OUTLINED_INFIX: &str = ".obf.outlined.";

pub fn is_outlined(name: &str) -> bool {
    name.contains(OUTLINED_INFIX)
}

/// Largest number used by an existing outlined function.
pub fn max_outlined_id(module: &Module) -> Option<u64> {
    module
        .functions
        .iter()
        .filter_map(|f| f.name.rsplit_once(OUTLINED_INFIX))
        .filter_map(|(_, n)| n.parse::<u64>().ok())
        .max()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Region {
    blocks: Vec<BlockId>,
    exit: BlockId,
}

pub fn run(func: &mut Function, ctx: &mut PassContext<'_>) -> PassResult<PassOutcome> {
    if func.is_declaration {
        return Err(ineligible(PassKind::Outlining, func, "declaration"));
    }
    if func.has_attr(Attr::OptNone) {
        return Err(ineligible(PassKind::Outlining, func, "optnone"));
    }
    if is_outlined(&func.name) || func.name == DECRYPT_FN {
        return Err(ineligible(PassKind::Outlining, func, "generated function"));
    }
    check_well_formed(func)?;

    let regions = find_regions(func, ctx.threshold());
    if regions.is_empty() {
        return Err(ineligible(
            PassKind::Outlining,
            func,
            "no single-entry straight-line region",
        ));
    }

    let mut outcome = PassOutcome::unchanged();
    for region in regions {
        if !ctx.roll() {
            continue;
        }
        let Some(n) = ctx.ids.next() else {
            log::warn!("outlining: id range exhausted in {}", func.name);
            break;
        };
        let name = format!("{}{}{}", func.name, OUTLINED_INFIX, n);
        let outlined = extract(func, &region, &name);
        log::debug!(
            "outlining: {} blocks of {} into {} ({} params)",
            region.blocks.len(),
            func.name,
            name,
            outlined.params.len()
        );
        ctx.stats.regions_outlined += 1;
        outcome.new_functions.push(outlined);
        outcome.changed = true;
    }
    Ok(outcome)
}

fn br_target(func: &Function, block: BlockId) -> Option<BlockId> {
    match func.inst(func.terminator(block)?).kind {
        InstKind::Br { target } => Some(target),
        _ => None,
    }
}

/// A block that may be part of a region on its own terms.
fn is_movable(func: &Function, block: BlockId, address_taken: &HashSet<BlockId>) -> bool {
    func.block(block).role != BlockRole::OpaqueDead
        && !address_taken.contains(&block)
        && br_target(func, block).is_some()
        && func.block_insts(block).iter().all(|i| {
            !matches!(func.inst(*i).kind, InstKind::Alloca { .. } | InstKind::BlockAddr { .. })
        })
}

fn region_size(func: &Function, blocks: &[BlockId]) -> usize {
    blocks
        .iter()
        .flat_map(|b| func.block_insts(*b))
        .filter(|i| {
            let kind = &func.inst(**i).kind;
            !kind.is_terminator() && !kind.is_phi()
        })
        .count()
}

/// Disjoint candidate regions, heads in layout order.
fn find_regions(func: &Function, min_size: usize) -> Vec<Region> {
    let Some(entry) = func.entry() else {
        return Vec::new();
    };
    let cfg = Cfg::build(func);
    let address_taken: HashSet<BlockId> = func
        .placed_insts()
        .filter_map(|(_, i)| match func.inst(i).kind {
            InstKind::BlockAddr { block } => Some(block),
            _ => None,
        })
        .collect();

    let mut claimed: HashSet<BlockId> = HashSet::new();
    let mut regions = Vec::new();
    for &head in func.layout() {
        if head == entry || claimed.contains(&head) || !is_movable(func, head, &address_taken) {
            continue;
        }
        let &[pred] = cfg.preds(head) else {
            continue;
        };
        let edges = func.successors(pred).iter().filter(|s| **s == head).count();
        if pred == head || edges != 1 {
            continue;
        }

        let mut blocks = vec![head];
        let mut current = head;
        let exit = loop {
            let Some(next) = br_target(func, current) else {
                break None;
            };
            let joins = next != entry
                && !blocks.contains(&next)
                && !claimed.contains(&next)
                && cfg.preds(next) == [current]
                && is_movable(func, next, &address_taken);
            if !joins {
                break Some(next);
            }
            blocks.push(next);
            current = next;
        };
        let Some(exit) = exit else {
            continue;
        };
        if blocks.contains(&exit) || region_size(func, &blocks) < min_size {
            continue;
        }
        claimed.extend(blocks.iter().copied());
        regions.push(Region { blocks, exit });
    }
    regions
}

/// Every phi in a region has a single incoming entry; replace it by that value.
fn fold_phis(func: &mut Function, blocks: &[BlockId]) {
    for &block in blocks {
        let phis: Vec<InstId> = func.block_insts(block)[..func.phi_count(block)].to_vec();
        for phi in phis {
            let InstKind::Phi { incoming } = &func.inst(phi).kind else {
                continue;
            };
            let (Some(result), Some(&(_, value))) = (func.result(phi), incoming.first()) else {
                continue;
            };
            func.unplace_inst(block, phi);
            func.replace_all_uses(result, value);
        }
    }
}

/// Move `region` into a new function named `name` and leave a call behind.
fn extract(func: &mut Function, region: &Region, name: &str) -> Function {
    fold_phis(func, &region.blocks);

    let members: HashSet<BlockId> = region.blocks.iter().copied().collect();
    let insts: Vec<InstId> = region
        .blocks
        .iter()
        .flat_map(|b| func.block_insts(*b).to_vec())
        .collect();
    let defined: HashSet<ValueId> = insts.iter().filter_map(|i| func.result(*i)).collect();

    let mut inputs: Vec<ValueId> = Vec::new();
    for &inst in &insts {
        for op in func.inst(inst).kind.operands() {
            if !defined.contains(&op) && !inputs.contains(&op) {
                inputs.push(op);
            }
        }
    }
    let uses = UseMap::build(func);
    let outputs: Vec<ValueId> = insts
        .iter()
        .filter_map(|i| func.result(*i))
        .filter(|v| uses.uses(*v).iter().any(|u| !members.contains(&u.block)))
        .collect();

    let outlined = build_outlined(func, region, name, &insts, &inputs, &outputs);
    rewrite_caller(func, region, name, inputs, &outputs);
    outlined
}

fn build_outlined(
    func: &Function,
    region: &Region,
    name: &str,
    insts: &[InstId],
    inputs: &[ValueId],
    outputs: &[ValueId],
) -> Function {
    let mut params: Vec<(String, Type)> = inputs
        .iter()
        .map(|v| (func.value_name(*v).to_string(), func.value_ty(*v)))
        .collect();
    params.extend(
        outputs
            .iter()
            .map(|v| (format!("{}.out", func.value_name(*v)), Type::Ptr)),
    );
    let param_refs: Vec<(&str, Type)> = params.iter().map(|(n, t)| (n.as_str(), *t)).collect();
    let mut outlined = Function::new(name, &param_refs, Type::Void);
    outlined.add_attr(Attr::NoInline);

    let mut values: HashMap<ValueId, ValueId> =
        inputs.iter().copied().zip(outlined.params.iter().copied()).collect();
    let out_params: Vec<ValueId> = outlined.params[inputs.len()..].to_vec();
    let blocks: HashMap<BlockId, BlockId> = region
        .blocks
        .iter()
        .map(|b| (*b, outlined.add_block(func.block_name(*b))))
        .collect();

    let owner: HashMap<InstId, BlockId> = func.inst_blocks();
    for &inst in insts {
        let Some(target) = owner.get(&inst).and_then(|b| blocks.get(b)).copied() else {
            continue;
        };
        let data = func.inst(inst);
        if data.kind == (InstKind::Br { target: region.exit }) {
            let mut b = FunctionBuilder::at_end(&mut outlined, target);
            for (value, out) in outputs.iter().zip(&out_params) {
                if let Some(inner) = values.get(value) {
                    b.store(*inner, *out, false);
                }
            }
            b.ret(None);
            continue;
        }

        let mut kind = data.kind.clone();
        for op in kind.operands_mut() {
            if let Some(inner) = values.get(op) {
                *op = *inner;
            }
        }
        for dest in kind.block_refs_mut() {
            if let Some(inner) = blocks.get(dest) {
                *dest = *inner;
            }
        }
        let value_name = data.result.map(|r| func.value_name(r)).unwrap_or("");
        let copy = outlined.create_inst(kind, data.ty, value_name);
        outlined.append_inst(target, copy);
        if let (Some(old), Some(new)) = (data.result, outlined.result(copy)) {
            values.insert(old, new);
        }
    }
    outlined
}

fn rewrite_caller(
    func: &mut Function,
    region: &Region,
    name: &str,
    inputs: Vec<ValueId>,
    outputs: &[ValueId],
) {
    let Some(entry) = func.entry() else {
        return;
    };
    let head = region.blocks[0];
    let last = region.blocks[region.blocks.len() - 1];

    let mut slots = Vec::with_capacity(outputs.len());
    for &value in outputs {
        let ty = func.value_ty(value);
        let slot_name = format!("{}.out", func.value_name(value));
        slots.push(FunctionBuilder::at(func, entry, 0).alloca(ty, 1, &slot_name));
    }

    for &block in &region.blocks[1..] {
        func.remove_block(block);
    }
    func.block_insts_mut(head).clear();
    func.block_mut(head).role = BlockRole::OutlinedCall;

    let mut args = inputs;
    args.extend(slots.iter().copied());
    let mut reloads = Vec::with_capacity(outputs.len());
    {
        let mut b = FunctionBuilder::at_end(func, head);
        b.call(name, args, Type::Void, "");
        for (&value, &slot) in outputs.iter().zip(&slots) {
            let ty = b.func().value_ty(value);
            let reload_name = b.func().value_name(value).to_string();
            reloads.push((value, b.load(ty, slot, false, &reload_name)));
        }
        b.br(region.exit);
    }
    for (old, new) in reloads {
        func.replace_all_uses(old, new);
    }
    if last != head {
        func.retarget_phis(region.exit, last, head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PassConfig;
    use crate::core::rng::stream_rng;
    use crate::core::{IdAllocator, PassError};
    use crate::interp::Interpreter;
    use crate::verify::verify_module;

    const CHAIN: &str = r#"
define @f(%a: i32, %b: i32) -> i32 {
entry:
  %c = icmp slt %a, %b
  condbr %c, ^work, ^other
work:
  %x = add i32 %a, %b
  %y = mul i32 %x, %a
  br ^more
more:
  %z = sub i32 %y, %b
  %w = xor i32 %z, %x
  br ^join
other:
  %o = sub i32 %b, %a
  br ^join
join:
  %r = phi i32 [^more, %w], [^other, %o]
  ret %r
}
"#;

    fn outline(module: &mut Module, config: &PassConfig, ids: u64) -> PassResult<PassOutcome> {
        let range = IdAllocator::new(0).reserve(ids);
        let mut ctx = PassContext::new(PassKind::Outlining, config, stream_rng(2, 5, 0)).with_ids(range);
        let outcome = run(&mut module.functions[0], &mut ctx)?;
        module.functions.extend(outcome.new_functions.iter().cloned());
        Ok(outcome)
    }

    fn callers_of<'m>(module: &'m Module, callee: &str) -> Vec<&'m str> {
        module
            .functions
            .iter()
            .filter(|f| {
                f.placed_insts().any(|(_, i)| {
                    matches!(&f.inst(i).kind, InstKind::Call { callee: c, .. } if c == callee)
                })
            })
            .map(|f| f.name.as_str())
            .collect()
    }

    #[test]
    fn test_chain_is_outlined_with_out_pointer() {
        let reference = Module::parse(CHAIN).unwrap();
        let mut module = Module::parse(CHAIN).unwrap();
        let outcome = outline(&mut module, &PassConfig::enabled(), 5).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.new_functions.len(), 1);
        verify_module(&module, "outlining").unwrap();

        let outlined = module.function("f.obf.outlined.0").unwrap();
        assert!(outlined.has_attr(Attr::NoInline));
        assert_eq!(outlined.ret_ty, Type::Void);
        assert_eq!(outlined.param_types(), vec![Type::I32, Type::I32, Type::Ptr]);
        assert_eq!(callers_of(&module, "f.obf.outlined.0"), vec!["f"]);

        let f = module.function("f").unwrap();
        assert!(f.block_by_name("more").is_none());
        let work = f.block_by_name("work").unwrap();
        assert_eq!(f.block(work).role, BlockRole::OutlinedCall);

        for (a, b) in [(1u64, 2u64), (5, 3), (0, 0), (0xffff_fff0, 7)] {
            let x = Interpreter::new(&reference).call("f", &[a, b]).unwrap();
            let y = Interpreter::new(&module).call("f", &[a, b]).unwrap();
            assert_eq!(x.value, y.value, "f({a}, {b})");
        }
    }

    #[test]
    fn test_branching_regions_are_ineligible() {
        let text = r#"
define @g(%c: i1, %a: i32) -> i32 {
entry:
  condbr %c, ^l, ^r
l:
  %x = add i32 %a, %a
  %y = add i32 %x, %a
  ret %y
r:
  ret %a
}
"#;
        let mut module = Module::parse(text).unwrap();
        let err = outline(&mut module, &PassConfig::enabled(), 4).unwrap_err();
        assert!(matches!(err, PassError::Ineligible { .. }));
    }

    #[test]
    fn test_probability_zero_keeps_function() {
        let mut module = Module::parse(CHAIN).unwrap();
        let before = module.print();
        let config = PassConfig::enabled().with_probability(0.0);
        let outcome = outline(&mut module, &config, 5).unwrap();
        assert!(!outcome.changed);
        assert_eq!(module.print(), before);
    }

    #[test]
    fn test_small_regions_respect_threshold() {
        let mut module = Module::parse(CHAIN).unwrap();
        let config = PassConfig::enabled().with_threshold(10);
        assert!(outline(&mut module, &config, 5).is_err());
    }

    #[test]
    fn test_max_outlined_id() {
        let mut module = Module::parse(CHAIN).unwrap();
        assert_eq!(max_outlined_id(&module), None);
        module.functions.push(Function::declare("f.obf.outlined.7", &[], Type::Void));
        module.functions.push(Function::declare("g.obf.outlined.3", &[], Type::Void));
        assert_eq!(max_outlined_id(&module), Some(7));
    }
}
