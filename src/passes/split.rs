//! Basic block splitting.
//!
//! Cuts eligible blocks in two at a random instruction boundary and links the
//! halves with an unconditional branch. The head dominates the tail, so values
//! defined before the cut stay usable after it without any rewriting.

use super::{check_well_formed, ineligible, PassContext, PassKind, PassOutcome};
use crate::core::PassResult;
use crate::ir::{Attr, BlockId, BlockRole, Function, FunctionBuilder};
use rand::Rng;

/// Minimum instructions in a block, terminator included.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 3;

pub fn run(func: &mut Function, ctx: &mut PassContext<'_>) -> PassResult<PassOutcome> {
    if func.is_declaration {
        return Err(ineligible(PassKind::Split, func, "declaration"));
    }
    if func.has_attr(Attr::OptNone) {
        return Err(ineligible(PassKind::Split, func, "optnone"));
    }
    check_well_formed(func)?;

    let min_size = ctx.threshold();
    let blocks: Vec<BlockId> = func.layout().to_vec();
    let mut split = 0;
    for block in blocks {
        let len = func.block_insts(block).len();
        if len < min_size {
            continue;
        }
        let lo = func.phi_count(block).max(1);
        let hi = len - 2;
        if lo > hi {
            continue;
        }
        if !ctx.roll() {
            continue;
        }
        let at = ctx.rng.gen_range(lo..=hi);
        split_block(func, block, at);
        split += 1;
    }

    if split > 0 {
        log::debug!("split: {} blocks split in {}", split, func.name);
        ctx.stats.blocks_split += split;
    }
    Ok(PassOutcome::changed(split > 0))
}

/// Move `block[at..]` into a new block placed after `block` and return it.
pub fn split_block(func: &mut Function, block: BlockId, at: usize) -> BlockId {
    let name = format!("{}.split", func.block_name(block));
    let tail = func.insert_block_after(block, &name, BlockRole::SplitTail);
    let moved: Vec<_> = func.block_insts_mut(block).split_off(at);
    *func.block_insts_mut(tail) = moved;

    for succ in func.successors(tail) {
        func.retarget_phis(succ, block, tail);
    }

    FunctionBuilder::at_end(func, block).br(tail);
    log::trace!("split: {} at {} -> {}", func.block_name(block), at, func.block_name(tail));
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PassConfig;
    use crate::core::rng::stream_rng;
    use crate::core::PassError;
    use crate::ir::Module;
    use crate::verify::verify_module;

    const STRAIGHT: &str = r#"
define @f(%a: i32, %b: i32) -> i32 {
entry:
  %x = add i32 %a, %b
  %y = mul i32 %x, %a
  %z = sub i32 %y, %b
  %w = xor i32 %z, %x
  ret %w
}
"#;

    fn run_split(module: &mut Module, config: &PassConfig, seed: u64) -> PassResult<PassOutcome> {
        let mut ctx = PassContext::new(PassKind::Split, config, stream_rng(seed, 1, 0));
        run(&mut module.functions[0], &mut ctx)
    }

    #[test]
    fn test_split_preserves_body_count() {
        let mut module = Module::parse(STRAIGHT).unwrap();
        let before = module.functions[0].body_inst_count();
        let config = PassConfig::enabled();
        let outcome = run_split(&mut module, &config, 3).unwrap();
        assert!(outcome.changed);
        let func = &module.functions[0];
        assert_eq!(func.block_count(), 2);
        assert_eq!(func.body_inst_count(), before);
        verify_module(&module, "split").unwrap();
    }

    #[test]
    fn test_probability_zero_is_noop() {
        let mut module = Module::parse(STRAIGHT).unwrap();
        let original = module.print();
        let config = PassConfig::enabled().with_probability(0.0);
        let outcome = run_split(&mut module, &config, 3).unwrap();
        assert!(!outcome.changed);
        assert_eq!(module.print(), original);
    }

    #[test]
    fn test_phis_stay_in_head_and_successors_retargeted() {
        let mut module = Module::parse(
            r#"
define @f(%c: i1, %a: i32) -> i32 {
entry:
  condbr %c, ^l, ^j
l:
  %p = phi i32 [^entry, %a]
  %x = add i32 %p, %p
  %y = add i32 %x, %x
  br ^j
j:
  %r = phi i32 [^entry, %a], [^l, %y]
  ret %r
}
"#,
        )
        .unwrap();
        let config = PassConfig::enabled();
        run_split(&mut module, &config, 11).unwrap();
        verify_module(&module, "split").unwrap();
        let func = &module.functions[0];
        let l = func.block_by_name("l").unwrap();
        assert!(func.inst(func.block_insts(l)[0]).kind.is_phi());
        assert!(func.block_by_name("l.split").is_some());
    }

    #[test]
    fn test_optnone_skipped() {
        let mut module =
            Module::parse(&STRAIGHT.replace("-> i32 {", "-> i32 #optnone {")).unwrap();
        let config = PassConfig::enabled();
        let err = run_split(&mut module, &config, 1).unwrap_err();
        assert!(matches!(err, PassError::Ineligible { .. }));
    }

    #[test]
    fn test_missing_terminator_is_malformed() {
        let mut module = Module::parse(STRAIGHT).unwrap();
        let func = &mut module.functions[0];
        let entry = func.entry().unwrap();
        func.block_insts_mut(entry).pop();
        let config = PassConfig::enabled();
        let err = run_split(&mut module, &config, 1).unwrap_err();
        assert!(err.is_fatal());
    }
}
