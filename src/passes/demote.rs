//! SSA demotion to stack slots.
//!
//! Flattening routes every edge through the dispatcher, which destroys the
//! dominance relations phis and cross-block values rely on. Before rewriting
//! the CFG, phis become a slot written at the end of each predecessor and read
//! at the top of the block, and values used outside their defining block (the
//! entry block excepted) get a slot written after the definition and read
//! before each foreign use. All slots are allocated at the top of the entry.

use crate::analysis::{value_spans, UseMap};
use crate::ir::{BlockId, Function, FunctionBuilder, InstId, InstKind, ValueId};

/// Allocate a slot for a value of type `ty` at the top of the entry block.
fn entry_slot(func: &mut Function, value: ValueId, entry: BlockId) -> ValueId {
    let ty = func.value_ty(value);
    let name = format!("{}.slot", func.value_name(value));
    FunctionBuilder::at(func, entry, 0).alloca(ty, 1, &name)
}

/// Replace every phi with a stack slot. Returns the number of phis demoted.
pub fn demote_phis(func: &mut Function) -> usize {
    let Some(entry) = func.entry() else {
        return 0;
    };
    let blocks: Vec<BlockId> = func.layout().to_vec();
    let mut demoted = 0;
    for block in blocks {
        let phis: Vec<InstId> = func.block_insts(block)[..func.phi_count(block)].to_vec();
        for (index, phi) in phis.into_iter().enumerate() {
            let Some(result) = func.result(phi) else {
                continue;
            };
            let InstKind::Phi { incoming } = func.inst(phi).kind.clone() else {
                continue;
            };
            let slot = entry_slot(func, result, entry);
            for (pred, value) in incoming {
                FunctionBuilder::before_terminator(func, pred).store(value, slot, false);
            }

            let ty = func.value_ty(result);
            let name = format!("{}.reload", func.value_name(result));
            let load = func.create_inst(InstKind::Load { ptr: slot, volatile: false }, ty, &name);
            let Some(loaded) = func.result(load) else {
                continue;
            };
            func.unplace_inst(block, phi);
            // Earlier phis of this block are already loads at the front.
            func.insert_inst(block, index, load);
            func.replace_all_uses(result, loaded);
            demoted += 1;
        }
    }
    demoted
}

/// Give every value that is defined outside the entry and used in another
/// block its own stack slot. Must run after [`demote_phis`].
pub fn demote_cross_block_values(func: &mut Function) -> usize {
    let Some(entry) = func.entry() else {
        return 0;
    };
    let spans = value_spans(func);
    let mut crossing: Vec<(ValueId, BlockId)> = spans
        .iter()
        .filter(|(_, span)| span.def_block != Some(entry) && span.crosses_blocks())
        .filter_map(|(value, span)| span.def_block.map(|b| (*value, b)))
        .collect();
    crossing.sort();

    let uses = UseMap::build(func);
    let mut demoted = 0;
    for (value, def_block) in crossing {
        let Some(def) = func.def_inst(value) else {
            continue;
        };
        let foreign: Vec<_> = uses
            .uses(value)
            .iter()
            .filter(|u| u.block != def_block)
            .copied()
            .collect();
        if foreign.is_empty() {
            continue;
        }

        let slot = entry_slot(func, value, entry);
        let def_pos = func
            .inst_position(def_block, def)
            .map(|p| p + 1)
            .unwrap_or(0);
        FunctionBuilder::at(func, def_block, def_pos).store(value, slot, false);

        let ty = func.value_ty(value);
        let name = format!("{}.reload", func.value_name(value));
        for use_site in foreign {
            let Some(pos) = func.inst_position(use_site.block, use_site.inst) else {
                continue;
            };
            let loaded = FunctionBuilder::at(func, use_site.block, pos).load(ty, slot, false, &name);
            if let Some(op) = func
                .inst_mut(use_site.inst)
                .kind
                .operands_mut()
                .into_iter()
                .nth(use_site.slot)
            {
                *op = loaded;
            }
        }
        demoted += 1;
    }
    demoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Interpreter;
    use crate::ir::Module;
    use crate::verify::verify_module;

    const LOOP: &str = r#"
define @fact(%n: i64) -> i64 {
entry:
  %one = const i64 1
  br ^head
head:
  %i = phi i64 [^entry, %n], [^body, %dec]
  %acc = phi i64 [^entry, %one], [^body, %mul]
  %stop = icmp ule %i, %one
  condbr %stop, ^exit, ^body
body:
  %mul = mul i64 %acc, %i
  %dec = sub i64 %i, %one
  br ^head
exit:
  ret %acc
}
"#;

    #[test]
    fn test_demotion_removes_phis_and_keeps_semantics() {
        let reference = Module::parse(LOOP).unwrap();
        let mut module = Module::parse(LOOP).unwrap();
        let func = &mut module.functions[0];
        assert_eq!(demote_phis(func), 2);
        let crossing = demote_cross_block_values(func);
        assert!(crossing >= 2);
        assert!(func
            .placed_insts()
            .all(|(_, i)| !func.inst(i).kind.is_phi()));
        verify_module(&module, "flattening").unwrap();

        for n in [0u64, 1, 5, 10] {
            let a = Interpreter::new(&reference).call("fact", &[n]).unwrap();
            let b = Interpreter::new(&module).call("fact", &[n]).unwrap();
            assert_eq!(a.value, b.value);
        }
    }

    #[test]
    fn test_swap_phis_use_parallel_copy() {
        let text = r#"
define @swap(%a: i32, %b: i32, %n: i32) -> i32 {
entry:
  %zero = const i32 0
  %one = const i32 1
  br ^loop
loop:
  %x = phi i32 [^entry, %a], [^loop, %y]
  %y = phi i32 [^entry, %b], [^loop, %x]
  %k = phi i32 [^entry, %zero], [^loop, %k1]
  %k1 = add i32 %k, %one
  %again = icmp slt %k1, %n
  condbr %again, ^loop, ^done
done:
  ret %x
}
"#;
        let reference = Module::parse(text).unwrap();
        let mut module = Module::parse(text).unwrap();
        let func = &mut module.functions[0];
        demote_phis(func);
        demote_cross_block_values(func);
        verify_module(&module, "flattening").unwrap();
        for n in [1u64, 2, 3, 4] {
            let a = Interpreter::new(&reference).call("swap", &[7, 9, n]).unwrap();
            let b = Interpreter::new(&module).call("swap", &[7, 9, n]).unwrap();
            assert_eq!(a.value, b.value, "n = {n}");
        }
    }
}
