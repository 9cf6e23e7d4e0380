// This module computes the control-flow and data-flow facts passes and the verifier rely
// on. None of them are cached in the IR: every pass rewrites blocks freely, so callers
// build a fresh analysis when they need one. Cfg holds deduplicated predecessor and
// successor lists per live block. reverse_post_order walks the CFG from the entry with an
// explicit stack of (block, finished) entries: a block is pushed once to expand its
// successors and once more to be emitted after them, so long chains produced by splitting
// never recurse on the native stack. DomTree implements the Cooper-Harvey-Kennedy iterative
// dominator algorithm over that order. UseMap records every use of every value with its
// block and operand slot, and ValueSpan summarises where a value is defined and in which
// blocks it is referenced, which is what SSA demotion needs to decide which values must
// move to the stack.

//! CFG, dominance and def-use analyses.

use crate::ir::{BlockId, Function, InstId, ValueDef, ValueId};
use hashbrown::{HashMap, HashSet};

/// Predecessor and successor lists. Duplicate edges are collapsed.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    preds: HashMap<BlockId, Vec<BlockId>>,
    succs: HashMap<BlockId, Vec<BlockId>>,
}

fn push_unique(list: &mut Vec<BlockId>, block: BlockId) {
    if !list.contains(&block) {
        list.push(block);
    }
}

impl Cfg {
    pub fn build(func: &Function) -> Self {
        let mut cfg = Self::default();
        for &block in func.layout() {
            cfg.preds.entry(block).or_default();
            let succs = cfg.succs.entry(block).or_default();
            for succ in func.successors(block) {
                push_unique(succs, succ);
            }
        }
        for &block in func.layout() {
            for succ in cfg.succs[&block].clone() {
                push_unique(cfg.preds.entry(succ).or_default(), block);
            }
        }
        cfg
    }

    pub fn preds(&self, block: BlockId) -> &[BlockId] {
        self.preds.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn succs(&self, block: BlockId) -> &[BlockId] {
        self.succs.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Blocks reachable from the entry in reverse post-order.
pub fn reverse_post_order(func: &Function) -> Vec<BlockId> {
    let Some(entry) = func.entry() else {
        return Vec::new();
    };
    let mut post = Vec::new();
    let mut stack = vec![(entry, false)];
    let mut visited = HashSet::new();
    while let Some((block, processed)) = stack.pop() {
        if processed {
            post.push(block);
            continue;
        }
        if !visited.insert(block) {
            continue;
        }
        stack.push((block, true));
        // Reverse so the first successor is explored first.
        for succ in func.successors(block).into_iter().rev() {
            if func.is_live_block(succ) && !visited.contains(&succ) {
                stack.push((succ, false));
            }
        }
    }
    post.reverse();
    post
}

pub fn reachable_blocks(func: &Function) -> HashSet<BlockId> {
    reverse_post_order(func).into_iter().collect()
}

/// Immediate dominators of the reachable blocks.
#[derive(Debug, Clone, Default)]
pub struct DomTree {
    idom: HashMap<BlockId, BlockId>,
    rpo_index: HashMap<BlockId, usize>,
}

impl DomTree {
    pub fn build(func: &Function, cfg: &Cfg) -> Self {
        let order = reverse_post_order(func);
        let rpo_index: HashMap<BlockId, usize> =
            order.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        let Some(&entry) = order.first() else {
            return Self { idom, rpo_index };
        };
        idom.insert(entry, entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in order.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in cfg.preds(block) {
                    if !idom.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, &rpo_index, pred, current),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&block) != Some(&new_idom) {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }
        Self { idom, rpo_index }
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idom.contains_key(&block)
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied().filter(|d| *d != block)
    }

    /// Whether `a` dominates `b`. Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom(current) {
                Some(next) => current = next,
                None => return false,
            }
        }
    }

    pub fn rpo_index(&self, block: BlockId) -> Option<usize> {
        self.rpo_index.get(&block).copied()
    }
}

fn intersect(
    idom: &HashMap<BlockId, BlockId>,
    rpo_index: &HashMap<BlockId, usize>,
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while rpo_index[&a] > rpo_index[&b] {
            a = idom[&a];
        }
        while rpo_index[&b] > rpo_index[&a] {
            b = idom[&b];
        }
    }
    a
}

/// One operand slot referring to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub inst: InstId,
    pub block: BlockId,
    pub slot: usize,
}

/// Use-lists for every value referenced by a placed instruction.
#[derive(Debug, Clone, Default)]
pub struct UseMap {
    uses: HashMap<ValueId, Vec<Use>>,
}

impl UseMap {
    pub fn build(func: &Function) -> Self {
        let mut uses: HashMap<ValueId, Vec<Use>> = HashMap::new();
        for (block, inst) in func.placed_insts() {
            for (slot, value) in func.inst(inst).kind.operands().into_iter().enumerate() {
                uses.entry(value).or_default().push(Use { inst, block, slot });
            }
        }
        Self { uses }
    }

    pub fn uses(&self, value: ValueId) -> &[Use] {
        self.uses.get(&value).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_used(&self, value: ValueId) -> bool {
        !self.uses(value).is_empty()
    }
}

/// Where a value lives relative to the block structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSpan {
    /// Defining block; `None` for parameters.
    pub def_block: Option<BlockId>,
    /// Blocks referencing the value, in first-reference order. Phi uses count
    /// in the phi's own block.
    pub used_in: Vec<BlockId>,
    pub ref_count: u32,
}

impl ValueSpan {
    /// Referenced from a block other than the defining one.
    pub fn crosses_blocks(&self) -> bool {
        match self.def_block {
            Some(def) => self.used_in.iter().any(|b| *b != def),
            None => false,
        }
    }
}

/// Span of every value defined by a placed instruction or a parameter.
pub fn value_spans(func: &Function) -> HashMap<ValueId, ValueSpan> {
    let mut spans: HashMap<ValueId, ValueSpan> = HashMap::new();
    for &param in &func.params {
        spans.insert(param, ValueSpan { def_block: None, used_in: Vec::new(), ref_count: 0 });
    }
    for (block, inst) in func.placed_insts() {
        if let Some(result) = func.result(inst) {
            spans.insert(
                result,
                ValueSpan { def_block: Some(block), used_in: Vec::new(), ref_count: 0 },
            );
        }
    }
    for (block, inst) in func.placed_insts() {
        for value in func.inst(inst).kind.operands() {
            if let Some(span) = spans.get_mut(&value) {
                span.ref_count += 1;
                push_unique(&mut span.used_in, block);
            }
        }
    }
    spans
}

/// Defining block of a value, `None` for parameters and unplaced definitions.
pub fn def_block(func: &Function, inst_blocks: &HashMap<InstId, BlockId>, value: ValueId) -> Option<BlockId> {
    match func.value(value).def {
        ValueDef::Param(_) => None,
        ValueDef::Inst(inst) => inst_blocks.get(&inst).copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Module;

    fn diamond() -> Module {
        Module::parse(
            r#"
define @f(%c: i1, %a: i32) -> i32 {
entry:
  condbr %c, ^left, ^right
left:
  %x = add i32 %a, %a
  br ^join
right:
  %y = mul i32 %a, %a
  br ^join
join:
  %r = phi i32 [^left, %x], [^right, %y]
  ret %r
}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_rpo_starts_at_entry_and_ends_at_join() {
        let module = diamond();
        let func = module.function("f").unwrap();
        let order = reverse_post_order(func);
        let names: Vec<&str> = order.iter().map(|b| func.block_name(*b)).collect();
        assert_eq!(names.first(), Some(&"entry"));
        assert_eq!(names.last(), Some(&"join"));
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_rpo_of_long_chain() {
        let mut func = Function::new("chain", &[], crate::ir::Type::Void);
        let blocks: Vec<BlockId> = (0..20_000).map(|i| func.add_block(&format!("b{i}"))).collect();
        for pair in blocks.windows(2) {
            crate::ir::FunctionBuilder::at_end(&mut func, pair[0]).br(pair[1]);
        }
        crate::ir::FunctionBuilder::at_end(&mut func, blocks[blocks.len() - 1]).ret(None);
        assert_eq!(reverse_post_order(&func), blocks);
    }

    #[test]
    fn test_dominators_of_diamond() {
        let module = diamond();
        let func = module.function("f").unwrap();
        let cfg = Cfg::build(func);
        let dom = DomTree::build(func, &cfg);
        let entry = func.block_by_name("entry").unwrap();
        let left = func.block_by_name("left").unwrap();
        let join = func.block_by_name("join").unwrap();
        assert_eq!(dom.idom(join), Some(entry));
        assert!(dom.dominates(entry, left));
        assert!(!dom.dominates(left, join));
        assert!(dom.dominates(join, join));
        assert_eq!(cfg.preds(join).len(), 2);
    }

    #[test]
    fn test_value_spans_detect_cross_block_uses() {
        let module = diamond();
        let func = module.function("f").unwrap();
        let spans = value_spans(func);
        let uses = UseMap::build(func);
        let x = func
            .placed_insts()
            .filter_map(|(_, i)| func.result(i))
            .find(|v| func.value_name(*v) == "x")
            .unwrap();
        assert!(spans[&x].crosses_blocks());
        assert_eq!(uses.uses(x).len(), 1);
        let a = func.params[1];
        assert_eq!(spans[&a].ref_count, 4);
        assert!(!spans[&a].crosses_blocks());
    }
}
