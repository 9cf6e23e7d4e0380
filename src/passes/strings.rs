// This module implements string constant encryption. It runs on the whole module and owns
// the constant pool while it runs. Functions that are malformed or were excluded by an
// earlier failure are not rewritten, and the strings they reference stay plaintext. Identical plaintext entries are merged first and
// every `str` reference is remapped, so a literal shared by several sites is encrypted
// once. Each chosen entry gets its own 64-bit key from the pass RNG and its bytes are
// replaced in place with the key-stream ciphertext from crate::crypto. The pass then makes
// sure the module has `malloc`, `free` and a generated IR routine that recomputes the same
// key stream, and rewrites every live use of an encrypted reference to go through a fresh
// decrypt call placed directly before the use (for phi operands, at the end of the
// incoming block). The calling function owns the returned buffer; see `plan_lifetime` for
// where frees are placed.

//! String constant encryption.

use super::{check_well_formed, PassKind, PassOutcome};
use crate::analysis::UseMap;
use crate::core::{PassConfig, PassError, PassResult, SessionStats};
use crate::crypto;
use crate::ir::{
    Attr, BinOp, BlockId, BlockRole, CastOp, CmpPred, ConstId, ConstOrigin, Function,
    FunctionBuilder, InstKind, Module, Type, ValueId,
};
use hashbrown::{HashMap, HashSet};
use rand::rngs::StdRng;
use rand::Rng;

/// Strings shorter than this are left in plaintext.
pub const DEFAULT_MIN_LENGTH: usize = 1;

/// Name of the generated decrypt routine.
pub const DECRYPT_FN: &str = "obf.decrypt_string";

const MALLOC: &str = "malloc";
const FREE: &str = "free";

pub fn run(
    module: &mut Module,
    config: &PassConfig,
    rng: &mut StdRng,
    stats: &mut SessionStats,
    excluded: &HashSet<String>,
) -> PassResult<PassOutcome> {
    if module.constants.is_empty() {
        return Ok(PassOutcome::unchanged());
    }

    let remap = module.constants.dedup();
    let merged = remap.iter().enumerate().any(|(i, id)| id.index() != i);
    if merged {
        for func in module.functions.iter_mut() {
            remap_references(func, &remap);
        }
        log::debug!("string: merged duplicates down to {} entries", module.constants.len());
    }

    // Functions left alone keep every string they reference in plaintext.
    let skipped: Vec<bool> = module
        .functions
        .iter()
        .map(|func| {
            if excluded.contains(&func.name) {
                return true;
            }
            match check_well_formed(func) {
                Ok(()) => false,
                Err(err) => {
                    log::warn!("string: skipping {}: {err}", func.name);
                    true
                }
            }
        })
        .collect();
    let pinned = references(flagged(&module.functions, &skipped, true));
    let live = live_references(flagged(&module.functions, &skipped, false));
    let min_length = config.threshold_for(PassKind::String);
    let candidates: Vec<ConstId> = module
        .constants
        .iter()
        .filter(|(id, c)| {
            c.origin == ConstOrigin::Source
                && !c.is_encrypted()
                && c.bytes.len() >= min_length
                && live.contains(id)
                && !pinned.contains(id)
        })
        .map(|(id, _)| id)
        .collect();

    let probability = config.probability.clamp(0.0, 1.0);
    let mut encrypted: HashMap<ConstId, (u64, u64)> = HashMap::new();
    for id in candidates {
        if !rng.gen_bool(probability) {
            continue;
        }
        let key: u64 = rng.gen();
        let Some(entry) = module.constants.get_mut(id) else {
            continue;
        };
        entry.bytes = crypto::encrypt(&entry.bytes, key);
        entry.key = Some(key);
        log::trace!("string: encrypted {} ({} bytes)", entry.name, entry.bytes.len());
        encrypted.insert(id, (entry.bytes.len() as u64, key));
    }
    if encrypted.is_empty() {
        return Ok(PassOutcome::changed(merged));
    }

    module.ensure_declaration(MALLOC, &[Type::I64], Type::Ptr);
    module.ensure_declaration(FREE, &[Type::Ptr], Type::Void);
    match module.function(DECRYPT_FN) {
        None => module.functions.push(build_decrypt_routine()),
        Some(existing) if existing.param_types() != [Type::Ptr, Type::I64, Type::I64] => {
            return Err(PassError::Malformed {
                function: DECRYPT_FN.to_string(),
                block: "-".to_string(),
                reason: "name is taken by a function with another signature".to_string(),
            });
        }
        Some(_) => {}
    }

    let mut sites = 0;
    for (func, skip) in module.functions.iter_mut().zip(skipped.iter().chain(std::iter::repeat(&false))) {
        if *skip || func.is_declaration || func.name == DECRYPT_FN {
            continue;
        }
        sites += rewrite_uses(func, &encrypted);
    }

    log::debug!("string: {} strings encrypted, {} decrypt sites", encrypted.len(), sites);
    stats.strings_encrypted += encrypted.len();
    stats.decrypt_sites += sites;
    Ok(PassOutcome::changed(true))
}

fn remap_references(func: &mut Function, remap: &[ConstId]) {
    let insts: Vec<_> = func.placed_insts().map(|(_, i)| i).collect();
    for inst in insts {
        if let InstKind::StrRef { constant } = &mut func.inst_mut(inst).kind {
            if let Some(new) = remap.get(constant.index()) {
                *constant = *new;
            }
        }
    }
}

/// Constants referenced from at least one block that can execute.
fn live_references<'a>(functions: impl Iterator<Item = &'a Function>) -> HashSet<ConstId> {
    let mut live = HashSet::new();
    for func in functions.filter(|f| f.name != DECRYPT_FN) {
        for (block, inst) in func.placed_insts() {
            if func.block(block).role == BlockRole::OpaqueDead {
                continue;
            }
            if let InstKind::StrRef { constant } = func.inst(inst).kind {
                live.insert(constant);
            }
        }
    }
    live
}

fn flagged<'a>(
    functions: &'a [Function],
    flags: &'a [bool],
    flag: bool,
) -> impl Iterator<Item = &'a Function> + 'a {
    functions.iter().zip(flags).filter(move |(_, f)| **f == flag).map(|(func, _)| func)
}

/// Constants referenced anywhere in `functions`, dead blocks included.
fn references<'a>(functions: impl Iterator<Item = &'a Function>) -> HashSet<ConstId> {
    functions
        .flat_map(|func| {
            func.placed_insts().filter_map(move |(_, inst)| match func.inst(inst).kind {
                InstKind::StrRef { constant } => Some(constant),
                _ => None,
            })
        })
        .collect()
}

/// Route every use of an encrypted reference through a decrypt call.
/// Returns the number of calls inserted.
fn rewrite_uses(func: &mut Function, encrypted: &HashMap<ConstId, (u64, u64)>) -> usize {
    let refs: Vec<(ValueId, ConstId)> = func
        .placed_insts()
        .filter(|(block, _)| func.block(*block).role != BlockRole::OpaqueDead)
        .filter_map(|(_, inst)| match func.inst(inst).kind {
            InstKind::StrRef { constant } if encrypted.contains_key(&constant) => {
                func.result(inst).map(|v| (v, constant))
            }
            _ => None,
        })
        .collect();
    if refs.is_empty() {
        return 0;
    }

    let uses = UseMap::build(func);
    let mut buffers: Vec<(ValueId, BlockId)> = Vec::new();
    for (reference, constant) in refs {
        let (len, key) = encrypted[&constant];
        for site in uses.uses(reference) {
            let (block, pos) = match &func.inst(site.inst).kind {
                InstKind::Phi { incoming } => {
                    let Some((pred, _)) = incoming.get(site.slot) else {
                        continue;
                    };
                    let pos = func.block_insts(*pred).len().saturating_sub(1);
                    (*pred, pos)
                }
                _ => match func.inst_position(site.block, site.inst) {
                    Some(pos) => (site.block, pos),
                    None => continue,
                },
            };

            let mut b = FunctionBuilder::at(func, block, pos);
            let len_v = b.iconst(Type::I64, len as i64, "str.len");
            let key_v = b.iconst(Type::I64, key as i64, "str.key");
            let plain = b.call_value(DECRYPT_FN, vec![reference, len_v, key_v], Type::Ptr, "str.plain");

            if let Some(op) = func
                .inst_mut(site.inst)
                .kind
                .operands_mut()
                .into_iter()
                .nth(site.slot)
            {
                *op = plain;
            }
            buffers.push((plain, block));
        }
    }

    let uses = UseMap::build(func);
    let plans: Vec<(ValueId, BlockId, Lifetime)> = buffers
        .iter()
        .map(|&(buf, block)| (buf, block, plan_lifetime(func, &uses, buf, block)))
        .collect();
    for (buf, block, lifetime) in plans {
        match lifetime {
            Lifetime::Escapes => {}
            Lifetime::Block(last) => {
                if let Some(pos) = func.inst_position(block, last) {
                    FunctionBuilder::at(func, block, pos + 1).call(FREE, vec![buf], Type::Void, "");
                }
            }
            Lifetime::Function => free_at_exit(func, buf, block),
        }
    }
    buffers.len()
}

/// Where a decrypted buffer must be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifetime {
    /// Ownership leaves the function through `ret` or a store to non-local memory.
    Escapes,
    /// Every use sits in the decrypting block; free after this instruction.
    Block(crate::ir::InstId),
    /// Track the buffer in a slot and free it when the function returns.
    Function,
}

/// Follow the buffer and the pointers derived from it to decide its lifetime.
/// Call arguments are treated as borrowed, but a pointer returned by a call that
/// received a derived pointer may alias the buffer and is followed too. Stores
/// into a stack slot of this function keep the buffer local; loads from the slot
/// are followed.
fn plan_lifetime(func: &Function, uses: &UseMap, buf: ValueId, block: BlockId) -> Lifetime {
    let mut derived = vec![buf];
    let mut seen: HashSet<ValueId> = HashSet::from_iter([buf]);
    let mut slots: HashSet<ValueId> = HashSet::new();
    let mut local = true;
    let mut last: Option<(usize, crate::ir::InstId)> = None;

    while let Some(value) = derived.pop() {
        for site in uses.uses(value) {
            let kind = &func.inst(site.inst).kind;
            match kind {
                InstKind::Ret { .. } => return Lifetime::Escapes,
                InstKind::Store { ptr, .. } if site.slot == 0 => {
                    if !is_private_slot(func, uses, *ptr) {
                        return Lifetime::Escapes;
                    }
                    if slots.insert(*ptr) {
                        for load in uses.uses(*ptr) {
                            if !matches!(func.inst(load.inst).kind, InstKind::Load { .. }) {
                                continue;
                            }
                            if let Some(result) = func.result(load.inst) {
                                if seen.insert(result) {
                                    derived.push(result);
                                }
                            }
                        }
                    }
                    local = false;
                }
                InstKind::Gep { .. } | InstKind::Select { .. } | InstKind::Phi { .. } => {
                    if let Some(result) = func.result(site.inst) {
                        if seen.insert(result) {
                            derived.push(result);
                        }
                    }
                }
                InstKind::Call { .. } | InstKind::CallIndirect { .. }
                    if func.inst(site.inst).ty == Type::Ptr =>
                {
                    if let Some(result) = func.result(site.inst) {
                        if seen.insert(result) {
                            derived.push(result);
                        }
                    }
                }
                _ => {}
            }
            if site.block != block || kind.is_phi() || kind.is_terminator() {
                local = false;
                continue;
            }
            if let Some(pos) = func.inst_position(block, site.inst) {
                if last.map_or(true, |(p, _)| pos > p) {
                    last = Some((pos, site.inst));
                }
            }
        }
    }

    match (local, last) {
        (true, Some((_, inst))) => Lifetime::Block(inst),
        _ => Lifetime::Function,
    }
}

/// An `alloca` of this function whose address is only loaded from and stored to.
fn is_private_slot(func: &Function, uses: &UseMap, ptr: ValueId) -> bool {
    let is_alloca = func
        .def_inst(ptr)
        .is_some_and(|def| matches!(func.inst(def).kind, InstKind::Alloca { .. }));
    is_alloca
        && uses.uses(ptr).iter().all(|site| match func.inst(site.inst).kind {
            InstKind::Load { .. } => true,
            InstKind::Store { .. } => site.slot == 1,
            _ => false,
        })
}

/// Record `buf` in a null-initialised entry slot and free the slot before every `ret`.
fn free_at_exit(func: &mut Function, buf: ValueId, block: BlockId) {
    let Some(entry) = func.entry() else {
        return;
    };
    let slot = {
        let mut b = FunctionBuilder::at(func, entry, 0);
        let slot = b.alloca(Type::Ptr, 1, "str.slot");
        let null = b.null_ptr("str.null");
        b.store(null, slot, false);
        slot
    };

    let Some(def) = func.def_inst(buf) else {
        return;
    };
    if let Some(pos) = func.inst_position(block, def) {
        FunctionBuilder::at(func, block, pos + 1).store(buf, slot, false);
    }

    let exits: Vec<BlockId> = func
        .layout()
        .iter()
        .copied()
        .filter(|b| {
            func.terminator(*b)
                .is_some_and(|t| matches!(func.inst(t).kind, InstKind::Ret { .. }))
        })
        .collect();
    for exit in exits {
        let mut b = FunctionBuilder::before_terminator(func, exit);
        let owned = b.load(Type::Ptr, slot, false, "str.owned");
        b.call(FREE, vec![owned], Type::Void, "");
    }
}

/// Build `obf.decrypt_string(src, len, key) -> ptr`, the IR twin of
/// [`crypto::decrypt`]. The result is a `malloc`ed, NUL-terminated copy.
fn build_decrypt_routine() -> Function {
    let mut func = Function::new(
        DECRYPT_FN,
        &[("src", Type::Ptr), ("len", Type::I64), ("key", Type::I64)],
        Type::Ptr,
    );
    func.add_attr(Attr::NoInline);
    func.add_attr(Attr::OptNone);
    let (src, len, key) = (func.params[0], func.params[1], func.params[2]);

    let entry = func.add_block("entry");
    let head = func.add_block("head");
    let body = func.add_block("body");
    let exit = func.add_block("exit");

    let (buf, zero, one, multiplier, increment, shift) = {
        let mut b = FunctionBuilder::at_end(&mut func, entry);
        let zero = b.iconst(Type::I64, 0, "zero");
        let one = b.iconst(Type::I64, 1, "one");
        let size = b.binary(BinOp::Add, len, one, "size");
        let buf = b.call_value(MALLOC, vec![size], Type::Ptr, "buf");
        let multiplier = b.iconst(Type::I64, crypto::LCG_MULTIPLIER as i64, "mul");
        let increment = b.iconst(Type::I64, crypto::LCG_INCREMENT as i64, "inc");
        let shift = b.iconst(Type::I64, 56, "shift");
        b.br(head);
        (buf, zero, one, multiplier, increment, shift)
    };

    let (index, state) = {
        let mut b = FunctionBuilder::at_end(&mut func, head);
        let index = b.phi(Type::I64, vec![(entry, zero)], "i");
        let state = b.phi(Type::I64, vec![(entry, key)], "state");
        let done = b.icmp(CmpPred::Uge, index, len, "done");
        b.cond_br(done, exit, body);
        (index, state)
    };

    let (next_index, next_state) = {
        let mut b = FunctionBuilder::at_end(&mut func, body);
        let scaled = b.binary(BinOp::Mul, state, multiplier, "scaled");
        let next_state = b.binary(BinOp::Add, scaled, increment, "state.next");
        let top = b.binary(BinOp::LShr, next_state, shift, "top");
        let key_byte = b.cast(CastOp::Trunc, top, Type::I8, "kb");
        let src_at = b.gep(src, index, "src.at");
        let cipher = b.load(Type::I8, src_at, false, "c");
        let plain = b.binary(BinOp::Xor, cipher, key_byte, "p");
        let dst_at = b.gep(buf, index, "dst.at");
        b.store(plain, dst_at, false);
        let next_index = b.binary(BinOp::Add, index, one, "i.next");
        b.br(head);
        (next_index, next_state)
    };
    add_incoming(&mut func, index, body, next_index);
    add_incoming(&mut func, state, body, next_state);

    {
        let mut b = FunctionBuilder::at_end(&mut func, exit);
        let end = b.gep(buf, len, "end");
        let nul = b.iconst(Type::I8, 0, "nul");
        b.store(nul, end, false);
        b.ret(Some(buf));
    }
    func
}

fn add_incoming(func: &mut Function, phi: ValueId, block: BlockId, value: ValueId) {
    let Some(inst) = func.def_inst(phi) else {
        return;
    };
    if let InstKind::Phi { incoming } = &mut func.inst_mut(inst).kind {
        incoming.push((block, value));
    }
}
