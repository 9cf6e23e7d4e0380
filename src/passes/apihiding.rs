// This module implements external API hiding. Direct calls to functions the module only
// declares are the easiest thing to read in a binary's import table, so each chosen call
// site is rewritten to look its target up at run time instead: the callee's name becomes
// a string constant, `dlsym` is called with the default handle (null) and that name, and
// the original call turns into a call through the returned pointer with the same
// arguments and result value. Name constants are ordinary pool entries, so when the
// string pass runs afterwards it encrypts them like any other literal.
//
// The pass works on the whole module because it adds the resolver declaration and pool
// entries. Functions that are malformed, excluded by an earlier failure or generated by
// another pass (`obf.` prefix) are left alone, as are calls to the resolver itself.

//! External call hiding through run-time symbol lookup.

use super::{check_well_formed, PassOutcome};
use crate::core::{PassConfig, PassError, PassResult, SessionStats};
use crate::ir::{BlockRole, ConstOrigin, Function, FunctionBuilder, InstId, InstKind, Module, Type};
use hashbrown::HashSet;
use rand::rngs::StdRng;
use rand::Rng;

/// Symbol lookup routine called in place of each hidden callee.
pub const RESOLVER: &str = "dlsym";

/// Prefix of the pool entries holding callee names.
const NAME_PREFIX: &str = ".obf.api.";

/// Prefix of functions generated by other passes.
const GENERATED_PREFIX: &str = "obf.";

pub fn run(
    module: &mut Module,
    config: &PassConfig,
    rng: &mut StdRng,
    stats: &mut SessionStats,
    excluded: &HashSet<String>,
) -> PassResult<PassOutcome> {
    let externals: HashSet<String> = module
        .functions
        .iter()
        .filter(|f| f.is_declaration && f.name != RESOLVER)
        .map(|f| f.name.clone())
        .collect();
    if externals.is_empty() {
        return Ok(PassOutcome::unchanged());
    }
    if let Some(existing) = module.function(RESOLVER) {
        if existing.param_types() != [Type::Ptr, Type::Ptr] || existing.ret_ty != Type::Ptr {
            return Err(PassError::Malformed {
                function: RESOLVER.to_string(),
                block: "-".to_string(),
                reason: "name is taken by a function with another signature".to_string(),
            });
        }
    }

    let probability = config.probability.clamp(0.0, 1.0);
    let mut hidden = 0;
    for index in 0..module.functions.len() {
        let func = &module.functions[index];
        if func.is_declaration
            || func.name.starts_with(GENERATED_PREFIX)
            || excluded.contains(&func.name)
        {
            continue;
        }
        if let Err(err) = check_well_formed(func) {
            log::warn!("apihiding: skipping {}: {err}", func.name);
            continue;
        }

        let sites: Vec<(InstId, String)> = func
            .placed_insts()
            .filter(|(block, _)| func.block(*block).role != BlockRole::OpaqueDead)
            .filter_map(|(_, inst)| match &func.inst(inst).kind {
                InstKind::Call { callee, .. } if externals.contains(callee) => {
                    Some((inst, callee.clone()))
                }
                _ => None,
            })
            .collect();

        for (inst, callee) in sites {
            if !rng.gen_bool(probability) {
                continue;
            }
            let name = format!("{NAME_PREFIX}{callee}");
            let constant = module.constants.intern(&name, callee.as_bytes(), ConstOrigin::Source);
            hide_call(&mut module.functions[index], inst, constant);
            log::trace!("apihiding: {} -> {} in {}", callee, RESOLVER, module.functions[index].name);
            hidden += 1;
        }
    }

    if hidden == 0 {
        return Ok(PassOutcome::unchanged());
    }
    module.ensure_declaration(RESOLVER, &[Type::Ptr, Type::Ptr], Type::Ptr);
    log::debug!("apihiding: {} calls resolved at run time", hidden);
    stats.calls_hidden += hidden;
    Ok(PassOutcome::changed(true))
}

/// Resolve the callee of `inst` through [`RESOLVER`] right before the call and
/// call the resolved pointer instead. The result value keeps its id.
fn hide_call(func: &mut Function, inst: InstId, name: crate::ir::ConstId) {
    let Some(block) = func.inst_block(inst) else {
        return;
    };
    let Some(pos) = func.inst_position(block, inst) else {
        return;
    };
    let target = {
        let mut b = FunctionBuilder::at(func, block, pos);
        let handle = b.null_ptr("api.handle");
        let symbol = b.str_ref(name, "api.name");
        b.call_value(RESOLVER, vec![handle, symbol], Type::Ptr, "api.fn")
    };
    let call = func.inst_mut(inst);
    if let InstKind::Call { args, .. } = &mut call.kind {
        let args = std::mem::take(args);
        call.kind = InstKind::CallIndirect { callee: target, args };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::{stream_rng, MODULE_UNIT};
    use crate::interp::Interpreter;
    use crate::passes::PassKind;
    use crate::verify::verify_module;

    const GREETER: &str = r#"
declare @puts(ptr) -> i32
declare @putchar(i32) -> i32
string @.msg = "hi"
define @helper(%c: i32) -> i32 {
entry:
  %r = call i32 @putchar(%c)
  ret %r
}
define @main() -> i32 {
entry:
  %s = str @.msg
  %p = call i32 @puts(%s)
  %c = const i32 33
  %q = call i32 @helper(%c)
  ret %q
}
"#;

    fn hide(module: &mut Module, config: &PassConfig, excluded: &HashSet<String>) -> SessionStats {
        let mut rng = stream_rng(1, PassKind::ApiHiding.stream(), MODULE_UNIT);
        let mut stats = SessionStats::new();
        run(module, config, &mut rng, &mut stats, excluded).unwrap();
        stats
    }

    fn direct_calls_to(func: &Function, name: &str) -> usize {
        func.placed_insts()
            .filter(|(_, i)| matches!(&func.inst(*i).kind, InstKind::Call { callee, .. } if callee == name))
            .count()
    }

    fn indirect_calls(func: &Function) -> usize {
        func.placed_insts()
            .filter(|(_, i)| matches!(func.inst(*i).kind, InstKind::CallIndirect { .. }))
            .count()
    }

    #[test]
    fn test_external_calls_go_through_resolver() {
        let _ = env_logger::builder().is_test(true).try_init();
        let reference = Module::parse(GREETER).unwrap();
        let mut module = Module::parse(GREETER).unwrap();
        let stats = hide(&mut module, &PassConfig::enabled(), &HashSet::new());
        verify_module(&module, "apihiding").unwrap();
        assert_eq!(stats.calls_hidden, 2);

        let main = module.function("main").unwrap();
        assert_eq!(direct_calls_to(main, "puts"), 0);
        assert_eq!(direct_calls_to(main, RESOLVER), 1);
        // Calls between defined functions stay direct.
        assert_eq!(direct_calls_to(main, "helper"), 1);
        assert_eq!(indirect_calls(module.function("helper").unwrap()), 1);
        assert!(module.function(RESOLVER).is_some_and(|f| f.is_declaration));
        assert!(module.constants.find(".obf.api.puts").is_some());

        let expected = Interpreter::new(&reference).call("main", &[]).unwrap();
        let actual = Interpreter::new(&module).call("main", &[]).unwrap();
        assert_eq!(actual.stdout(), "hi\n!");
        assert_eq!(actual.value, expected.value);
    }

    #[test]
    fn test_printed_form_parses_back() {
        let mut module = Module::parse(GREETER).unwrap();
        hide(&mut module, &PassConfig::enabled(), &HashSet::new());
        let text = module.print();
        assert!(text.contains("%api.fn = call ptr @dlsym(%api.handle, %api.name)"));
        assert!(text.contains("call i32 %api.fn(%s)"));
        let reparsed = Module::parse(&text).unwrap();
        assert_eq!(reparsed.print(), text);
    }

    #[test]
    fn test_excluded_and_zero_probability_leave_module_alone() {
        let mut module = Module::parse(GREETER).unwrap();
        let before = module.print();
        let stats = hide(&mut module, &PassConfig::enabled().with_probability(0.0), &HashSet::new());
        assert_eq!(stats.calls_hidden, 0);
        assert_eq!(module.print(), before);

        let excluded: HashSet<String> = ["main".to_string()].into_iter().collect();
        let stats = hide(&mut module, &PassConfig::enabled(), &excluded);
        assert_eq!(stats.calls_hidden, 1);
        assert_eq!(direct_calls_to(module.function("main").unwrap(), "puts"), 1);
    }

    #[test]
    fn test_conflicting_resolver_is_malformed() {
        let text = "declare @dlsym(ptr) -> ptr\ndeclare @puts(ptr) -> i32\n";
        let mut module = Module::parse(text).unwrap();
        let mut rng = stream_rng(1, PassKind::ApiHiding.stream(), MODULE_UNIT);
        let err = run(&mut module, &PassConfig::enabled(), &mut rng, &mut SessionStats::new(), &HashSet::new())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
