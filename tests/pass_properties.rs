//! End-to-end properties of the obfuscation pipeline.
//!
//! Every test goes through the public entry points: parse text, configure a
//! pipeline, run it, then inspect the module or execute it.

use obfuscator::crypto;
use obfuscator::ir::{BlockRole, FunctionBuilder, InstKind};
use obfuscator::{obfuscate, Interpreter, Module, PassConfig, Pipeline, PipelineConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PROGRAM: &str = r#"
module "props"

declare @puts(ptr) -> i32

string @.banner = "obfuscated"

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
  %sq = mul i32 %i, %i
  %acc2 = add i32 %acc, %sq
  %next = add i32 %i, %one
  br ^head
exit:
  ret %acc
}

define @classify(%x: i32) -> i32 {
entry:
  %k = const i32 3
  %m = and i32 %x, %k
  switch %m, ^other [0: ^zero, 1: ^one]
zero:
  %a = const i32 100
  br ^join
one:
  %b = mul i32 %x, %x
  %b2 = add i32 %b, %k
  br ^join
other:
  %c = sub i32 %k, %x
  br ^join
join:
  %r = phi i32 [^zero, %a], [^one, %b2], [^other, %c]
  ret %r
}

define @main(%n: i32) -> i32 {
entry:
  %s = str @.banner
  %p = call i32 @puts(%s)
  %v = call i32 @sum(%n)
  %w = call i32 @classify(%v)
  %t = add i32 %v, %w
  ret %t
}
"#;

fn run(module: &Module, name: &str, args: &[u64]) -> (Option<u64>, String) {
    let result = Interpreter::new(module).call(name, args).unwrap();
    let out = result.stdout();
    (result.value, out)
}

fn assert_equivalent(reference: &Module, transformed: &Module, name: &str, inputs: &[u64]) {
    for &x in inputs {
        assert_eq!(
            run(reference, name, &[x]),
            run(transformed, name, &[x]),
            "{name}({x}) diverged"
        );
    }
}

fn config_with(seed: u64, passes: &[&str]) -> PipelineConfig {
    let mut config = PipelineConfig::with_passes(seed, passes).unwrap();
    config.jobs = 1;
    config
}

#[test]
fn test_flattening_preserves_behavior() {
    let _ = env_logger::builder().is_test(true).try_init();
    let reference = Module::parse(PROGRAM).unwrap();
    for seed in 0..4 {
        let (module, report) = obfuscate(PROGRAM, config_with(seed, &["flattening"])).unwrap();
        assert!(report.is_clean(), "{:?}", report.failures);
        // `main` is a single block and stays as it is.
        assert_eq!(report.stats.functions_flattened, 2);
        assert_equivalent(&reference, &module, "sum", &[0, 1, 5, 9]);
        assert_equivalent(&reference, &module, "classify", &[0, 1, 2, 3, 6, 13]);
        assert_equivalent(&reference, &module, "main", &[0, 4]);
    }
}

#[test]
fn test_opaque_predicates_never_take_dead_edge() {
    let reference = Module::parse(PROGRAM).unwrap();
    let (module, report) = obfuscate(PROGRAM, config_with(11, &["opaque"])).unwrap();
    assert!(report.is_clean());
    assert!(report.stats.predicates_inserted > 0);

    let dead_blocks: usize = module
        .functions
        .iter()
        .map(|f| f.layout().iter().filter(|b| f.block(**b).role == BlockRole::OpaqueDead).count())
        .sum();
    assert_eq!(dead_blocks, report.stats.predicates_inserted);

    // Replace every dead block with a trap: a wrong turn would now fail the run.
    let mut module = module;
    for func in &mut module.functions {
        let dead: Vec<_> = func
            .layout()
            .iter()
            .copied()
            .filter(|b| func.block(*b).role == BlockRole::OpaqueDead)
            .collect();
        for block in dead {
            func.block_insts_mut(block).clear();
            FunctionBuilder::at_end(func, block).unreachable();
        }
    }
    assert_equivalent(&reference, &module, "sum", &[0, 3, 8]);
    assert_equivalent(&reference, &module, "classify", &[0, 1, 2, 3, 17]);
    assert_equivalent(&reference, &module, "main", &[2, 6]);
}

#[test]
fn test_string_encryption_round_trip() {
    let mut rng = StdRng::seed_from_u64(5);
    for len in [0usize, 1, 7, 64, 300] {
        let plain: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let key: u64 = rng.gen();
        let cipher = crypto::encrypt(&plain, key);
        assert_eq!(cipher.len(), plain.len());
        assert_eq!(crypto::decrypt(&cipher, key), plain);
    }

    let reference = Module::parse(PROGRAM).unwrap();
    let (module, report) = obfuscate(PROGRAM, config_with(3, &["string"])).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.stats.strings_encrypted, 1);
    let banner = module.constants.find(".banner").unwrap();
    let entry = module.constants.get(banner).unwrap();
    assert_ne!(entry.bytes, b"obfuscated".to_vec());
    assert_eq!(crypto::decrypt(&entry.bytes, entry.key.unwrap()), b"obfuscated".to_vec());
    assert_eq!(run(&module, "main", &[3]).1, "obfuscated\n");
    assert_equivalent(&reference, &module, "main", &[0, 3]);
}

#[test]
fn test_outlined_functions_have_single_caller() {
    let reference = Module::parse(PROGRAM).unwrap();
    let mut config = config_with(8, &["split", "outlining"]);
    config.split = PassConfig::enabled().with_threshold(3);
    let (module, report) = obfuscate(PROGRAM, config).unwrap();
    assert!(report.is_clean());
    assert!(report.stats.regions_outlined > 0);

    for outlined in module.functions.iter().filter(|f| f.name.contains(".obf.outlined.")) {
        let callers: Vec<&str> = module
            .functions
            .iter()
            .flat_map(|f| {
                f.placed_insts().filter_map(move |(_, inst)| match &f.inst(inst).kind {
                    InstKind::Call { callee, .. } if *callee == outlined.name => Some(f.name.as_str()),
                    _ => None,
                })
            })
            .collect();
        assert_eq!(callers.len(), 1, "{} has callers {:?}", outlined.name, callers);
        assert!(outlined.name.starts_with(&format!("{}.obf.outlined.", callers[0])));
    }
    assert_equivalent(&reference, &module, "main", &[0, 1, 7]);
}

#[test]
fn test_identical_seeds_give_identical_output() {
    let all = ["split", "opaque", "flattening", "string", "outlining"];
    let (a, _) = obfuscate(PROGRAM, config_with(21, &all)).unwrap();
    let (b, _) = obfuscate(PROGRAM, config_with(21, &all)).unwrap();
    assert_eq!(a.to_string(), b.to_string());

    let (c, _) = obfuscate(PROGRAM, config_with(22, &all)).unwrap();
    assert_ne!(a.to_string(), c.to_string());
}

#[test]
fn test_split_conserves_instructions() {
    let reference = Module::parse(PROGRAM).unwrap();
    let (module, report) = obfuscate(PROGRAM, config_with(4, &["split"])).unwrap();
    assert!(report.is_clean());
    assert!(report.stats.blocks_split > 0);

    for before in reference.functions.iter().filter(|f| !f.is_declaration) {
        let after = module.function(&before.name).unwrap();
        assert_eq!(before.body_inst_count(), after.body_inst_count(), "{}", before.name);
        let added = after.layout().len() - before.layout().len();
        assert_eq!(after.inst_count(), before.inst_count() + added);
    }
    assert_equivalent(&reference, &module, "main", &[0, 5]);
}

#[test]
fn test_if_else_flattens_to_two_cases() {
    let text = r#"
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
    let (module, report) = obfuscate(text, config_with(6, &["flattening"])).unwrap();
    assert!(report.is_clean());
    let pick = module.function("pick").unwrap();
    let switches: Vec<usize> = pick
        .placed_insts()
        .filter_map(|(_, i)| match &pick.inst(i).kind {
            InstKind::Switch { cases, .. } => Some(cases.len()),
            _ => None,
        })
        .collect();
    assert_eq!(switches, vec![2]);
    assert_eq!(run(&module, "pick", &[1]).0, Some(11));
    assert_eq!(run(&module, "pick", &[0]).0, Some(22));
}

#[test]
fn test_duplicate_strings_share_one_entry() {
    let text = r#"
declare @puts(ptr) -> i32
string @.a = "twice"
string @.b = "twice"
define @main() -> i32 {
entry:
  %x = str @.a
  %r0 = call i32 @puts(%x)
  %y = str @.b
  %r1 = call i32 @puts(%y)
  %z = const i32 0
  ret %z
}
"#;
    let (module, report) = obfuscate(text, config_with(2, &["string"])).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.stats.strings_encrypted, 1);
    assert_eq!(report.stats.decrypt_sites, 2);
    let encrypted = module.constants.iter().filter(|(_, c)| c.key.is_some()).count();
    assert_eq!(encrypted, 1);
    assert_eq!(run(&module, "main", &[]).1, "twice\ntwice\n");
}

#[test]
fn test_pipeline_rejects_bad_threshold() {
    let mut config = PipelineConfig::new(0);
    config.flattening = PassConfig::enabled().with_threshold(1);
    assert!(Pipeline::new(config).is_err());
}

#[test]
fn test_flattened_strings_are_released() {
    let text = r#"
declare @puts(ptr) -> i32
string @.yes = "yes"
string @.no = "no"
define @say(%c: i1) -> i32 {
entry:
  %y = str @.yes
  %n = str @.no
  condbr %c, ^a, ^b
a:
  br ^join
b:
  br ^join
join:
  %m = phi ptr [^a, %y], [^b, %n]
  %r = call i32 @puts(%m)
  ret %r
}
"#;
    let reference = Module::parse(text).unwrap();
    let (module, report) = obfuscate(text, config_with(13, &["flattening", "string"])).unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.stats.strings_encrypted, 2);

    let say = module.function("say").unwrap();
    let frees = say
        .placed_insts()
        .filter(|(_, i)| matches!(&say.inst(*i).kind, InstKind::Call { callee, .. } if callee == "free"))
        .count();
    assert_eq!(frees, report.stats.decrypt_sites);
    assert_equivalent(&reference, &module, "say", &[0, 1]);
}

#[test]
fn test_loop_to_entry_is_reported_not_flattened() {
    let text = r#"
define @count(%n: i32) -> i32 {
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
    let (module, report) = obfuscate(text, config_with(1, &["flattening"])).unwrap();
    assert!(report.failed("count"));
    assert_eq!(report.stats.functions_flattened, 0);
    assert_eq!(module.print(), Module::parse(text).unwrap().print());
}
