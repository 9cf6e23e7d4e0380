// This module is the pipeline orchestrator. It validates the configuration up front, then
// applies every enabled pass in canonical order (split, opaque, flattening, apihiding,
// string, outlining) no matter how the passes were named on the command line or in the config
// file. Function passes run over all defined functions, in parallel on a rayon pool unless
// `jobs` is 1. Each worker clones its function, runs the pass with an RNG derived from
// (seed, pass, function index) and, when `verify_each` is set, verifies the result against
// a signature table built before the parallel phase. Only verified results are committed.
// Ineligible functions produce diagnostics. Malformed input and verifier failures restore
// the function, record a failure and exclude the function from later function passes.
//
// Module passes (apihiding, string) run on a snapshot and skip excluded functions.
// Module-wide state is never touched by workers: the orchestrator creates the opaque key
// global and decoy strings before the opaque pass, refusing to run it when a global of
// that name exists with another type or initial value, and reserves one outlined-function ID
// range per function (sized by its block count) before the outlining pass. Statistics and
// new functions are merged in function-index order, so the output depends only on the
// seed and the input, not on scheduling.

//! Pass pipeline orchestration.

use crate::core::rng::{stream_rng, MODULE_UNIT};
use crate::core::{
    ConfigError, ConfigResult, Diagnostic, FailureKind, FunctionFailure, IdAllocator, IdRange,
    PassError, PipelineConfig, PipelineError, PipelineReport, SessionStats,
};
use crate::ir::{ConstId, ConstOrigin, Function, Module, Type};
use crate::passes::opaque::{DECOY_STRINGS, OPAQUE_KEY_GLOBAL};
use crate::passes::outline::{is_outlined, max_outlined_id};
use crate::passes::strings::DECRYPT_FN;
use crate::passes::{PassContext, PassKind, PassUnit};
use crate::verify::{verify_function, Symbols};
use hashbrown::HashSet;
use rayon::prelude::*;

/// Pass name recorded for failures found by the final verification.
const FINAL_VERIFY: &str = "pipeline";

/// Outcome of one function pass on one function.
#[derive(Debug, Default)]
struct FunctionRun {
    stats: SessionStats,
    diagnostic: Option<Diagnostic>,
    failure: Option<FunctionFailure>,
    new_functions: Vec<Function>,
}

impl FunctionRun {
    fn failed(function: &str, pass: PassKind, kind: FailureKind) -> Self {
        Self {
            failure: Some(FunctionFailure { function: function.to_string(), pass: pass.name(), kind }),
            ..Self::default()
        }
    }
}

/// Shared read-only inputs of a function pass.
struct FunctionPassInput<'a> {
    kind: PassKind,
    symbols: &'a Symbols<'a>,
    decoys: &'a [ConstId],
    excluded: &'a HashSet<String>,
}

#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    passes: Vec<PassKind>,
    pool: Option<rayon::ThreadPool>,
}

impl Pipeline {
    /// Validate `config` and prepare the worker pool.
    pub fn new(config: PipelineConfig) -> ConfigResult<Self> {
        config.validate()?;
        let passes = config.enabled_passes();
        let pool = if config.jobs > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.jobs)
                .build()
                .map_err(|e| ConfigError::Malformed { reason: format!("thread pool: {e}") })?;
            Some(pool)
        } else {
            None
        };
        Ok(Self { config, passes, pool })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Enabled passes in execution order.
    pub fn passes(&self) -> &[PassKind] {
        &self.passes
    }

    /// Obfuscate `module` in place.
    pub fn run(&self, module: &mut Module) -> PipelineReport {
        let mut report = PipelineReport::default();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut ids = IdAllocator::new(max_outlined_id(module).map_or(0, |n| n + 1));

        report.stats.functions_processed =
            module.functions.iter().filter(|f| !f.is_declaration).count();
        log::info!(
            "obfuscating {} ({} functions) with [{}], seed {}",
            module.name,
            report.stats.functions_processed,
            self.passes.iter().map(|k| k.name()).collect::<Vec<_>>().join(", "),
            self.config.seed
        );

        for &kind in &self.passes {
            match kind.unit() {
                PassUnit::Function => {
                    self.run_function_pass(kind, module, &mut ids, &mut excluded, &mut report)
                }
                PassUnit::Module => self.run_module_pass(kind, module, &mut excluded, &mut report),
            }
        }

        if !self.config.verify_each {
            self.verify_all(module, &excluded, &mut report);
        }
        log::info!(
            "finished {}: {} diagnostics, {} failures",
            module.name,
            report.diagnostics.len(),
            report.failures.len()
        );
        report
    }

    fn run_function_pass(
        &self,
        kind: PassKind,
        module: &mut Module,
        ids: &mut IdAllocator,
        excluded: &mut HashSet<String>,
        report: &mut PipelineReport,
    ) {
        let decoys = if kind == PassKind::Opaque {
            match prepare_opaque(module) {
                Ok(decoys) => decoys,
                Err(err) => {
                    let failure = FunctionFailure {
                        function: module.name.clone(),
                        pass: kind.name(),
                        kind: FailureKind::Pass(err),
                    };
                    log::warn!("{failure}");
                    report.stats.functions_failed += 1;
                    report.failures.push(failure);
                    return;
                }
            }
        } else {
            Vec::new()
        };
        let ranges: Vec<IdRange> = if kind == PassKind::Outlining {
            let sizes: Vec<u64> = module
                .functions
                .iter()
                .map(|f| {
                    if f.is_declaration
                        || excluded.contains(&f.name)
                        || is_outlined(&f.name)
                        || f.name == DECRYPT_FN
                    {
                        0
                    } else {
                        f.block_count() as u64
                    }
                })
                .collect();
            ids.reserve_batches(&sizes)
        } else {
            vec![IdRange::empty(); module.functions.len()]
        };

        let symbols = Symbols::collect(&module.functions, &module.globals, &module.constants);
        let input = FunctionPassInput { kind, symbols: &symbols, decoys: &decoys, excluded };
        let work = |(index, (func, range)): (usize, (&mut Function, IdRange))| {
            self.run_on_function(&input, index, func, range)
        };
        let runs: Vec<Option<FunctionRun>> = if self.config.jobs == 1 {
            module.functions.iter_mut().zip(ranges).enumerate().map(work).collect()
        } else {
            let parallel = || {
                module
                    .functions
                    .par_iter_mut()
                    .zip(ranges)
                    .enumerate()
                    .map(work)
                    .collect::<Vec<_>>()
            };
            match &self.pool {
                Some(pool) => pool.install(parallel),
                None => parallel(),
            }
        };

        let mut appended = Vec::new();
        for run in runs.into_iter().flatten() {
            report.stats.merge(&run.stats);
            if let Some(diagnostic) = run.diagnostic {
                log::debug!("{diagnostic}");
                report.stats.functions_skipped += 1;
                report.diagnostics.push(diagnostic);
            }
            if let Some(failure) = run.failure {
                log::warn!("{failure}");
                report.stats.functions_failed += 1;
                excluded.insert(failure.function.clone());
                report.failures.push(failure);
            }
            appended.extend(run.new_functions);
        }
        module.functions.extend(appended);
    }

    fn run_on_function(
        &self,
        input: &FunctionPassInput<'_>,
        index: usize,
        func: &mut Function,
        range: IdRange,
    ) -> Option<FunctionRun> {
        if func.is_declaration || input.excluded.contains(&func.name) {
            return None;
        }
        let kind = input.kind;
        let config = self.config.pass(kind);
        let rng = stream_rng(self.config.seed, kind.stream(), index as u64);
        let mut ctx = PassContext::new(kind, config, rng)
            .with_decoys(input.decoys)
            .with_ids(range);

        let mut work = func.clone();
        let outcome = match kind.run_on_function(&mut work, &mut ctx) {
            Ok(outcome) => outcome,
            Err(err) if !err.is_fatal() => {
                return Some(FunctionRun {
                    diagnostic: Some(Diagnostic {
                        pass: kind.name(),
                        function: func.name.clone(),
                        message: err.to_string(),
                    }),
                    ..FunctionRun::default()
                });
            }
            Err(err) => return Some(FunctionRun::failed(&func.name, kind, FailureKind::Pass(err))),
        };
        if !outcome.changed {
            return Some(FunctionRun { stats: ctx.stats, ..FunctionRun::default() });
        }

        if self.config.verify_each {
            let mut symbols = input.symbols.clone();
            for new in &outcome.new_functions {
                symbols.add_function(new);
            }
            let verified = verify_function(&work, &symbols, kind.name()).and_then(|_| {
                outcome
                    .new_functions
                    .iter()
                    .try_for_each(|f| verify_function(f, &symbols, kind.name()))
            });
            if let Err(err) = verified {
                return Some(FunctionRun::failed(&func.name, kind, FailureKind::Verify(err)));
            }
        }

        *func = work;
        ctx.stats.record_application(kind.name());
        Some(FunctionRun {
            stats: ctx.stats,
            new_functions: outcome.new_functions,
            ..FunctionRun::default()
        })
    }

    /// Module passes run on a snapshot; any failure reverts the whole pass.
    fn run_module_pass(
        &self,
        kind: PassKind,
        module: &mut Module,
        excluded: &mut HashSet<String>,
        report: &mut PipelineReport,
    ) {
        let snapshot = module.clone();
        let mut rng = stream_rng(self.config.seed, kind.stream(), MODULE_UNIT);
        let mut stats = SessionStats::new();

        let config = self.config.pass(kind);
        let outcome = match kind.run_on_module(module, config, &mut rng, &mut stats, excluded) {
            Ok(outcome) => outcome,
            Err(err) if !err.is_fatal() => {
                let diagnostic =
                    Diagnostic { pass: kind.name(), function: module.name.clone(), message: err.to_string() };
                log::debug!("{diagnostic}");
                report.diagnostics.push(diagnostic);
                return;
            }
            Err(err) => {
                *module = snapshot;
                let function = match &err {
                    PassError::Malformed { function, .. } | PassError::Ineligible { function, .. } => {
                        function.clone()
                    }
                };
                let failure = FunctionFailure { function, pass: kind.name(), kind: FailureKind::Pass(err) };
                log::warn!("{failure}");
                report.stats.functions_failed += 1;
                excluded.insert(failure.function.clone());
                report.failures.push(failure);
                return;
            }
        };

        if outcome.changed && self.config.verify_each {
            let symbols = Symbols::of_module(module);
            let failures: Vec<FunctionFailure> = module
                .functions
                .iter()
                .filter_map(|f| verify_function(f, &symbols, kind.name()).err())
                .map(|err| FunctionFailure {
                    function: err.function.clone(),
                    pass: kind.name(),
                    kind: FailureKind::Verify(err),
                })
                .collect();
            if !failures.is_empty() {
                *module = snapshot;
                for failure in failures {
                    log::warn!("{failure}");
                    report.stats.functions_failed += 1;
                    excluded.insert(failure.function.clone());
                    report.failures.push(failure);
                }
                return;
            }
        }

        if outcome.changed {
            stats.record_application(kind.name());
        }
        report.stats.merge(&stats);
    }

    /// Single verification of the final module when per-pass checks are off.
    /// Failures are reported; there is no earlier state to restore.
    fn verify_all(&self, module: &Module, excluded: &HashSet<String>, report: &mut PipelineReport) {
        let symbols = Symbols::of_module(module);
        for func in module.functions.iter().filter(|f| !excluded.contains(&f.name)) {
            if let Err(err) = verify_function(func, &symbols, FINAL_VERIFY) {
                let failure = FunctionFailure {
                    function: func.name.clone(),
                    pass: FINAL_VERIFY,
                    kind: FailureKind::Verify(err),
                };
                log::warn!("{failure}");
                report.stats.functions_failed += 1;
                report.failures.push(failure);
            }
        }
    }
}

/// Create the module state opaque predicates read: the zero key global and the
/// generated decoy strings. An existing key global must be `i32` with value 0,
/// since every keyed predicate assumes it.
fn prepare_opaque(module: &mut Module) -> Result<Vec<ConstId>, PassError> {
    if let Some(global) = module.global(OPAQUE_KEY_GLOBAL) {
        if global.ty != Type::I32 || global.init != 0 {
            return Err(PassError::Malformed {
                function: module.name.clone(),
                block: "-".to_string(),
                reason: format!(
                    "global @{OPAQUE_KEY_GLOBAL} exists as {} = {}, expected i32 = 0",
                    global.ty, global.init
                ),
            });
        }
    }
    module.ensure_global(OPAQUE_KEY_GLOBAL, Type::I32, 0);
    Ok(DECOY_STRINGS
        .iter()
        .map(|text| module.constants.intern(".obf.decoy", text.as_bytes(), ConstOrigin::Generated))
        .collect())
}

/// Parse `text`, run the configured pipeline on it and return the result.
pub fn obfuscate(text: &str, config: PipelineConfig) -> Result<(Module, PipelineReport), PipelineError> {
    let pipeline = Pipeline::new(config)?;
    let mut module = Module::parse(text)?;
    let report = pipeline.run(&mut module);
    Ok((module, report))
}
