// This module is the pass registry. The pass set is closed, so passes are the variants of
// PassKind rather than trait objects: each variant knows its stable name, its default and
// minimum threshold, whether it works per function or on the whole module, and which RNG
// stream it draws from. Stream numbers are fixed per pass so adding a pass does not
// change the output of the others for a given seed. Function passes receive a PassContext holding their configuration,
// a generator derived for exactly that function, any module-wide resources the orchestrator
// reserved up front (decoy strings for opaque predicates, an ID range for outlined
// functions) and a SessionStats to count into. They return a PassOutcome or a PassError;
// PassError::Ineligible means the function was left untouched.

//! Obfuscation passes.

use crate::core::{IdRange, PassConfig, PassError, PassResult, SessionStats};
use crate::ir::{ConstId, Function, Module};
use hashbrown::HashSet;
use rand::rngs::StdRng;
use rand::Rng;

pub mod apihiding;
pub mod demote;
pub mod flatten;
pub mod opaque;
pub mod outline;
pub mod split;
pub mod strings;

/// Every registered pass, in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassKind {
    Split,
    Opaque,
    Flattening,
    ApiHiding,
    String,
    Outlining,
}

/// What a pass operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassUnit {
    Function,
    Module,
}

impl PassKind {
    pub const ALL: [PassKind; 6] = [
        PassKind::Split,
        PassKind::Opaque,
        PassKind::Flattening,
        PassKind::ApiHiding,
        PassKind::String,
        PassKind::Outlining,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PassKind::Split => "split",
            PassKind::Opaque => "opaque",
            PassKind::Flattening => "flattening",
            PassKind::ApiHiding => "apihiding",
            PassKind::String => "string",
            PassKind::Outlining => "outlining",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn unit(self) -> PassUnit {
        match self {
            PassKind::String | PassKind::ApiHiding => PassUnit::Module,
            _ => PassUnit::Function,
        }
    }

    pub fn default_threshold(self) -> usize {
        match self {
            PassKind::Split => split::DEFAULT_MIN_BLOCK_SIZE,
            PassKind::Opaque => 0,
            PassKind::Flattening => flatten::DEFAULT_MIN_BLOCKS,
            PassKind::ApiHiding => 0,
            PassKind::String => strings::DEFAULT_MIN_LENGTH,
            PassKind::Outlining => outline::DEFAULT_MIN_REGION_SIZE,
        }
    }

    /// Smallest threshold for which the pass is well defined.
    pub fn min_threshold(self) -> usize {
        match self {
            PassKind::Split => 3,
            PassKind::Opaque => 0,
            PassKind::Flattening => 2,
            PassKind::ApiHiding => 0,
            PassKind::String => 0,
            PassKind::Outlining => 1,
        }
    }

    /// RNG stream index, distinct per pass.
    pub fn stream(self) -> u64 {
        match self {
            PassKind::Split => 1,
            PassKind::Opaque => 2,
            PassKind::Flattening => 3,
            PassKind::String => 4,
            PassKind::Outlining => 5,
            PassKind::ApiHiding => 6,
        }
    }

    /// Run a function-level pass.
    pub fn run_on_function(
        self,
        func: &mut Function,
        ctx: &mut PassContext<'_>,
    ) -> PassResult<PassOutcome> {
        match self {
            PassKind::Split => split::run(func, ctx),
            PassKind::Opaque => opaque::run(func, ctx),
            PassKind::Flattening => flatten::run(func, ctx),
            PassKind::Outlining => outline::run(func, ctx),
            PassKind::String | PassKind::ApiHiding => {
                Err(ineligible(self, func, "runs on whole modules"))
            }
        }
    }

    /// Run a module-level pass. Functions in `excluded` are left untouched.
    pub fn run_on_module(
        self,
        module: &mut Module,
        config: &PassConfig,
        rng: &mut StdRng,
        stats: &mut SessionStats,
        excluded: &HashSet<String>,
    ) -> PassResult<PassOutcome> {
        match self {
            PassKind::String => strings::run(module, config, rng, stats, excluded),
            PassKind::ApiHiding => apihiding::run(module, config, rng, stats, excluded),
            other => Err(PassError::Ineligible {
                pass: other.name(),
                function: module.name.clone(),
                reason: "runs on individual functions".to_string(),
            }),
        }
    }
}

/// Name-based lookup used by the CLI and configuration loader.
pub struct PassRegistry;

impl PassRegistry {
    pub fn lookup(name: &str) -> Option<PassKind> {
        PassKind::from_name(name)
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        PassKind::ALL.into_iter().map(PassKind::name)
    }
}

/// Per-function state handed to a pass.
pub struct PassContext<'a> {
    pub kind: PassKind,
    pub config: &'a PassConfig,
    pub rng: StdRng,
    /// Generated strings the opaque pass may reference from dead code.
    pub decoys: &'a [ConstId],
    /// Pre-reserved outlined-function numbers.
    pub ids: IdRange,
    pub stats: SessionStats,
}

impl<'a> PassContext<'a> {
    pub fn new(kind: PassKind, config: &'a PassConfig, rng: StdRng) -> Self {
        Self {
            kind,
            config,
            rng,
            decoys: &[],
            ids: IdRange::empty(),
            stats: SessionStats::new(),
        }
    }

    pub fn with_decoys(mut self, decoys: &'a [ConstId]) -> Self {
        self.decoys = decoys;
        self
    }

    pub fn with_ids(mut self, ids: IdRange) -> Self {
        self.ids = ids;
        self
    }

    pub fn threshold(&self) -> usize {
        self.config.threshold_for(self.kind)
    }

    /// Draw against the configured probability.
    pub fn roll(&mut self) -> bool {
        let p = self.config.probability.clamp(0.0, 1.0);
        self.rng.gen_bool(p)
    }
}

/// Result of running a pass over one unit.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub changed: bool,
    /// Functions created by the pass, in creation order.
    pub new_functions: Vec<Function>,
}

impl PassOutcome {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed(changed: bool) -> Self {
        Self { changed, new_functions: Vec::new() }
    }
}

pub(crate) fn ineligible(kind: PassKind, func: &Function, reason: &str) -> PassError {
    PassError::Ineligible {
        pass: kind.name(),
        function: func.name.clone(),
        reason: reason.to_string(),
    }
}

/// Reject functions with a block that does not end in a terminator.
pub(crate) fn check_well_formed(func: &Function) -> PassResult<()> {
    for &block in func.layout() {
        if func.terminator(block).is_none() {
            return Err(PassError::Malformed {
                function: func.name.clone(),
                block: func.block_name(block).to_string(),
                reason: "block has no terminator".to_string(),
            });
        }
    }
    if !func.is_declaration && func.entry().is_none() {
        return Err(PassError::Malformed {
            function: func.name.clone(),
            block: "-".to_string(),
            reason: "function has no blocks".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in PassKind::ALL {
            assert_eq!(PassRegistry::lookup(kind.name()), Some(kind));
        }
        assert_eq!(PassRegistry::lookup("antidebug"), None);
        assert_eq!(
            PassRegistry::names().collect::<Vec<_>>(),
            vec!["split", "opaque", "flattening", "apihiding", "string", "outlining"]
        );
    }

    #[test]
    fn test_streams_are_distinct() {
        let streams: HashSet<u64> = PassKind::ALL.into_iter().map(PassKind::stream).collect();
        assert_eq!(streams.len(), PassKind::ALL.len());
        assert_eq!(PassKind::String.stream(), 4);
    }

    #[test]
    fn test_canonical_order_is_declaration_order() {
        let mut shuffled = vec![PassKind::Outlining, PassKind::Split, PassKind::Flattening];
        shuffled.sort();
        assert_eq!(shuffled, vec![PassKind::Split, PassKind::Flattening, PassKind::Outlining]);
    }
}
