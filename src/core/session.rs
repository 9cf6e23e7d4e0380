// This module tracks what one pipeline run did. Every worker owns a SessionStats while it
// rewrites a function; the orchestrator merges the per-function stats in function-index
// order once the parallel phase finishes, so totals do not depend on scheduling.
// Diagnostics record non-fatal outcomes (a pass declined a function and left it untouched),
// while FunctionFailure records fatal per-function outcomes: malformed input or a verifier
// rejection, after which the function is restored and excluded from later passes.
// PipelineReport bundles all three and is what the library hands back to callers and what
// the binary prints with --stats.

//! Per-run statistics and diagnostics.

use super::error::{PassError, VerifyError};
use hashbrown::HashMap;
use std::fmt;

/// Counters collected while passes run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub functions_processed: usize,
    pub blocks_split: usize,
    pub predicates_inserted: usize,
    pub functions_flattened: usize,
    pub values_demoted: usize,
    pub strings_encrypted: usize,
    pub decrypt_sites: usize,
    pub regions_outlined: usize,
    pub calls_hidden: usize,
    pub functions_skipped: usize,
    pub functions_failed: usize,
    /// How many functions each pass changed, keyed by pass name.
    pub pass_applications: HashMap<&'static str, usize>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_application(&mut self, pass: &'static str) {
        *self.pass_applications.entry(pass).or_insert(0) += 1;
    }

    /// Fold another set of counters into this one.
    pub fn merge(&mut self, other: &SessionStats) {
        self.functions_processed += other.functions_processed;
        self.blocks_split += other.blocks_split;
        self.predicates_inserted += other.predicates_inserted;
        self.functions_flattened += other.functions_flattened;
        self.values_demoted += other.values_demoted;
        self.strings_encrypted += other.strings_encrypted;
        self.decrypt_sites += other.decrypt_sites;
        self.regions_outlined += other.regions_outlined;
        self.calls_hidden += other.calls_hidden;
        self.functions_skipped += other.functions_skipped;
        self.functions_failed += other.functions_failed;
        for (pass, count) in &other.pass_applications {
            *self.pass_applications.entry(pass).or_insert(0) += count;
        }
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Obfuscation Session Statistics:")?;
        writeln!(f, "  Functions processed: {}", self.functions_processed)?;
        writeln!(f, "  Blocks split: {}", self.blocks_split)?;
        writeln!(f, "  Opaque predicates inserted: {}", self.predicates_inserted)?;
        writeln!(f, "  Functions flattened: {}", self.functions_flattened)?;
        writeln!(f, "  Values demoted to stack: {}", self.values_demoted)?;
        writeln!(f, "  Strings encrypted: {}", self.strings_encrypted)?;
        writeln!(f, "  Decrypt call sites: {}", self.decrypt_sites)?;
        writeln!(f, "  Regions outlined: {}", self.regions_outlined)?;
        writeln!(f, "  External calls hidden: {}", self.calls_hidden)?;
        writeln!(f, "  Functions skipped: {}", self.functions_skipped)?;
        writeln!(f, "  Functions failed: {}", self.functions_failed)?;

        if !self.pass_applications.is_empty() {
            writeln!(f, "  Pass breakdown:")?;
            let mut sorted: Vec<_> = self.pass_applications.iter().collect();
            sorted.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), **name));
            for (pass, count) in sorted {
                writeln!(f, "    {}: {}", pass, count)?;
            }
        }

        Ok(())
    }
}

/// A pass declined to touch a function.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub pass: &'static str,
    pub function: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.pass, self.function, self.message)
    }
}

/// Why a function was rolled back.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    Pass(PassError),
    Verify(VerifyError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionFailure {
    pub function: String,
    pub pass: &'static str,
    pub kind: FailureKind,
}

impl fmt::Display for FunctionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Pass(err) => write!(f, "{}: {}", self.pass, err),
            FailureKind::Verify(err) => write!(f, "{}", err),
        }
    }
}

/// Everything a pipeline run reports besides the rewritten module.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub stats: SessionStats,
    pub diagnostics: Vec<Diagnostic>,
    pub failures: Vec<FunctionFailure>,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, function: &str) -> bool {
        self.failures.iter().any(|f| f.function == function)
    }

    pub fn diagnostics_for<'a>(&'a self, pass: &'a str) -> impl Iterator<Item = &'a Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.pass == pass)
    }
}
