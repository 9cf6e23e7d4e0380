// This module defines the error types for the obfuscator using the thiserror crate for
// idiomatic Rust error handling. The taxonomy mirrors how failures are treated by the
// pipeline: ParseError for malformed textual IR, ConfigError for invalid pipeline
// configuration (fatal before any IR is touched), PassError for problems a pass finds in
// one function (Malformed is fatal for that function, Ineligible is a diagnostic and leaves
// the function unmodified), VerifyError for structural violations found after a pass
// (fatal for the function, carrying the pass name and offending instruction), and
// InterpError for traps raised by the reference interpreter. Result aliases are provided
// for each concern.

//! Error types for the obfuscator.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Textual IR could not be parsed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Invalid pipeline configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown pass name: {name}")]
    UnknownPass { name: String },

    #[error("probability for pass '{pass}' must be within [0, 1], got {value}")]
    InvalidProbability { pass: String, value: f64 },

    #[error("invalid setting '{key}' for pass '{pass}': {reason}")]
    InvalidSetting {
        pass: String,
        key: String,
        reason: String,
    },

    #[error("malformed configuration: {reason}")]
    Malformed { reason: String },

    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Problems a pass reports for a single function.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PassError {
    /// Input IR violates a basic invariant (e.g. missing terminator).
    #[error("malformed input in {function} at block {block}: {reason}")]
    Malformed {
        function: String,
        block: String,
        reason: String,
    },

    /// The pass's preconditions are not met; the function is left unmodified.
    #[error("{pass} skipped {function}: {reason}")]
    Ineligible {
        pass: &'static str,
        function: String,
        reason: String,
    },
}

impl PassError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PassError::Malformed { .. })
    }
}

/// Structural violation found by the verifier.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("verification failed after {pass} in {function}, block {block}{}: {reason}", inst_suffix(.inst))]
pub struct VerifyError {
    pub pass: String,
    pub function: String,
    pub block: String,
    pub inst: Option<String>,
    pub reason: String,
}

fn inst_suffix(inst: &Option<String>) -> String {
    inst.as_ref().map(|i| format!(" at `{i}`")).unwrap_or_default()
}

/// Runtime trap in the interpreter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpError {
    #[error("function not found: {name}")]
    FunctionNotFound { name: String },

    #[error("{function}: expected {expected} arguments, got {got}")]
    ArgumentCount {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid memory access at {addr:#x} ({size} bytes)")]
    InvalidAccess { addr: u64, size: u64 },

    #[error("division by zero in {function}")]
    DivisionByZero { function: String },

    #[error("reached unreachable in {function}, block {block}")]
    Unreachable { function: String, block: String },

    #[error("step limit of {limit} exceeded")]
    StepLimit { limit: u64 },

    #[error("call depth of {limit} exceeded")]
    CallDepth { limit: usize },

    #[error("malformed IR in {function}: {reason}")]
    Malformed { function: String, reason: String },
}

/// Pipeline-level failure: only configuration problems abort a whole run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type PassResult<T> = Result<T, PassError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type InterpResult<T> = Result<T, InterpError>;
