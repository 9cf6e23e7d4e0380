// This module gathers the infrastructure every pass shares but none of them owns: the
// error taxonomy (thiserror enums per concern), the pipeline configuration with its JSON
// and command-line loaders, seeded RNG derivation so parallel runs stay reproducible,
// the module-wide ID allocator that pre-reserves names before a parallel phase, and the
// session statistics and diagnostics that a pipeline run reports back.

//! Core obfuscator infrastructure
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - One enum per concern: parse, config, pass, verify, interpreter
//!
//! ## Configuration (`config`)
//! - Per-pass enable flag, probability and threshold
//! - Shared seed, worker count and verification mode
//!
//! ## Randomness (`rng`)
//! - Per-function `StdRng` streams derived from the pipeline seed
//!
//! ## IDs (`ids`)
//! - Disjoint ID ranges handed to workers up front
//!
//! ## Session (`session`)
//! - Counters, diagnostics and per-function failures

pub mod config;
pub mod error;
pub mod ids;
pub mod rng;
pub mod session;

pub use config::{PassConfig, PipelineConfig};
pub use error::{
    ConfigError, ConfigResult, InterpError, InterpResult, ParseError, PassError, PassResult,
    PipelineError, VerifyError,
};
pub use ids::{IdAllocator, IdRange};
pub use session::{Diagnostic, FailureKind, FunctionFailure, PipelineReport, SessionStats};
