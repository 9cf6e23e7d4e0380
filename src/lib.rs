//! IR-level obfuscation passes.
//!
//! The crate rewrites functions of a small SSA intermediate representation so
//! that their control flow and constant data are harder to analyze, while
//! observable behavior stays the same.
//!
//! # Primary Usage
//!
//! ```ignore
//! use obfuscator::{Module, Pipeline, PipelineConfig};
//!
//! let mut module = Module::parse(&text)?;
//! let pipeline = Pipeline::new(PipelineConfig::all_enabled(42))?;
//! let report = pipeline.run(&mut module);
//! println!("{}", module);
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Modules, functions, blocks and the textual format
//! - [`analysis`] - CFG, dominators and use lists
//! - [`passes`] - `split`, `opaque`, `flattening`, `apihiding`, `string`, `outlining`
//! - [`verify`] - Structural verifier run after every pass
//! - [`pipeline`] - Orders passes and runs functions in parallel
//! - [`interp`] - Reference interpreter for equivalence checks
//! - [`filecheck`] - FileCheck-style directive runner for `.oir` tests
//! - [`core`] - Errors, configuration, RNG streams, IDs and statistics

pub mod analysis;
pub mod core;
pub mod crypto;
pub mod filecheck;
pub mod interp;
pub mod ir;
pub mod passes;
pub mod pipeline;
pub mod verify;

pub use core::{
    ConfigError, InterpError, ParseError, PassConfig, PassError, PipelineConfig, PipelineError,
    PipelineReport, SessionStats, VerifyError,
};
pub use interp::{Execution, Interpreter};
pub use ir::{Function, Module};
pub use passes::{PassKind, PassOutcome, PassRegistry};
pub use pipeline::{obfuscate, Pipeline};
pub use verify::{verify_function, verify_module};
