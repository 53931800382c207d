//! docweave engine - orchestration
//!
//! This crate ties the graph and the store together:
//! - [`Project`]: declared models plus the cached dependency graph
//! - [`Executor`]: stage-by-stage execution with failure isolation
//! - Report generation from validation and run results

pub mod executor;
pub mod project;
pub mod report;

pub use executor::{
    select_subgraph, CompleteCallback, Executor, ModelFailure, ModelStats, RunError, RunOptions,
    RunResult, StartCallback, DEFAULT_MAX_CONCURRENCY,
};
pub use project::Project;
pub use report::{build_report, run_diagnostics, validation_diagnostics};
