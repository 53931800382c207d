//! docweave core
//!
//! Core domain model shared by every docweave crate: sources, models,
//! transformation pipelines, compiled programs, configuration and the
//! stable report format.
//! Never rename diagnostic codes - they are part of the public API.

pub mod source;
pub mod pipeline;
pub mod materialization;
pub mod program;
pub mod model;
pub mod error;
pub mod diagnostic;
pub mod report;
pub mod config;

pub use source::{Collection, Source, SourceKind};
pub use pipeline::{Document, Lookup, Operation, Pipeline, SourceReference, SourceReferences, UnionWith};
pub use materialization::{MaterializationConfig, MaterializationKind, WriteMode};
pub use program::{Namespace, Program, ProgramKind};
pub use model::{Model, ModelBuilder};
pub use error::ConfigurationError;
pub use diagnostic::{Diagnostic, DiagnosticCode, Severity};
pub use report::{Report, ReportSummary, ReportVersion};
pub use config::{Config, ConfigError, StoreConfig};
