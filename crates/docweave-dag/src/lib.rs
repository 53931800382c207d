//! Model dependency graph
//!
//! This crate handles:
//! - Discovering the sources a model depends on (including joins and unions
//!   nested inside sub-pipelines)
//! - Building the complete dependency graph from a few declared models
//! - Validating the graph (cycles, disconnected groups)
//! - Layering the graph into execution stages
//! - Rendering the graph as a Mermaid diagram
//! - Loading a project from a JSON manifest

pub mod discover;
pub mod graph;
pub mod validate;
pub mod plan;
pub mod mermaid;
pub mod manifest;

pub use discover::discover_dependencies;
pub use graph::{GraphBuilder, GraphError, GraphNode, ModelGraph, NodeId};
pub use validate::{validate, ValidationError, ValidationResult, ValidationWarning, WarningKind};
pub use plan::{plan, ExecutionPlan, PlanError};
pub use mermaid::to_mermaid;
pub use manifest::{CollectionDef, Manifest, ManifestError, ModelDef, ResolvedManifest};
