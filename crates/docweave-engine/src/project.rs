//! Projects: declared models and their resolved graph
//!
//! The graph is a cached pure function of the declared models. Declarations
//! are append-only; adding a model drops the cache.

use std::sync::{Arc, OnceLock};

use docweave_core::Model;
use docweave_dag::{
    plan, to_mermaid, validate, ExecutionPlan, GraphBuilder, GraphError, ModelGraph,
    ResolvedManifest, ValidationResult,
};
use docweave_store::DocumentStore;

use crate::executor::{select_subgraph, Executor, RunError, RunOptions, RunResult};

/// A named set of declared models
#[derive(Debug, Default)]
pub struct Project {
    name: String,
    declared: Vec<Arc<Model>>,
    graph: OnceLock<Arc<ModelGraph>>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared: Vec::new(),
            graph: OnceLock::new(),
        }
    }

    /// Project declaring the manifest's declared models
    pub fn from_manifest(manifest: &ResolvedManifest) -> Self {
        let mut project = Self::new(manifest.name.clone());
        for model in &manifest.declared {
            project.add_model(Arc::clone(model));
        }
        project
    }

    pub fn with_model(mut self, model: Arc<Model>) -> Self {
        self.add_model(model);
        self
    }

    /// Declare a model
    ///
    /// Declaring a model that is already reachable is harmless.
    pub fn add_model(&mut self, model: Arc<Model>) {
        self.declared.push(model);
        self.graph = OnceLock::new();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_models(&self) -> &[Arc<Model>] {
        &self.declared
    }

    /// The resolved dependency graph, built on first use
    pub fn graph(&self) -> Result<Arc<ModelGraph>, GraphError> {
        if let Some(graph) = self.graph.get() {
            return Ok(Arc::clone(graph));
        }

        let built = Arc::new(GraphBuilder::new().declare_all(self.declared.iter().cloned()).build()?);
        Ok(Arc::clone(self.graph.get_or_init(|| built)))
    }

    /// Every model in the graph, declared and discovered, in graph order
    pub fn models(&self) -> Result<Vec<Arc<Model>>, GraphError> {
        Ok(self
            .graph()?
            .models()
            .filter_map(|node| node.model().cloned())
            .collect())
    }

    pub fn validate(&self) -> Result<ValidationResult, GraphError> {
        Ok(validate(&*self.graph()?))
    }

    /// Plan the whole graph
    pub fn plan(&self) -> Result<ExecutionPlan, RunError> {
        Ok(plan(&*self.graph()?)?)
    }

    /// Plan the part of the graph a run with `options` would touch
    pub fn plan_for(&self, options: &RunOptions) -> Result<ExecutionPlan, RunError> {
        let graph = self.graph()?;
        Ok(plan(&select_subgraph(&graph, options)?)?)
    }

    pub fn to_mermaid(&self) -> Result<String, GraphError> {
        Ok(to_mermaid(&*self.graph()?))
    }

    /// Run the project against `store`
    pub async fn run(
        &self,
        store: Arc<dyn DocumentStore>,
        options: &RunOptions,
    ) -> Result<RunResult, RunError> {
        let graph = self.graph()?;
        tracing::info!(project = %self.name, models = graph.models().count(), "Running project");
        Executor::new(store).run(&graph, options).await
    }
}
