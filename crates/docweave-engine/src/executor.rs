//! Stage-by-stage execution of a model graph
//!
//! Stages run strictly in order. Models inside a stage are independent and
//! run concurrently, bounded by a semaphore. A model whose program fails is
//! recorded and every model that depends on it is skipped; unrelated
//! branches keep going.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use docweave_core::Model;
use docweave_dag::{plan, validate, GraphError, ModelGraph, NodeId, PlanError, ValidationError};
use docweave_store::{DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Per-stage concurrency used when nothing else is configured
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Called when a model's program is about to be submitted
pub type StartCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called when a model's program completed successfully
pub type CompleteCallback = Arc<dyn Fn(&str, &ModelStats) + Send + Sync>;

/// Errors that prevent a run from starting
///
/// Per-model failures are not errors; they land in [`RunResult::models_failed`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("graph is invalid: {}", join(.errors))]
    InvalidGraph { errors: Vec<ValidationError> },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model '{model}' depends on excluded model '{dependency}'")]
    ExcludedDependency { model: String, dependency: String },
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// What to run and how
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to these models and their dependencies
    pub targets: Vec<String>,

    /// Remove these models after target selection
    pub exclude: Vec<String>,

    /// Validate and plan only
    pub dry_run: bool,

    /// Override the executor's per-stage concurrency
    pub max_concurrency: Option<usize>,

    on_model_start: Option<StartCallback>,
    on_model_complete: Option<CompleteCallback>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, model: impl Into<String>) -> Self {
        self.targets.push(model.into());
        self
    }

    pub fn targets<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn on_model_start(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_model_start = Some(Arc::new(callback));
        self
    }

    pub fn on_model_complete(
        mut self,
        callback: impl Fn(&str, &ModelStats) + Send + Sync + 'static,
    ) -> Self {
        self.on_model_complete = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("targets", &self.targets)
            .field("exclude", &self.exclude)
            .field("dry_run", &self.dry_run)
            .field("max_concurrency", &self.max_concurrency)
            .field("on_model_start", &self.on_model_start.is_some())
            .field("on_model_complete", &self.on_model_complete.is_some())
            .finish()
    }
}

/// Statistics for one completed model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStats {
    pub duration_ms: u64,
    pub documents_written: u64,
}

/// A model whose program failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// True when no model failed
    pub success: bool,

    /// Completed models, in completion order
    pub models_run: Vec<String>,

    pub models_failed: Vec<ModelFailure>,

    /// Models not attempted because something upstream failed or was skipped
    pub models_skipped: Vec<String>,

    pub total_duration_ms: u64,

    /// Stats of every completed model
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stats: BTreeMap<String, ModelStats>,
}

/// Runs a graph against a store
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn DocumentStore>,
    max_concurrency: usize,
}

impl Executor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Per-stage concurrency limit; 0 is treated as 1
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Validate, select, plan and run `graph`
    ///
    /// Returns `Err` when nothing could run (invalid graph, bad selection).
    /// Per-model failures are reported in the `Ok` result.
    pub async fn run(&self, graph: &ModelGraph, options: &RunOptions) -> Result<RunResult, RunError> {
        let started = Instant::now();

        let validation = validate(graph);
        if !validation.valid {
            return Err(RunError::InvalidGraph {
                errors: validation.errors,
            });
        }

        let subgraph = select_subgraph(graph, options)?;
        let plan = plan(&subgraph)?;

        if options.dry_run {
            tracing::info!(
                stages = plan.stages.len(),
                models = plan.model_count(),
                "Dry run: nothing executed"
            );
            return Ok(RunResult {
                success: true,
                total_duration_ms: elapsed_ms(started),
                ..RunResult::default()
            });
        }

        let limit = options.max_concurrency.unwrap_or(self.max_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut result = RunResult::default();

        // Failed or skipped; anything depending on these is skipped
        let mut blocked: HashSet<String> = HashSet::new();

        for (index, stage) in plan.stages.iter().enumerate() {
            tracing::info!(stage = index, models = stage.len(), "Starting stage");

            let mut set = JoinSet::new();
            let mut tasks: HashMap<tokio::task::Id, String> = HashMap::new();

            for name in stage {
                let Some(id) = subgraph.id_of(name) else {
                    continue;
                };

                let failed_dependency = subgraph
                    .dependencies(id)
                    .iter()
                    .map(|&dep| subgraph.node(dep).name())
                    .find(|dep| blocked.contains(*dep));
                if let Some(dependency) = failed_dependency {
                    tracing::warn!(model = %name, dependency = %dependency, "Skipping model");
                    blocked.insert(name.clone());
                    result.models_skipped.push(name.clone());
                    continue;
                }

                let Some(model) = subgraph.node(id).model().cloned() else {
                    continue;
                };

                let handle = set.spawn(run_model(
                    model,
                    Arc::clone(&self.store),
                    Arc::clone(&semaphore),
                    options.on_model_start.clone(),
                    options.on_model_complete.clone(),
                ));
                tasks.insert(handle.id(), name.clone());
            }

            while let Some(joined) = set.join_next_with_id().await {
                let (name, outcome) = match joined {
                    Ok((_, (name, outcome))) => (name, outcome),
                    Err(join_error) => {
                        let name = tasks.get(&join_error.id()).cloned().unwrap_or_default();
                        let reason = if join_error.is_panic() {
                            "task panicked"
                        } else {
                            "task cancelled"
                        };
                        (name, Err(StoreError::Cancelled(reason.to_string())))
                    }
                };

                match outcome {
                    Ok(stats) => {
                        result.models_run.push(name.clone());
                        result.stats.insert(name, stats);
                    }
                    Err(error) => {
                        tracing::error!(model = %name, error = %error, "Model failed");
                        blocked.insert(name.clone());
                        result.models_failed.push(ModelFailure {
                            name,
                            error: error.to_string(),
                        });
                    }
                }
            }
        }

        result.success = result.models_failed.is_empty();
        result.total_duration_ms = elapsed_ms(started);

        tracing::info!(
            run = result.models_run.len(),
            failed = result.models_failed.len(),
            skipped = result.models_skipped.len(),
            duration_ms = result.total_duration_ms,
            "Run finished"
        );

        Ok(result)
    }
}

async fn run_model(
    model: Arc<Model>,
    store: Arc<dyn DocumentStore>,
    semaphore: Arc<Semaphore>,
    on_start: Option<StartCallback>,
    on_complete: Option<CompleteCallback>,
) -> (String, Result<ModelStats, StoreError>) {
    let name = model.name().to_string();

    // Semaphore was closed -- treat as cancellation
    let Ok(_permit) = semaphore.acquire().await else {
        return (name, Err(StoreError::Cancelled("executor shut down".to_string())));
    };

    if let Some(callback) = &on_start {
        callback(&name);
    }

    let started = Instant::now();
    let program = model.compile_program();
    let outcome = store.execute(&program).await;
    let duration_ms = elapsed_ms(started);

    match outcome {
        Ok(execution) => {
            let stats = ModelStats {
                duration_ms,
                documents_written: execution.documents_written,
            };
            tracing::info!(
                model = %name,
                duration_ms,
                documents = stats.documents_written,
                "Model completed"
            );
            if let Some(callback) = &on_complete {
                callback(&name, &stats);
            }
            (name, Ok(stats))
        }
        Err(error) => (name, Err(error)),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// The part of `graph` a run with `options` touches
///
/// Targets pull in their transitive dependencies. Excluded models are then
/// removed; excluding something a remaining model depends on is an error.
pub fn select_subgraph(graph: &ModelGraph, options: &RunOptions) -> Result<ModelGraph, RunError> {
    let mut keep: HashSet<NodeId> = if options.targets.is_empty() {
        (0..graph.len()).collect()
    } else {
        let mut keep = HashSet::new();
        for target in &options.targets {
            let id = graph
                .id_of(target)
                .filter(|&id| graph.node(id).is_model())
                .ok_or_else(|| RunError::UnknownModel(target.clone()))?;
            keep.insert(id);
            keep.extend(graph.upstream(id));
        }
        keep
    };

    let mut excluded = HashSet::new();
    for name in &options.exclude {
        match graph.id_of(name) {
            Some(id) if graph.node(id).is_model() => {
                if keep.remove(&id) {
                    excluded.insert(id);
                }
            }
            _ => tracing::warn!(model = %name, "Ignoring unknown excluded model"),
        }
    }

    for node in graph.nodes().iter().filter(|node| keep.contains(&node.id)) {
        if let Some(&dependency) = graph
            .dependencies(node.id)
            .iter()
            .find(|dep| excluded.contains(*dep))
        {
            return Err(RunError::ExcludedDependency {
                model: node.name().to_string(),
                dependency: graph.node(dependency).name().to_string(),
            });
        }
    }

    if keep.len() == graph.len() {
        return Ok(graph.clone());
    }
    Ok(graph.subgraph(&keep))
}
