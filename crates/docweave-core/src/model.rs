//! Models: named, derived transformations over a source
//!
//! A model is immutable once built. Compiling it is a pure function of its
//! fields and performs no I/O.

use std::sync::Arc;

use crate::error::ConfigurationError;
use crate::materialization::MaterializationConfig;
use crate::pipeline::{Document, Pipeline};
use crate::program::{Namespace, Program, ProgramKind};
use crate::source::Source;

/// A named transformation of one upstream source
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    source: Source,
    pipeline: Pipeline,
    materialization: MaterializationConfig,
    description: Option<String>,
}

impl Model {
    /// Start building a model that reads from `source`
    pub fn builder(name: impl Into<String>, source: impl Into<Source>) -> ModelBuilder {
        ModelBuilder {
            name: name.into(),
            source: source.into(),
            pipeline: Pipeline::new(),
            materialization: MaterializationConfig::default(),
            description: None,
        }
    }

    /// Build a model, validating its name and materialization
    pub fn new(
        name: impl Into<String>,
        source: impl Into<Source>,
        pipeline: Pipeline,
        materialization: MaterializationConfig,
    ) -> Result<Self, ConfigurationError> {
        Self::builder(name, source)
            .pipeline(pipeline)
            .materialization(materialization)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the materialized output (the model name)
    pub fn output_name(&self) -> &str {
        &self.name
    }

    /// Output database, if one was set
    pub fn output_database(&self) -> Option<&str> {
        self.materialization.database.as_deref()
    }

    pub fn output_namespace(&self) -> Namespace {
        self.materialization.namespace(&self.name)
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Whether the upstream source is itself a model
    pub fn is_source_model(&self) -> bool {
        self.source.is_model()
    }

    /// The upstream model, when the source is one
    pub fn upstream_model(&self) -> Option<&Arc<Model>> {
        self.source.as_model()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn materialization(&self) -> &MaterializationConfig {
        &self.materialization
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The transformation operations, without the materialization step
    pub fn compile_operations(&self) -> Vec<Document> {
        self.pipeline.compile()
    }

    /// The full program: operations plus one trailing write operation for
    /// collection-backed models. Views get no trailing operation.
    pub fn compile_program(&self) -> Program {
        let mut operations = self.compile_operations();
        let kind = match self.materialization.operation(&self.name) {
            Some(write) => {
                operations.push(write);
                ProgramKind::Aggregate
            }
            None => ProgramKind::View,
        };

        Program {
            model: self.name.clone(),
            kind,
            source: self.source.namespace(),
            operations,
            target: self.output_namespace(),
        }
    }

    /// Wrap into a shareable source for downstream models
    pub fn into_source(self) -> Source {
        Source::Model(Arc::new(self))
    }
}

/// Builder for [`Model`]
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    source: Source,
    pipeline: Pipeline,
    materialization: MaterializationConfig,
    description: Option<String>,
}

impl ModelBuilder {
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn materialization(mut self, materialization: MaterializationConfig) -> Self {
        self.materialization = materialization;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn build(self) -> Result<Model, ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyModelName);
        }
        self.materialization.validate(&self.name)?;

        Ok(Model {
            name: self.name,
            source: self.source,
            pipeline: self.pipeline,
            materialization: self.materialization,
            description: self.description,
        })
    }

    /// Build and wrap in an `Arc` so the model can be shared as a source
    pub fn build_shared(self) -> Result<Arc<Model>, ConfigurationError> {
        self.build().map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialization::{MaterializationKind, WriteMode};
    use crate::source::Collection;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn ops(program: &Program) -> Vec<Value> {
        program.operations.iter().cloned().map(Value::Object).collect()
    }

    #[test]
    fn accessors_project_fields() {
        let base = Model::builder("stg_users", Collection::new("users").in_database("raw"))
            .materialization(MaterializationConfig::collection(WriteMode::Replace).with_database("dw"))
            .build_shared()
            .unwrap();
        let derived = Model::builder("dim_users", base.clone()).build().unwrap();

        assert_eq!(base.output_name(), "stg_users");
        assert_eq!(base.output_database(), Some("dw"));
        assert_eq!(base.source_name(), "users");
        assert!(!base.is_source_model());
        assert!(derived.is_source_model());
        assert!(Arc::ptr_eq(derived.upstream_model().unwrap(), &base));
        assert_eq!(derived.output_database(), None);
    }

    #[test]
    fn compile_program_appends_replace() {
        let model = Model::builder("active_users", Source::collection("users"))
            .pipeline(Pipeline::new().match_(json!({"active": true})))
            .build()
            .unwrap();

        let program = model.compile_program();
        assert_eq!(program.kind, ProgramKind::Aggregate);
        assert_eq!(program.source, Namespace::new("users"));
        assert_eq!(program.target, Namespace::new("active_users"));
        assert_eq!(
            ops(&program),
            vec![json!({"$match": {"active": true}}), json!({"$out": "active_users"})]
        );
        assert_eq!(model.compile_operations().len(), 1);
    }

    #[test]
    fn compile_program_reads_from_upstream_output() {
        let base = Model::builder("base", Source::collection("raw"))
            .materialization(MaterializationConfig::collection(WriteMode::Upsert).with_database("dw"))
            .build_shared()
            .unwrap();
        let model = Model::builder("agg", base)
            .materialization(MaterializationConfig::collection(WriteMode::Append))
            .build()
            .unwrap();

        let program = model.compile_program();
        assert_eq!(program.source, Namespace::qualified("dw", "base"));
        assert_eq!(
            ops(&program),
            vec![json!({"$merge": {
                "into": "agg",
                "on": "_id",
                "whenMatched": "fail",
                "whenNotMatched": "insert"
            }})]
        );
    }

    #[test]
    fn views_compile_without_trailing_operation() {
        let model = Model::builder("recent", Source::collection("events"))
            .pipeline(Pipeline::new().sort(json!({"ts": -1})).limit(10))
            .materialization(MaterializationConfig::view())
            .build()
            .unwrap();

        let program = model.compile_program();
        assert_eq!(program.kind, ProgramKind::View);
        assert_eq!(program.operations, model.compile_operations());
    }

    #[test]
    fn compile_is_deterministic() {
        let model = Model::builder("m", Source::collection("c"))
            .pipeline(Pipeline::new().group(json!({"_id": "$k", "n": {"$sum": 1}})))
            .build()
            .unwrap();
        assert_eq!(model.compile_program(), model.compile_program());
    }

    #[test]
    fn build_rejects_invalid_declarations() {
        let err = Model::builder("  ", Source::collection("c")).build().unwrap_err();
        assert_eq!(err, ConfigurationError::EmptyModelName);

        let err = Model::builder("m", Source::collection("c"))
            .materialization(MaterializationConfig {
                kind: MaterializationKind::Collection,
                database: None,
                mode: None,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingMaterializationMode { .. }));
    }
}
