//! Transformation pipelines
//!
//! A [`Pipeline`] is an ordered list of operations. Most operations are
//! opaque documents the orchestrator never looks into. Joins and unions
//! carry a [`Source`] reference (and optionally a nested pipeline applied to
//! that source), which is everything dependency discovery needs to see.

use serde_json::{json, Map, Value};

use crate::source::Source;

/// A single document (an ordered JSON object)
pub type Document = Map<String, Value>;

/// Join another source into each document
#[derive(Debug, Clone)]
pub struct Lookup {
    /// Source joined in
    pub from: Source,

    /// Field of the input document to match on
    pub local_field: Option<String>,

    /// Field of the joined source to match on
    pub foreign_field: Option<String>,

    /// Output array field
    pub as_field: String,

    /// Applied to the joined source before matching
    pub pipeline: Option<Pipeline>,
}

impl Lookup {
    /// Equality join on `local_field == foreign_field`
    pub fn new(
        from: impl Into<Source>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        as_field: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            local_field: Some(local_field.into()),
            foreign_field: Some(foreign_field.into()),
            as_field: as_field.into(),
            pipeline: None,
        }
    }

    /// Join driven purely by a sub-pipeline (no key match)
    pub fn with_pipeline_only(from: impl Into<Source>, as_field: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            from: from.into(),
            local_field: None,
            foreign_field: None,
            as_field: as_field.into(),
            pipeline: Some(pipeline),
        }
    }

    /// Attach a sub-pipeline run against the joined source
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    fn compile(&self) -> Document {
        let mut body = Map::new();
        body.insert("from".to_string(), self.from.namespace().to_target());
        if let Some(local) = &self.local_field {
            body.insert("localField".to_string(), Value::String(local.clone()));
        }
        if let Some(foreign) = &self.foreign_field {
            body.insert("foreignField".to_string(), Value::String(foreign.clone()));
        }
        if let Some(pipeline) = &self.pipeline {
            body.insert("pipeline".to_string(), pipeline.compile_value());
        }
        body.insert("as".to_string(), Value::String(self.as_field.clone()));
        stage("$lookup", Value::Object(body))
    }
}

/// Append the documents of another source
#[derive(Debug, Clone)]
pub struct UnionWith {
    pub from: Source,

    /// Applied to the other source before its documents are appended
    pub pipeline: Option<Pipeline>,
}

impl UnionWith {
    pub fn new(from: impl Into<Source>) -> Self {
        Self {
            from: from.into(),
            pipeline: None,
        }
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    fn compile(&self) -> Document {
        let mut body = Map::new();
        body.insert("coll".to_string(), self.from.namespace().to_target());
        if let Some(pipeline) = &self.pipeline {
            body.insert("pipeline".to_string(), pipeline.compile_value());
        }
        stage("$unionWith", Value::Object(body))
    }
}

/// One step of a pipeline
#[derive(Debug, Clone)]
pub enum Operation {
    /// Opaque single-key operation document, e.g. `{"$match": {...}}`
    Stage(Document),

    Lookup(Lookup),

    UnionWith(UnionWith),
}

impl Operation {
    /// Compile into the store's operation format
    pub fn compile(&self) -> Document {
        match self {
            Self::Stage(doc) => doc.clone(),
            Self::Lookup(lookup) => lookup.compile(),
            Self::UnionWith(union) => union.compile(),
        }
    }
}

/// A source embedded in a pipeline, plus the sub-pipeline applied to it
#[derive(Debug, Clone, Copy)]
pub struct SourceReference<'a> {
    pub source: &'a Source,
    pub nested: Option<&'a Pipeline>,
}

/// Capability needed by dependency discovery: list the sources a
/// transformation embeds, without exposing the rest of its grammar
pub trait SourceReferences {
    /// Direct references only; nested pipelines are returned alongside and
    /// walked by the caller
    fn source_references(&self) -> Vec<SourceReference<'_>>;
}

/// Ordered list of operations
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    operations: Vec<Operation>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_operations(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Append a raw `{name: body}` operation
    pub fn stage(mut self, name: &str, body: Value) -> Self {
        self.operations.push(Operation::Stage(stage(name, body)));
        self
    }

    pub fn match_(self, filter: Value) -> Self {
        self.stage("$match", filter)
    }

    pub fn project(self, projection: Value) -> Self {
        self.stage("$project", projection)
    }

    pub fn add_fields(self, fields: Value) -> Self {
        self.stage("$addFields", fields)
    }

    pub fn group(self, group: Value) -> Self {
        self.stage("$group", group)
    }

    pub fn sort(self, sort: Value) -> Self {
        self.stage("$sort", sort)
    }

    pub fn limit(self, n: u64) -> Self {
        self.stage("$limit", json!(n))
    }

    pub fn skip(self, n: u64) -> Self {
        self.stage("$skip", json!(n))
    }

    pub fn unwind(self, path: impl Into<String>) -> Self {
        self.stage("$unwind", Value::String(path.into()))
    }

    pub fn count(self, field: impl Into<String>) -> Self {
        self.stage("$count", Value::String(field.into()))
    }

    pub fn lookup(mut self, lookup: Lookup) -> Self {
        self.operations.push(Operation::Lookup(lookup));
        self
    }

    pub fn union_with(mut self, union: UnionWith) -> Self {
        self.operations.push(Operation::UnionWith(union));
        self
    }

    /// Compile every operation, recursing into nested pipelines
    pub fn compile(&self) -> Vec<Document> {
        self.operations.iter().map(Operation::compile).collect()
    }

    fn compile_value(&self) -> Value {
        Value::Array(self.compile().into_iter().map(Value::Object).collect())
    }
}

impl SourceReferences for Pipeline {
    fn source_references(&self) -> Vec<SourceReference<'_>> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::Stage(_) => None,
                Operation::Lookup(lookup) => Some(SourceReference {
                    source: &lookup.from,
                    nested: lookup.pipeline.as_ref(),
                }),
                Operation::UnionWith(union) => Some(SourceReference {
                    source: &union.from,
                    nested: union.pipeline.as_ref(),
                }),
            })
            .collect()
    }
}

fn stage(name: &str, body: Value) -> Document {
    let mut doc = Map::new();
    doc.insert(name.to_string(), body);
    doc
}
