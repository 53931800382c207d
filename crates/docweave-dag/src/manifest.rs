//! Project manifest (docweave.json) parsing
//!
//! A manifest declares collections and models in JSON so projects can be
//! described without Rust code. `$lookup.from` and `$unionWith.coll` values
//! that name a collection or model become source references; everything
//! else in a pipeline is passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use docweave_core::{
    Collection, ConfigurationError, Document, Lookup, MaterializationConfig, Model, Namespace,
    Operation, Pipeline, Source, SourceKind, UnionWith,
};

/// docweave.json structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Project name
    pub name: String,

    /// Raw collections models may read from
    #[serde(default)]
    pub collections: Vec<CollectionDef>,

    /// Model definitions, in any order
    #[serde(default)]
    pub models: Vec<ModelDef>,

    /// Models the user cares about; every model when empty
    #[serde(default)]
    pub declared: Vec<String>,

    /// Documents to load into collections before running (in-memory store)
    #[serde(default)]
    pub seeds: BTreeMap<String, Vec<Document>>,
}

/// A raw collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub name: String,

    #[serde(default)]
    pub database: Option<String>,
}

/// A model definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,

    /// Name of the upstream collection or model
    pub from: String,

    /// Pipeline operations
    #[serde(default)]
    pub pipeline: Vec<Value>,

    /// Defaults to a replaced collection
    #[serde(default)]
    pub materialize: Option<MaterializationConfig>,

    #[serde(default)]
    pub description: Option<String>,
}

/// A manifest with every reference resolved into shared models
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub name: String,

    /// Declared collections, in manifest order
    pub collections: Vec<Collection>,

    /// Every model, in manifest order
    pub models: Vec<Arc<Model>>,

    /// The models to build the project from
    pub declared: Vec<Arc<Model>>,

    pub seeds: BTreeMap<String, Vec<Document>>,
}

impl Manifest {
    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_json(&contents)
    }

    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json)
            .map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Resolve every model and reference
    pub fn resolve(&self) -> Result<ResolvedManifest, ManifestError> {
        let mut resolver = Resolver::new(self)?;

        let models = self
            .models
            .iter()
            .map(|def| resolver.model(&def.name))
            .collect::<Result<Vec<_>, _>>()?;

        let declared = if self.declared.is_empty() {
            models.clone()
        } else {
            self.declared
                .iter()
                .map(|name| {
                    resolver
                        .resolved
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ManifestError::UnknownModel(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(ResolvedManifest {
            name: self.name.clone(),
            collections: resolver.collection_list,
            models,
            declared,
            seeds: self.seeds.clone(),
        })
    }
}

impl ResolvedManifest {
    /// Where seed documents for `name` go: the declared collection's
    /// database when it has one, else the store default
    pub fn seed_namespace(&self, name: &str) -> Namespace {
        self.collections
            .iter()
            .find(|collection| collection.name == name)
            .map(|collection| Namespace {
                database: collection.database.clone(),
                name: collection.name.clone(),
            })
            .unwrap_or_else(|| Namespace::new(name))
    }
}

struct Resolver<'a> {
    collections: HashMap<&'a str, Collection>,
    collection_list: Vec<Collection>,
    defs: HashMap<&'a str, &'a ModelDef>,
    resolved: HashMap<String, Arc<Model>>,
    /// Models currently being resolved, outermost first
    resolving: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn new(manifest: &'a Manifest) -> Result<Self, ManifestError> {
        let mut collections = HashMap::new();
        let mut collection_list = Vec::new();
        for def in &manifest.collections {
            let collection = Collection {
                name: def.name.clone(),
                database: def.database.clone(),
            };
            if collections.insert(def.name.as_str(), collection.clone()).is_some() {
                return Err(conflict(&def.name, SourceKind::Collection, SourceKind::Collection));
            }
            collection_list.push(collection);
        }

        let mut defs = HashMap::new();
        for def in &manifest.models {
            if collections.contains_key(def.name.as_str()) {
                return Err(conflict(&def.name, SourceKind::Collection, SourceKind::Model));
            }
            if defs.insert(def.name.as_str(), def).is_some() {
                return Err(conflict(&def.name, SourceKind::Model, SourceKind::Model));
            }
        }

        Ok(Self {
            collections,
            collection_list,
            defs,
            resolved: HashMap::new(),
            resolving: Vec::new(),
        })
    }

    fn model(&mut self, name: &str) -> Result<Arc<Model>, ManifestError> {
        if let Some(model) = self.resolved.get(name) {
            return Ok(model.clone());
        }

        if let Some(pos) = self.resolving.iter().position(|n| n == name) {
            let mut path = self.resolving[pos..].to_vec();
            path.push(name.to_string());
            return Err(ManifestError::Cycle { path });
        }

        let def = *self
            .defs
            .get(name)
            .ok_or_else(|| ManifestError::UnknownModel(name.to_string()))?;

        self.resolving.push(name.to_string());
        let source = self.source(&def.from, name)?;
        let pipeline = self.pipeline(&def.pipeline, name)?;

        let mut builder = Model::builder(def.name.clone(), source)
            .pipeline(pipeline)
            .materialization(def.materialize.clone().unwrap_or_default());
        if let Some(description) = &def.description {
            builder = builder.description(description.clone());
        }
        let model = builder.build_shared()?;
        self.resolving.pop();

        self.resolved.insert(name.to_string(), model.clone());
        Ok(model)
    }

    fn source(&mut self, name: &str, referenced_by: &str) -> Result<Source, ManifestError> {
        if self.defs.contains_key(name) {
            return self.model(name).map(Source::Model);
        }
        if let Some(collection) = self.collections.get(name) {
            return Ok(Source::Collection(collection.clone()));
        }
        Err(ManifestError::UnknownSource {
            name: name.to_string(),
            model: referenced_by.to_string(),
        })
    }

    fn pipeline(&mut self, stages: &[Value], model: &str) -> Result<Pipeline, ManifestError> {
        let mut pipeline = Pipeline::new();

        for stage in stages {
            let invalid = |message: &str| ManifestError::InvalidStage {
                model: model.to_string(),
                message: message.to_string(),
            };

            let Some(doc) = stage.as_object() else {
                return Err(invalid("operation must be an object"));
            };
            let mut entries = doc.iter();
            let (Some((name, body)), None) = (entries.next(), entries.next()) else {
                return Err(invalid("operation must have exactly one key"));
            };

            let operation = match name.as_str() {
                "$lookup" => {
                    let body = body.as_object().ok_or_else(|| invalid("$lookup takes an object"))?;
                    let from = reference_name(body.get("from"))
                        .ok_or_else(|| invalid("$lookup.from must name a source"))?;
                    let as_field = body
                        .get("as")
                        .and_then(Value::as_str)
                        .ok_or_else(|| invalid("$lookup.as is required"))?;

                    let nested = match body.get("pipeline") {
                        Some(Value::Array(stages)) => Some(self.pipeline(stages, model)?),
                        Some(_) => return Err(invalid("$lookup.pipeline must be an array")),
                        None => None,
                    };

                    Operation::Lookup(Lookup {
                        from: self.source(from, model)?,
                        local_field: body.get("localField").and_then(Value::as_str).map(str::to_string),
                        foreign_field: body.get("foreignField").and_then(Value::as_str).map(str::to_string),
                        as_field: as_field.to_string(),
                        pipeline: nested,
                    })
                }
                "$unionWith" => {
                    let (coll, nested) = match body {
                        Value::String(coll) => (coll.as_str(), None),
                        Value::Object(body) => {
                            let coll = reference_name(body.get("coll"))
                                .ok_or_else(|| invalid("$unionWith.coll must name a source"))?;
                            let nested = match body.get("pipeline") {
                                Some(Value::Array(stages)) => Some(self.pipeline(stages, model)?),
                                Some(_) => return Err(invalid("$unionWith.pipeline must be an array")),
                                None => None,
                            };
                            (coll, nested)
                        }
                        _ => return Err(invalid("$unionWith takes a name or an object")),
                    };

                    Operation::UnionWith(UnionWith {
                        from: self.source(coll, model)?,
                        pipeline: nested,
                    })
                }
                _ => Operation::Stage(doc.clone()),
            };

            pipeline.push(operation);
        }

        Ok(pipeline)
    }
}

/// `"name"` or `{"db": ..., "coll": "name"}`
fn reference_name(value: Option<&Value>) -> Option<&str> {
    match value? {
        Value::String(name) => Some(name),
        Value::Object(target) => target.get("coll").and_then(Value::as_str),
        _ => None,
    }
}

fn conflict(name: &str, first: SourceKind, second: SourceKind) -> ManifestError {
    ConfigurationError::name_conflict(name, first, second).into()
}

/// Manifest parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest JSON: {0}")]
    ParseError(String),

    #[error("Model '{model}' references unknown source '{name}'")]
    UnknownSource { name: String, model: String },

    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Models reference each other in a cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Invalid operation in model '{model}': {message}")]
    InvalidStage { model: String, message: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
