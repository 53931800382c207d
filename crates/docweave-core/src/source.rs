//! Sources a model can read from
//!
//! A source is either a raw collection (a leaf with no dependencies) or a
//! model (a derived node). Graph and plan code switch on [`SourceKind`],
//! never on concrete types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::model::Model;
use crate::program::Namespace;

/// Discriminant of a [`Source`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Raw collection, never run, only read
    Collection,

    /// Derived model
    Model,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Model => "model",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw collection in the document store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collection {
    /// Collection name
    pub name: String,

    /// Database holding the collection (store default when absent)
    #[serde(default)]
    pub database: Option<String>,
}

impl Collection {
    /// Create a collection in the store's default database
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: None,
        }
    }

    /// Place the collection in an explicit database
    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

/// Anything a model can read from
///
/// Models are shared by reference: a model does not own its upstream, the
/// project's node set does.
#[derive(Debug, Clone)]
pub enum Source {
    Collection(Collection),
    Model(Arc<Model>),
}

impl Source {
    /// Shorthand for a collection source in the default database
    pub fn collection(name: impl Into<String>) -> Self {
        Self::Collection(Collection::new(name))
    }

    /// Name of the collection or model
    pub fn name(&self) -> &str {
        match self {
            Self::Collection(collection) => &collection.name,
            Self::Model(model) => model.name(),
        }
    }

    /// Database the source's data lives in, if explicitly set
    pub fn output_database(&self) -> Option<&str> {
        match self {
            Self::Collection(collection) => collection.database.as_deref(),
            Self::Model(model) => model.output_database(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Collection(_) => SourceKind::Collection,
            Self::Model(_) => SourceKind::Model,
        }
    }

    /// Upstream source of a model; collections have none
    pub fn upstream(&self) -> Option<&Source> {
        match self {
            Self::Collection(_) => None,
            Self::Model(model) => Some(model.source()),
        }
    }

    pub fn as_model(&self) -> Option<&Arc<Model>> {
        match self {
            Self::Model(model) => Some(model),
            Self::Collection(_) => None,
        }
    }

    pub fn is_model(&self) -> bool {
        matches!(self, Self::Model(_))
    }

    /// Where the source's documents can be read from
    pub fn namespace(&self) -> Namespace {
        Namespace {
            database: self.output_database().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    /// Identity comparison: collections compare by location, models by
    /// reference. Two distinct models sharing a name are not the same source.
    pub fn same_as(&self, other: &Source) -> bool {
        match (self, other) {
            (Self::Collection(a), Self::Collection(b)) => a == b,
            (Self::Model(a), Self::Model(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Collection> for Source {
    fn from(collection: Collection) -> Self {
        Self::Collection(collection)
    }
}

impl From<Arc<Model>> for Source {
    fn from(model: Arc<Model>) -> Self {
        Self::Model(model)
    }
}

impl From<Model> for Source {
    fn from(model: Model) -> Self {
        Self::Model(Arc::new(model))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind(), self.name())
    }
}
