//! Compiled programs submitted to the document store

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::pipeline::Document;

/// Location of a collection or view: a name, optionally qualified by database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    /// Database (store default when absent)
    #[serde(default)]
    pub database: Option<String>,

    /// Collection or view name
    pub name: String,
}

impl Namespace {
    /// Namespace in the store's default database
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            database: None,
            name: name.into(),
        }
    }

    /// Namespace in an explicit database
    pub fn qualified(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            name: name.into(),
        }
    }

    /// Operation-level rendering: the bare name, or `{db, coll}` when a
    /// database is set
    pub fn to_target(&self) -> Value {
        match &self.database {
            Some(database) => json!({ "db": database, "coll": self.name }),
            None => Value::String(self.name.clone()),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(database) => write!(f, "{}.{}", database, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// How the store should treat a program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramKind {
    /// Run the operations over `source`; the last operation writes `target`
    Aggregate,

    /// (Re)define `target` as a view of `source` filtered through the operations
    View,
}

/// A model compiled into something the store can run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Model the program was compiled from
    pub model: String,

    pub kind: ProgramKind,

    /// Where the input documents are read from
    pub source: Namespace,

    /// Ordered operations, including the trailing materialization operation
    /// for aggregate programs
    pub operations: Vec<Document>,

    /// Where the output lands
    pub target: Namespace,
}
