//! How a model's output is persisted

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ConfigurationError;
use crate::pipeline::Document;
use crate::program::Namespace;

/// Output kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterializationKind {
    /// A real collection written by the last operation
    #[default]
    Collection,

    /// A view evaluated on read; nothing is written
    View,
}

/// How a collection-backed model writes its results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Drop and replace the whole output collection
    Replace,

    /// Merge by `_id`, replacing documents that already exist
    Upsert,

    /// Merge by `_id`, failing when a document already exists
    Append,
}

/// Materialization strategy of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializationConfig {
    #[serde(rename = "type", default)]
    pub kind: MaterializationKind,

    /// Output database (store default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Required for collections, ignored for views
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WriteMode>,
}

impl Default for MaterializationConfig {
    fn default() -> Self {
        Self::collection(WriteMode::Replace)
    }
}

impl MaterializationConfig {
    pub fn collection(mode: WriteMode) -> Self {
        Self {
            kind: MaterializationKind::Collection,
            database: None,
            mode: Some(mode),
        }
    }

    pub fn view() -> Self {
        Self {
            kind: MaterializationKind::View,
            database: None,
            mode: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn is_view(&self) -> bool {
        self.kind == MaterializationKind::View
    }

    /// Check that a collection target carries a write mode
    pub fn validate(&self, model: &str) -> Result<(), ConfigurationError> {
        if self.kind == MaterializationKind::Collection && self.mode.is_none() {
            return Err(ConfigurationError::MissingMaterializationMode {
                model: model.to_string(),
            });
        }
        Ok(())
    }

    /// The trailing write operation for `name`, or `None` for views
    pub fn operation(&self, name: &str) -> Option<Document> {
        let target = self.namespace(name).to_target();
        let op = match (self.kind, self.mode) {
            (MaterializationKind::View, _) => return None,
            // validate() rejects this; Replace is the safe reading
            (MaterializationKind::Collection, None | Some(WriteMode::Replace)) => {
                json!({ "$out": target })
            }
            (MaterializationKind::Collection, Some(WriteMode::Upsert)) => merge(target, "replace"),
            (MaterializationKind::Collection, Some(WriteMode::Append)) => merge(target, "fail"),
        };
        match op {
            Value::Object(doc) => Some(doc),
            _ => None,
        }
    }

    /// Output location for a model called `name`
    pub fn namespace(&self, name: &str) -> Namespace {
        Namespace {
            database: self.database.clone(),
            name: name.to_string(),
        }
    }
}

fn merge(target: Value, when_matched: &str) -> Value {
    json!({
        "$merge": {
            "into": target,
            "on": "_id",
            "whenMatched": when_matched,
            "whenNotMatched": "insert",
        }
    })
}
