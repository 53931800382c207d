//! Errors raised while declaring models

use crate::source::SourceKind;

/// Fatal problems in how models are declared. Raised at construction or
/// graph build time, never silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Model name must not be empty")]
    EmptyModelName,

    #[error("Model '{model}' materializes to a collection but has no write mode (replace, upsert or append)")]
    MissingMaterializationMode { model: String },

    #[error("Two different models are named '{name}'")]
    DuplicateModelName { name: String },

    #[error("Two different collections are named '{name}'")]
    DuplicateCollectionName { name: String },

    /// Sources are identified by name alone, whatever database they live in
    #[error("Model '{name}' has the same name as a collection it would shadow")]
    ModelShadowsCollection { name: String },
}

impl ConfigurationError {
    /// The error for two different sources sharing `name`, by kind
    pub fn name_conflict(name: impl Into<String>, first: SourceKind, second: SourceKind) -> Self {
        let name = name.into();
        match (first, second) {
            (SourceKind::Model, SourceKind::Model) => Self::DuplicateModelName { name },
            (SourceKind::Collection, SourceKind::Collection) => {
                Self::DuplicateCollectionName { name }
            }
            _ => Self::ModelShadowsCollection { name },
        }
    }
}
