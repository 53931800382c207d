//! Store adapter trait for running compiled programs

use docweave_core::Program;
use serde::{Deserialize, Serialize};

/// What a store reports back after running a program
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Documents written to the target (0 for views)
    pub documents_written: u64,
}

/// Errors that can occur when running a program
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Duplicate key {key} in {namespace}")]
    DuplicateKey { namespace: String, key: String },

    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

/// Trait for document stores that can run compiled programs
///
/// Implementations own connection management; the executor shares one store
/// across every model of a stage.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get the store name (e.g., "Memory")
    fn name(&self) -> &'static str;

    /// Run a program to completion
    ///
    /// Aggregate programs read `program.source`, apply the operations and
    /// write through the trailing operation. View programs (re)define
    /// `program.target` as a view.
    async fn execute(&self, program: &Program) -> Result<ExecutionStats, StoreError>;

    /// Test the connection to the store
    async fn test_connection(&self) -> Result<(), StoreError>;
}
