//! Document store adapters
//!
//! The orchestrator never runs transformations itself: each model compiles
//! into a [`docweave_core::Program`] that is submitted to a [`DocumentStore`].
//!
//! ## Stores
//!
//! - [`MemoryStore`] - in-process store that evaluates programs over JSON
//!   documents. Used by tests, demos and the CLI.
//!
//! ## Example
//!
//! ```rust,ignore
//! use docweave_store::{DocumentStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! store.seed(Namespace::new("orders"), docs).await;
//! let stats = store.execute(&model.compile_program()).await?;
//! ```

pub mod adapter;
pub mod memory;
mod eval;

pub use adapter::{DocumentStore, ExecutionStats, StoreError};
pub use memory::{MemoryStore, MemoryStoreBuilder};
