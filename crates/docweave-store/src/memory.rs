//! In-memory document store
//!
//! Runs compiled programs against collections held in process memory. It is
//! useful for:
//! - Unit and integration testing of projects
//! - Dry demos without a database server
//! - Simulating store failures for specific models
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docweave_store::{DocumentStore, MemoryStore};
//! use docweave_core::Namespace;
//!
//! let store = MemoryStore::new();
//! store.seed(Namespace::new("orders"), orders).await;
//!
//! let stats = store.execute(&model.compile_program()).await?;
//! let rows = store.documents(&Namespace::new("daily_orders")).await?;
//! ```
//!
//! ## Simulating Failures
//!
//! ```rust,ignore
//! // Fail one model's program
//! store.fail_model("daily_orders", StoreError::Execution("boom".into())).await;
//!
//! // Simulate round-trip latency
//! let store = MemoryStore::new().with_latency(100); // 100ms delay
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use docweave_core::{Document, Namespace, Program, ProgramKind};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::adapter::{DocumentStore, ExecutionStats, StoreError};
use crate::eval::{self, Catalog};

/// Database used for namespaces that do not name one
pub const DEFAULT_DATABASE: &str = "test";

/// Views may be defined on views; reads give up past this depth
const MAX_VIEW_DEPTH: usize = 32;

/// A stored view definition
#[derive(Debug, Clone)]
struct View {
    source: Namespace,
    operations: Vec<Document>,
}

#[derive(Debug)]
struct State {
    default_database: String,
    collections: HashMap<Namespace, Vec<Document>>,
    views: HashMap<Namespace, View>,
    executed: Vec<String>,
    next_id: u64,
}

impl State {
    fn new(default_database: String) -> Self {
        Self {
            default_database,
            collections: HashMap::new(),
            views: HashMap::new(),
            executed: Vec::new(),
            next_id: 0,
        }
    }

    /// Fully qualify a namespace against the default database
    fn key(&self, namespace: &Namespace) -> Namespace {
        Namespace {
            database: Some(
                namespace
                    .database
                    .clone()
                    .unwrap_or_else(|| self.default_database.clone()),
            ),
            name: namespace.name.clone(),
        }
    }

    /// Documents of a collection or view. Missing namespaces read as empty.
    fn read_at(&self, namespace: &Namespace, depth: usize) -> Result<Vec<Document>, StoreError> {
        let key = self.key(namespace);
        if let Some(view) = self.views.get(&key) {
            if depth >= MAX_VIEW_DEPTH {
                return Err(StoreError::Execution(format!("view {key} nests too deeply")));
            }
            let input = self.read_at(&view.source, depth + 1)?;
            let reader = Reader { state: self, depth: depth + 1 };
            return eval::run_pipeline(input, &view.operations, &reader);
        }
        Ok(self.collections.get(&key).cloned().unwrap_or_default())
    }

    fn assign_ids(&mut self, docs: &mut [Document]) {
        for doc in docs {
            if !doc.contains_key("_id") {
                self.next_id += 1;
                doc.insert("_id".to_string(), Value::String(format!("{:024x}", self.next_id)));
            }
        }
    }

    fn apply(&mut self, program: &Program) -> Result<ExecutionStats, StoreError> {
        match program.kind {
            ProgramKind::View => {
                if let Some(op) = program.operations.iter().find(|op| is_write(op)) {
                    return Err(StoreError::InvalidProgram(format!(
                        "view {} cannot contain a write operation: {}",
                        program.target,
                        Value::Object(op.clone())
                    )));
                }
                let target = self.key(&program.target);
                let source = self.key(&program.source);
                self.collections.remove(&target);
                self.views.insert(
                    target,
                    View {
                        source,
                        operations: program.operations.clone(),
                    },
                );
                Ok(ExecutionStats::default())
            }
            ProgramKind::Aggregate => {
                let (write, operations) = program.operations.split_last().ok_or_else(|| {
                    StoreError::InvalidProgram(format!("program for {} has no operations", program.model))
                })?;
                let (name, body) = eval::operation_parts(write)?;
                if name != "$out" && name != "$merge" {
                    return Err(StoreError::InvalidProgram(format!(
                        "aggregate program must end with $out or $merge, found {name}"
                    )));
                }

                let input = self.read_at(&program.source, 0)?;
                let output = eval::run_pipeline(input, operations, &Reader { state: self, depth: 0 })?;

                let written = if name == "$out" {
                    self.write_out(body, output)?
                } else {
                    self.write_merge(body, output)?
                };
                Ok(ExecutionStats { documents_written: written })
            }
        }
    }

    /// `$out`: replace the target's contents
    fn write_out(&mut self, body: &Value, mut docs: Vec<Document>) -> Result<u64, StoreError> {
        let target = self.key(&eval::parse_namespace(body)?);
        self.assign_ids(&mut docs);

        let mut seen = HashSet::new();
        for doc in &docs {
            let id = doc.get("_id").map(Value::to_string).unwrap_or_default();
            if !seen.insert(id.clone()) {
                return Err(StoreError::DuplicateKey {
                    namespace: target.to_string(),
                    key: id,
                });
            }
        }

        let written = docs.len() as u64;
        self.views.remove(&target);
        self.collections.insert(target, docs);
        Ok(written)
    }

    /// `$merge`: match on a key, then insert or update. All or nothing.
    fn write_merge(&mut self, body: &Value, mut docs: Vec<Document>) -> Result<u64, StoreError> {
        let spec = body
            .as_object()
            .ok_or_else(|| StoreError::InvalidProgram("$merge expects an object".to_string()))?;
        let target = self.key(&eval::parse_namespace(
            spec.get("into")
                .ok_or_else(|| StoreError::InvalidProgram("$merge requires into".to_string()))?,
        )?);
        let on = match spec.get("on") {
            None => "_id",
            Some(Value::String(field)) => field.as_str(),
            Some(Value::Array(fields)) if fields.len() == 1 => fields[0]
                .as_str()
                .ok_or_else(|| StoreError::InvalidProgram("$merge on must name fields".to_string()))?,
            Some(other) => {
                return Err(StoreError::UnsupportedOperation(format!("$merge on {other}")))
            }
        };
        let when_matched = spec.get("whenMatched").and_then(Value::as_str).unwrap_or("merge");
        let when_not_matched = spec.get("whenNotMatched").and_then(Value::as_str).unwrap_or("insert");

        if self.views.contains_key(&target) {
            return Err(StoreError::InvalidProgram(format!("cannot $merge into view {target}")));
        }
        if on == "_id" {
            self.assign_ids(&mut docs);
        }

        let mut working = self.collections.get(&target).cloned().unwrap_or_default();
        let mut written = 0u64;

        for doc in docs {
            let key = eval::get_path(&doc, on).cloned().ok_or_else(|| {
                StoreError::Execution(format!("document for {target} is missing merge key {on}"))
            })?;
            let position = working.iter().position(|existing| {
                eval::get_path(existing, on).is_some_and(|value| eval::values_equal(value, &key))
            });

            match (position, when_matched, when_not_matched) {
                (Some(_), "fail", _) => {
                    return Err(StoreError::DuplicateKey {
                        namespace: target.to_string(),
                        key: key.to_string(),
                    })
                }
                (Some(i), "replace", _) => {
                    let mut replacement = doc;
                    if let Some(id) = working[i].get("_id") {
                        replacement.insert("_id".to_string(), id.clone());
                    }
                    working[i] = replacement;
                    written += 1;
                }
                (Some(i), "merge", _) => {
                    working[i].extend(doc);
                    written += 1;
                }
                (Some(_), "keepExisting", _) => {}
                (Some(_), other, _) => {
                    return Err(StoreError::UnsupportedOperation(format!("$merge whenMatched {other}")))
                }
                (None, _, "insert") => {
                    working.push(doc);
                    written += 1;
                }
                (None, _, "discard") => {}
                (None, _, "fail") => {
                    return Err(StoreError::Execution(format!(
                        "no document in {target} matches {on} = {key}"
                    )))
                }
                (None, _, other) => {
                    return Err(StoreError::UnsupportedOperation(format!("$merge whenNotMatched {other}")))
                }
            }
        }

        self.collections.insert(target, working);
        Ok(written)
    }
}

fn is_write(op: &Document) -> bool {
    op.contains_key("$out") || op.contains_key("$merge")
}

struct Reader<'a> {
    state: &'a State,
    depth: usize,
}

impl Catalog for Reader<'_> {
    fn read(&self, namespace: &Namespace) -> Result<Vec<Document>, StoreError> {
        self.state.read_at(namespace, self.depth + 1)
    }
}

/// Tracks programs in flight and the highest overlap seen
struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            current: Arc::clone(current),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory document store
///
/// Clones share the same collections, so a test can keep a handle while the
/// executor owns another.
///
/// # Features
///
/// - Seed and read collections by namespace
/// - Views are stored as definitions and evaluated on read
/// - Simulate failures for specific models and connection tests
/// - Simulate latency
/// - Record the order programs ran in, and peak concurrency
///
/// # Example
///
/// ```rust,ignore
/// let store = MemoryStore::builder()
///     .with_default_database("shop")
///     .with_latency(50)
///     .build();
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,

    /// Errors to return for specific models
    failures: Arc<RwLock<HashMap<String, StoreError>>>,

    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,

    fail_connection: bool,

    /// Simulated latency per program (milliseconds)
    latency_ms: u64,

    store_name: &'static str,
}

impl MemoryStore {
    /// Create an empty store using [`DEFAULT_DATABASE`]
    pub fn new() -> Self {
        MemoryStoreBuilder::new().build()
    }

    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::new()
    }

    /// Configure to fail all connection tests
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Delay every program and connection test by `latency_ms`
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set a custom store name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.store_name = name;
        self
    }

    /// Replace the contents of a collection
    ///
    /// Documents without an `_id` get a generated one.
    pub async fn seed(&self, namespace: Namespace, mut documents: Vec<Document>) {
        let mut state = self.state.write().await;
        let key = state.key(&namespace);
        state.assign_ids(&mut documents);
        state.views.remove(&key);
        state.collections.insert(key, documents);
    }

    /// Read a collection or evaluate a view
    pub async fn documents(&self, namespace: &Namespace) -> Result<Vec<Document>, StoreError> {
        self.state.read().await.read_at(namespace, 0)
    }

    /// Whether a collection or view exists at `namespace`
    pub async fn has_namespace(&self, namespace: &Namespace) -> bool {
        let state = self.state.read().await;
        let key = state.key(namespace);
        state.collections.contains_key(&key) || state.views.contains_key(&key)
    }

    pub async fn is_view(&self, namespace: &Namespace) -> bool {
        let state = self.state.read().await;
        state.views.contains_key(&state.key(namespace))
    }

    /// Every namespace holding a collection or view, fully qualified and sorted
    pub async fn namespaces(&self) -> Vec<Namespace> {
        let state = self.state.read().await;
        let mut names: Vec<Namespace> = state
            .collections
            .keys()
            .chain(state.views.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Make every program compiled from `model` fail with `error`
    pub async fn fail_model(&self, model: impl Into<String>, error: StoreError) {
        self.failures.write().await.insert(model.into(), error);
    }

    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    /// Models whose programs completed, in completion order
    pub async fn executed_programs(&self) -> Vec<String> {
        self.state.read().await.executed.clone()
    }

    /// Drop all collections, views and the execution log
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.collections.clear();
        state.views.clear();
        state.executed.clear();
    }

    /// Highest number of programs that were running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &'static str {
        self.store_name
    }

    async fn execute(&self, program: &Program) -> Result<ExecutionStats, StoreError> {
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak);
        self.simulate_latency().await;

        if let Some(error) = self.failures.read().await.get(&program.model) {
            return Err(error.clone());
        }

        let mut state = self.state.write().await;
        let stats = state.apply(program)?;
        state.executed.push(program.model.clone());

        tracing::debug!(
            model = %program.model,
            target = %program.target,
            written = stats.documents_written,
            "Program executed"
        );
        Ok(stats)
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        self.simulate_latency().await;

        if self.fail_connection {
            Err(StoreError::Connection("Simulated connection failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Builder for a [`MemoryStore`] with preloaded collections
///
/// # Example
///
/// ```rust,ignore
/// let store = MemoryStoreBuilder::new()
///     .with_collection(Namespace::new("users"), users)
///     .with_failure("broken_model", StoreError::Execution("boom".into()))
///     .build();
/// ```
pub struct MemoryStoreBuilder {
    default_database: String,
    collections: Vec<(Namespace, Vec<Document>)>,
    failures: HashMap<String, StoreError>,
    fail_connection: bool,
    latency_ms: u64,
    store_name: &'static str,
}

impl MemoryStoreBuilder {
    pub fn new() -> Self {
        Self {
            default_database: DEFAULT_DATABASE.to_string(),
            collections: Vec::new(),
            failures: HashMap::new(),
            fail_connection: false,
            latency_ms: 0,
            store_name: "Memory",
        }
    }

    /// Database for namespaces that do not name one
    pub fn with_default_database(mut self, database: impl Into<String>) -> Self {
        self.default_database = database.into();
        self
    }

    pub fn with_collection(mut self, namespace: Namespace, documents: Vec<Document>) -> Self {
        self.collections.push((namespace, documents));
        self
    }

    pub fn with_failure(mut self, model: impl Into<String>, error: StoreError) -> Self {
        self.failures.insert(model.into(), error);
        self
    }

    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.store_name = name;
        self
    }

    pub fn build(self) -> MemoryStore {
        let mut state = State::new(self.default_database);
        for (namespace, mut documents) in self.collections {
            let key = state.key(&namespace);
            state.assign_ids(&mut documents);
            state.collections.insert(key, documents);
        }

        MemoryStore {
            state: Arc::new(RwLock::new(state)),
            failures: Arc::new(RwLock::new(self.failures)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            store_name: self.store_name,
        }
    }
}

impl Default for MemoryStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn docs(value: Value) -> Vec<Document> {
        match value {
            Value::Array(items) => items.into_iter().filter_map(|v| v.as_object().cloned()).collect(),
            _ => Vec::new(),
        }
    }

    fn program(kind: ProgramKind, source: Namespace, target: Namespace, operations: Value) -> Program {
        Program {
            model: target.name.clone(),
            kind,
            source,
            operations: docs(operations),
            target,
        }
    }

    #[tokio::test]
    async fn test_out_replaces_target() {
        let store = MemoryStore::new();
        store
            .seed(Namespace::new("users"), docs(json!([{"_id": 1, "a": true}, {"_id": 2, "a": false}])))
            .await;
        store.seed(Namespace::new("active"), docs(json!([{"_id": 99}]))).await;

        let stats = store
            .execute(&program(
                ProgramKind::Aggregate,
                Namespace::new("users"),
                Namespace::new("active"),
                json!([{"$match": {"a": true}}, {"$out": "active"}]),
            ))
            .await
            .unwrap();

        assert_eq!(stats.documents_written, 1);
        assert_eq!(
            store.documents(&Namespace::new("active")).await.unwrap(),
            docs(json!([{"_id": 1, "a": true}]))
        );
        assert_eq!(store.executed_programs().await, vec!["active".to_string()]);
    }

    #[tokio::test]
    async fn test_default_database_qualifies_namespaces() {
        let store = MemoryStore::builder().with_default_database("shop").build();
        store.seed(Namespace::new("orders"), docs(json!([{"_id": 1}]))).await;

        assert!(store.has_namespace(&Namespace::qualified("shop", "orders")).await);
        assert!(!store.has_namespace(&Namespace::qualified("test", "orders")).await);
        assert_eq!(store.namespaces().await, vec![Namespace::qualified("shop", "orders")]);
    }

    #[tokio::test]
    async fn test_out_to_other_database() {
        let store = MemoryStore::new();
        store.seed(Namespace::new("raw"), docs(json!([{"_id": 1}]))).await;

        store
            .execute(&program(
                ProgramKind::Aggregate,
                Namespace::new("raw"),
                Namespace::qualified("dw", "copy"),
                json!([{"$out": {"db": "dw", "coll": "copy"}}]),
            ))
            .await
            .unwrap();

        assert_eq!(store.documents(&Namespace::qualified("dw", "copy")).await.unwrap().len(), 1);
        assert!(!store.has_namespace(&Namespace::new("copy")).await);
    }

    #[tokio::test]
    async fn test_merge_replace_upserts() {
        let store = MemoryStore::new();
        store.seed(Namespace::new("src"), docs(json!([{"_id": 1, "v": "new"}, {"_id": 2, "v": "b"}]))).await;
        store.seed(Namespace::new("dst"), docs(json!([{"_id": 1, "v": "old", "extra": true}]))).await;

        let stats = store
            .execute(&program(
                ProgramKind::Aggregate,
                Namespace::new("src"),
                Namespace::new("dst"),
                json!([{"$merge": {"into": "dst", "on": "_id", "whenMatched": "replace", "whenNotMatched": "insert"}}]),
            ))
            .await
            .unwrap();

        assert_eq!(stats.documents_written, 2);
        assert_eq!(
            store.documents(&Namespace::new("dst")).await.unwrap(),
            docs(json!([{"_id": 1, "v": "new"}, {"_id": 2, "v": "b"}]))
        );
    }

    #[tokio::test]
    async fn test_merge_fail_rejects_existing_keys_atomically() {
        let store = MemoryStore::new();
        store.seed(Namespace::new("src"), docs(json!([{"_id": 5}, {"_id": 1}]))).await;
        store.seed(Namespace::new("dst"), docs(json!([{"_id": 1}]))).await;

        let err = store
            .execute(&program(
                ProgramKind::Aggregate,
                Namespace::new("src"),
                Namespace::new("dst"),
                json!([{"$merge": {"into": "dst", "on": "_id", "whenMatched": "fail", "whenNotMatched": "insert"}}]),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(store.documents(&Namespace::new("dst")).await.unwrap().len(), 1);
        assert!(store.executed_programs().await.is_empty());
    }

    #[tokio::test]
    async fn test_append_generates_ids() {
        let store = MemoryStore::new();
        store.seed(Namespace::new("events"), docs(json!([{"kind": "a"}]))).await;

        let append = program(
            ProgramKind::Aggregate,
            Namespace::new("events"),
            Namespace::new("log"),
            json!([
                {"$project": {"_id": 0, "kind": 1}},
                {"$merge": {"into": "log", "on": "_id", "whenMatched": "fail", "whenNotMatched": "insert"}}
            ]),
        );
        store.execute(&append).await.unwrap();
        store.execute(&append).await.unwrap();

        let log = store.documents(&Namespace::new("log")).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_ne!(log[0].get("_id"), log[1].get("_id"));
    }

    #[tokio::test]
    async fn test_view_is_evaluated_on_read() {
        let store = MemoryStore::new();
        store.seed(Namespace::new("users"), docs(json!([{"_id": 1, "a": true}]))).await;

        let stats = store
            .execute(&program(
                ProgramKind::View,
                Namespace::new("users"),
                Namespace::new("active_users"),
                json!([{"$match": {"a": true}}]),
            ))
            .await
            .unwrap();
        assert_eq!(stats.documents_written, 0);
        assert!(store.is_view(&Namespace::new("active_users")).await);

        store
            .seed(Namespace::new("users"), docs(json!([{"_id": 1, "a": true}, {"_id": 2, "a": true}])))
            .await;
        assert_eq!(store.documents(&Namespace::new("active_users")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_view_with_write_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .execute(&program(
                ProgramKind::View,
                Namespace::new("users"),
                Namespace::new("v"),
                json!([{"$out": "v"}]),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidProgram(_)));
    }

    #[tokio::test]
    async fn test_aggregate_without_write_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .execute(&program(
                ProgramKind::Aggregate,
                Namespace::new("users"),
                Namespace::new("x"),
                json!([{"$match": {}}]),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidProgram(_)));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.fail_model("broken", StoreError::Execution("boom".to_string())).await;

        let broken = program(
            ProgramKind::Aggregate,
            Namespace::new("users"),
            Namespace::new("broken"),
            json!([{"$out": "broken"}]),
        );
        assert_eq!(
            store.execute(&broken).await.unwrap_err(),
            StoreError::Execution("boom".to_string())
        );

        store.clear_failures().await;
        assert!(store.execute(&broken).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let store = MemoryStore::new().with_connection_failure();
        assert!(matches!(store.test_connection().await, Err(StoreError::Connection(_))));
        assert!(MemoryStore::new().test_connection().await.is_ok());
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let store = MemoryStore::new();
        let clone = store.clone();
        clone.seed(Namespace::new("c"), docs(json!([{"_id": 1}]))).await;
        assert!(store.has_namespace(&Namespace::new("c")).await);

        store.clear().await;
        assert!(clone.namespaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_builder() {
        let store = MemoryStoreBuilder::new()
            .with_collection(Namespace::new("users"), docs(json!([{"name": "a"}])))
            .with_failure("m", StoreError::Cancelled("stop".to_string()))
            .with_name("TestStore")
            .build();

        assert_eq!(store.name(), "TestStore");
        let users = store.documents(&Namespace::new("users")).await.unwrap();
        assert!(users[0].contains_key("_id"));
    }
}
