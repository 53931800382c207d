//! End-to-end tests: projects run against the in-memory store
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p docweave-engine --test integration_tests
//! ```

use std::sync::{Arc, Mutex};

use docweave_core::{
    Document, Lookup, MaterializationConfig, Model, Namespace, Pipeline, Source,
};
use docweave_dag::{GraphBuilder, Manifest, WarningKind};
use docweave_engine::{Executor, Project, RunError, RunOptions};
use docweave_store::{DocumentStore, MemoryStore, StoreError};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

// =============================================================================
// Helper Functions
// =============================================================================

fn docs(value: Value) -> Vec<Document> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

fn as_json(documents: Vec<Document>) -> Value {
    Value::Array(documents.into_iter().map(Value::Object).collect())
}

fn model(name: &str, source: impl Into<Source>) -> Arc<Model> {
    Model::builder(name, source).build_shared().unwrap()
}

fn position(list: &[String], name: &str) -> usize {
    list.iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("{name} missing from {list:?}"))
}

/// base <- left, base <- right, both declared
fn fan_out() -> Project {
    let base = model("base", Source::collection("raw"));
    let left = Model::builder("left", base.clone())
        .pipeline(Pipeline::new().match_(json!({"side": "l"})))
        .build_shared()
        .unwrap();
    let right = Model::builder("right", base)
        .pipeline(Pipeline::new().match_(json!({"side": "r"})))
        .build_shared()
        .unwrap();
    Project::new("fan_out").with_model(left).with_model(right)
}

async fn fan_out_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .seed(
            Namespace::new("raw"),
            docs(json!([{"_id": 1, "side": "l"}, {"_id": 2, "side": "r"}, {"_id": 3, "side": "r"}])),
        )
        .await;
    store
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_filter_then_aggregate() {
    let store = MemoryStore::new();
    store
        .seed(
            Namespace::new("events"),
            docs(json!([
                {"_id": 1, "value": 10, "active": true},
                {"_id": 2, "value": 20, "active": true},
                {"_id": 3, "value": 30, "active": false}
            ])),
        )
        .await;

    let staging = Model::builder("stg_events", Source::collection("events"))
        .pipeline(Pipeline::new().match_(json!({"active": true})))
        .build_shared()
        .unwrap();
    let totals = Model::builder("event_totals", staging)
        .pipeline(Pipeline::new().group(json!({
            "_id": null,
            "total": {"$sum": "$value"},
            "count": {"$sum": 1}
        })))
        .build_shared()
        .unwrap();

    let project = Project::new("events").with_model(totals);
    let result = project
        .run(Arc::new(store.clone()), &RunOptions::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.models_run, vec!["stg_events", "event_totals"]);
    assert_eq!(
        as_json(store.documents(&Namespace::new("stg_events")).await.unwrap()),
        json!([
            {"_id": 1, "value": 10, "active": true},
            {"_id": 2, "value": 20, "active": true}
        ])
    );
    assert_eq!(
        as_json(store.documents(&Namespace::new("event_totals")).await.unwrap()),
        json!([{"_id": null, "total": 30, "count": 2}])
    );
    assert_eq!(result.stats["event_totals"].documents_written, 1);
}

#[tokio::test]
async fn test_nested_join_discovers_every_model() {
    let store = MemoryStore::new();
    store
        .seed(Namespace::new("orders"), docs(json!([{"_id": 1, "user_id": 10}, {"_id": 2, "user_id": 11}])))
        .await;
    store
        .seed(
            Namespace::new("users"),
            docs(json!([
                {"_id": 10, "name": "ann", "region_id": "eu"},
                {"_id": 11, "name": "bob", "region_id": "us"}
            ])),
        )
        .await;
    store
        .seed(
            Namespace::new("regions"),
            docs(json!([{"_id": "eu", "label": "Europe"}, {"_id": "us", "label": "Americas"}])),
        )
        .await;

    let stg_orders = model("stg_orders", Source::collection("orders"));
    let stg_users = model("stg_users", Source::collection("users"));
    let stg_regions = model("stg_regions", Source::collection("regions"));
    let region_names = Model::builder("region_names", stg_regions)
        .pipeline(Pipeline::new().project(json!({"label": 1})))
        .build_shared()
        .unwrap();

    let report = Model::builder("order_report", stg_orders)
        .pipeline(
            Pipeline::new()
                .lookup(
                    Lookup::new(stg_users, "user_id", "_id", "user").pipeline(
                        Pipeline::new().lookup(Lookup::new(region_names, "region_id", "_id", "region")),
                    ),
                )
                .unwind("$user")
                .unwind("$user.region")
                .project(json!({"_id": 1, "name": "$user.name", "region": "$user.region.label"}))
                .sort(json!({"_id": 1})),
        )
        .build_shared()
        .unwrap();

    let project = Project::new("shop").with_model(report);
    assert_eq!(project.models().unwrap().len(), 5);

    let result = project
        .run(Arc::new(store.clone()), &RunOptions::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.models_run.len(), 5);
    for (dependency, dependent) in [
        ("stg_orders", "order_report"),
        ("stg_users", "order_report"),
        ("region_names", "order_report"),
        ("stg_regions", "region_names"),
    ] {
        assert!(
            position(&result.models_run, dependency) < position(&result.models_run, dependent),
            "{dependency} should run before {dependent}"
        );
    }

    assert_eq!(
        as_json(store.documents(&Namespace::new("order_report")).await.unwrap()),
        json!([
            {"_id": 1, "name": "ann", "region": "Europe"},
            {"_id": 2, "name": "bob", "region": "Americas"}
        ])
    );
}

#[tokio::test]
async fn test_fan_out_plans_two_stages() {
    let project = fan_out();
    let plan = project.plan().unwrap();

    assert_eq!(
        plan.stages,
        vec![vec!["base".to_string()], vec!["left".to_string(), "right".to_string()]]
    );

    let store = fan_out_store().await;
    let result = project
        .run(Arc::new(store.clone()), &RunOptions::new())
        .await
        .unwrap();
    assert_eq!(result.models_run[0], "base");
    assert_eq!(store.documents(&Namespace::new("right")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let store = fan_out_store().await;
    let before = store.namespaces().await;

    let result = fan_out()
        .run(Arc::new(store.clone()), &RunOptions::new().dry_run(true))
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.models_run.is_empty());
    assert!(result.models_failed.is_empty());
    assert_eq!(store.namespaces().await, before);
    assert!(store.executed_programs().await.is_empty());
}

#[tokio::test]
async fn test_target_runs_only_its_ancestry() {
    let store = fan_out_store().await;
    let result = fan_out()
        .run(Arc::new(store.clone()), &RunOptions::new().target("left"))
        .await
        .unwrap();

    assert_eq!(result.models_run, vec!["base", "left"]);
    assert!(!store.has_namespace(&Namespace::new("right")).await);
}

#[tokio::test]
async fn test_unknown_target_is_rejected() {
    let store = MemoryStore::new();
    let err = fan_out()
        .run(Arc::new(store), &RunOptions::new().target("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::UnknownModel(name) if name == "missing"));
}

#[tokio::test]
async fn test_exclude() {
    let store = fan_out_store().await;
    let result = fan_out()
        .run(Arc::new(store.clone()), &RunOptions::new().exclude(["right"]))
        .await
        .unwrap();
    assert_eq!(result.models_run, vec!["base", "left"]);

    // Excluding something the rest needs is a configuration error
    let err = fan_out()
        .run(Arc::new(store), &RunOptions::new().exclude(["base"]))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::ExcludedDependency { dependency, .. } if dependency == "base"));
}

#[tokio::test]
async fn test_failure_skips_dependents_only() {
    let store = MemoryStore::new();
    store
        .fail_model("bad_base", StoreError::Execution("boom".to_string()))
        .await;

    let bad_base = model("bad_base", Source::collection("a"));
    let bad_child = model("bad_child", bad_base);
    let bad_grandchild = model("bad_grandchild", bad_child);
    let good_base = model("good_base", Source::collection("b"));
    let good_child = model("good_child", good_base);

    let project = Project::new("mixed")
        .with_model(bad_grandchild)
        .with_model(good_child);

    let result = project
        .run(Arc::new(store.clone()), &RunOptions::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.models_failed.len(), 1);
    assert_eq!(result.models_failed[0].name, "bad_base");
    assert!(result.models_failed[0].error.contains("boom"));
    assert_eq!(result.models_skipped, vec!["bad_child", "bad_grandchild"]);
    assert_eq!(result.models_run, vec!["good_base", "good_child"]);
    assert!(store.has_namespace(&Namespace::new("good_child")).await);
}

#[tokio::test]
async fn test_panicking_model_is_a_failure() {
    let bad = model("bad", Source::collection("a"));
    let child = model("child", bad);
    let good = model("good", Source::collection("b"));
    let project = Project::new("panics").with_model(child).with_model(good);

    let options = RunOptions::new().on_model_start(|name| {
        if name == "bad" {
            panic!("callback blew up");
        }
    });

    let store = MemoryStore::new();
    let result = project
        .run(Arc::new(store.clone()), &options)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.models_failed.len(), 1);
    assert_eq!(result.models_failed[0].name, "bad");
    assert!(result.models_failed[0].error.contains("task panicked"));
    assert_eq!(result.models_skipped, vec!["child"]);
    assert_eq!(result.models_run, vec!["good"]);
    assert!(store.has_namespace(&Namespace::new("good")).await);
    assert!(!store.has_namespace(&Namespace::new("child")).await);
}

#[tokio::test]
async fn test_callbacks_observe_every_model() {
    let started = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(Mutex::new(Vec::new()));

    let options = {
        let started = Arc::clone(&started);
        let completed = Arc::clone(&completed);
        RunOptions::new()
            .on_model_start(move |name| started.lock().unwrap().push(name.to_string()))
            .on_model_complete(move |name, stats| {
                completed
                    .lock()
                    .unwrap()
                    .push((name.to_string(), stats.documents_written))
            })
    };

    let store = fan_out_store().await;
    let result = fan_out().run(Arc::new(store), &options).await.unwrap();

    assert!(result.success);
    let mut started = started.lock().unwrap().clone();
    started.sort();
    assert_eq!(started, vec!["base", "left", "right"]);

    let mut completed = completed.lock().unwrap().clone();
    completed.sort();
    assert_eq!(
        completed,
        vec![
            ("base".to_string(), 3),
            ("left".to_string(), 1),
            ("right".to_string(), 2)
        ]
    );
}

#[tokio::test]
async fn test_concurrency_is_bounded_per_stage() {
    let store = MemoryStore::new().with_latency(30);
    let mut project = Project::new("wide");
    for i in 0..4 {
        project.add_model(model(&format!("m{i}"), Source::collection(format!("c{i}"))));
    }

    let result = project
        .run(Arc::new(store.clone()), &RunOptions::new().max_concurrency(2))
        .await
        .unwrap();

    assert_eq!(result.models_run.len(), 4);
    assert_eq!(store.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_orphans_warn_but_run() {
    let a = model("a", Source::collection("x"));
    let b = model("b", Source::collection("y"));
    let project = Project::new("orphans").with_model(a).with_model(b);

    let validation = project.validate().unwrap();
    assert!(validation.valid);
    assert_eq!(validation.warnings.len(), 1);
    assert_eq!(validation.warnings[0].kind, WarningKind::Orphan);
    assert_eq!(validation.warnings[0].models, vec!["a", "b"]);

    let result = project
        .run(Arc::new(MemoryStore::new()), &RunOptions::new())
        .await
        .unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn test_invalid_graph_refuses_to_run() {
    let a = model("a", Source::collection("x"));
    let b = model("b", a);
    let mut graph = GraphBuilder::new().declare(b).build().unwrap();
    let (a_id, b_id) = (graph.id_of("a").unwrap(), graph.id_of("b").unwrap());
    graph.add_edge(a_id, b_id);

    let store = MemoryStore::new();
    let err = Executor::new(Arc::new(store.clone()))
        .run(&graph, &RunOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::InvalidGraph { ref errors } if errors.len() == 1));
    assert!(store.executed_programs().await.is_empty());
}

#[tokio::test]
async fn test_view_feeds_downstream_model() {
    let store = MemoryStore::new();
    store
        .seed(Namespace::new("users"), docs(json!([{"_id": 1, "active": true}, {"_id": 2, "active": false}])))
        .await;

    let active = Model::builder("active_users", Source::collection("users"))
        .pipeline(Pipeline::new().match_(json!({"active": true})))
        .materialization(MaterializationConfig::view())
        .build_shared()
        .unwrap();
    let counted = Model::builder("active_count", active)
        .pipeline(Pipeline::new().count("n"))
        .build_shared()
        .unwrap();

    let result = Project::new("views")
        .with_model(counted)
        .run(Arc::new(store.clone()), &RunOptions::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.stats["active_users"].documents_written, 0);
    assert!(store.is_view(&Namespace::new("active_users")).await);
    let counts = store.documents(&Namespace::new("active_count")).await.unwrap();
    assert_eq!(counts[0].get("n"), Some(&json!(1)));
}

#[tokio::test]
async fn test_manifest_project_runs() {
    let manifest = Manifest::from_json(
        &json!({
            "name": "shop",
            "collections": [{"name": "orders", "database": "raw"}],
            "models": [
                {"name": "paid_orders", "from": "orders", "pipeline": [{"$match": {"paid": true}}]},
                {"name": "revenue", "from": "paid_orders", "pipeline": [
                    {"$group": {"_id": null, "total": {"$sum": "$amount"}}}
                ], "materialize": {"type": "collection", "mode": "upsert", "database": "reporting"}}
            ],
            "declared": ["revenue"],
            "seeds": {"orders": [
                {"_id": 1, "amount": 10, "paid": true},
                {"_id": 2, "amount": 5, "paid": false},
                {"_id": 3, "amount": 7, "paid": true}
            ]}
        })
        .to_string(),
    )
    .unwrap();
    let resolved = manifest.resolve().unwrap();

    let store = MemoryStore::new();
    for (name, documents) in &resolved.seeds {
        store.seed(resolved.seed_namespace(name), documents.clone()).await;
    }

    let project = Project::from_manifest(&resolved);
    let store_handle: Arc<dyn DocumentStore> = Arc::new(store.clone());
    let result = project.run(store_handle, &RunOptions::new()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.models_run, vec!["paid_orders", "revenue"]);
    assert_eq!(
        as_json(store.documents(&Namespace::qualified("reporting", "revenue")).await.unwrap()),
        json!([{"_id": null, "total": 17}])
    );
}
