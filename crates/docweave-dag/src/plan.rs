//! Execution planning
//!
//! Layers the graph with Kahn's algorithm. Every model in a stage has all of
//! its dependencies in strictly earlier stages, so models within a stage are
//! independent of each other. Collections are never scheduled.

use serde::{Deserialize, Serialize};

use crate::graph::{ModelGraph, NodeId};

/// Errors raised while planning
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle among models: {}", .remaining.join(", "))]
    Cycle { remaining: Vec<String> },
}

/// Ordered stages of mutually independent models
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Number of models across all stages
    pub fn model_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    /// Models in execution order
    pub fn models(&self) -> impl Iterator<Item = &str> + '_ {
        self.stages.iter().flatten().map(String::as_str)
    }

    /// Stage index of a model
    pub fn stage_of(&self, model: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.iter().any(|name| name == model))
    }
}

/// Layer the graph's models into execution stages
///
/// Ties within a stage follow graph order (declaration, then discovery).
pub fn plan(graph: &ModelGraph) -> Result<ExecutionPlan, PlanError> {
    // Unresolved model dependencies per node; collections are always satisfied
    let mut in_degree: Vec<usize> = graph
        .nodes()
        .iter()
        .map(|node| {
            graph
                .dependencies(node.id)
                .iter()
                .filter(|&&dep| graph.node(dep).is_model())
                .count()
        })
        .collect();

    let mut frontier: Vec<NodeId> = graph
        .models()
        .filter(|node| in_degree[node.id] == 0)
        .map(|node| node.id)
        .collect();

    let total = graph.models().count();
    let mut placed = 0;
    let mut stages = Vec::new();

    while !frontier.is_empty() {
        frontier.sort_unstable();
        placed += frontier.len();

        let mut next = Vec::new();
        for &id in &frontier {
            for &dependent in graph.dependents(id) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }

        stages.push(graph.names(&frontier));
        frontier = next;
    }

    if placed < total {
        let remaining = graph
            .models()
            .filter(|node| in_degree[node.id] > 0)
            .map(|node| node.name().to_string())
            .collect();
        return Err(PlanError::Cycle { remaining });
    }

    tracing::debug!(stages = stages.len(), models = placed, "planned execution");

    Ok(ExecutionPlan { stages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use docweave_core::{Lookup, Model, Pipeline, Source};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn model(name: &str, source: impl Into<Source>) -> Arc<Model> {
        Model::builder(name, source).build_shared().unwrap()
    }

    fn stages(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
        plan.stages
            .iter()
            .map(|stage| stage.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn fan_out_produces_two_stages() {
        let base = model("base", Source::collection("raw"));
        let left = model("left", base.clone());
        let right = model("right", base);

        let graph = GraphBuilder::new().declare(left).declare(right).build().unwrap();
        let plan = plan(&graph).unwrap();

        assert_eq!(stages(&plan), vec![vec!["base"], vec!["left", "right"]]);
    }

    #[test]
    fn every_edge_points_to_an_earlier_stage() {
        let a = model("a", Source::collection("raw"));
        let b = model("b", a.clone());
        let c = model("c", Source::collection("other"));
        let d = Model::builder("d", b.clone())
            .pipeline(Pipeline::new().lookup(Lookup::new(c.clone(), "c_id", "_id", "c")))
            .build_shared()
            .unwrap();
        let e = model("e", d.clone());

        let graph = GraphBuilder::new().declare(e).declare(a).build().unwrap();
        let plan = plan(&graph).unwrap();

        assert_eq!(plan.model_count(), graph.models().count());
        for (dependency, dependent) in graph.edges() {
            let dep = graph.node(dependency);
            if !dep.is_model() {
                continue;
            }
            let dependent_stage = plan.stage_of(graph.node(dependent).name()).unwrap();
            let dependency_stage = plan.stage_of(dep.name()).unwrap();
            assert!(dependency_stage < dependent_stage, "{} before {}", dep.name(), graph.node(dependent).name());
        }
        assert_eq!(stages(&plan), vec![vec!["a", "c"], vec!["b"], vec!["d"], vec!["e"]]);
    }

    #[test]
    fn collections_are_not_scheduled() {
        let graph = GraphBuilder::new()
            .declare(model("only", Source::collection("raw")))
            .build()
            .unwrap();
        let plan = plan(&graph).unwrap();

        assert_eq!(stages(&plan), vec![vec!["only"]]);
        assert_eq!(plan.models().collect::<Vec<_>>(), vec!["only"]);
    }

    #[test]
    fn cycle_is_a_planning_error() {
        let a = model("a", Source::collection("raw"));
        let b = model("b", a.clone());
        let mut graph = GraphBuilder::new().declare(b).build().unwrap();
        let a_id = graph.id_of("a").unwrap();
        let b_id = graph.id_of("b").unwrap();
        graph.add_edge(a_id, b_id);

        let err = plan(&graph).unwrap_err();
        assert_eq!(
            err,
            PlanError::Cycle {
                remaining: vec!["b".to_string(), "a".to_string()]
            }
        );
    }

    #[test]
    fn empty_graph_plans_nothing() {
        let plan = plan(&ModelGraph::new()).unwrap();
        assert!(plan.is_empty());
    }
}
