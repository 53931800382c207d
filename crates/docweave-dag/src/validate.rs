//! Graph validation
//!
//! Cycles are fatal. Disconnected groups of models only produce a warning:
//! they are allowed but usually point at a modeling mistake.

use serde::{Deserialize, Serialize};

use crate::graph::{ModelGraph, NodeId};

/// Structural problem that blocks planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValidationError {
    /// `path` lists the chain of dependencies, first element repeated at the end
    #[error("cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Warning category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningKind {
    /// The graph splits into several disconnected groups
    Orphan,
}

/// Non-fatal structural finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    #[serde(rename = "type")]
    pub kind: WarningKind,

    /// Models the warning is about
    pub models: Vec<String>,
}

/// Outcome of [`validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validate a graph: report every cycle and warn about disconnected groups
pub fn validate(graph: &ModelGraph) -> ValidationResult {
    let errors: Vec<ValidationError> = find_cycles(graph)
        .into_iter()
        .map(|cycle| ValidationError::Cycle {
            path: graph.names(&cycle),
        })
        .collect();

    let mut warnings = Vec::new();
    if let Some(roots) = disconnected_roots(graph) {
        warnings.push(ValidationWarning {
            kind: WarningKind::Orphan,
            models: roots,
        });
    }

    for error in &errors {
        tracing::error!(%error, "invalid model graph");
    }
    for warning in &warnings {
        tracing::warn!(models = ?warning.models, "model graph has disconnected groups");
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Three-color depth-first search, iterative so stack depth stays bounded.
/// Each back edge to a node still in progress yields one cycle.
fn find_cycles(graph: &ModelGraph) -> Vec<Vec<NodeId>> {
    let mut color = vec![Color::White; graph.len()];
    let mut cycles = Vec::new();

    for start in 0..graph.len() {
        if color[start] != Color::White {
            continue;
        }

        // (node, index of the next dependency to visit)
        let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];
        color[start] = Color::Gray;

        while let Some(top) = stack.last_mut() {
            let (node, next) = *top;
            let deps = graph.dependencies(node);

            if next == deps.len() {
                color[node] = Color::Black;
                stack.pop();
                continue;
            }
            top.1 += 1;

            let child = deps[next];
            match color[child] {
                Color::White => {
                    color[child] = Color::Gray;
                    stack.push((child, 0));
                }
                Color::Gray => {
                    let pos = stack.iter().position(|&(n, _)| n == child).unwrap_or(0);
                    let mut cycle: Vec<NodeId> = stack[pos..].iter().map(|&(n, _)| n).collect();
                    cycle.push(child);
                    cycles.push(cycle);
                }
                Color::Black => {}
            }
        }
    }

    cycles
}

/// When the connected part of the graph splits into more than one weakly
/// connected component, the root models (no dependents) of all components
fn disconnected_roots(graph: &ModelGraph) -> Option<Vec<String>> {
    let mut parent: Vec<NodeId> = (0..graph.len()).collect();

    fn find(parent: &mut [NodeId], mut x: NodeId) -> NodeId {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for (dependency, dependent) in graph.edges() {
        let a = find(&mut parent, dependency);
        let b = find(&mut parent, dependent);
        if a != b {
            parent[a.max(b)] = a.min(b);
        }
    }

    let mut components: Vec<NodeId> = Vec::new();
    for node in graph.nodes() {
        let connected = !graph.dependencies(node.id).is_empty() || !graph.dependents(node.id).is_empty();
        if !connected {
            continue;
        }
        let root = find(&mut parent, node.id);
        if !components.contains(&root) {
            components.push(root);
        }
    }

    if components.len() <= 1 {
        return None;
    }

    Some(
        graph
            .models()
            .filter(|node| graph.dependents(node.id).is_empty())
            .map(|node| node.name().to_string())
            .collect(),
    )
}
