//! Mermaid rendering of the dependency graph
//!
//! Collections are drawn as cylinders, collection-backed models as boxes and
//! views as rounded boxes. Edges point from a dependency to its dependent.
//! Node ids come from the arena index and names only appear as labels, so
//! any model name renders as its own node.

use std::fmt::Write;

use docweave_core::Source;

use crate::graph::{ModelGraph, NodeId};

/// Render `graph` as a Mermaid flowchart, in graph order
pub fn to_mermaid(graph: &ModelGraph) -> String {
    let mut out = String::from("graph TD\n");

    for node in graph.nodes() {
        let id = node_id(node.id);
        let label = node.name().replace('"', "'");
        let _ = match &node.source {
            Source::Collection(_) => writeln!(out, "    {id}[(\"{label}\")]"),
            Source::Model(model) if model.materialization().is_view() => {
                writeln!(out, "    {id}(\"{label}\")")
            }
            Source::Model(_) => writeln!(out, "    {id}[\"{label}\"]"),
        };
    }

    for (dependency, dependent) in graph.edges() {
        let _ = writeln!(
            out,
            "    {} --> {}",
            node_id(dependency),
            node_id(dependent)
        );
    }

    out
}

fn node_id(id: NodeId) -> String {
    format!("n{id}")
}
