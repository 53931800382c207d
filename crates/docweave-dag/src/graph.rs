//! Dependency graph construction and traversal
//!
//! Nodes live in an arena and are addressed by index. Forward and reverse
//! adjacency lists are kept side by side for planning and impact analysis.
//! Node order is declaration order followed by discovery order, and every
//! deterministic output (plans, diagrams, warnings) follows it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use docweave_core::{ConfigurationError, Model, Source, SourceKind};

use crate::discover::discover_dependencies;

/// Node identifier (index into the graph's arena)
pub type NodeId = usize;

/// Errors raised while building a graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// A collection or model in the graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,

    pub source: Source,

    /// Whether the user declared this model, as opposed to it being
    /// pulled in as a dependency
    pub declared: bool,
}

impl GraphNode {
    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn is_model(&self) -> bool {
        self.kind() == SourceKind::Model
    }

    pub fn model(&self) -> Option<&Arc<Model>> {
        self.source.as_model()
    }
}

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct ModelGraph {
    /// All nodes, indexed by NodeId
    nodes: Vec<GraphNode>,

    /// Name -> node
    index: HashMap<String, NodeId>,

    /// Forward edges: node -> nodes it depends on
    dependencies: Vec<Vec<NodeId>>,

    /// Reverse edges: node -> nodes that depend on it
    dependents: Vec<Vec<NodeId>>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, or return the existing one if the same source is
    /// already present. A different source with the same name is an error.
    pub fn add_node(&mut self, source: Source, declared: bool) -> Result<NodeId, GraphError> {
        self.insert(source, declared).map(|(id, _)| id)
    }

    fn insert(&mut self, source: Source, declared: bool) -> Result<(NodeId, bool), GraphError> {
        if let Some(&id) = self.index.get(source.name()) {
            let node = &mut self.nodes[id];
            if !node.source.same_as(&source) {
                return Err(ConfigurationError::name_conflict(
                    source.name(),
                    node.source.kind(),
                    source.kind(),
                )
                .into());
            }
            node.declared |= declared;
            return Ok((id, false));
        }

        let id = self.nodes.len();
        self.index.insert(source.name().to_string(), id);
        self.nodes.push(GraphNode { id, source, declared });
        self.dependencies.push(Vec::new());
        self.dependents.push(Vec::new());
        Ok((id, true))
    }

    /// Record that `dependent` reads from `dependency`. Repeated edges are ignored.
    pub fn add_edge(&mut self, dependent: NodeId, dependency: NodeId) {
        if self.dependencies[dependent].contains(&dependency) {
            return;
        }
        self.dependencies[dependent].push(dependency);
        self.dependents[dependency].push(dependent);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in graph order
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.id_of(name).map(|id| &self.nodes[id])
    }

    /// Model nodes in graph order (collections excluded)
    pub fn models(&self) -> impl Iterator<Item = &GraphNode> + '_ {
        self.nodes.iter().filter(|node| node.is_model())
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models().map(|node| node.name().to_string()).collect()
    }

    /// Nodes the user declared, in declaration order
    pub fn declared(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.declared).map(|n| n.id).collect()
    }

    /// Immediate dependencies of a node
    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        &self.dependencies[id]
    }

    /// Immediate dependents of a node
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id]
    }

    /// Every edge as `(dependency, dependent)`, grouped by dependent in graph order
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(dependent, deps)| deps.iter().map(move |&dep| (dep, dependent)))
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.iter().map(Vec::len).sum()
    }

    /// All upstream nodes (transitive closure of dependencies), nearest first
    pub fn upstream(&self, id: NodeId) -> Vec<NodeId> {
        Self::closure(id, &self.dependencies)
    }

    /// All downstream nodes (transitive closure of dependents)
    ///
    /// This is the "blast radius" - every model affected if this node fails.
    pub fn downstream(&self, id: NodeId) -> Vec<NodeId> {
        Self::closure(id, &self.dependents)
    }

    /// Names of all downstream nodes of `name`; empty for unknown names
    pub fn downstream_names(&self, name: &str) -> Vec<String> {
        self.id_of(name)
            .map(|id| self.names(&self.downstream(id)))
            .unwrap_or_default()
    }

    /// Names of all upstream nodes of `name`; empty for unknown names
    pub fn upstream_names(&self, name: &str) -> Vec<String> {
        self.id_of(name)
            .map(|id| self.names(&self.upstream(id)))
            .unwrap_or_default()
    }

    /// Check if `dependent` transitively depends on `dependency`
    pub fn has_path(&self, dependency: &str, dependent: &str) -> bool {
        match (self.id_of(dependency), self.id_of(dependent)) {
            (Some(from), Some(to)) => self.downstream(from).contains(&to),
            _ => false,
        }
    }

    pub fn names(&self, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|&id| self.nodes[id].name().to_string()).collect()
    }

    /// The subgraph induced by `keep`, preserving node order
    pub fn subgraph(&self, keep: &HashSet<NodeId>) -> ModelGraph {
        let mut sub = ModelGraph::new();
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();

        for node in self.nodes.iter().filter(|n| keep.contains(&n.id)) {
            let new_id = sub.nodes.len();
            sub.index.insert(node.name().to_string(), new_id);
            sub.nodes.push(GraphNode {
                id: new_id,
                source: node.source.clone(),
                declared: node.declared,
            });
            sub.dependencies.push(Vec::new());
            sub.dependents.push(Vec::new());
            remap.insert(node.id, new_id);
        }

        for (dependency, dependent) in self.edges() {
            if let (Some(&dep), Some(&child)) = (remap.get(&dependency), remap.get(&dependent)) {
                sub.add_edge(child, dep);
            }
        }

        sub
    }

    fn closure(start: NodeId, adjacency: &[Vec<NodeId>]) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<NodeId> = adjacency[start].iter().copied().collect();
        let mut result = Vec::new();

        // BFS over the adjacency list
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            result.push(current);

            for &next in &adjacency[current] {
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        result
    }
}

/// Builds the full graph from a set of declared models
///
/// Starting from the declared models, follows every upstream link and every
/// source discovered inside pipelines until only collections remain.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    declared: Vec<Arc<Model>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a model; declaring the same model twice is harmless
    pub fn declare(mut self, model: Arc<Model>) -> Self {
        self.declared.push(model);
        self
    }

    pub fn declare_all(mut self, models: impl IntoIterator<Item = Arc<Model>>) -> Self {
        self.declared.extend(models);
        self
    }

    /// Compute the dependency closure of the declared models
    pub fn build(&self) -> Result<ModelGraph, GraphError> {
        let mut graph = ModelGraph::new();
        let mut queue = VecDeque::new();

        for model in &self.declared {
            let (id, inserted) = graph.insert(Source::Model(model.clone()), true)?;
            if inserted {
                queue.push_back(id);
            }
        }

        while let Some(id) = queue.pop_front() {
            let Some(model) = graph.node(id).model().cloned() else {
                // Collections are leaves
                continue;
            };

            for dependency in discover_dependencies(&model) {
                let (dep_id, inserted) = graph.insert(dependency, false)?;
                if inserted {
                    queue.push_back(dep_id);
                }
                graph.add_edge(id, dep_id);
            }
        }

        tracing::debug!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            declared = self.declared.len(),
            "built model graph"
        );

        Ok(graph)
    }
}
