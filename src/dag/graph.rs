// src/dag/graph.rs

use std::collections::HashMap;

use crate::dag::node::{Node, NodeId};
use crate::errors::{DagwaveError, Result};

/// Immutable dependency graph.
///
/// Nodes keep their insertion order, which is used as the stable tie-break
/// wherever the orchestrator needs a deterministic ordering. There are no
/// mutators: build a graph with [`GraphBuilder`].
///
/// Dependencies on unknown node IDs are kept on the node (so validation can
/// report them) but never appear in the adjacency.
#[derive(Debug, Clone)]
pub struct Graph {
    id: String,
    name: String,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
}

impl Graph {
    pub fn builder(id: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(id)
    }

    /// Assemble a graph from nodes that are already known to have unique IDs.
    pub(crate) fn from_unique_nodes(id: String, name: String, nodes: Vec<Node>) -> Self {
        let index: HashMap<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut dependents: HashMap<NodeId, Vec<NodeId>> = nodes
            .iter()
            .map(|n| (n.id.clone(), Vec::new()))
            .collect();

        for node in &nodes {
            for dep in &node.dependencies {
                if let Some(list) = dependents.get_mut(dep) {
                    if !list.contains(&node.id) {
                        list.push(node.id.clone());
                    }
                }
            }
        }

        Self {
            id,
            name,
            nodes,
            index,
            dependents,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }

    /// Insertion index of a node.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Immediate dependencies of a node, as declared (may include unknown IDs).
    pub fn dependencies_of(&self, id: &str) -> &[NodeId] {
        self.node(id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a node (nodes that list it as a dependency).
    pub fn dependents_of(&self, id: &str) -> &[NodeId] {
        self.dependents
            .get(id)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Number of edges between existing nodes.
    pub fn edge_count(&self) -> usize {
        self.dependents.values().map(Vec::len).sum()
    }
}

/// Separate construction stage for [`Graph`].
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    id: String,
    name: Option<String>,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            nodes: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Freeze the graph. Fails only on duplicate node IDs; structural problems
    /// such as cycles or dangling dependencies are reported by
    /// [`validate_dag`](crate::dag::topology::validate_dag).
    pub fn build(self) -> Result<Graph> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(DagwaveError::DuplicateNode(node.id.clone()));
            }
        }

        let name = self.name.unwrap_or_else(|| self.id.clone());
        Ok(Graph::from_unique_nodes(self.id, name, self.nodes))
    }
}
