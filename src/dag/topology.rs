// src/dag/topology.rs

//! Pure topology queries over an immutable [`Graph`].
//!
//! Everything here is read-only and deterministic: nodes inside a wave are
//! ordered by descending priority, then by insertion order.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use thiserror::Error;

use crate::dag::graph::Graph;
use crate::dag::node::NodeId;

/// A group of nodes that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wave {
    pub index: usize,
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DagStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub root_nodes: usize,
    pub leaf_nodes: usize,
    pub wave_count: usize,
    /// Width of the widest wave.
    pub max_parallelism: usize,
    pub avg_parallelism: f64,
}

/// Successful output of [`topological_sort`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologicalOrder {
    /// Flat order: waves concatenated.
    pub order: Vec<NodeId>,
    pub waves: Vec<Wave>,
    pub stats: DagStats,
}

impl TopologicalOrder {
    /// Wave index of every node.
    pub fn wave_of(&self) -> HashMap<&str, usize> {
        self.waves
            .iter()
            .flat_map(|w| w.node_ids.iter().map(move |id| (id.as_str(), w.index)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// `cycle[i + 1]` is a dependency of `cycle[i]`; first and last match.
    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<NodeId>),

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    MissingDependency { node: NodeId, dependency: NodeId },
}

/// Kahn's algorithm with explicit waves.
///
/// Dangling dependencies are a structural error; a cycle is reported with a
/// concrete path.
pub fn topological_sort(graph: &Graph) -> Result<TopologicalOrder, TopologyError> {
    if let Some((node, dependency)) = first_missing_dependency(graph) {
        return Err(TopologyError::MissingDependency { node, dependency });
    }

    let (waves, remaining) = kahn_waves(graph);
    if !remaining.is_empty() {
        return Err(TopologyError::Cycle(extract_cycle(graph, &remaining)));
    }

    let order = waves
        .iter()
        .flat_map(|w| w.node_ids.iter().cloned())
        .collect();
    let stats = compute_stats(graph, &waves);

    Ok(TopologicalOrder {
        order,
        waves,
        stats,
    })
}

pub fn is_acyclic(graph: &Graph) -> bool {
    get_cycle(graph).is_none()
}

/// The first cycle found, if any. Dangling dependencies are ignored here.
pub fn get_cycle(graph: &Graph) -> Option<Vec<NodeId>> {
    let (_, remaining) = kahn_waves(graph);
    if remaining.is_empty() {
        None
    } else {
        Some(extract_cycle(graph, &remaining))
    }
}

fn first_missing_dependency(graph: &Graph) -> Option<(NodeId, NodeId)> {
    graph.nodes().find_map(|node| {
        node.dependencies
            .iter()
            .find(|dep| !graph.contains(dep))
            .map(|dep| (node.id.clone(), dep.clone()))
    })
}

/// Returns the waves that could be placed and the IDs left over (non-empty
/// only when the graph has a cycle).
fn kahn_waves(graph: &Graph) -> (Vec<Wave>, HashSet<&str>) {
    let mut in_degree: HashMap<&str, usize> = graph
        .nodes()
        .map(|node| {
            let known: HashSet<&str> = node
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|dep| graph.contains(dep))
                .collect();
            (node.id.as_str(), known.len())
        })
        .collect();

    let mut current: Vec<&str> = graph
        .node_ids()
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();

    let mut waves = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    while !current.is_empty() {
        sort_wave(graph, &mut current);

        let mut next = Vec::new();
        for &id in &current {
            placed.insert(id);
            for dependent in graph.dependents_of(id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        next.push(dependent.as_str());
                    }
                }
            }
        }

        waves.push(Wave {
            index: waves.len(),
            node_ids: current.iter().map(|id| id.to_string()).collect(),
        });
        current = next;
    }

    let remaining = graph.node_ids().filter(|id| !placed.contains(id)).collect();
    (waves, remaining)
}

fn sort_wave(graph: &Graph, ids: &mut [&str]) {
    ids.sort_by_key(|id| {
        let priority = graph.node(id).map(|n| n.priority).unwrap_or(0);
        let position = graph.position(id).unwrap_or(usize::MAX);
        (std::cmp::Reverse(priority), position)
    });
}

/// DFS over the nodes Kahn could not place, following dependency edges.
///
/// Every leftover node has at least one leftover dependency, so the walk
/// always closes a loop.
fn extract_cycle(graph: &Graph, remaining: &HashSet<&str>) -> Vec<NodeId> {
    let mut finished: HashSet<&str> = HashSet::new();

    for start in graph.node_ids().filter(|id| remaining.contains(id)) {
        if finished.contains(start) {
            continue;
        }

        let mut path: Vec<(&str, usize)> = vec![(start, 0)];
        let mut on_path: HashSet<&str> = HashSet::from([start]);

        while let Some(&(id, next)) = path.last() {
            let deps = graph.dependencies_of(id);
            if next >= deps.len() {
                path.pop();
                on_path.remove(id);
                finished.insert(id);
                continue;
            }
            if let Some(top) = path.last_mut() {
                top.1 += 1;
            }

            let dep = deps[next].as_str();
            if !remaining.contains(dep) || finished.contains(dep) {
                continue;
            }

            if on_path.contains(dep) {
                let from = path.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                let mut cycle: Vec<NodeId> =
                    path[from..].iter().map(|(n, _)| n.to_string()).collect();
                cycle.push(dep.to_string());
                return cycle;
            }

            on_path.insert(dep);
            path.push((dep, 0));
        }
    }

    Vec::new()
}

fn compute_stats(graph: &Graph, waves: &[Wave]) -> DagStats {
    let root_nodes = graph
        .nodes()
        .filter(|n| n.dependencies.is_empty())
        .count();
    let leaf_nodes = graph
        .node_ids()
        .filter(|id| graph.dependents_of(id).is_empty())
        .count();
    let max_parallelism = waves.iter().map(|w| w.node_ids.len()).max().unwrap_or(0);
    let avg_parallelism = if waves.is_empty() {
        0.0
    } else {
        graph.len() as f64 / waves.len() as f64
    };

    DagStats {
        total_nodes: graph.len(),
        total_edges: graph.edge_count(),
        root_nodes,
        leaf_nodes,
        wave_count: waves.len(),
        max_parallelism,
        avg_parallelism,
    }
}

/// Longest dependency chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalPath {
    /// From a root to the last node of the chain.
    pub path: Vec<NodeId>,
    /// Sum of node costs along the path (node count when no costs are given).
    pub cost: u64,
}

impl CriticalPath {
    pub fn len(&self) -> usize {
        self.path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

/// Longest path by node count, or by `costs` when supplied (missing entries
/// cost 1). Dynamic programming over the topological order.
pub fn find_critical_path(
    graph: &Graph,
    costs: Option<&HashMap<NodeId, u64>>,
) -> Result<CriticalPath, TopologyError> {
    let sorted = topological_sort(graph)?;
    let cost_of = |id: &str| costs.and_then(|c| c.get(id).copied()).unwrap_or(1);

    let mut dist: HashMap<&str, u64> = HashMap::new();
    let mut pred: HashMap<&str, &str> = HashMap::new();

    for id in &sorted.order {
        let id = id.as_str();
        let mut best: Option<(&str, u64)> = None;
        for dep in graph.dependencies_of(id) {
            let d = dist.get(dep.as_str()).copied().unwrap_or(0);
            if best.is_none_or(|(_, b)| d > b) {
                best = Some((dep.as_str(), d));
            }
        }

        let upstream = match best {
            Some((dep, d)) => {
                pred.insert(id, dep);
                d
            }
            None => 0,
        };
        dist.insert(id, upstream + cost_of(id));
    }

    let mut end: Option<(&str, u64)> = None;
    for id in &sorted.order {
        let d = dist.get(id.as_str()).copied().unwrap_or(0);
        if end.is_none_or(|(_, best)| d > best) {
            end = Some((id.as_str(), d));
        }
    }

    let Some((end, cost)) = end else {
        return Ok(CriticalPath {
            path: Vec::new(),
            cost: 0,
        });
    };

    let mut path = vec![end.to_string()];
    let mut current = end;
    while let Some(&p) = pred.get(current) {
        path.push(p.to_string());
        current = p;
    }
    path.reverse();

    Ok(CriticalPath { path, cost })
}

/// The given nodes plus all their transitive dependencies, as a new graph.
///
/// Unknown IDs in `node_ids` are ignored; dependencies that fall outside the
/// extracted set are dropped from the copied nodes.
pub fn extract_subgraph(graph: &Graph, node_ids: &[&str]) -> Graph {
    let mut included: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<&str> = node_ids.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if !graph.contains(id) || !included.insert(id.to_string()) {
            continue;
        }
        for dep in graph.dependencies_of(id) {
            if !included.contains(dep) {
                queue.push_back(dep.as_str());
            }
        }
    }

    let nodes = graph
        .nodes()
        .filter(|n| included.contains(&n.id))
        .map(|n| {
            let mut node = n.clone();
            node.dependencies.retain(|d| included.contains(d));
            node
        })
        .collect();

    Graph::from_unique_nodes(
        graph.id().to_string(),
        format!("{} (subgraph)", graph.name()),
        nodes,
    )
}

/// Every node that depends on `node_id`, directly or transitively.
pub fn find_transitive_dependents(graph: &Graph, node_id: &str) -> HashSet<NodeId> {
    closure(node_id, |id| graph.dependents_of(id))
}

/// Every node `node_id` depends on, directly or transitively.
pub fn find_transitive_dependencies(graph: &Graph, node_id: &str) -> HashSet<NodeId> {
    closure(node_id, |id| graph.dependencies_of(id))
}

fn closure<'g>(start: &str, next: impl Fn(&str) -> &'g [NodeId]) -> HashSet<NodeId> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<&'g str> = next(start).iter().map(String::as_str).collect();

    while let Some(id) = stack.pop() {
        if id == start || !seen.insert(id.to_string()) {
            continue;
        }
        stack.extend(next(id).iter().map(String::as_str));
    }

    seen
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    EmptyGraph,
    Cycle,
    MissingDependency,
    SelfDependency,
    OrphanNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
    pub node_ids: Vec<NodeId>,
}

/// Output of [`validate_dag`]: errors block execution, warnings do not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has(&self, kind: IssueKind) -> bool {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .any(|i| i.kind == kind)
    }

    /// One line per error, for run-level failure messages.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Collect every structural problem. Never fails.
pub fn validate_dag(graph: &Graph) -> ValidationReport {
    let mut report = ValidationReport::default();

    if graph.is_empty() {
        report.errors.push(ValidationIssue {
            kind: IssueKind::EmptyGraph,
            message: "graph has no nodes".to_string(),
            node_ids: Vec::new(),
        });
        return report;
    }

    let mut self_loops = HashSet::new();
    for node in graph.nodes() {
        for dep in &node.dependencies {
            if *dep == node.id {
                self_loops.insert(node.id.as_str());
                report.errors.push(ValidationIssue {
                    kind: IssueKind::SelfDependency,
                    message: format!("node '{}' depends on itself", node.id),
                    node_ids: vec![node.id.clone()],
                });
            } else if !graph.contains(dep) {
                report.errors.push(ValidationIssue {
                    kind: IssueKind::MissingDependency,
                    message: format!("node '{}' depends on unknown node '{}'", node.id, dep),
                    node_ids: vec![node.id.clone(), dep.clone()],
                });
            }
        }
    }

    if let Some(cycle) = get_cycle(graph) {
        let is_reported_self_loop = cycle.len() == 2 && self_loops.contains(cycle[0].as_str());
        if !is_reported_self_loop {
            report.errors.push(ValidationIssue {
                kind: IssueKind::Cycle,
                message: format!("cycle detected: {}", cycle.join(" -> ")),
                node_ids: cycle,
            });
        }
    }

    if graph.len() > 1 {
        for id in graph.node_ids() {
            let known_deps = graph
                .dependencies_of(id)
                .iter()
                .any(|d| d != id && graph.contains(d));
            if !known_deps && graph.dependents_of(id).iter().all(|d| d == id) {
                report.warnings.push(ValidationIssue {
                    kind: IssueKind::OrphanNode,
                    message: format!("node '{id}' has no dependencies and no dependents"),
                    node_ids: vec![id.to_string()],
                });
            }
        }
    }

    report
}
