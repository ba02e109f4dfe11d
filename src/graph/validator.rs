//! Structural validation of candidate execution graphs.
//!
//! Validation is purely structural and side-effect free: node ids are unique,
//! every dependency resolves, every strategy name is registered, the edge set
//! is acyclic (Kahn's algorithm) and stage labels strictly increase along
//! every edge. A [`ValidGraph`] is the proof of all of that; the coordinator
//! only accepts one, so malformed plans are rejected before anything runs.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use super::{ExecutionGraph, GraphNode};

/// Structural defects in a candidate graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("graph has no nodes")]
    Empty,

    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("node '{node}' depends on unknown node '{missing}'")]
    DanglingDependency { node: String, missing: String },

    #[error("node '{node}' names unknown strategy '{strategy}'")]
    UnknownStrategy { node: String, strategy: String },

    #[error("node '{node}' names unknown fallback strategy '{fallback}'")]
    UnknownFallback { node: String, fallback: String },

    #[error("dependency cycle involving node '{0}'")]
    Cyclic(String),

    #[error(
        "node '{node}' in group {group} must run after dependency '{dependency}' in group {dependency_group}"
    )]
    BadParallelGroup {
        node: String,
        group: u32,
        dependency: String,
        dependency_group: u32,
    },
}

/// A structurally sound graph plus derived lookup tables.
///
/// Construction goes through [`validate`] only; holding one is proof the
/// checks passed. The inner graph stays immutable for the life of the run.
#[derive(Debug, Clone)]
pub struct ValidGraph {
    graph: ExecutionGraph,
    groups: Vec<u32>,
    dependents: HashMap<String, Vec<String>>,
}

impl ValidGraph {
    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn id(&self) -> Uuid {
        self.graph.id
    }

    /// Stage labels present, ascending.
    pub fn groups(&self) -> &[u32] {
        &self.groups
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.graph.node(id)
    }

    pub fn nodes_in_group(&self, group: u32) -> Vec<&GraphNode> {
        self.graph
            .nodes
            .iter()
            .filter(|n| n.parallel_group == group)
            .collect()
    }

    /// Ids of nodes that consume `id`'s result, in graph order.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes whose results reach the synthesizer: every node nothing depends
    /// on, plus nodes explicitly marked to forward their summary.
    pub fn terminal_node_ids(&self) -> Vec<String> {
        self.graph
            .nodes
            .iter()
            .filter(|n| self.dependents_of(&n.id).is_empty() || n.forwards_to_synthesis())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Give the graph back, discarding the validation proof.
    pub fn into_graph(self) -> ExecutionGraph {
        self.graph
    }
}

/// Validate a candidate graph against the set of registered strategy names.
pub fn validate(
    graph: ExecutionGraph,
    known_strategies: &HashSet<String>,
) -> Result<ValidGraph, ValidationError> {
    if graph.nodes.is_empty() {
        return Err(ValidationError::Empty);
    }

    let mut seen: HashSet<&str> = HashSet::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    for node in &graph.nodes {
        for dep in &node.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(ValidationError::DanglingDependency {
                    node: node.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
        if !known_strategies.contains(&node.strategy) {
            return Err(ValidationError::UnknownStrategy {
                node: node.id.clone(),
                strategy: node.strategy.clone(),
            });
        }
        if let Some(fallback) = &node.fallback {
            if !known_strategies.contains(fallback) {
                return Err(ValidationError::UnknownFallback {
                    node: node.id.clone(),
                    fallback: fallback.clone(),
                });
            }
        }
    }

    check_acyclic(&graph)?;

    for node in &graph.nodes {
        for dep_id in &node.depends_on {
            // Dependencies resolved above, lookup cannot miss.
            if let Some(dep) = graph.node(dep_id) {
                if dep.parallel_group >= node.parallel_group {
                    return Err(ValidationError::BadParallelGroup {
                        node: node.id.clone(),
                        group: node.parallel_group,
                        dependency: dep.id.clone(),
                        dependency_group: dep.parallel_group,
                    });
                }
            }
        }
    }

    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for node in &graph.nodes {
        for dep in &node.depends_on {
            dependents
                .entry(dep.clone())
                .or_default()
                .push(node.id.clone());
        }
    }

    let groups = graph.group_labels();

    Ok(ValidGraph {
        graph,
        groups,
        dependents,
    })
}

/// Kahn's algorithm over the dependency edges.
fn check_acyclic(graph: &ExecutionGraph) -> Result<(), ValidationError> {
    let mut in_degree: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.depends_on.len()))
        .collect();

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &graph.nodes {
        for dep in &node.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(node.id.as_str());
        }
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut processed = 0usize;
    while let Some(id) = ready.pop_front() {
        processed += 1;
        if let Some(next) = dependents.get(id) {
            for dependent in next {
                if let Some(d) = in_degree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }
    }

    if processed == graph.nodes.len() {
        return Ok(());
    }

    // Report the lexicographically smallest node still stuck in a cycle so
    // the error is deterministic.
    let mut stuck: Vec<&str> = in_degree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id)
        .collect();
    stuck.sort_unstable();
    Err(ValidationError::Cyclic(
        stuck.first().unwrap_or(&"?").to_string(),
    ))
}
