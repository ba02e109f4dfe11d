//! Pre-run budget assessment and scope narrowing.

use std::collections::HashSet;

use crate::config::Config;
use crate::graph::{validate, ExecutionGraph, ResourceEstimate, ValidGraph};

use super::{estimate, node_units, BudgetError, NARROWING_CAP_FLOOR};

/// Outcome of a pre-run assessment.
#[derive(Debug)]
pub struct Assessment {
    /// The graph to execute, possibly narrowed
    pub graph: ValidGraph,
    /// Whether any cap was reduced or any node removed
    pub narrowed: bool,
    /// Prediction for the graph as it will actually run
    pub estimate: ResourceEstimate,
}

/// Prices graphs before execution and shrinks them to fit the ceilings.
///
/// Narrowing order is fixed: oversized single nodes first, then the graph
/// total by repeatedly cutting the most expensive node's cap 25%, then
/// removal of optional leaf nodes. Nodes other nodes depend on are never
/// removed, and no cap drops below [`NARROWING_CAP_FLOOR`].
#[derive(Debug, Clone, Copy)]
pub struct BudgetManager {
    soft_ceiling: u64,
    hard_ceiling: u64,
}

impl BudgetManager {
    pub fn new(soft_ceiling: u64, hard_ceiling: u64) -> Self {
        Self {
            soft_ceiling,
            hard_ceiling,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.soft_unit_ceiling, config.hard_unit_ceiling)
    }

    /// A single node may not exceed a quarter of the soft ceiling.
    fn node_ceiling(&self) -> u64 {
        self.soft_ceiling / 4
    }

    /// Assess a validated graph against the ceilings.
    ///
    /// `allow_over_hard` is the caller's explicit confirmation to run a plan
    /// whose prediction stays above the hard ceiling after narrowing.
    pub fn assess(
        &self,
        valid: ValidGraph,
        known_strategies: &HashSet<String>,
        allow_over_hard: bool,
    ) -> Result<Assessment, BudgetError> {
        let initial = estimate(valid.graph());
        let oversized_node = valid
            .graph()
            .nodes
            .iter()
            .any(|n| node_units(n) > self.node_ceiling());

        if initial.predicted_units <= self.soft_ceiling && !oversized_node {
            return Ok(Assessment {
                graph: valid,
                narrowed: false,
                estimate: initial,
            });
        }

        let mut graph = valid.into_graph();
        let mut narrowed = false;

        for idx in 0..graph.nodes.len() {
            while node_units(&graph.nodes[idx]) > self.node_ceiling() {
                if !shrink_cap(&mut graph, idx) {
                    break;
                }
                narrowed = true;
            }
        }

        while estimate(&graph).predicted_units > self.soft_ceiling {
            match most_expensive_shrinkable(&graph) {
                Some(idx) => {
                    shrink_cap(&mut graph, idx);
                    narrowed = true;
                }
                None => break,
            }
        }

        while estimate(&graph).predicted_units > self.soft_ceiling && graph.nodes.len() > 1 {
            match most_expensive_optional_leaf(&graph) {
                Some(idx) => {
                    let removed = graph.nodes.remove(idx);
                    tracing::info!(node = %removed.id, "dropped optional node to fit budget");
                    narrowed = true;
                }
                None => break,
            }
        }

        let final_estimate = estimate(&graph);
        if final_estimate.predicted_units > self.hard_ceiling && !allow_over_hard {
            return Err(BudgetError::CeilingExceeded {
                predicted: final_estimate.predicted_units,
                ceiling: self.hard_ceiling,
            });
        }
        if final_estimate.predicted_units > self.soft_ceiling {
            tracing::warn!(
                predicted = final_estimate.predicted_units,
                soft_ceiling = self.soft_ceiling,
                "proceeding over the soft ceiling after narrowing bottomed out"
            );
        }

        graph.resource_estimate = final_estimate;
        let graph = validate(graph, known_strategies)?;

        Ok(Assessment {
            graph,
            narrowed,
            estimate: final_estimate,
        })
    }
}

/// Cut one node's cap by 25%, at least by one, never below the floor.
/// Returns false when the node cannot shrink further.
fn shrink_cap(graph: &mut ExecutionGraph, idx: usize) -> bool {
    let node = &mut graph.nodes[idx];
    let cap = node.max_items().unwrap_or(super::DEFAULT_ASSUMED_ITEMS);
    if cap <= NARROWING_CAP_FLOOR {
        return false;
    }
    let new_cap = (cap * 3 / 4).min(cap - 1).max(NARROWING_CAP_FLOOR);
    tracing::debug!(node = %node.id, from = cap, to = new_cap, "narrowing result cap");
    node.set_max_items(new_cap);
    true
}

fn most_expensive_shrinkable(graph: &ExecutionGraph) -> Option<usize> {
    graph
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.max_items().unwrap_or(super::DEFAULT_ASSUMED_ITEMS) > NARROWING_CAP_FLOOR)
        .max_by_key(|(idx, n)| (node_units(n), usize::MAX - idx))
        .map(|(idx, _)| idx)
}

/// Optional nodes nothing depends on, most expensive first.
fn most_expensive_optional_leaf(graph: &ExecutionGraph) -> Option<usize> {
    let depended_on: HashSet<&str> = graph
        .nodes
        .iter()
        .flat_map(|n| n.depends_on.iter().map(String::as_str))
        .collect();

    graph
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| !n.required && !depended_on.contains(n.id.as_str()))
        .max_by_key(|(idx, n)| (node_units(n), usize::MAX - idx))
        .map(|(idx, _)| idx)
}
