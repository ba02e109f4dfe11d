//! Budget estimation and enforcement.
//!
//! Cost is measured in abstract units derived from each node's declared
//! `expectedCost` class and its `maxItems` cap. The [`BudgetManager`] prices
//! a whole graph before anything runs, narrows it when the prediction crosses
//! the soft ceiling, and refuses to run past the hard ceiling without an
//! explicit caller confirmation. The [`BudgetTracker`] then accounts actual
//! spend during the run so predictions can be checked against reality.

mod manager;
mod tracker;

pub use manager::{Assessment, BudgetManager};
pub use tracker::BudgetTracker;

use crate::graph::{ExecutionGraph, ExpectedCost, ResourceEstimate, ValidationError};

/// Items assumed for a node whose params omit `maxItems`.
pub const DEFAULT_ASSUMED_ITEMS: usize = 20;

/// Lower bound narrowing will not shrink a node's cap below.
pub const NARROWING_CAP_FLOOR: usize = 5;

/// Unit weights for one cost class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitModel {
    pub base: u64,
    pub per_item: u64,
}

impl UnitModel {
    /// Price a result of `items` findings.
    pub fn units_for(self, items: usize) -> u64 {
        self.base + self.per_item * items as u64
    }
}

/// Weight table behind `expectedCost`.
pub fn unit_model(cost: ExpectedCost) -> UnitModel {
    match cost {
        ExpectedCost::Low => UnitModel {
            base: 200,
            per_item: 20,
        },
        ExpectedCost::Medium => UnitModel {
            base: 500,
            per_item: 75,
        },
        ExpectedCost::High => UnitModel {
            base: 1000,
            per_item: 400,
        },
    }
}

/// Expected wall-clock contribution of one node, in milliseconds.
fn latency_ms(cost: ExpectedCost) -> u64 {
    match cost {
        ExpectedCost::Low => 800,
        ExpectedCost::Medium => 2_000,
        ExpectedCost::High => 5_000,
    }
}

/// Predicted units for a single node at its current cap.
pub fn node_units(node: &crate::graph::GraphNode) -> u64 {
    let items = node.max_items().unwrap_or(DEFAULT_ASSUMED_ITEMS);
    unit_model(node.expected_cost).units_for(items)
}

/// Price a whole graph: unit total, node count, and a latency prediction
/// that sums the slowest node of each stage.
pub fn estimate(graph: &ExecutionGraph) -> ResourceEstimate {
    let predicted_units = graph.nodes.iter().map(node_units).sum();

    let predicted_latency_ms = graph
        .group_labels()
        .into_iter()
        .map(|group| {
            graph
                .nodes
                .iter()
                .filter(|n| n.parallel_group == group)
                .map(|n| latency_ms(n.expected_cost))
                .max()
                .unwrap_or(0)
        })
        .sum();

    ResourceEstimate {
        predicted_units,
        predicted_node_count: graph.nodes.len(),
        predicted_latency_ms,
    }
}

/// Budget decisions that stop a run before it starts.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error(
        "predicted cost {predicted} units exceeds the hard ceiling of {ceiling}; \
         confirmation required to proceed"
    )]
    CeilingExceeded { predicted: u64, ceiling: u64 },

    /// Narrowing produced a structurally broken graph. Always a bug.
    #[error("graph invalid after narrowing: {0}")]
    Validation(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::{graph_of, node};

    #[test]
    fn test_unit_model_weights() {
        assert_eq!(unit_model(ExpectedCost::Low).units_for(25), 700);
        assert_eq!(unit_model(ExpectedCost::Medium).units_for(50), 4250);
        assert_eq!(unit_model(ExpectedCost::High).units_for(20), 9000);
    }

    #[test]
    fn test_estimate_sums_nodes_and_stage_latencies() {
        let mut a = node("a", "keyword_search", 1);
        a.set_max_items(50);
        let mut b = node("b", "keyword_search", 1);
        b.set_max_items(50);
        let mut c = node("c", "detail_read", 2);
        c.set_max_items(15);
        c.expected_cost = ExpectedCost::High;

        let graph = graph_of(vec![a, b, c]);
        let est = estimate(&graph);
        assert_eq!(est.predicted_node_count, 3);
        assert_eq!(est.predicted_units, 4250 + 4250 + 7000);
        // Stage 1 runs two medium nodes in parallel, stage 2 one high node.
        assert_eq!(est.predicted_latency_ms, 2_000 + 5_000);
    }

    #[test]
    fn test_missing_cap_uses_assumed_items() {
        let mut n = node("a", "keyword_search", 1);
        n.params = serde_json::json!({"source": "mailbox"});
        assert_eq!(
            node_units(&n),
            unit_model(ExpectedCost::Medium).units_for(DEFAULT_ASSUMED_ITEMS)
        );
    }
}
