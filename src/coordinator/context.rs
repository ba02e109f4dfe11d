//! Per-request execution state.
//!
//! One [`ExecutionContext`] exists per coordinator run. It owns the node
//! status machine, the compressed results gathered so far, the budget
//! tracker and the cancellation token. Nothing in here is shared across
//! requests; the coordinator threads it explicitly through the call chain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::budget::BudgetTracker;
use crate::graph::{GraphNode, NodeStatus, ValidGraph};
use crate::strategy::{ResolvedInput, ResolvedInputs, StrategyResult};

/// Bookkeeping defects. Hitting one means coordinator logic is wrong, not
/// that the request went badly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("illegal transition for node '{node}': {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("node '{node}' started before its dependency '{dependency}' was terminal")]
    DependencyNotTerminal { node: String, dependency: String },
}

/// Node counts by status, as reported in progress events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummaryCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// A node that produced no data, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingNode {
    pub node_id: String,
    pub required: bool,
    pub reason: String,
}

pub struct ExecutionContext {
    request_id: Uuid,
    started: Instant,
    tracker: BudgetTracker,
    cancel: CancellationToken,
    statuses: Mutex<HashMap<String, NodeStatus>>,
    results: Mutex<HashMap<String, Arc<StrategyResult>>>,
    /// Failure or skip reason per non-succeeded node
    reasons: Mutex<HashMap<String, String>>,
}

impl ExecutionContext {
    pub fn new(request_id: Uuid, graph: &ValidGraph, cancel: CancellationToken) -> Self {
        let statuses = graph
            .graph()
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Pending))
            .collect();
        Self {
            request_id,
            started: Instant::now(),
            tracker: BudgetTracker::new(graph.graph().resource_estimate.predicted_units),
            cancel,
            statuses: Mutex::new(statuses),
            results: Mutex::new(HashMap::new()),
            reasons: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn tracker(&self) -> &BudgetTracker {
        &self.tracker
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.statuses.lock().unwrap().get(node_id).copied()
    }

    pub fn result(&self, node_id: &str) -> Option<Arc<StrategyResult>> {
        self.results.lock().unwrap().get(node_id).cloned()
    }

    fn transition(&self, node_id: &str, to: NodeStatus) -> Result<(), ContextError> {
        let mut statuses = self.statuses.lock().unwrap();
        let current = statuses
            .get_mut(node_id)
            .ok_or_else(|| ContextError::UnknownNode(node_id.to_string()))?;
        if !current.can_transition_to(to) {
            return Err(ContextError::InvalidTransition {
                node: node_id.to_string(),
                from: *current,
                to,
            });
        }
        *current = to;
        Ok(())
    }

    /// `pending -> running`.
    pub fn begin(&self, node_id: &str) -> Result<(), ContextError> {
        self.transition(node_id, NodeStatus::Running)
    }

    /// `running -> succeeded`, recording the result and charging its units.
    pub fn complete(&self, node_id: &str, result: StrategyResult) -> Result<(), ContextError> {
        self.transition(node_id, NodeStatus::Succeeded)?;
        self.tracker.charge(result.units_consumed);
        self.results
            .lock()
            .unwrap()
            .insert(node_id.to_string(), Arc::new(result));
        Ok(())
    }

    /// `running -> failed`, recording why.
    pub fn fail(&self, node_id: &str, reason: impl Into<String>) -> Result<(), ContextError> {
        self.transition(node_id, NodeStatus::Failed)?;
        self.reasons
            .lock()
            .unwrap()
            .insert(node_id.to_string(), reason.into());
        Ok(())
    }

    /// `pending|running -> skipped`, recording why.
    pub fn skip(&self, node_id: &str, reason: impl Into<String>) -> Result<(), ContextError> {
        self.transition(node_id, NodeStatus::Skipped)?;
        self.reasons
            .lock()
            .unwrap()
            .insert(node_id.to_string(), reason.into());
        Ok(())
    }

    /// Nodes still pending, e.g. after a cancellation or abort.
    pub fn pending_nodes(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| **s == NodeStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Build what a node is allowed to see of its dependencies: compressed
    /// results for succeeded ones, unavailability markers for the rest.
    pub fn resolve_inputs(&self, node: &GraphNode) -> Result<ResolvedInputs, ContextError> {
        let mut inputs = ResolvedInputs::empty();
        for dep_id in &node.depends_on {
            let status = self
                .status(dep_id)
                .ok_or_else(|| ContextError::UnknownNode(dep_id.clone()))?;
            match status {
                NodeStatus::Succeeded => {
                    let result = self.result(dep_id).ok_or_else(|| {
                        ContextError::UnknownNode(dep_id.clone())
                    })?;
                    inputs.insert(dep_id.clone(), ResolvedInput::Available(result));
                }
                NodeStatus::Failed | NodeStatus::Skipped => {
                    let reason = self
                        .reasons
                        .lock()
                        .unwrap()
                        .get(dep_id)
                        .cloned()
                        .unwrap_or_else(|| "node unavailable".to_string());
                    inputs.insert(dep_id.clone(), ResolvedInput::Unavailable { reason });
                }
                NodeStatus::Pending | NodeStatus::Running => {
                    return Err(ContextError::DependencyNotTerminal {
                        node: node.id.clone(),
                        dependency: dep_id.clone(),
                    });
                }
            }
        }
        Ok(inputs)
    }

    pub fn summary(&self) -> NodeSummaryCounts {
        let statuses = self.statuses.lock().unwrap();
        let mut counts = NodeSummaryCounts::default();
        for status in statuses.values() {
            match status {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Running => counts.running += 1,
                NodeStatus::Succeeded => counts.succeeded += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Every node that produced no data, in graph order.
    pub fn missing_nodes(&self, graph: &ValidGraph) -> Vec<MissingNode> {
        let statuses = self.statuses.lock().unwrap();
        let reasons = self.reasons.lock().unwrap();
        graph
            .graph()
            .nodes
            .iter()
            .filter_map(|n| match statuses.get(&n.id) {
                Some(NodeStatus::Failed) | Some(NodeStatus::Skipped) => Some(MissingNode {
                    node_id: n.id.clone(),
                    required: n.required,
                    reason: reasons
                        .get(&n.id)
                        .cloned()
                        .unwrap_or_else(|| "node unavailable".to_string()),
                }),
                _ => None,
            })
            .collect()
    }
}
