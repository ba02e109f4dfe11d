//! Execution graph types.
//!
//! An [`ExecutionGraph`] is the decomposer's entire output: a DAG of bounded
//! gathering tasks plus instructions for the final synthesis. Its JSON shape
//! is a stable contract (camelCase field names, exactly the fields below) so
//! plans can be persisted, replayed and asserted on in tests. Graphs are
//! immutable once validated; runtime state like node status lives in the
//! coordinator's per-request context, never on the graph itself.

pub mod validator;

pub use validator::{validate, ValidGraph, ValidationError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse per-node cost class declared by the decomposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedCost {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ExpectedCost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Runtime state of one node, tracked outside the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Legal lifecycle moves: `pending -> running -> {succeeded, failed, skipped}`,
    /// with `pending -> skipped` for nodes whose dependencies already failed.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Skipped)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One bounded gathering task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Unique within the graph
    pub id: String,
    /// Identifier resolved through the strategy registry
    pub strategy: String,
    /// Strategy-specific arguments, opaque to the coordinator
    #[serde(default)]
    pub params: serde_json::Value,
    /// Ids of nodes whose results this node consumes
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Stage label; must be strictly greater than every dependency's label
    pub parallel_group: u32,
    pub expected_cost: ExpectedCost,
    /// Required nodes abort the graph on permanent failure
    #[serde(default = "default_required")]
    pub required: bool,
    /// Strategy to run in this node's place if it fails permanently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

fn default_required() -> bool {
    true
}

impl GraphNode {
    /// The `maxItems` result cap inside `params`, when declared.
    pub fn max_items(&self) -> Option<usize> {
        self.params
            .get("maxItems")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }

    /// Rewrite the `maxItems` cap. Creates the params object if absent.
    pub fn set_max_items(&mut self, cap: usize) {
        if !self.params.is_object() {
            self.params = serde_json::json!({});
        }
        if let Some(map) = self.params.as_object_mut() {
            map.insert(
                "maxItems".to_string(),
                serde_json::Value::from(cap as u64),
            );
        }
    }

    /// Whether this node's result is forwarded to synthesis even when other
    /// nodes depend on it.
    pub fn forwards_to_synthesis(&self) -> bool {
        self.params
            .get("forwardToSynthesis")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Cost prediction computed by the decomposer from `expectedCost` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEstimate {
    pub predicted_units: u64,
    pub predicted_node_count: usize,
    /// Milliseconds
    #[serde(rename = "predictedLatency")]
    pub predicted_latency_ms: u64,
}

/// One request's full execution plan.
///
/// Owned by a single in-flight request. A replan produces a fresh graph with
/// a fresh id; existing graphs are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionGraph {
    pub id: Uuid,
    pub original_request: String,
    pub nodes: Vec<GraphNode>,
    /// Free-text grouping/ranking guidance for the synthesizer
    pub synthesis_instructions: String,
    pub resource_estimate: ResourceEstimate,
}

impl ExecutionGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Distinct `parallelGroup` labels, ascending.
    pub fn group_labels(&self) -> Vec<u32> {
        let mut labels: Vec<u32> = self.nodes.iter().map(|n| n.parallel_group).collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_status_transitions() {
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Skipped));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Succeeded));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Failed));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Skipped));

        assert!(!NodeStatus::Pending.can_transition_to(NodeStatus::Succeeded));
        assert!(!NodeStatus::Succeeded.can_transition_to(NodeStatus::Running));
        assert!(!NodeStatus::Failed.can_transition_to(NodeStatus::Skipped));
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }

    #[test]
    fn test_wire_schema_field_names() {
        let graph = ExecutionGraph {
            id: Uuid::nil(),
            original_request: "what emails am I blocking people on".to_string(),
            nodes: vec![GraphNode {
                id: "search-sent".to_string(),
                strategy: "keyword_search".to_string(),
                params: serde_json::json!({"source": "mailbox", "maxItems": 50}),
                depends_on: vec![],
                parallel_group: 1,
                expected_cost: ExpectedCost::Medium,
                required: true,
                fallback: None,
            }],
            synthesis_instructions: "rank by age".to_string(),
            resource_estimate: ResourceEstimate {
                predicted_units: 4250,
                predicted_node_count: 1,
                predicted_latency_ms: 3000,
            },
        };

        let value = serde_json::to_value(&graph).unwrap();
        assert!(value.get("originalRequest").is_some());
        assert!(value.get("synthesisInstructions").is_some());
        let estimate = value.get("resourceEstimate").unwrap();
        assert!(estimate.get("predictedUnits").is_some());
        assert!(estimate.get("predictedNodeCount").is_some());
        assert!(estimate.get("predictedLatency").is_some());
        let node = &value["nodes"][0];
        assert!(node.get("dependsOn").is_some());
        assert!(node.get("parallelGroup").is_some());
        assert_eq!(node["expectedCost"], "medium");
        assert_eq!(node["required"], true);
        // Fallback is omitted when unset.
        assert!(node.get("fallback").is_none());
    }

    #[test]
    fn test_wire_schema_parses_decomposer_output() {
        let raw = r#"{
            "id": "5e9cf9a1-7c57-4f38-9f3f-111111111111",
            "originalRequest": "what's on my calendar today",
            "nodes": [
                {
                    "id": "todays-events",
                    "strategy": "metadata_filter",
                    "params": {"source": "calendar", "maxItems": 25},
                    "dependsOn": [],
                    "parallelGroup": 1,
                    "expectedCost": "low",
                    "required": true
                }
            ],
            "synthesisInstructions": "list by time",
            "resourceEstimate": {
                "predictedUnits": 700,
                "predictedNodeCount": 1,
                "predictedLatency": 1500
            }
        }"#;

        let graph: ExecutionGraph = serde_json::from_str(raw).unwrap();
        assert_eq!(graph.nodes.len(), 1);
        let node = &graph.nodes[0];
        assert_eq!(node.max_items(), Some(25));
        assert!(node.required);
        assert!(node.depends_on.is_empty());
        assert_eq!(graph.group_labels(), vec![1]);
    }

    #[test]
    fn test_set_max_items_rewrites_params() {
        let mut node = GraphNode {
            id: "n".to_string(),
            strategy: "detail_read".to_string(),
            params: serde_json::json!({"source": "mailbox", "maxItems": 20}),
            depends_on: vec![],
            parallel_group: 1,
            expected_cost: ExpectedCost::High,
            required: true,
            fallback: None,
        };
        node.set_max_items(15);
        assert_eq!(node.max_items(), Some(15));
        assert_eq!(node.params["source"], "mailbox");
    }
}
