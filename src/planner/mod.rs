//! Request decomposition.
//!
//! The planner turns one natural-language request into a validated
//! [`ExecutionGraph`] through a single structured completion call. The model
//! sees the strategy catalog and the graph rules; it emits nodes and
//! synthesis instructions only. Graph id, original request and the resource
//! estimate are attached locally, then the whole thing goes through
//! [`validate`]. A reply that fails to parse or validate is repaired exactly
//! once, with the error appended to the prompt.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::budget;
use crate::config::Config;
use crate::graph::{validate, ExecutionGraph, GraphNode, ResourceEstimate, ValidGraph};
use crate::llm::{
    complete_with_repair, CompletionClient, CompletionError, CompletionRequest, ResponseSchema,
    TokenUsage,
};
use crate::strategy::{StrategyInfo, StrategyRegistry};

const PLANNER_SYSTEM: &str = "\
You decompose information requests into a graph of bounded gathering tasks. \
You never answer the request yourself and never invent data; you only decide \
which strategies to run, in what order, with what parameters.";

#[derive(Debug, thiserror::Error)]
pub enum DecompositionError {
    #[error("request is empty")]
    EmptyRequest,

    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// A validated plan plus the tokens spent producing it.
#[derive(Debug)]
pub struct Decomposition {
    pub graph: ValidGraph,
    pub usage: TokenUsage,
}

/// What the model actually emits. Everything else on [`ExecutionGraph`] is
/// attached locally before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannedGraph {
    nodes: Vec<GraphNode>,
    #[serde(default)]
    synthesis_instructions: String,
}

pub struct Planner {
    client: Arc<dyn CompletionClient>,
    config: Arc<Config>,
}

impl Planner {
    pub fn new(client: Arc<dyn CompletionClient>, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    /// Decompose `request` into a validated execution graph.
    ///
    /// `refinement` carries the hint from an earlier round judged
    /// insufficient; the planner sees the hint, never that round's outputs.
    pub async fn decompose(
        &self,
        request: &str,
        recent_context: Option<&str>,
        registry: &StrategyRegistry,
        refinement: Option<&str>,
    ) -> Result<Decomposition, DecompositionError> {
        let request = request.trim();
        if request.is_empty() {
            return Err(DecompositionError::EmptyRequest);
        }

        let catalog = registry.catalog();
        let known = registry.known_names();
        let completion_request = CompletionRequest {
            model: self.config.planner_model.clone(),
            system: PLANNER_SYSTEM.to_string(),
            prompt: self.decomposition_prompt(request, recent_context, &catalog, refinement),
            schema: ResponseSchema::new("execution_graph", graph_schema()),
            max_output_tokens: self.config.completion_max_tokens,
        };

        let graph_id = Uuid::new_v4();
        let original_request = request.to_string();
        let (graph, usage) =
            complete_with_repair(&*self.client, &completion_request, |value| {
                build_graph(value, graph_id, &original_request, &known)
            })
            .await?;

        tracing::info!(
            graph = %graph.id(),
            nodes = graph.graph().nodes.len(),
            stages = graph.groups().len(),
            predicted_units = graph.graph().resource_estimate.predicted_units,
            "request decomposed"
        );
        Ok(Decomposition { graph, usage })
    }

    fn decomposition_prompt(
        &self,
        request: &str,
        recent_context: Option<&str>,
        catalog: &[StrategyInfo],
        refinement: Option<&str>,
    ) -> String {
        let mut strategies = String::new();
        for info in catalog {
            strategies.push_str(&format!(
                "- {} (caps results at {}): {}\n  params schema: {}\n",
                info.name, info.item_cap, info.description, info.params_schema
            ));
        }

        let mut prompt = format!(
            "Decompose the request below into an execution graph.\n\
             \n\
             Rules:\n\
             - Use only the strategies listed; `strategy` and `fallback` must name one of them.\n\
             - Every node's parallelGroup must be strictly greater than the parallelGroup of \
             each of its dependencies; independent lookups share a stage so they run in parallel.\n\
             - Set params.maxItems on every gathering node and prefer small caps.\n\
             - Tag each node's expectedCost as low, medium or high honestly; it drives budgeting.\n\
             - Mark a node required only when the answer is impossible without it.\n\
             - synthesisInstructions must say how the final answer should group and rank findings.\n\
             \n\
             Available strategies:\n{strategies}\n"
        );
        if let Some(context) = recent_context {
            let context = truncate_chars(context, self.config.recent_context_limit);
            prompt.push_str(&format!("Recent conversation context:\n{context}\n\n"));
        }
        if let Some(hint) = refinement {
            prompt.push_str(&format!(
                "A previous decomposition produced an insufficient answer. \
                 Refine the plan: {hint}\n\n"
            ));
        }
        prompt.push_str(&format!("Request: {request}\n"));
        prompt
    }
}

/// Parse, complete and validate one model reply. The error string feeds the
/// repair prompt, so it names the offending node where possible.
fn build_graph(
    value: &serde_json::Value,
    graph_id: Uuid,
    original_request: &str,
    known: &HashSet<String>,
) -> Result<ValidGraph, String> {
    let planned: PlannedGraph =
        serde_json::from_value(value.clone()).map_err(|e| format!("malformed graph: {e}"))?;
    let mut graph = ExecutionGraph {
        id: graph_id,
        original_request: original_request.to_string(),
        nodes: planned.nodes,
        synthesis_instructions: planned.synthesis_instructions,
        resource_estimate: ResourceEstimate {
            predicted_units: 0,
            predicted_node_count: 0,
            predicted_latency_ms: 0,
        },
    };
    graph.resource_estimate = budget::estimate(&graph);
    validate(graph, known).map_err(|e| e.to_string())
}

fn graph_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["nodes", "synthesisInstructions"],
        "properties": {
            "nodes": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": [
                        "id", "strategy", "params", "dependsOn",
                        "parallelGroup", "expectedCost", "required"
                    ],
                    "properties": {
                        "id": {"type": "string"},
                        "strategy": {"type": "string"},
                        "params": {"type": "object"},
                        "dependsOn": {"type": "array", "items": {"type": "string"}},
                        "parallelGroup": {"type": "integer", "minimum": 1},
                        "expectedCost": {"type": "string", "enum": ["low", "medium", "high"]},
                        "required": {"type": "boolean"},
                        "fallback": {"type": ["string", "null"]}
                    }
                }
            },
            "synthesisInstructions": {"type": "string"}
        }
    })
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::testing::fixture_router;
    use crate::llm::testing::StubCompletionClient;
    use serde_json::json;

    fn planner_with(stub: Arc<StubCompletionClient>) -> Planner {
        Planner::new(stub, Arc::new(Config::for_tests()))
    }

    fn registry() -> StrategyRegistry {
        StrategyRegistry::with_defaults(fixture_router(5, 2))
    }

    fn planned_reply() -> serde_json::Value {
        json!({
            "nodes": [
                {
                    "id": "search-inbox",
                    "strategy": "keyword_search",
                    "params": {"source": "mailbox", "keywords": ["invoice"], "maxItems": 20},
                    "dependsOn": [],
                    "parallelGroup": 1,
                    "expectedCost": "medium",
                    "required": true
                },
                {
                    "id": "read-details",
                    "strategy": "detail_read",
                    "params": {"maxItems": 5},
                    "dependsOn": ["search-inbox"],
                    "parallelGroup": 2,
                    "expectedCost": "high",
                    "required": true
                }
            ],
            "synthesisInstructions": "group by sender, oldest first"
        })
    }

    #[tokio::test]
    async fn test_decompose_builds_validated_graph() {
        let stub = Arc::new(StubCompletionClient::new());
        stub.push_value(planned_reply());
        let planner = planner_with(stub.clone());

        let decomposition = planner
            .decompose("which invoices are open", None, &registry(), None)
            .await
            .unwrap();

        let graph = decomposition.graph.graph();
        assert_eq!(graph.original_request, "which invoices are open");
        assert_eq!(decomposition.graph.groups(), &[1, 2][..]);
        // medium@20 = 500 + 75*20, high@5 = 1000 + 400*5
        assert_eq!(graph.resource_estimate.predicted_units, 2_000 + 3_000);
        assert_eq!(graph.resource_estimate.predicted_node_count, 2);
        assert_eq!(graph.resource_estimate.predicted_latency_ms, 2_000 + 5_000);
        assert_eq!(decomposition.usage.total_tokens, 150);
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_graph_repaired_once() {
        let stub = Arc::new(StubCompletionClient::new());
        // First reply has a dependency cycle.
        stub.push_value(json!({
            "nodes": [
                {"id": "a", "strategy": "keyword_search", "params": {},
                 "dependsOn": ["b"], "parallelGroup": 2, "expectedCost": "low", "required": true},
                {"id": "b", "strategy": "keyword_search", "params": {},
                 "dependsOn": ["a"], "parallelGroup": 1, "expectedCost": "low", "required": true}
            ],
            "synthesisInstructions": ""
        }));
        stub.push_value(planned_reply());
        let planner = planner_with(stub.clone());

        let decomposition = planner
            .decompose("which invoices are open", None, &registry(), None)
            .await
            .unwrap();

        assert_eq!(stub.call_count(), 2);
        assert_eq!(decomposition.graph.graph().nodes.len(), 2);
        // The repair prompt carries the validation failure.
        let repair = &stub.requests()[1];
        assert!(repair.prompt.contains("dependency cycle"));
        // Both calls are paid for.
        assert_eq!(decomposition.usage.total_tokens, 300);
    }

    #[tokio::test]
    async fn test_two_bad_replies_surface_schema_violation() {
        let bad = json!({
            "nodes": [
                {"id": "a", "strategy": "grep_everything", "params": {},
                 "dependsOn": [], "parallelGroup": 1, "expectedCost": "low", "required": true}
            ],
            "synthesisInstructions": ""
        });
        let stub = Arc::new(StubCompletionClient::new());
        stub.push_value(bad.clone());
        stub.push_value(bad);
        let planner = planner_with(stub.clone());

        let err = planner
            .decompose("which invoices are open", None, &registry(), None)
            .await
            .unwrap_err();

        match err {
            DecompositionError::Completion(e) => {
                assert!(e.message.contains("grep_everything"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(stub.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_request_rejected_without_model_call() {
        let stub = Arc::new(StubCompletionClient::new());
        let planner = planner_with(stub.clone());

        let err = planner
            .decompose("   ", None, &registry(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DecompositionError::EmptyRequest));
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn test_prompt_carries_catalog_context_and_hint() {
        let stub = Arc::new(StubCompletionClient::new());
        stub.push_value(planned_reply());
        let planner = planner_with(stub.clone());

        let context = "ø".repeat(3_000);
        planner
            .decompose(
                "find the overdue invoices",
                Some(&context),
                &registry(),
                Some("also check the calendar for payment deadlines"),
            )
            .await
            .unwrap();

        let request = &stub.requests()[0];
        assert_eq!(request.model, "test/planner");
        assert_eq!(request.schema.name, "execution_graph");
        assert!(request.prompt.contains("keyword_search"));
        assert!(request.prompt.contains("cross_reference"));
        assert!(request.prompt.contains("find the overdue invoices"));
        assert!(request.prompt.contains("also check the calendar"));
        // Context is clamped to the configured limit, on a char boundary.
        assert_eq!(request.prompt.matches('ø').count(), 2_000);
    }
}
