//! Final answer synthesis.
//!
//! The synthesizer sees exactly one thing: the terminal result set that came
//! out of the compression funnel, plus the planner's synthesis instructions.
//! Raw evidence bodies never reach this module; whatever the executors did
//! not compress into result items does not exist here.
//!
//! Synthesis is deliberately failure-tolerant. A model outage degrades to an
//! enumerated listing of the gathered findings instead of failing a request
//! whose expensive gathering work already succeeded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::coordinator::{AbortInfo, TerminalResultSet};
use crate::llm::{
    complete_with_repair, CompletionClient, CompletionRequest, ResponseSchema, TokenUsage,
};
use crate::strategy::{ResultStatus, StrategyResult};

const SYNTHESIS_SYSTEM: &str = "\
You write final answers to information requests from pre-gathered findings. \
Use only the findings you are given; never invent evidence. When the findings \
have gaps, name them plainly instead of papering over them.";

/// The user-facing product of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    pub request_id: Uuid,
    pub text: String,
    pub metadata: ResultMetadata,
}

/// Runtime accounting attached to every answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub graph_id: Uuid,
    pub node_count: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub units_consumed: u64,
    pub predicted_units: u64,
    pub elapsed_ms: u64,
    pub token_usage: TokenUsage,
    pub replanned: bool,
    pub degraded: bool,
    pub cancelled: bool,
    /// Required-node failure that stopped the run early, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortInfo>,
}

/// Synthesizer output before the engine wraps it into a [`FinalResult`].
#[derive(Debug)]
pub struct SynthesizedAnswer {
    pub text: String,
    pub usage: TokenUsage,
    /// True when the model call failed and the text is an enumerated listing.
    pub degraded: bool,
}

pub struct Synthesizer {
    client: Arc<dyn CompletionClient>,
    config: Arc<Config>,
}

impl Synthesizer {
    pub fn new(client: Arc<dyn CompletionClient>, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    /// Produce the final answer text for `request` from `set`.
    pub async fn synthesize(
        &self,
        request: &str,
        instructions: &str,
        set: &TerminalResultSet,
    ) -> SynthesizedAnswer {
        if set.results.iter().all(|r| r.items.is_empty()) {
            // Nothing was gathered; a model round-trip cannot help.
            return SynthesizedAnswer {
                text: no_evidence_answer(request, set),
                usage: TokenUsage::default(),
                degraded: false,
            };
        }

        let completion_request = CompletionRequest {
            model: self.config.synthesis_model.clone(),
            system: SYNTHESIS_SYSTEM.to_string(),
            prompt: synthesis_prompt(request, instructions, set),
            schema: ResponseSchema::new("final_answer", answer_schema()),
            max_output_tokens: self.config.completion_max_tokens,
        };

        let outcome = complete_with_repair(&*self.client, &completion_request, |value| {
            let answer = value
                .get("answer")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim();
            if answer.is_empty() {
                Err("reply must contain a non-empty `answer` string".to_string())
            } else {
                Ok(answer.to_string())
            }
        })
        .await;

        match outcome {
            Ok((text, usage)) => SynthesizedAnswer {
                text,
                usage,
                degraded: false,
            },
            Err(e) => {
                tracing::warn!(error = %e, "synthesis call failed, returning enumerated findings");
                SynthesizedAnswer {
                    text: degraded_answer(request, set),
                    usage: TokenUsage::default(),
                    degraded: true,
                }
            }
        }
    }
}

fn synthesis_prompt(request: &str, instructions: &str, set: &TerminalResultSet) -> String {
    let mut prompt = format!(
        "Answer the request below using only the findings that follow.\n\
         \n\
         Request: {request}\n"
    );
    if !instructions.trim().is_empty() {
        prompt.push_str(&format!("\nHow to organize the answer: {instructions}\n"));
    }
    prompt.push_str(&format!("\nFindings:\n{}", render_results(&set.results)));
    if let Some(gaps) = gap_notes(set) {
        prompt.push_str(&format!(
            "\nGaps in the gathered evidence. The answer must mention these explicitly:\n{gaps}\n"
        ));
    }
    prompt
}

/// Compact text rendering of the terminal results, one block per node.
fn render_results(results: &[StrategyResult]) -> String {
    if results.is_empty() {
        return "(none)\n".to_string();
    }
    let mut out = String::new();
    for result in results {
        let mut qualifiers = String::new();
        if result.truncated {
            qualifiers.push_str(", truncated");
        }
        if result.status == ResultStatus::Partial {
            qualifiers.push_str(", partial");
        }
        out.push_str(&format!(
            "## {} ({} items{qualifiers})\n",
            result.node_id,
            result.items.len()
        ));
        for item in &result.items {
            out.push_str(&format!("- [{}:{}] {}", item.source, item.id, item.heading));
            if !item.summary.is_empty() {
                out.push_str(&format!(" :: {}", item.summary));
            }
            if let Some(ts) = &item.timestamp {
                out.push_str(&format!(" ({})", ts.format("%Y-%m-%d %H:%M")));
            }
            if !item.participants.is_empty() {
                out.push_str(&format!(" [{}]", item.participants.join(", ")));
            }
            out.push('\n');
        }
    }
    out
}

fn gap_notes(set: &TerminalResultSet) -> Option<String> {
    let mut lines = Vec::new();
    if let Some(abort) = &set.aborted {
        lines.push(format!(
            "- execution aborted: required node '{}' failed ({})",
            abort.node_id, abort.reason
        ));
    }
    if set.cancelled {
        lines.push(format!(
            "- the request was cancelled after {} of {} stages",
            set.stages_completed, set.stages_total
        ));
    }
    for miss in &set.missing {
        let kind = if miss.required { "required" } else { "optional" };
        lines.push(format!(
            "- {kind} node '{}' produced nothing: {}",
            miss.node_id, miss.reason
        ));
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn no_evidence_answer(request: &str, set: &TerminalResultSet) -> String {
    let mut text = format!("No evidence could be gathered for: {request}\n");
    if let Some(gaps) = gap_notes(set) {
        text.push_str(&format!("\nWhat went wrong:\n{gaps}\n"));
    }
    text
}

fn degraded_answer(request: &str, set: &TerminalResultSet) -> String {
    let mut text = format!(
        "A synthesized answer could not be produced for: {request}\n\
         The gathered findings are listed verbatim.\n\n{}",
        render_results(&set.results)
    );
    if let Some(gaps) = gap_notes(set) {
        text.push_str(&format!("\nGaps:\n{gaps}\n"));
    }
    text
}

fn answer_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["answer"],
        "properties": {
            "answer": {"type": "string"}
        }
    })
}
