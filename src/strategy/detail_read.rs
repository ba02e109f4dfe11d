//! Batched detail reads.
//!
//! Takes candidate ids (from upstream results or explicit params), reads each
//! full record with bounded internal concurrency, and compresses every one
//! into an independently bounded analysis. Raw bodies inform the digest and
//! are dropped before the result leaves this module.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;

use crate::budget::unit_model;
use crate::evidence::{EvidenceQuery, SourceRouter};
use crate::graph::GraphNode;

use super::{
    clamp_text, parse_params, ResolvedInputs, ResultItem, ResultStatus, Strategy, StrategyError,
    StrategyResult, SUMMARY_CHAR_LIMIT,
};

const DETAIL_READ_CAP: usize = 20;

/// Concurrent reads in flight inside one node.
const READ_CONCURRENCY: usize = 4;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailReadParams {
    /// Source for explicit ids; candidates from inputs carry their own
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    ids: Vec<String>,
    max_items: Option<usize>,
}

/// A candidate record to read in full.
struct Candidate {
    id: String,
    source: String,
    score: Option<f64>,
}

pub struct DetailRead {
    router: Arc<SourceRouter>,
}

impl DetailRead {
    pub fn new(router: Arc<SourceRouter>) -> Self {
        Self { router }
    }

    /// Read one record and compress it. `None` when the record is gone or
    /// its source cannot serve it.
    async fn read_one(&self, candidate: &Candidate) -> Option<ResultItem> {
        let source = match self.router.get(&candidate.source) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(id = %candidate.id, error = %e, "candidate source unavailable");
                return None;
            }
        };
        let query = EvidenceQuery::by_ids(vec![candidate.id.clone()]);
        match source.fetch(&query, 1).await {
            Ok(records) => records.first().map(|record| {
                let digest = record
                    .body
                    .as_deref()
                    .unwrap_or(record.snippet.as_str());
                ResultItem {
                    id: record.id.clone(),
                    source: record.source.clone(),
                    heading: clamp_text(&record.title, SUMMARY_CHAR_LIMIT),
                    summary: clamp_text(digest, SUMMARY_CHAR_LIMIT),
                    timestamp: record.timestamp,
                    participants: record.participants.clone(),
                    score: candidate.score,
                }
            }),
            Err(e) => {
                tracing::debug!(id = %candidate.id, error = %e, "detail read miss");
                None
            }
        }
    }
}

#[async_trait]
impl Strategy for DetailRead {
    fn name(&self) -> &str {
        "detail_read"
    }

    fn description(&self) -> &str {
        "Read candidate records in full and return one bounded analysis per record"
    }

    fn item_cap(&self) -> usize {
        DETAIL_READ_CAP
    }

    fn params_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "source": {"type": "string", "description": "Required with explicit ids"},
                "ids": {"type": "array", "items": {"type": "string"}},
                "maxItems": {"type": "integer", "minimum": 1}
            },
            "required": ["maxItems"]
        })
    }

    async fn execute(
        &self,
        node: &GraphNode,
        inputs: &ResolvedInputs,
    ) -> Result<StrategyResult, StrategyError> {
        let params: DetailReadParams = parse_params(self.name(), &node.params)?;

        let mut candidates: Vec<Candidate> = Vec::new();
        if !params.ids.is_empty() {
            let source = params.source.clone().ok_or_else(|| {
                StrategyError::InvalidParams {
                    strategy: self.name().to_string(),
                    reason: "explicit ids require a source".to_string(),
                }
            })?;
            for id in &params.ids {
                candidates.push(Candidate {
                    id: id.clone(),
                    source: source.clone(),
                    score: None,
                });
            }
        } else {
            if !inputs.is_empty() && inputs.available().next().is_none() {
                let reasons: Vec<String> = inputs
                    .unavailable()
                    .map(|(id, reason)| format!("{id}: {reason}"))
                    .collect();
                return Err(StrategyError::MissingInput {
                    reason: format!("all inputs unavailable ({})", reasons.join("; ")),
                });
            }
            if inputs.is_empty() {
                return Err(StrategyError::InvalidParams {
                    strategy: self.name().to_string(),
                    reason: "needs upstream candidates or explicit ids".to_string(),
                });
            }
            let mut seen = std::collections::HashSet::new();
            for (_, result) in inputs.available() {
                for item in &result.items {
                    if seen.insert(item.id.clone()) {
                        candidates.push(Candidate {
                            id: item.id.clone(),
                            source: item.source.clone(),
                            score: item.score,
                        });
                    }
                }
            }
        }

        let cap = params
            .max_items
            .unwrap_or(DETAIL_READ_CAP)
            .min(DETAIL_READ_CAP);
        let overflow = candidates.len() > cap;
        candidates.truncate(cap);
        let attempted = candidates.len();

        // Ordered, bounded fan-out inside the node. The (inert) futures are
        // built before the stream so no closure over `&Candidate` is held
        // across an await; rustc cannot prove such a closure Send inside the
        // boxed async-trait future (rust-lang/rust#102211).
        let reads: Vec<_> = candidates.iter().map(|c| self.read_one(c)).collect();
        let analyses: Vec<Option<ResultItem>> = stream::iter(reads)
            .buffered(READ_CONCURRENCY)
            .collect()
            .await;

        let items: Vec<ResultItem> = analyses.into_iter().flatten().collect();
        let misses = attempted - items.len();
        let degraded = misses > 0 || inputs.unavailable().next().is_some();
        let status = if attempted > 0 && items.is_empty() {
            ResultStatus::Failed
        } else if degraded {
            ResultStatus::Partial
        } else {
            ResultStatus::Success
        };
        if misses > 0 {
            tracing::debug!(node = %node.id, misses, "some candidates could not be read");
        }

        Ok(StrategyResult::bounded(
            &node.id,
            items,
            cap,
            overflow,
            unit_model(node.expected_cost),
            status,
        ))
    }
}
