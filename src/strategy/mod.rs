//! Strategy executors and their registry.
//!
//! A strategy is one bounded evidence-gathering operation: keyword search,
//! metadata filter, cross-reference, batched detail read. All of them share
//! one contract and one hard rule: a [`StrategyResult`] never exceeds the
//! strategy's declared item cap, and its items are compressed summaries, not
//! raw records. [`ResultItem`] has no body field on purpose; whatever a
//! source returned stays inside the executor that fetched it. This is the
//! compression funnel every downstream component relies on.
//!
//! Strategies are read-only. Anything that mutates user-visible state goes
//! through the confirm-then-execute flow in [`crate::actions`] instead, never
//! through this registry.

mod cross_reference;
mod detail_read;
mod search;

pub use cross_reference::CrossReference;
pub use detail_read::DetailRead;
pub use search::{KeywordSearch, MetadataFilter};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::UnitModel;
use crate::evidence::{EvidenceItem, SourceError, SourceRouter};
use crate::graph::GraphNode;

/// Longest summary a result item may carry, in characters.
pub const SUMMARY_CHAR_LIMIT: usize = 280;

/// One compressed finding inside a [`StrategyResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    /// Id of the evidence record this finding refers to
    pub id: String,
    pub source: String,
    pub heading: String,
    /// Bounded digest, at most [`SUMMARY_CHAR_LIMIT`] characters
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    /// Ranking score assigned by cross-referencing, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl ResultItem {
    /// Compress a raw record into a bounded finding. The record's body is
    /// read for the digest but never stored.
    pub fn from_evidence(item: &EvidenceItem) -> Self {
        let digest = if item.snippet.is_empty() {
            item.body.as_deref().unwrap_or("")
        } else {
            &item.snippet
        };
        Self {
            id: item.id.clone(),
            source: item.source.clone(),
            heading: clamp_text(&item.title, SUMMARY_CHAR_LIMIT),
            summary: clamp_text(digest, SUMMARY_CHAR_LIMIT),
            timestamp: item.timestamp,
            participants: item.participants.clone(),
            score: None,
        }
    }
}

/// Truncate to `limit` characters on a char boundary.
pub fn clamp_text(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Outcome class of one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    /// Produced data but with gaps (missing inputs, unreadable records)
    Partial,
    Failed,
}

/// The bounded output of one node execution attempt.
///
/// Created exactly once per attempt; never mutated afterwards. The only
/// constructor clamps `items` to the strategy's cap, which makes the cap
/// impossible to bypass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyResult {
    pub node_id: String,
    pub items: Vec<ResultItem>,
    /// True when items were dropped, by the cap or at the source
    pub truncated: bool,
    pub units_consumed: u64,
    pub status: ResultStatus,
}

impl StrategyResult {
    /// Build a result, enforcing the item cap and pricing the final item
    /// count through `model`.
    pub fn bounded(
        node_id: impl Into<String>,
        mut items: Vec<ResultItem>,
        cap: usize,
        source_truncated: bool,
        model: UnitModel,
        status: ResultStatus,
    ) -> Self {
        let clamped = items.len() > cap;
        items.truncate(cap);
        Self {
            node_id: node_id.into(),
            units_consumed: model.units_for(items.len()),
            truncated: source_truncated || clamped,
            items,
            status,
        }
    }

    /// An empty failed result recording the attempt.
    pub fn failed(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            items: Vec::new(),
            truncated: false,
            units_consumed: 0,
            status: ResultStatus::Failed,
        }
    }
}

/// What a node sees of one declared dependency.
#[derive(Debug, Clone)]
pub enum ResolvedInput {
    /// The dependency's compressed result
    Available(Arc<StrategyResult>),
    /// The dependency did not produce data; dependents decide how to degrade
    Unavailable { reason: String },
}

/// A node's dependencies in declaration order.
///
/// This is the whole of what an executor may see from upstream: compressed
/// results and unavailability markers, nothing else.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    entries: Vec<(String, ResolvedInput)>,
}

impl ResolvedInputs {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node_id: impl Into<String>, input: ResolvedInput) {
        self.entries.push((node_id.into(), input));
    }

    pub fn get(&self, node_id: &str) -> Option<&ResolvedInput> {
        self.entries
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(_, input)| input)
    }

    /// Dependencies that produced data, in declaration order.
    pub fn available(&self) -> impl Iterator<Item = (&str, &Arc<StrategyResult>)> {
        self.entries.iter().filter_map(|(id, input)| match input {
            ResolvedInput::Available(result) => Some((id.as_str(), result)),
            ResolvedInput::Unavailable { .. } => None,
        })
    }

    /// Dependencies that did not produce data, with their reasons.
    pub fn unavailable(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(id, input)| match input {
            ResolvedInput::Unavailable { reason } => Some((id.as_str(), reason.as_str())),
            ResolvedInput::Available(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Errors from strategy execution.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("invalid params for '{strategy}': {reason}")]
    InvalidParams { strategy: String, reason: String },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("strategy call exceeded its deadline")]
    Timeout,

    #[error("no usable input: {reason}")]
    MissingInput { reason: String },
}

impl StrategyError {
    /// Transient errors are retried by the coordinator; permanent ones mark
    /// the node failed immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            StrategyError::Source(e) => e.is_transient(),
            StrategyError::Timeout => true,
            StrategyError::InvalidParams { .. } | StrategyError::MissingInput { .. } => false,
        }
    }
}

/// One bounded evidence-gathering operation.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Identifier used in graph nodes.
    fn name(&self) -> &str;

    /// One-line description for the decomposer prompt and the catalog endpoint.
    fn description(&self) -> &str;

    /// Hard cap on items in any result this strategy returns.
    fn item_cap(&self) -> usize;

    /// JSON schema of the node params this strategy accepts.
    fn params_schema(&self) -> serde_json::Value;

    /// Run one bounded operation. `inputs` holds only compressed upstream
    /// results, keyed and ordered by the node's `dependsOn` list.
    async fn execute(
        &self,
        node: &GraphNode,
        inputs: &ResolvedInputs,
    ) -> Result<StrategyResult, StrategyError>;
}

/// Catalog entry describing one registered strategy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyInfo {
    pub name: String,
    pub description: String,
    pub item_cap: usize,
    pub params_schema: serde_json::Value,
}

/// Maps strategy identifiers to executors.
///
/// Resolved once at startup, then shared read-only by every in-flight
/// request. Dispatch is always by name through this table.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    /// An empty registry, for tests that register probes.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry holding the built-in read strategies over `router`.
    pub fn with_defaults(router: Arc<SourceRouter>) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(KeywordSearch::new(Arc::clone(&router))));
        registry.register(Arc::new(MetadataFilter::new(Arc::clone(&router))));
        registry.register(Arc::new(CrossReference::new()));
        registry.register(Arc::new(DetailRead::new(router)));
        tracing::debug!(strategies = registry.strategies.len(), "strategy registry ready");
        registry
    }

    /// Register an executor under its own name. Replaces any previous one.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Registered names, for graph validation.
    pub fn known_names(&self) -> HashSet<String> {
        self.strategies.keys().cloned().collect()
    }

    /// Catalog sorted by name, for the decomposer prompt and the API.
    pub fn catalog(&self) -> Vec<StrategyInfo> {
        let mut infos: Vec<StrategyInfo> = self
            .strategies
            .values()
            .map(|s| StrategyInfo {
                name: s.name().to_string(),
                description: s.description().to_string(),
                item_cap: s.item_cap(),
                params_schema: s.params_schema(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

/// Parse a node's params into a strategy's typed param struct.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    strategy: &str,
    params: &serde_json::Value,
) -> Result<T, StrategyError> {
    serde_json::from_value(params.clone()).map_err(|e| StrategyError::InvalidParams {
        strategy: strategy.to_string(),
        reason: e.to_string(),
    })
}
