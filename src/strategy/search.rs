//! Search strategies: keyword search and metadata filter.
//!
//! Both run one bounded query against a single source. They differ only in
//! what they require from params: keyword search needs keywords, metadata
//! filter needs at least one structural criterion and refuses keywords.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::budget::unit_model;
use crate::evidence::{EvidenceQuery, SourceRouter};
use crate::graph::GraphNode;

use super::{
    parse_params, ResolvedInputs, ResultItem, ResultStatus, Strategy, StrategyError,
    StrategyResult,
};

const SEARCH_ITEM_CAP: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    source: String,
    #[serde(flatten)]
    query: EvidenceQuery,
    max_items: Option<usize>,
}

/// Run one bounded query and compress the hits.
///
/// The dry-run estimate tells us how many records matched in total, so the
/// `truncated` flag is accurate even when the fetch came back full.
async fn fetch_bounded(
    router: &SourceRouter,
    node: &GraphNode,
    params: &SearchParams,
    cap: usize,
) -> Result<StrategyResult, StrategyError> {
    let source = router.get(&params.source)?;
    let total = source.estimate(&params.query).await?;
    let raw = source.fetch(&params.query, cap).await?;

    let items: Vec<ResultItem> = raw.iter().map(ResultItem::from_evidence).collect();
    let source_truncated = total > raw.len() as u64;

    Ok(StrategyResult::bounded(
        &node.id,
        items,
        cap,
        source_truncated,
        unit_model(node.expected_cost),
        ResultStatus::Success,
    ))
}

/// Free-text search over one source.
pub struct KeywordSearch {
    router: Arc<SourceRouter>,
}

impl KeywordSearch {
    pub fn new(router: Arc<SourceRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Strategy for KeywordSearch {
    fn name(&self) -> &str {
        "keyword_search"
    }

    fn description(&self) -> &str {
        "Search one source by keywords, optionally narrowed by participant, tags or a time window"
    }

    fn item_cap(&self) -> usize {
        SEARCH_ITEM_CAP
    }

    fn params_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "source": {"type": "string", "description": "Evidence source id"},
                "keywords": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                "participant": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "after": {"type": "string", "format": "date-time"},
                "before": {"type": "string", "format": "date-time"},
                "maxItems": {"type": "integer", "minimum": 1}
            },
            "required": ["source", "keywords", "maxItems"]
        })
    }

    async fn execute(
        &self,
        node: &GraphNode,
        _inputs: &ResolvedInputs,
    ) -> Result<StrategyResult, StrategyError> {
        let params: SearchParams = parse_params(self.name(), &node.params)?;
        if params.query.keywords.is_empty() {
            return Err(StrategyError::InvalidParams {
                strategy: self.name().to_string(),
                reason: "keywords must not be empty".to_string(),
            });
        }

        let cap = params
            .max_items
            .unwrap_or(SEARCH_ITEM_CAP)
            .min(SEARCH_ITEM_CAP);
        fetch_bounded(&self.router, node, &params, cap).await
    }
}

/// Structural filter over one source: tags, participant, time window or ids,
/// no free text.
pub struct MetadataFilter {
    router: Arc<SourceRouter>,
}

impl MetadataFilter {
    pub fn new(router: Arc<SourceRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Strategy for MetadataFilter {
    fn name(&self) -> &str {
        "metadata_filter"
    }

    fn description(&self) -> &str {
        "Filter one source by tags, participant, time window or explicit ids"
    }

    fn item_cap(&self) -> usize {
        SEARCH_ITEM_CAP
    }

    fn params_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "source": {"type": "string", "description": "Evidence source id"},
                "participant": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "after": {"type": "string", "format": "date-time"},
                "before": {"type": "string", "format": "date-time"},
                "ids": {"type": "array", "items": {"type": "string"}},
                "maxItems": {"type": "integer", "minimum": 1}
            },
            "required": ["source", "maxItems"]
        })
    }

    async fn execute(
        &self,
        node: &GraphNode,
        _inputs: &ResolvedInputs,
    ) -> Result<StrategyResult, StrategyError> {
        let params: SearchParams = parse_params(self.name(), &node.params)?;
        if !params.query.keywords.is_empty() {
            return Err(StrategyError::InvalidParams {
                strategy: self.name().to_string(),
                reason: "keywords are not accepted here, use keyword_search".to_string(),
            });
        }
        let q = &params.query;
        if q.tags.is_empty()
            && q.participant.is_none()
            && q.after.is_none()
            && q.before.is_none()
            && q.ids.is_empty()
        {
            return Err(StrategyError::InvalidParams {
                strategy: self.name().to_string(),
                reason: "at least one filter criterion is required".to_string(),
            });
        }

        let cap = params
            .max_items
            .unwrap_or(SEARCH_ITEM_CAP)
            .min(SEARCH_ITEM_CAP);
        fetch_bounded(&self.router, node, &params, cap).await
    }
}
