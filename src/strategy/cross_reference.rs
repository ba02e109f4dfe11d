//! Cross-referencing of upstream results.
//!
//! Pure computation over compressed inputs: combines the item sets of this
//! node's dependencies (intersection, union, or difference against the first
//! input), scores each finding by how many inputs mention it, ranks, and
//! returns a bounded subset. Touches no source.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;

use crate::budget::unit_model;
use crate::graph::GraphNode;

use super::{
    parse_params, ResolvedInputs, ResultItem, ResultStatus, Strategy, StrategyError,
    StrategyResult,
};

const CROSS_REFERENCE_CAP: usize = 25;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Mode {
    /// Keep only ids present in every available input
    #[default]
    Intersect,
    /// Keep ids from any input, deduplicated
    Union,
    /// Keep ids of the first input absent from every later one
    Difference,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RankBy {
    /// Newest first
    #[default]
    Recency,
    /// Most-mentioned first
    Mentions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrossReferenceParams {
    #[serde(default)]
    mode: Mode,
    #[serde(default)]
    rank_by: RankBy,
    max_items: Option<usize>,
}

pub struct CrossReference;

impl CrossReference {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Strategy for CrossReference {
    fn name(&self) -> &str {
        "cross_reference"
    }

    fn description(&self) -> &str {
        "Intersect, merge, or difference upstream results, rank them, and keep a bounded subset"
    }

    fn item_cap(&self) -> usize {
        CROSS_REFERENCE_CAP
    }

    fn params_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["intersect", "union", "difference"]},
                "rankBy": {"type": "string", "enum": ["recency", "mentions"]},
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
        let params: CrossReferenceParams = parse_params(self.name(), &node.params)?;

        if inputs.is_empty() {
            return Err(StrategyError::InvalidParams {
                strategy: self.name().to_string(),
                reason: "requires at least one dependency".to_string(),
            });
        }

        let available: Vec<_> = inputs.available().collect();
        if available.is_empty() {
            let reasons: Vec<String> = inputs
                .unavailable()
                .map(|(id, reason)| format!("{id}: {reason}"))
                .collect();
            return Err(StrategyError::MissingInput {
                reason: format!("all inputs unavailable ({})", reasons.join("; ")),
            });
        }

        // First appearance keeps the item; later inputs only raise the count.
        let mut order: Vec<String> = Vec::new();
        let mut merged: std::collections::HashMap<String, (ResultItem, usize)> =
            std::collections::HashMap::new();
        for (_, result) in &available {
            let mut seen_here: HashSet<&str> = HashSet::new();
            for item in &result.items {
                if !seen_here.insert(&item.id) {
                    continue;
                }
                match merged.get_mut(&item.id) {
                    Some((_, count)) => *count += 1,
                    None => {
                        order.push(item.id.clone());
                        merged.insert(item.id.clone(), (item.clone(), 1));
                    }
                }
            }
        }

        // Difference keeps ids unique to the first declared input.
        let (base_ids, later_ids) = match params.mode {
            Mode::Difference => {
                let base: HashSet<&str> =
                    available[0].1.items.iter().map(|i| i.id.as_str()).collect();
                let mut later: HashSet<&str> = HashSet::new();
                for (_, result) in available.iter().skip(1) {
                    later.extend(result.items.iter().map(|i| i.id.as_str()));
                }
                (base, later)
            }
            _ => (HashSet::new(), HashSet::new()),
        };

        let input_count = available.len();
        let mut matched: Vec<ResultItem> = order
            .into_iter()
            .filter_map(|id| merged.remove(&id))
            .filter(|(item, count)| match params.mode {
                Mode::Intersect => *count == input_count,
                Mode::Union => true,
                Mode::Difference => {
                    base_ids.contains(item.id.as_str()) && !later_ids.contains(item.id.as_str())
                }
            })
            .map(|(mut item, count)| {
                item.score = Some(count as f64 / input_count as f64);
                item
            })
            .collect();

        match params.rank_by {
            RankBy::Recency => matched.sort_by(|a, b| {
                b.timestamp
                    .cmp(&a.timestamp)
                    .then_with(|| a.id.cmp(&b.id))
            }),
            RankBy::Mentions => matched.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.timestamp.cmp(&a.timestamp))
                    .then_with(|| a.id.cmp(&b.id))
            }),
        }

        let cap = params
            .max_items
            .unwrap_or(CROSS_REFERENCE_CAP)
            .min(CROSS_REFERENCE_CAP);
        let status = if inputs.unavailable().next().is_some() {
            ResultStatus::Partial
        } else {
            ResultStatus::Success
        };

        Ok(StrategyResult::bounded(
            &node.id,
            matched,
            cap,
            false,
            unit_model(node.expected_cost),
            status,
        ))
    }
}
