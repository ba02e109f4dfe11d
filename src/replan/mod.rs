//! Sufficiency assessment for one-shot replanning.
//!
//! After a round has been synthesized, the engine asks this module whether
//! the answer rests on enough evidence or whether one more planning round is
//! warranted. The verdict is a cheap local heuristic, not a model call, and
//! a replan round receives only the refinement hint produced here; results
//! from the first round are never carried across.

use crate::coordinator::TerminalResultSet;
use crate::synthesis::SynthesizedAnswer;

/// Verdict on a synthesized round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sufficiency {
    Sufficient,
    /// Too thin to answer; `hint` tells the next planning round what to fix.
    Insufficient { hint: String },
}

/// Judge whether `answer` rests on enough gathered evidence.
///
/// The heuristic is deliberately simple: a round is insufficient when it
/// gathered fewer than `floor` result items in total. Three cases are never
/// replanned regardless of item count: cancelled runs (user intent), aborted
/// runs (the answer already names a required gap), and degraded answers (the
/// evidence was fine, the synthesis backend was not).
pub fn assess(answer: &SynthesizedAnswer, set: &TerminalResultSet, floor: usize) -> Sufficiency {
    if set.cancelled || set.aborted.is_some() || answer.degraded {
        return Sufficiency::Sufficient;
    }
    let total = set.total_items();
    if total >= floor {
        return Sufficiency::Sufficient;
    }

    let mut hint = format!(
        "the previous plan gathered only {total} result item{} in total; \
         broaden the search terms or consult additional sources",
        if total == 1 { "" } else { "s" }
    );
    let empty: Vec<&str> = set
        .results
        .iter()
        .filter(|r| r.items.is_empty())
        .map(|r| r.node_id.as_str())
        .collect();
    if !empty.is_empty() {
        hint.push_str(&format!(
            ". Nodes that returned nothing: {}",
            empty.join(", ")
        ));
    }
    let unavailable: Vec<String> = set
        .missing
        .iter()
        .map(|m| format!("{} ({})", m.node_id, m.reason))
        .collect();
    if !unavailable.is_empty() {
        hint.push_str(&format!(
            ". Nodes that never produced data: {}",
            unavailable.join(", ")
        ));
    }

    tracing::info!(total_items = total, floor, "round judged insufficient");
    Sufficiency::Insufficient { hint }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::unit_model;
    use crate::coordinator::{AbortInfo, MissingNode, NodeSummaryCounts};
    use crate::graph::ExpectedCost;
    use crate::llm::TokenUsage;
    use crate::strategy::testing::ProbeStrategy;
    use crate::strategy::{ResultStatus, StrategyResult};

    fn result_with_items(node_id: &str, count: usize) -> StrategyResult {
        let items = (0..count)
            .map(|n| ProbeStrategy::synthetic_item(node_id, n))
            .collect();
        StrategyResult::bounded(
            node_id,
            items,
            25,
            false,
            unit_model(ExpectedCost::Low),
            ResultStatus::Success,
        )
    }

    fn set_with(results: Vec<StrategyResult>) -> TerminalResultSet {
        TerminalResultSet {
            results,
            missing: vec![],
            counts: NodeSummaryCounts::default(),
            units_consumed: 500,
            predicted_units: 700,
            stages_completed: 1,
            stages_total: 1,
            cancelled: false,
            aborted: None,
        }
    }

    fn answer() -> SynthesizedAnswer {
        SynthesizedAnswer {
            text: "Here is what I found.".to_string(),
            usage: TokenUsage::new(100, 50),
            degraded: false,
        }
    }

    #[test]
    fn test_enough_items_is_sufficient() {
        let set = set_with(vec![result_with_items("inbox", 3)]);
        assert_eq!(assess(&answer(), &set, 3), Sufficiency::Sufficient);
    }

    #[test]
    fn test_thin_round_names_empty_nodes_in_hint() {
        let mut set = set_with(vec![
            result_with_items("inbox", 1),
            result_with_items("events", 0),
        ]);
        set.missing = vec![MissingNode {
            node_id: "chat-scan".to_string(),
            required: false,
            reason: "node unavailable: source outage".to_string(),
        }];

        match assess(&answer(), &set, 3) {
            Sufficiency::Insufficient { hint } => {
                assert!(hint.contains("only 1 result item"));
                assert!(hint.contains("events"));
                assert!(hint.contains("chat-scan"));
                assert!(hint.contains("source outage"));
            }
            Sufficiency::Sufficient => panic!("expected insufficient verdict"),
        }
    }

    #[test]
    fn test_cancelled_round_never_replans() {
        let mut set = set_with(vec![]);
        set.cancelled = true;
        assert_eq!(assess(&answer(), &set, 3), Sufficiency::Sufficient);
    }

    #[test]
    fn test_aborted_round_never_replans() {
        let mut set = set_with(vec![]);
        set.aborted = Some(AbortInfo {
            node_id: "search-inbox".to_string(),
            reason: "invalid params".to_string(),
        });
        assert_eq!(assess(&answer(), &set, 3), Sufficiency::Sufficient);
    }

    #[test]
    fn test_degraded_answer_never_replans() {
        // The evidence was thin AND the synthesis backend was down; another
        // planning round cannot fix the backend.
        let set = set_with(vec![result_with_items("inbox", 1)]);
        let degraded = SynthesizedAnswer {
            text: "listing".to_string(),
            usage: TokenUsage::default(),
            degraded: true,
        };
        assert_eq!(assess(&degraded, &set, 3), Sufficiency::Sufficient);
    }
}
