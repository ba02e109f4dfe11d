//! In-memory evidence source.
//!
//! Backs the daemon when no live collaborators are wired up: point
//! `EVIDENCE_FIXTURE_PATH` at a JSON array of records and every registered
//! source serves its share of them. Also the workhorse behind most tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{EvidenceItem, EvidenceQuery, EvidenceSource, SourceError, SourceRouter};
use super::{CALENDAR, CHAT, MAILBOX};

/// Errors reading a fixture file.
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("failed to read fixture file: {0}")]
    Io(#[from] std::io::Error),

    #[error("fixture file is not a JSON array of records: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Evidence source over a fixed in-process record set.
pub struct MemorySource {
    id: String,
    items: RwLock<Vec<EvidenceItem>>,
}

impl MemorySource {
    /// Empty source with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            items: RwLock::new(Vec::new()),
        }
    }

    /// Source pre-populated with `items`.
    pub fn with_items(id: impl Into<String>, items: Vec<EvidenceItem>) -> Self {
        Self {
            id: id.into(),
            items: RwLock::new(items),
        }
    }

    /// Add a record.
    pub fn insert(&self, item: EvidenceItem) {
        self.items.write().unwrap().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, query: &EvidenceQuery) -> Vec<EvidenceItem> {
        let items = self.items.read().unwrap();
        let mut matched: Vec<EvidenceItem> = items
            .iter()
            .filter(|item| matches_query(item, query))
            .cloned()
            .collect();
        // Chronological, undated records last, id as a stable tiebreak.
        matched.sort_by(|a, b| match (a.timestamp, b.timestamp) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        matched
    }
}

#[async_trait]
impl EvidenceSource for MemorySource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        query: &EvidenceQuery,
        max_items: usize,
    ) -> Result<Vec<EvidenceItem>, SourceError> {
        let mut matched = self.matching(query);
        matched.truncate(max_items);
        Ok(matched)
    }

    async fn estimate(&self, query: &EvidenceQuery) -> Result<u64, SourceError> {
        Ok(self.matching(query).len() as u64)
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Conjunctive filter per the source contract.
fn matches_query(item: &EvidenceItem, query: &EvidenceQuery) -> bool {
    if !query.ids.is_empty() && !query.ids.contains(&item.id) {
        return false;
    }

    for keyword in &query.keywords {
        let in_title = contains_ci(&item.title, keyword);
        let in_snippet = contains_ci(&item.snippet, keyword);
        let in_body = item
            .body
            .as_deref()
            .map(|b| contains_ci(b, keyword))
            .unwrap_or(false);
        if !in_title && !in_snippet && !in_body {
            return false;
        }
    }

    if let Some(participant) = &query.participant {
        if !item.participants.iter().any(|p| contains_ci(p, participant)) {
            return false;
        }
    }

    for tag in &query.tags {
        if !item.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return false;
        }
    }

    if let Some(after) = query.after {
        match item.timestamp {
            Some(ts) if ts >= after => {}
            _ => return false,
        }
    }

    if let Some(before) = query.before {
        match item.timestamp {
            Some(ts) if ts < before => {}
            _ => return false,
        }
    }

    true
}

/// Build a router from a fixture file: a JSON array of [`EvidenceItem`]s,
/// grouped by their `source` field. The built-in sources are always present,
/// empty when the fixture has no records for them.
pub fn router_from_fixture(path: &Path) -> Result<SourceRouter, FixtureError> {
    let text = std::fs::read_to_string(path)?;
    let items: Vec<EvidenceItem> = serde_json::from_str(&text)?;

    let mut by_source: HashMap<String, Vec<EvidenceItem>> = HashMap::new();
    for builtin in [MAILBOX, CALENDAR, CHAT] {
        by_source.entry(builtin.to_string()).or_default();
    }
    for item in items {
        by_source.entry(item.source.clone()).or_default().push(item);
    }

    let mut router = SourceRouter::new();
    for (id, share) in by_source {
        router.register(Arc::new(MemorySource::with_items(id, share)));
    }
    Ok(router)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::super::testing::mail_item;
    use super::*;

    fn source_with(n: usize) -> MemorySource {
        MemorySource::with_items(MAILBOX, (0..n).map(|i| mail_item(i, &["awaiting-reply"])).collect())
    }

    #[tokio::test]
    async fn test_fetch_truncates_to_max_items() {
        let source = source_with(47);
        let all = source.fetch(&EvidenceQuery::default(), 100).await.unwrap();
        assert_eq!(all.len(), 47);
        let capped = source.fetch(&EvidenceQuery::default(), 10).await.unwrap();
        assert_eq!(capped.len(), 10);
        // Estimate still reports the full match count.
        assert_eq!(source.estimate(&EvidenceQuery::default()).await.unwrap(), 47);
    }

    #[tokio::test]
    async fn test_keyword_match_is_conjunctive() {
        let source = source_with(5);
        let query = EvidenceQuery {
            keywords: vec!["awaiting".to_string(), "message 3".to_string()],
            ..Default::default()
        };
        let hits = source.fetch(&query, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "mail-3");
    }

    #[tokio::test]
    async fn test_id_and_tag_filters() {
        let source = source_with(5);
        let query = EvidenceQuery::by_ids(vec!["mail-1".to_string(), "mail-4".to_string()]);
        let hits = source.fetch(&query, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let query = EvidenceQuery {
            tags: vec!["AWAITING-REPLY".to_string()],
            ..Default::default()
        };
        assert_eq!(source.estimate(&query).await.unwrap(), 5);

        let query = EvidenceQuery {
            tags: vec!["archived".to_string()],
            ..Default::default()
        };
        assert_eq!(source.estimate(&query).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_time_window_excludes_undated() {
        let source = MemorySource::with_items(
            CALENDAR,
            vec![
                EvidenceItem {
                    id: "dated".to_string(),
                    source: CALENDAR.to_string(),
                    title: "Dated".to_string(),
                    snippet: String::new(),
                    body: None,
                    timestamp: Some(Utc.with_ymd_and_hms(2025, 3, 2, 10, 0, 0).unwrap()),
                    participants: vec![],
                    tags: vec![],
                },
                EvidenceItem {
                    id: "undated".to_string(),
                    source: CALENDAR.to_string(),
                    title: "Undated".to_string(),
                    snippet: String::new(),
                    body: None,
                    timestamp: None,
                    participants: vec![],
                    tags: vec![],
                },
            ],
        );
        let query = EvidenceQuery {
            after: Some(Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        let hits = source.fetch(&query, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "dated");
    }

    #[tokio::test]
    async fn test_results_sorted_chronologically() {
        let source = source_with(5);
        let hits = source.fetch(&EvidenceQuery::default(), 10).await.unwrap();
        let times: Vec<_> = hits.iter().map(|h| h.timestamp.unwrap()).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }
}
