//! Evidence-source contract and routing.
//!
//! Evidence sources are the read-only collaborators the engine gathers from
//! (mailbox search, calendar lookup, chat reads). They sit behind one trait
//! with two modes: a bounded fetch and a dry-run estimate that counts matches
//! without paying for their payloads. Strategies are the only callers; raw
//! [`EvidenceItem`]s never cross a stage boundary.

pub mod memory;

pub use memory::MemorySource;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Built-in source identifiers.
pub const MAILBOX: &str = "mailbox";
pub const CALENDAR: &str = "calendar";
pub const CHAT: &str = "chat";

/// One raw record held by an evidence source.
///
/// `body` may be arbitrarily large; it is only ever read inside a strategy
/// executor and never appears in a [`crate::strategy::StrategyResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: String,
    /// Identifier of the source that owns this record
    pub source: String,
    pub title: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Filter criteria sent to a source.
///
/// All populated fields must match (conjunctive). An empty query matches
/// every record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvidenceQuery {
    /// Every keyword must appear in title, snippet or body (case-insensitive)
    pub keywords: Vec<String>,
    /// Restrict to records involving this participant
    pub participant: Option<String>,
    /// Every listed tag must be present on the record
    pub tags: Vec<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    /// Restrict to these record ids (batched detail reads)
    pub ids: Vec<String>,
}

impl EvidenceQuery {
    /// Query selecting exactly the given record ids.
    pub fn by_ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Errors from evidence sources.
///
/// `Display` and `Error` are implemented by hand: the `source` fields name an
/// evidence source id, which collides with `thiserror`'s convention of
/// treating any field named `source` as the error cause.
#[derive(Debug, Clone)]
pub enum SourceError {
    Unavailable { source: String, reason: String },

    RateLimited {
        source: String,
        retry_after: Option<Duration>,
    },

    InvalidQuery { source: String, reason: String },

    UnknownSource(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Unavailable { source, reason } => {
                write!(f, "source '{source}' unavailable: {reason}")
            }
            SourceError::RateLimited { source, .. } => {
                write!(f, "source '{source}' rate limited")
            }
            SourceError::InvalidQuery { source, reason } => {
                write!(f, "invalid query for source '{source}': {reason}")
            }
            SourceError::UnknownSource(id) => {
                write!(f, "no evidence source registered for '{id}'")
            }
        }
    }
}

impl std::error::Error for SourceError {}

impl SourceError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Unavailable { .. } | SourceError::RateLimited { .. }
        )
    }
}

/// Read-only evidence collaborator.
///
/// `estimate` is the dry-run mode: it must return the number of records
/// `fetch` would match, without materializing payloads.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    /// Stable identifier used in strategy params (`"mailbox"`, `"calendar"`, ...).
    fn id(&self) -> &str;

    /// Return at most `max_items` matching records.
    async fn fetch(
        &self,
        query: &EvidenceQuery,
        max_items: usize,
    ) -> Result<Vec<EvidenceItem>, SourceError>;

    /// Count matching records without fetching them.
    async fn estimate(&self, query: &EvidenceQuery) -> Result<u64, SourceError>;
}

/// Maps source identifiers to implementations.
///
/// Built once at startup and shared read-only across all in-flight requests.
#[derive(Default)]
pub struct SourceRouter {
    sources: HashMap<String, Arc<dyn EvidenceSource>>,
}

impl SourceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under its own id. Replaces any previous registration.
    pub fn register(&mut self, source: Arc<dyn EvidenceSource>) {
        self.sources.insert(source.id().to_string(), source);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn EvidenceSource>, SourceError> {
        self.sources
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::UnknownSource(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    /// Registered source ids, sorted for stable output.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }
}
