//! Run history with pluggable backends.
//!
//! Every finished request leaves one [`RunRecord`]: the request text, the
//! answer, and the run's accounting. Raw evidence and intermediate node
//! results are never stored; the record is the post-funnel view only.
//!
//! Backends:
//! - `memory`: non-persistent, used in tests and when no database is
//!   configured
//! - `sqlite`: persistent single-file database

mod memory;
mod sqlite;

pub use memory::InMemoryRunStore;
pub use sqlite::SqliteRunStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::synthesis::FinalResult;

/// Terminal disposition of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Answered from a fully executed graph.
    Completed,
    /// Answered, but the synthesis backend was unavailable.
    Degraded,
    /// A required node failed; the answer names the gap.
    Aborted,
    /// Cancelled by the caller; the answer covers completed stages.
    Cancelled,
    /// No answer was produced at all.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Degraded => write!(f, "degraded"),
            Self::Aborted => write!(f, "aborted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One completed (or failed) request, as kept by a [`RunStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Request id, shared with the live request lifecycle.
    pub id: Uuid,
    pub request: String,
    pub answer: String,
    pub status: RunStatus,
    pub units_consumed: u64,
    pub predicted_units: u64,
    pub elapsed_ms: u64,
    pub replanned: bool,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Record for a request that produced an answer.
    pub fn from_answer(request: impl Into<String>, result: &FinalResult, status: RunStatus) -> Self {
        Self {
            id: result.request_id,
            request: request.into(),
            answer: result.text.clone(),
            status,
            units_consumed: result.metadata.units_consumed,
            predicted_units: result.metadata.predicted_units,
            elapsed_ms: result.metadata.elapsed_ms,
            replanned: result.metadata.replanned,
            created_at: Utc::now(),
        }
    }

    /// Record for a request that failed before any answer existed.
    pub fn from_failure(id: Uuid, request: impl Into<String>, reason: &str) -> Self {
        Self {
            id,
            request: request.into(),
            answer: format!("request failed: {reason}"),
            status: RunStatus::Failed,
            units_consumed: 0,
            predicted_units: 0,
            elapsed_ms: 0,
            replanned: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("could not open history database: {0}")]
    Open(String),

    #[error("storage task failed: {0}")]
    Background(String),
}

/// Store of finished runs, newest first.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Whether records survive a process restart.
    fn is_persistent(&self) -> bool;

    /// Insert or replace the record for `record.id`.
    async fn record(&self, record: &RunRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError>;

    /// Most recent records, newest first, at most `limit`.
    async fn recent(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}

/// Open the store selected by configuration.
///
/// `None` keeps history in memory; a path opens (creating if needed) a
/// sqlite database at that location.
pub async fn open_store(db_path: Option<PathBuf>) -> Result<Arc<dyn RunStore>, StoreError> {
    match db_path {
        None => Ok(Arc::new(InMemoryRunStore::new())),
        Some(path) => {
            let store = SqliteRunStore::open(path).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request: &str, status: RunStatus, created_at: DateTime<Utc>) -> RunRecord {
        RunRecord {
            id: Uuid::new_v4(),
            request: request.to_string(),
            answer: format!("answer to: {request}"),
            status,
            units_consumed: 4_200,
            predicted_units: 5_000,
            elapsed_ms: 1_800,
            replanned: false,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trips_a_record() {
        let store = InMemoryRunStore::new();
        let rec = record("what's on my calendar today", RunStatus::Completed, Utc::now());

        store.record(&rec).await.unwrap();
        let loaded = store.get(rec.id).await.unwrap().unwrap();

        assert_eq!(loaded.request, rec.request);
        assert_eq!(loaded.answer, rec.answer);
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.units_consumed, 4_200);
        assert!(!store.is_persistent());
    }

    #[tokio::test]
    async fn test_recent_returns_newest_first_and_respects_limit() {
        let store = InMemoryRunStore::new();
        let base = Utc::now();
        for (i, req) in ["first", "second", "third"].iter().enumerate() {
            let rec = record(
                req,
                RunStatus::Completed,
                base + chrono::Duration::seconds(i as i64),
            );
            store.record(&rec).await.unwrap();
        }

        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request, "third");
        assert_eq!(recent[1].request, "second");
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");

        let rec = record("what emails am I blocking people on", RunStatus::Aborted, Utc::now());
        {
            let store = SqliteRunStore::open(path.clone()).await.unwrap();
            assert!(store.is_persistent());
            store.record(&rec).await.unwrap();
        }

        let reopened = SqliteRunStore::open(path).await.unwrap();
        let loaded = reopened.get(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Aborted);
        assert_eq!(loaded.request, rec.request);
        assert_eq!(loaded.units_consumed, rec.units_consumed);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            rec.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_sqlite_recent_orders_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRunStore::open(dir.path().join("runs.db")).await.unwrap();

        let base = Utc::now();
        let mut first = record("older", RunStatus::Completed, base);
        let second = record(
            "newer",
            RunStatus::Degraded,
            base + chrono::Duration::seconds(5),
        );
        store.record(&first).await.unwrap();
        store.record(&second).await.unwrap();

        // Re-recording the same id replaces rather than duplicates.
        first.answer = "revised".to_string();
        store.record(&first).await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request, "newer");
        assert_eq!(recent[0].status, RunStatus::Degraded);
        assert_eq!(recent[1].answer, "revised");
    }

    #[tokio::test]
    async fn test_open_store_selects_backend_from_path() {
        let in_memory = open_store(None).await.unwrap();
        assert!(!in_memory.is_persistent());

        let dir = tempfile::tempdir().unwrap();
        let persistent = open_store(Some(dir.path().join("runs.db"))).await.unwrap();
        assert!(persistent.is_persistent());
    }
}
