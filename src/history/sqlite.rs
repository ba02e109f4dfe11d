//! SQLite-backed run store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{RunRecord, RunStatus, RunStore, StoreError};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY NOT NULL,
    request TEXT NOT NULL,
    answer TEXT NOT NULL,
    status TEXT NOT NULL,
    units_consumed INTEGER NOT NULL DEFAULT 0,
    predicted_units INTEGER NOT NULL DEFAULT 0,
    elapsed_ms INTEGER NOT NULL DEFAULT 0,
    replanned INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at DESC);
"#;

fn parse_status(s: &str) -> RunStatus {
    match s {
        "completed" => RunStatus::Completed,
        "degraded" => RunStatus::Degraded,
        "aborted" => RunStatus::Aborted,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    }
}

fn status_to_string(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::Degraded => "degraded",
        RunStatus::Aborted => "aborted",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Failed => "failed",
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let created_str: String = row.get(8)?;

    Ok(RunRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        request: row.get(1)?,
        answer: row.get(2)?,
        status: parse_status(&status_str),
        units_consumed: row.get::<_, i64>(4)? as u64,
        predicted_units: row.get::<_, i64>(5)? as u64,
        elapsed_ms: row.get::<_, i64>(6)? as u64,
        replanned: row.get::<_, i32>(7)? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Open(e.to_string()))?;
            }
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn record(&self, record: &RunRecord) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO runs
                 (id, request, answer, status, units_consumed, predicted_units,
                  elapsed_ms, replanned, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.to_string(),
                    record.request,
                    record.answer,
                    status_to_string(record.status),
                    record.units_consumed as i64,
                    record.predicted_units as i64,
                    record.elapsed_ms as i64,
                    record.replanned as i32,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok::<_, rusqlite::Error>(())
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))??;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.conn.clone();
        let id_str = id.to_string();
        let record = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT id, request, answer, status, units_consumed, predicted_units,
                        elapsed_ms, replanned, created_at
                 FROM runs WHERE id = ?1",
                params![id_str],
                row_to_record,
            )
            .optional()
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))??;
        Ok(record)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.conn.clone();
        let records = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, request, answer, status, units_consumed, predicted_units,
                        elapsed_ms, replanned, created_at
                 FROM runs
                 ORDER BY created_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))??;
        Ok(records)
    }
}
