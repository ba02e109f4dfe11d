//! In-memory run store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RunRecord, RunStore, StoreError};

#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    records: Arc<RwLock<HashMap<Uuid, RunRecord>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn record(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let mut records: Vec<RunRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}
