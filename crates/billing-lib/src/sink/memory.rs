//! In-memory sink, used for dry runs and tests

use super::{BillingSink, IdempotencyKey, SinkError, WriteOutcome};
use crate::models::BillingRecord;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    keys: HashSet<IdempotencyKey>,
    records: Vec<BillingRecord>,
}

/// Keeps every written record in memory, in write order
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records written so far
    pub async fn records(&self) -> Vec<BillingRecord> {
        self.state.lock().await.records.clone()
    }

    /// Records for a single pod, in write order
    pub async fn records_for(&self, pod_uid: &str) -> Vec<BillingRecord> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.pod_uid == pod_uid)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BillingSink for MemorySink {
    async fn write(
        &self,
        key: &IdempotencyKey,
        record: &BillingRecord,
    ) -> Result<WriteOutcome, SinkError> {
        let mut state = self.state.lock().await;
        if !state.keys.insert(key.clone()) {
            return Ok(WriteOutcome::AlreadyExists);
        }
        state.records.push(record.clone());
        Ok(WriteOutcome::Written)
    }
}
