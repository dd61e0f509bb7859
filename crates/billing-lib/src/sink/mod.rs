//! Billing record sinks
//!
//! A sink is an append-oriented store for [`BillingRecord`]s. Every write
//! carries an idempotency key; writing a key that is already stored must
//! succeed as [`WriteOutcome::AlreadyExists`] without adding a row.

mod jsonl;
mod memory;

pub use jsonl::JsonlSink;
pub use memory::MemorySink;

use crate::models::{BillingRecord, ResourceVersion};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unique key of a billing record: (pod UID, resource version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub pod_uid: String,
    pub resource_version: ResourceVersion,
}

impl IdempotencyKey {
    pub fn new(pod_uid: impl Into<String>, resource_version: ResourceVersion) -> Self {
        Self {
            pod_uid: pod_uid.into(),
            resource_version,
        }
    }

    pub fn for_record(record: &BillingRecord) -> Self {
        Self::new(record.pod_uid.clone(), record.resource_version.clone())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pod_uid, self.resource_version)
    }
}

/// Result of a successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    AlreadyExists,
}

/// Sink failures
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Append-oriented billing store
#[async_trait]
pub trait BillingSink: Send + Sync {
    async fn write(
        &self,
        key: &IdempotencyKey,
        record: &BillingRecord,
    ) -> Result<WriteOutcome, SinkError>;
}
