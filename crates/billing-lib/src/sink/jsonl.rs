//! Append-only JSON-lines file sink
//!
//! Each billing record is one line. On open the existing file is scanned to
//! rebuild the set of stored idempotency keys, so a restarted agent that
//! re-lists the cluster does not duplicate rows.

use super::{BillingSink, IdempotencyKey, SinkError, WriteOutcome};
use crate::models::BillingRecord;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

struct JsonlState {
    keys: HashSet<IdempotencyKey>,
    file: File,
}

/// Billing sink appending JSON lines to a local file
pub struct JsonlSink {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlSink {
    /// Open (or create) the sink file and load its existing keys
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let keys = load_keys(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), records = keys.len(), "Opened billing sink");

        Ok(Self {
            path,
            state: Mutex::new(JsonlState { keys, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct records stored
    pub async fn len(&self) -> usize {
        self.state.lock().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BillingSink for JsonlSink {
    async fn write(
        &self,
        key: &IdempotencyKey,
        record: &BillingRecord,
    ) -> Result<WriteOutcome, SinkError> {
        let mut state = self.state.lock().await;
        if state.keys.contains(key) {
            return Ok(WriteOutcome::AlreadyExists);
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        state.file.write_all(&line).await?;
        state.file.sync_data().await?;

        state.keys.insert(key.clone());
        Ok(WriteOutcome::Written)
    }
}

async fn load_keys(path: &Path) -> Result<HashSet<IdempotencyKey>, SinkError> {
    let mut keys = HashSet::new();
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
        Err(e) => return Err(e.into()),
    };

    let mut lines = BufReader::new(file).lines();
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BillingRecord>(&line) {
            Ok(record) => {
                keys.insert(IdempotencyKey::for_record(&record));
            }
            Err(e) => {
                // A torn final line after a crash is expected; keep going
                warn!(path = %path.display(), line = line_number, error = %e, "Skipping unreadable sink line");
            }
        }
    }
    Ok(keys)
}
