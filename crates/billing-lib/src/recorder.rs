//! Idempotent, ordered persistence of billing events
//!
//! The recorder sits between a watch session and the shared sink. It keeps
//! the last committed resource version per pod UID and refuses to write
//! anything that would move a pod's history backwards, except deletes,
//! which always reach the sink so a billing window can be closed.
//! Failing sink writes mark the `sink` health component degraded until the
//! next successful write.

use crate::backoff::{Backoff, BackoffConfig};
use crate::health::{components, HealthRegistry};
use crate::models::{BillingEventKind, ResourceVersion};
use crate::normalizer::NormalizedEvent;
use crate::observability::{StructuredLogger, WatcherMetrics};
use crate::sink::{BillingSink, IdempotencyKey, SinkError, WriteOutcome};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What happened to an event handed to the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new row was appended to the sink
    Written,
    /// The sink already held this (uid, resource version)
    Duplicate,
    /// Older than the committed position for the pod; dropped
    OutOfOrder,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Written => "written",
            RecordOutcome::Duplicate => "duplicate",
            RecordOutcome::OutOfOrder => "out_of_order",
        }
    }
}

/// A sink write failed; the committed position was not advanced
#[derive(Debug, Error)]
#[error("failed to persist billing record {key}: {source}")]
pub struct PersistenceError {
    pub key: IdempotencyKey,
    #[source]
    pub source: SinkError,
}

/// Per-scope recorder with its own dedup state
pub struct Recorder {
    sink: Arc<dyn BillingSink>,
    scope: String,
    committed: HashMap<String, ResourceVersion>,
    retry: BackoffConfig,
    sink_failing: bool,
    health: HealthRegistry,
    logger: StructuredLogger,
    metrics: WatcherMetrics,
}

impl Recorder {
    pub fn new(sink: Arc<dyn BillingSink>, scope: impl Into<String>) -> Self {
        Self {
            sink,
            scope: scope.into(),
            committed: HashMap::new(),
            retry: BackoffConfig::default(),
            sink_failing: false,
            health: HealthRegistry::new(),
            logger: StructuredLogger::new("default"),
            metrics: WatcherMetrics::new(),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Backoff used by [`Recorder::record_until_committed`]
    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Last committed resource version for a pod
    pub fn committed(&self, uid: &str) -> Option<&ResourceVersion> {
        self.committed.get(uid)
    }

    /// Number of pods with a committed position
    pub fn tracked(&self) -> usize {
        self.committed.len()
    }

    /// Persist one event, at most one sink write
    pub async fn record(&mut self, event: &NormalizedEvent) -> Result<RecordOutcome, PersistenceError> {
        let uid = event.pod.uid.as_str();
        let key = IdempotencyKey::new(uid, event.resource_version.clone());

        if let Some(last) = self.committed.get(uid) {
            if event.kind != BillingEventKind::Deleted && event.resource_version <= *last {
                let outcome = if event.resource_version == *last {
                    debug!(scope = %self.scope, uid = %uid, resource_version = %event.resource_version, "Billing record already committed");
                    RecordOutcome::Duplicate
                } else {
                    warn!(
                        scope = %self.scope,
                        uid = %uid,
                        resource_version = %event.resource_version,
                        committed = %last,
                        "Dropping out-of-order billing event"
                    );
                    RecordOutcome::OutOfOrder
                };
                self.metrics.inc_record(&self.scope, outcome.as_str());
                return Ok(outcome);
            }
        }

        let record = event.to_record();
        let started = Instant::now();
        let result = self.sink.write(&key, &record).await;
        self.metrics.observe_sink_latency(started.elapsed());

        let outcome = match result {
            Ok(WriteOutcome::Written) => {
                self.logger.log_record(&self.scope, &record);
                if record.malformed.is_some() {
                    self.metrics.inc_malformed_quantity();
                    self.logger.log_malformed(&self.scope, &record);
                }
                RecordOutcome::Written
            }
            Ok(WriteOutcome::AlreadyExists) => RecordOutcome::Duplicate,
            Err(source) => {
                self.metrics.inc_sink_error(&self.scope);
                self.sink_failing = true;
                self.health
                    .set_degraded(components::SINK, format!("write failed: {}", source))
                    .await;
                return Err(PersistenceError { key, source });
            }
        };
        if self.sink_failing {
            self.sink_failing = false;
            self.health.set_healthy(components::SINK).await;
        }

        self.advance(uid, &event.resource_version);
        self.metrics.inc_record(&self.scope, outcome.as_str());
        Ok(outcome)
    }

    /// Retry `record` with backoff until it succeeds
    ///
    /// Returns `None` if `cancel` fires first. Cancellation is checked before
    /// every write attempt and while sleeping between attempts.
    pub async fn record_until_committed(
        &mut self,
        event: &NormalizedEvent,
        cancel: &CancellationToken,
    ) -> Option<RecordOutcome> {
        let mut backoff = Backoff::new(self.retry);
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            match self.record(event).await {
                Ok(outcome) => return Some(outcome),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        scope = %self.scope,
                        uid = %e.key.pod_uid,
                        resource_version = %e.key.resource_version,
                        error = %e.source,
                        attempts = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Sink write failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Drop committed positions for pods not present in the latest listing
    pub fn forget_absent(&mut self, live_uids: &HashSet<String>) {
        let before = self.committed.len();
        self.committed.retain(|uid, _| live_uids.contains(uid));
        let pruned = before - self.committed.len();
        if pruned > 0 {
            debug!(scope = %self.scope, pruned = pruned, "Pruned recorder dedup state");
        }
    }

    fn advance(&mut self, uid: &str, resource_version: &ResourceVersion) {
        match self.committed.get_mut(uid) {
            Some(last) if *last >= *resource_version => {}
            Some(last) => *last = resource_version.clone(),
            None => {
                self.committed
                    .insert(uid.to_string(), resource_version.clone());
            }
        }
    }
}
