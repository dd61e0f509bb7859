//! Watch session: list, watch, reconnect
//!
//! One session covers one [`Scope`]. It lists the pods in scope to get a
//! baseline, then follows a watch from that baseline, feeding every delivery
//! through the normalizer and the recorder strictly in order. Whenever the
//! watch ends, for whatever reason, the session relists before watching
//! again, so nothing that changed while it was disconnected is missed.
//!
//! ```text
//! Disconnected -> Listing -> Watching <-> Resyncing
//!      ^                        |
//!      +------------------------+
//! ```


use crate::backoff::{Backoff, BackoffConfig};
use crate::cluster::{ClusterApi, ClusterError, PodEventStream, PodWatchEvent};
use crate::health::{components, HealthRegistry};
use crate::models::{ResourceVersion, Scope};
use crate::normalizer::{
    Normalized, NormalizedEvent, NormalizerCache, PodEventNormalizer, RawEventKind,
};
use crate::observability::{StructuredLogger, WatcherMetrics};
use crate::pod::resource_version_of;
use crate::recorder::Recorder;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Listing,
    Watching,
    Resyncing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Listing => "listing",
            SessionState::Watching => "watching",
            SessionState::Resyncing => "resyncing",
        }
    }
}

/// Watch session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnect if the watch delivers nothing (not even a bookmark) for this long
    pub idle_timeout: Duration,
    /// Periodic relist while watching; `None` disables it
    pub resync_interval: Option<Duration>,
    /// Reconnect backoff
    pub backoff: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            resync_interval: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Errors that end a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("fatal cluster error in {scope}: {source}")]
    Fatal {
        scope: String,
        #[source]
        source: ClusterError,
    },
}

/// Why a watch pass ended
enum WatchEnd {
    Cancelled,
    ResyncDue,
    /// Server closed the stream (e.g. its watch timeout)
    Closed,
    /// No delivery within the idle timeout
    Stalled,
    Failed(ClusterError),
}

/// Long-lived list + watch loop for one scope
pub struct WatchSession {
    scope: Scope,
    label: String,
    cluster: Arc<dyn ClusterApi>,
    normalizer: PodEventNormalizer,
    cache: NormalizerCache,
    recorder: Recorder,
    config: SessionConfig,
    backoff: Backoff,
    state: SessionState,
    cursor: ResourceVersion,
    health: HealthRegistry,
    logger: StructuredLogger,
    metrics: WatcherMetrics,
}

impl WatchSession {
    pub fn new(
        scope: Scope,
        cluster: Arc<dyn ClusterApi>,
        normalizer: PodEventNormalizer,
        recorder: Recorder,
        config: SessionConfig,
    ) -> Self {
        let label = scope.label().to_string();
        let backoff = Backoff::new(config.backoff);
        Self {
            scope,
            label,
            cluster,
            normalizer,
            cache: NormalizerCache::new(),
            recorder,
            config,
            backoff,
            state: SessionState::Disconnected,
            cursor: ResourceVersion::default(),
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

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Resource version the next watch would start from
    pub fn cursor(&self) -> &ResourceVersion {
        &self.cursor
    }

    /// Pods currently tracked by the normalizer cache
    pub fn tracked_pods(&self) -> usize {
        self.cache.len()
    }

    /// Run until cancelled or a fatal cluster error
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let component = components::watch_scope(&self.label);
        self.health.register(&component).await;
        info!(scope = %self.scope, "Starting watch session");

        let mut next_pass = SessionState::Listing;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.transition(next_pass);
            match self.list_pass(cancel).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.is_fatal() => return self.fail(e).await,
                Err(e) => {
                    self.transition(SessionState::Disconnected);
                    let immediate = matches!(e, ClusterError::ExpiredResourceVersion(_));
                    if !self.reconnect(cancel, e.kind(), !immediate).await {
                        break;
                    }
                    next_pass = SessionState::Listing;
                    continue;
                }
            }

            next_pass = match self.watch_pass(cancel).await {
                WatchEnd::Cancelled => break,
                WatchEnd::ResyncDue => {
                    debug!(scope = %self.scope, "Resync due, relisting");
                    SessionState::Resyncing
                }
                WatchEnd::Closed => {
                    self.transition(SessionState::Disconnected);
                    if !self.reconnect(cancel, "stream_closed", false).await {
                        break;
                    }
                    SessionState::Listing
                }
                WatchEnd::Stalled => {
                    self.transition(SessionState::Disconnected);
                    if !self.reconnect(cancel, "idle_timeout", true).await {
                        break;
                    }
                    SessionState::Listing
                }
                WatchEnd::Failed(e) if e.is_fatal() => return self.fail(e).await,
                WatchEnd::Failed(e) => {
                    self.transition(SessionState::Disconnected);
                    let immediate = matches!(e, ClusterError::ExpiredResourceVersion(_));
                    if !immediate {
                        error!(scope = %self.scope, resource_version = %self.cursor, error = %e, error_kind = e.kind(), "Watch stream failed");
                    }
                    if !self.reconnect(cancel, e.kind(), !immediate).await {
                        break;
                    }
                    SessionState::Listing
                }
            };
        }

        self.transition(SessionState::Disconnected);
        info!(scope = %self.scope, "Watch session stopped");
        Ok(())
    }

    /// Full list: emit changes, close vanished pods, take a new baseline
    ///
    /// Returns `Ok(false)` if cancelled part way.
    async fn list_pass(&mut self, cancel: &CancellationToken) -> Result<bool, ClusterError> {
        let list = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            list = self.cluster.list_pods(&self.scope) => list?,
        };

        let observed_at = Utc::now();
        let mut live_uids = HashSet::with_capacity(list.pods.len());
        for pod in &list.pods {
            if let Some(uid) = pod.metadata.uid.as_ref() {
                live_uids.insert(uid.clone());
            }
            if !self.process_pod(pod, RawEventKind::Listed, cancel).await {
                return Ok(false);
            }
        }

        let vanished = self.normalizer.close_vanished(
            &mut self.cache,
            &live_uids,
            &list.resource_version,
            observed_at,
        );
        if !vanished.is_empty() {
            info!(scope = %self.scope, pods = vanished.len(), resource_version = %list.resource_version, "Closing pods that vanished while disconnected");
        }
        for event in &vanished {
            if !self.commit(event, cancel).await {
                return Ok(false);
            }
        }

        self.recorder.forget_absent(&live_uids);
        self.cursor = list.resource_version;
        self.backoff.reset();
        self.metrics.set_tracked_pods(&self.label, self.cache.len());

        let component = components::watch_scope(&self.label);
        self.health.set_healthy(&component).await;
        self.health.listing_complete(&self.label).await;

        info!(
            scope = %self.scope,
            pods = list.pods.len(),
            tracked = self.cache.len(),
            resource_version = %self.cursor,
            "Listing complete"
        );
        Ok(true)
    }

    async fn watch_pass(&mut self, cancel: &CancellationToken) -> WatchEnd {
        let mut stream: PodEventStream = tokio::select! {
            _ = cancel.cancelled() => return WatchEnd::Cancelled,
            opened = self.cluster.watch_pods(&self.scope, &self.cursor) => match opened {
                Ok(stream) => stream,
                Err(e) => return WatchEnd::Failed(e),
            },
        };
        self.transition(SessionState::Watching);

        let resync_at = self.config.resync_interval.map(|period| Instant::now() + period);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchEnd::Cancelled,
                _ = resync_due(resync_at) => return WatchEnd::ResyncDue,
                next = tokio::time::timeout(self.config.idle_timeout, stream.next()) => next,
            };

            let event = match next {
                Err(_) => {
                    info!(scope = %self.scope, idle_secs = self.config.idle_timeout.as_secs(), "Watch idle, reconnecting");
                    return WatchEnd::Stalled;
                }
                Ok(None) => return WatchEnd::Closed,
                Ok(Some(Err(e))) => return WatchEnd::Failed(e),
                Ok(Some(Ok(event))) => event,
            };

            if !self.handle_watch_event(event, cancel).await {
                return WatchEnd::Cancelled;
            }
        }
    }

    async fn handle_watch_event(&mut self, event: PodWatchEvent, cancel: &CancellationToken) -> bool {
        let (pod, kind) = match event {
            PodWatchEvent::Bookmark(resource_version) => {
                self.metrics.inc_event_received(&self.label, "bookmark");
                self.advance_cursor(resource_version);
                return true;
            }
            PodWatchEvent::Added(pod) => (pod, RawEventKind::Added),
            PodWatchEvent::Modified(pod) => (pod, RawEventKind::Modified),
            PodWatchEvent::Deleted(pod) => (pod, RawEventKind::Deleted),
        };

        if !self.process_pod(&pod, kind, cancel).await {
            return false;
        }
        self.advance_cursor(resource_version_of(&pod));
        self.metrics.set_tracked_pods(&self.label, self.cache.len());
        true
    }

    /// Normalize and record one pod delivery; false if cancelled
    async fn process_pod(&mut self, pod: &Pod, kind: RawEventKind, cancel: &CancellationToken) -> bool {
        let resource_version = resource_version_of(pod);
        self.metrics.inc_event_received(&self.label, raw_kind_label(kind));

        match self.normalizer.normalize(
            &mut self.cache,
            pod,
            kind,
            &resource_version,
            Utc::now(),
        ) {
            Normalized::Emit(event) => self.commit(&event, cancel).await,
            Normalized::Skip(reason) => {
                self.metrics.inc_event_skipped(&self.label, reason.as_str());
                true
            }
        }
    }

    async fn commit(&mut self, event: &NormalizedEvent, cancel: &CancellationToken) -> bool {
        self.recorder
            .record_until_committed(event, cancel)
            .await
            .is_some()
    }

    fn advance_cursor(&mut self, resource_version: ResourceVersion) {
        if resource_version > self.cursor {
            self.cursor = resource_version;
        }
    }

    /// Count and log a reconnect, waiting out the backoff if asked to.
    /// Returns false if cancelled while waiting.
    async fn reconnect(&mut self, cancel: &CancellationToken, reason: &str, with_backoff: bool) -> bool {
        let delay = if with_backoff {
            self.backoff.next_delay()
        } else {
            Duration::ZERO
        };

        self.metrics.inc_reconnect(&self.label, reason);
        self.logger
            .log_reconnect(&self.label, reason, delay, self.backoff.attempts());
        if with_backoff {
            let component = components::watch_scope(&self.label);
            self.health
                .set_degraded(&component, format!("reconnecting after {}", reason))
                .await;
        }

        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn fail(&mut self, e: ClusterError) -> Result<(), SessionError> {
        self.transition(SessionState::Disconnected);
        error!(scope = %self.scope, error = %e, error_kind = e.kind(), "Fatal cluster error, ending watch session");
        let component = components::watch_scope(&self.label);
        self.health.set_unhealthy(&component, e.to_string()).await;
        Err(SessionError::Fatal {
            scope: self.label.clone(),
            source: e,
        })
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        self.logger
            .log_state_transition(&self.label, self.state.as_str(), next.as_str());
        self.metrics.set_session_state(&self.label, next.as_str());
        self.state = next;
    }
}

async fn resync_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn raw_kind_label(kind: RawEventKind) -> &'static str {
    match kind {
        RawEventKind::Listed => "listed",
        RawEventKind::Added => "added",
        RawEventKind::Modified => "modified",
        RawEventKind::Deleted => "deleted",
    }
}
