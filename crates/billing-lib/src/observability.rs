//! Observability infrastructure for the billing agent
//!
//! Provides:
//! - Prometheus metrics (event flow, record outcomes, sink latency, reconnects, session state)
//! - Structured JSON logging with tracing

use crate::models::BillingRecord;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Default histogram buckets for sink write latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Session states reported through the one-hot state gauge
const SESSION_STATES: &[&str] = &["disconnected", "listing", "watching", "resyncing"];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<WatcherMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct WatcherMetricsInner {
    events_received: IntCounterVec,
    events_skipped: IntCounterVec,
    records: IntCounterVec,
    sink_errors: IntCounterVec,
    sink_write_latency_seconds: Histogram,
    reconnects: IntCounterVec,
    session_restarts: IntCounterVec,
    malformed_quantities: IntCounter,
    tracked_pods: IntGaugeVec,
    session_state: IntGaugeVec,
}

impl WatcherMetricsInner {
    fn new() -> Self {
        Self {
            events_received: register_int_counter_vec!(
                "pod_billing_events_received_total",
                "Pod deliveries received from the cluster API",
                &["scope", "kind"]
            )
            .expect("Failed to register events_received"),

            events_skipped: register_int_counter_vec!(
                "pod_billing_events_skipped_total",
                "Pod deliveries that produced no billing event",
                &["scope", "reason"]
            )
            .expect("Failed to register events_skipped"),

            records: register_int_counter_vec!(
                "pod_billing_records_total",
                "Billing records by recorder outcome",
                &["scope", "outcome"]
            )
            .expect("Failed to register records"),

            sink_errors: register_int_counter_vec!(
                "pod_billing_sink_errors_total",
                "Failed sink writes",
                &["scope"]
            )
            .expect("Failed to register sink_errors"),

            sink_write_latency_seconds: register_histogram!(
                "pod_billing_sink_write_latency_seconds",
                "Time spent writing one billing record to the sink",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sink_write_latency_seconds"),

            reconnects: register_int_counter_vec!(
                "pod_billing_reconnects_total",
                "Watch session reconnects by cause",
                &["scope", "reason"]
            )
            .expect("Failed to register reconnects"),

            session_restarts: register_int_counter_vec!(
                "pod_billing_session_restarts_total",
                "Watch sessions restarted by the supervisor",
                &["scope"]
            )
            .expect("Failed to register session_restarts"),

            malformed_quantities: register_int_counter!(
                "pod_billing_malformed_quantities_total",
                "Billing events flagged because of an unparsable quantity"
            )
            .expect("Failed to register malformed_quantities"),

            tracked_pods: register_int_gauge_vec!(
                "pod_billing_tracked_pods",
                "Pods currently tracked by a watch session",
                &["scope"]
            )
            .expect("Failed to register tracked_pods"),

            session_state: register_int_gauge_vec!(
                "pod_billing_session_state",
                "Current watch session state (1 for the active state)",
                &["scope", "state"]
            )
            .expect("Failed to register session_state"),
        }
    }
}

/// Watcher metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct WatcherMetrics {
    _private: (),
}

impl Default for WatcherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(WatcherMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &WatcherMetricsInner {
        GLOBAL_METRICS.get_or_init(WatcherMetricsInner::new)
    }

    pub fn inc_event_received(&self, scope: &str, kind: &str) {
        self.inner()
            .events_received
            .with_label_values(&[scope, kind])
            .inc();
    }

    pub fn inc_event_skipped(&self, scope: &str, reason: &str) {
        self.inner()
            .events_skipped
            .with_label_values(&[scope, reason])
            .inc();
    }

    /// Count a recorder outcome (written, duplicate, out_of_order)
    pub fn inc_record(&self, scope: &str, outcome: &str) {
        self.inner()
            .records
            .with_label_values(&[scope, outcome])
            .inc();
    }

    pub fn inc_sink_error(&self, scope: &str) {
        self.inner().sink_errors.with_label_values(&[scope]).inc();
    }

    pub fn observe_sink_latency(&self, duration: Duration) {
        self.inner()
            .sink_write_latency_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn inc_reconnect(&self, scope: &str, reason: &str) {
        self.inner()
            .reconnects
            .with_label_values(&[scope, reason])
            .inc();
    }

    pub fn inc_session_restart(&self, scope: &str) {
        self.inner()
            .session_restarts
            .with_label_values(&[scope])
            .inc();
    }

    pub fn inc_malformed_quantity(&self) {
        self.inner().malformed_quantities.inc();
    }

    pub fn set_tracked_pods(&self, scope: &str, count: usize) {
        self.inner()
            .tracked_pods
            .with_label_values(&[scope])
            .set(count as i64);
    }

    /// Mark `state` as the active state of a scope's session
    pub fn set_session_state(&self, scope: &str, state: &str) {
        for candidate in SESSION_STATES {
            let value = i64::from(*candidate == state);
            self.inner()
                .session_state
                .with_label_values(&[scope, candidate])
                .set(value);
        }
    }
}

/// Structured logger for billing events
///
/// Provides consistent JSON-formatted logging for committed records,
/// session transitions and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    /// Log a billing record committed to the sink
    pub fn log_record(&self, scope: &str, record: &BillingRecord) {
        info!(
            event = "billing_record",
            cluster = %self.cluster,
            scope = %scope,
            uid = %record.pod_uid,
            namespace = %record.namespace,
            pod = %record.name,
            resource_version = %record.resource_version,
            kind = record.kind.as_str(),
            phase = record.phase.as_str(),
            request = %record.effective_request,
            "Recorded billing observation"
        );
    }

    /// Log a billing event flagged because of a malformed quantity
    pub fn log_malformed(&self, scope: &str, record: &BillingRecord) {
        warn!(
            event = "malformed_quantity",
            cluster = %self.cluster,
            scope = %scope,
            uid = %record.pod_uid,
            namespace = %record.namespace,
            pod = %record.name,
            resource_version = %record.resource_version,
            error = record.malformed.as_deref().unwrap_or_default(),
            "Billing record flagged for malformed resource quantity"
        );
    }

    /// Log a watch session state transition
    pub fn log_state_transition(&self, scope: &str, from: &str, to: &str) {
        info!(
            event = "session_state",
            cluster = %self.cluster,
            scope = %scope,
            from = %from,
            to = %to,
            "Watch session state changed"
        );
    }

    /// Log a watch session reconnect
    pub fn log_reconnect(&self, scope: &str, reason: &str, delay: Duration, attempts: u32) {
        warn!(
            event = "session_reconnect",
            cluster = %self.cluster,
            scope = %scope,
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            attempts = attempts,
            "Watch stream ended, reconnecting"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, scopes: &[String]) {
        info!(
            event = "agent_started",
            cluster = %self.cluster,
            agent_version = %version,
            scopes = ?scopes,
            "Pod billing agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Pod billing agent shutting down"
        );
    }
}
