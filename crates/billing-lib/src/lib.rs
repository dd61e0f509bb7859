//! Pod billing watcher library
//!
//! Follows pod lifecycle events from the cluster API and turns them into an
//! idempotent, ordered log of billing records:
//! - Effective resource request reduction (init, sidecar and app containers)
//! - Event normalization with change detection and vanished-pod closure
//! - List + watch sessions with reconnect, resync and idle watchdog
//! - Idempotent recording to pluggable sinks
//! - Supervision, health checks and observability

pub mod backoff;
pub mod cluster;
pub mod health;
pub mod models;
pub mod normalizer;
pub mod observability;
pub mod pod;
pub mod quantity;
pub mod recorder;
pub mod reducer;
pub mod session;
pub mod sink;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use backoff::{Backoff, BackoffConfig};
pub use cluster::{ClusterApi, ClusterError, KubeClusterApi};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use normalizer::{NamespaceFilter, PodEventNormalizer};
pub use observability::{StructuredLogger, WatcherMetrics};
pub use quantity::{Quantity, QuantityError};
pub use recorder::{PersistenceError, RecordOutcome, Recorder};
pub use session::{SessionConfig, SessionError, SessionState, WatchSession};
pub use sink::{BillingSink, JsonlSink, MemorySink, SinkError};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
