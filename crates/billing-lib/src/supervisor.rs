//! Process-lifetime orchestration of watch sessions
//!
//! One task per scope. A session that ends with an error is run again after
//! a backoff delay, keeping its pod cache and committed positions, so the
//! first listing after the restart closes pods deleted in the gap. A session
//! that panics loses that state and is replaced by a fresh one. An optional
//! ceiling on restarts turns a persistently failing scope into a process
//! failure.

use crate::backoff::{Backoff, BackoffConfig};
use crate::cluster::ClusterApi;
use crate::health::{components, HealthRegistry};
use crate::models::Scope;
use crate::normalizer::PodEventNormalizer;
use crate::observability::{StructuredLogger, WatcherMetrics};
use crate::recorder::Recorder;
use crate::session::{SessionConfig, WatchSession};
use crate::sink::BillingSink;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    pub session: SessionConfig,
    /// Delay between session restarts
    pub restart_backoff: BackoffConfig,
    /// Give up after this many restarts of a single scope
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("watch session for scope {scope} exceeded {max_restarts} restarts, last error: {last_error}")]
    RestartLimitExceeded {
        scope: String,
        max_restarts: u32,
        last_error: String,
    },
}

/// Runs and restarts one watch session per scope
pub struct Supervisor {
    scopes: Vec<Scope>,
    cluster: Arc<dyn ClusterApi>,
    sink: Arc<dyn BillingSink>,
    normalizer: PodEventNormalizer,
    config: SupervisorConfig,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl Supervisor {
    pub fn new(
        scopes: Vec<Scope>,
        cluster: Arc<dyn ClusterApi>,
        sink: Arc<dyn BillingSink>,
        normalizer: PodEventNormalizer,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            scopes,
            cluster,
            sink,
            normalizer,
            config,
            health: HealthRegistry::new(),
            logger: StructuredLogger::new("default"),
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

    /// Run every scope until `cancel` fires or a scope exceeds the restart ceiling
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        self.health.register(components::SUPERVISOR).await;
        self.health
            .expect_listings(self.scopes.iter().map(|s| s.label().to_string()))
            .await;
        self.health.set_ready(true).await;

        let scopes_cancel = cancel.child_token();
        let this = Arc::new(self);
        let mut tasks = JoinSet::new();
        for scope in this.scopes.clone() {
            let supervisor = this.clone();
            let token = scopes_cancel.clone();
            tasks.spawn(async move { supervisor.supervise_scope(scope, token).await });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Scope supervision failed, stopping all sessions");
                    scopes_cancel.cancel();
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Scope supervisor task failed");
                    scopes_cancel.cancel();
                }
            }
        }

        match failure {
            Some(e) => {
                this.health
                    .set_unhealthy(components::SUPERVISOR, e.to_string())
                    .await;
                Err(e)
            }
            None => {
                info!("All watch sessions stopped");
                Ok(())
            }
        }
    }

    async fn supervise_scope(
        self: Arc<Self>,
        scope: Scope,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let label = scope.label().to_string();
        let metrics = WatcherMetrics::new();
        let mut backoff = Backoff::new(self.config.restart_backoff);
        let mut restarts: u32 = 0;

        let mut session = self.build_session(scope.clone());
        loop {
            let token = cancel.clone();
            let started = Instant::now();
            let outcome = tokio::spawn(async move {
                let result = session.run(&token).await;
                (session, result)
            })
            .await;

            if cancel.is_cancelled() {
                return Ok(());
            }

            let last_error = match outcome {
                Ok((returned, result)) => {
                    session = returned;
                    match result {
                        Ok(()) => "session stopped unexpectedly".to_string(),
                        Err(e) => e.to_string(),
                    }
                }
                Err(e) => {
                    warn!(scope = %label, "Watch session panicked, restarting with an empty pod cache");
                    session = self.build_session(scope.clone());
                    format!("session task panicked: {}", e)
                }
            };

            restarts = restarts.saturating_add(1);
            if let Some(max_restarts) = self.config.max_restarts {
                if restarts > max_restarts {
                    return Err(SupervisorError::RestartLimitExceeded {
                        scope: label,
                        max_restarts,
                        last_error,
                    });
                }
            }

            // A session that survived a full backoff period starts over
            if started.elapsed() >= self.config.restart_backoff.max {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            metrics.inc_session_restart(&label);
            warn!(
                scope = %label,
                restarts = restarts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Restarting watch session"
            );
            self.health
                .set_degraded(
                    components::SUPERVISOR,
                    format!("scope {} restarted {} times", label, restarts),
                )
                .await;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn build_session(&self, scope: Scope) -> WatchSession {
        let recorder = Recorder::new(self.sink.clone(), scope.label())
            .with_health(self.health.clone())
            .with_logger(self.logger.clone())
            .with_retry(self.config.session.backoff);
        WatchSession::new(
            scope,
            self.cluster.clone(),
            self.normalizer.clone(),
            recorder,
            self.config.session.clone(),
        )
        .with_health(self.health.clone())
        .with_logger(self.logger.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterError, PodEventStream, PodList};
    use crate::models::{BillingEventKind, ResourceVersion};
    use crate::sink::MemorySink;
    use crate::test_support::pod;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// One pod per namespace scope; the first `rejections` lists are refused
    struct NamespacedCluster {
        rejections: usize,
        list_calls: AtomicUsize,
    }

    impl NamespacedCluster {
        fn new(rejections: usize) -> Self {
            Self {
                rejections,
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ClusterApi for NamespacedCluster {
        async fn list_pods(&self, scope: &Scope) -> Result<PodList, ClusterError> {
            let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.rejections {
                return Err(ClusterError::Unauthorized("pods is forbidden".to_string()));
            }
            let namespace = match scope {
                Scope::Namespace(ns) => ns.clone(),
                Scope::AllNamespaces => "default".to_string(),
            };
            Ok(PodList {
                pods: vec![pod(
                    &format!("uid-{}", namespace),
                    &namespace,
                    "web-0",
                    "10",
                )],
                resource_version: ResourceVersion::new("20"),
            })
        }

        async fn watch_pods(
            &self,
            _scope: &Scope,
            _resource_version: &ResourceVersion,
        ) -> Result<PodEventStream, ClusterError> {
            Ok(futures::stream::pending().boxed())
        }
    }

    fn config(max_restarts: Option<u32>) -> SupervisorConfig {
        let fast = BackoffConfig {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
        };
        SupervisorConfig {
            session: SessionConfig {
                backoff: fast,
                ..SessionConfig::default()
            },
            restart_backoff: fast,
            max_restarts,
        }
    }

    async fn wait_for_records(sink: &MemorySink, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.len().await < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected records were not written in time");
    }

    #[tokio::test]
    async fn test_one_session_per_namespace() {
        let cluster = Arc::new(NamespacedCluster::new(0));
        let sink = Arc::new(MemorySink::new());
        let health = HealthRegistry::new();
        let scopes = Scope::from_namespaces(&["team-a".to_string(), "team-b".to_string()]);
        let supervisor = Supervisor::new(
            scopes,
            cluster,
            sink.clone(),
            PodEventNormalizer::default(),
            config(None),
        )
        .with_health(health.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        wait_for_records(&sink, 2).await;
        assert_eq!(sink.records_for("uid-team-a").await.len(), 1);
        assert_eq!(sink.records_for("uid-team-b").await.len(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !health.readiness().await.ready {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("agent never became ready");

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_session_is_restarted() {
        let cluster = Arc::new(NamespacedCluster::new(2));
        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::new(
            vec![Scope::Namespace("team-a".to_string())],
            cluster.clone(),
            sink.clone(),
            PodEventNormalizer::default(),
            config(Some(5)),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        wait_for_records(&sink, 1).await;
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    /// Lists one pod, rejects the first watch, then lists nothing
    struct PodGoneDuringRestart {
        list_calls: AtomicUsize,
        watch_calls: AtomicUsize,
    }

    #[async_trait]
    impl ClusterApi for PodGoneDuringRestart {
        async fn list_pods(&self, _scope: &Scope) -> Result<PodList, ClusterError> {
            let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(PodList {
                    pods: vec![pod("uid-1", "team-a", "web-0", "10")],
                    resource_version: ResourceVersion::new("20"),
                })
            } else {
                Ok(PodList {
                    pods: Vec::new(),
                    resource_version: ResourceVersion::new("40"),
                })
            }
        }

        async fn watch_pods(
            &self,
            _scope: &Scope,
            _resource_version: &ResourceVersion,
        ) -> Result<PodEventStream, ClusterError> {
            if self.watch_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ClusterError::Unauthorized("token expired".to_string()));
            }
            Ok(futures::stream::pending().boxed())
        }
    }

    #[tokio::test]
    async fn test_restart_closes_pods_deleted_in_the_gap() {
        let cluster = Arc::new(PodGoneDuringRestart {
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::new(
            vec![Scope::Namespace("team-a".to_string())],
            cluster.clone(),
            sink.clone(),
            PodEventNormalizer::default(),
            config(Some(5)),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        wait_for_records(&sink, 2).await;
        let records = sink.records_for("uid-1").await;
        let kinds: Vec<BillingEventKind> = records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![BillingEventKind::Observed, BillingEventKind::Deleted]);
        assert_eq!(records[1].resource_version, ResourceVersion::new("40"));
        assert!(records[1].inferred);
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_restart_ceiling_fails_supervisor() {
        let cluster = Arc::new(NamespacedCluster::new(usize::MAX));
        let sink = Arc::new(MemorySink::new());
        let health = HealthRegistry::new();
        let supervisor = Supervisor::new(
            vec![Scope::AllNamespaces],
            cluster.clone(),
            sink.clone(),
            PodEventNormalizer::default(),
            config(Some(2)),
        )
        .with_health(health.clone());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.run(CancellationToken::new()),
        )
        .await
        .expect("supervisor did not give up");

        match result {
            Err(SupervisorError::RestartLimitExceeded {
                scope,
                max_restarts,
                last_error,
            }) => {
                assert_eq!(scope, "*");
                assert_eq!(max_restarts, 2);
                assert!(last_error.contains("unauthorized"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // Initial session plus two restarts
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 3);
        assert!(sink.is_empty().await);
        assert!(!health.readiness().await.ready);
    }
}
