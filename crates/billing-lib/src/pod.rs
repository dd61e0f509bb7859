//! Conversion from cluster pod objects to billing snapshots

use crate::models::{ContainerKind, ContainerSpec, PodIdentity, PodPhase, PodSnapshot, ResourceVersion};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod};
use thiserror::Error;

/// Restart policy marking an init container as restartable
const RESTART_POLICY_ALWAYS: &str = "Always";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("pod {0} has no uid")]
    MissingUid(String),
}

/// Resource version attached to a pod object, empty if unset
pub fn resource_version_of(pod: &Pod) -> ResourceVersion {
    ResourceVersion::new(pod.metadata.resource_version.clone().unwrap_or_default())
}

/// Build a billing snapshot from a pod object
pub fn snapshot_from_pod(pod: &Pod) -> Result<PodSnapshot, SnapshotError> {
    let metadata = &pod.metadata;
    let namespace = metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let name = metadata.name.clone().unwrap_or_else(|| "unknown".to_string());
    let uid = metadata
        .uid
        .clone()
        .ok_or_else(|| SnapshotError::MissingUid(format!("{}/{}", namespace, name)))?;

    let mut containers = Vec::new();
    if let Some(spec) = &pod.spec {
        if let Some(init_containers) = &spec.init_containers {
            containers.extend(init_containers.iter().map(|c| {
                let kind = if c.restart_policy.as_deref() == Some(RESTART_POLICY_ALWAYS) {
                    ContainerKind::Sidecar
                } else {
                    ContainerKind::Init
                };
                container_spec(c, kind)
            }));
        }
        containers.extend(
            spec.containers
                .iter()
                .map(|c| container_spec(c, ContainerKind::App)),
        );
    }

    let status = pod.status.as_ref();

    Ok(PodSnapshot {
        identity: PodIdentity {
            uid,
            namespace,
            name,
        },
        resource_version: resource_version_of(pod),
        containers,
        phase: PodPhase::parse(status.and_then(|s| s.phase.as_deref())),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        created_at: metadata.creation_timestamp.as_ref().map(|t| t.0),
        started_at: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        deleted_at: metadata.deletion_timestamp.as_ref().map(|t| t.0),
        finished_at: latest_termination(pod),
    })
}

fn container_spec(container: &Container, kind: ContainerKind) -> ContainerSpec {
    let requests = container
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .map(|requests| {
            requests
                .iter()
                .map(|(resource, quantity)| (resource.clone(), quantity.0.clone()))
                .collect()
        })
        .unwrap_or_default();

    ContainerSpec {
        name: container.name.clone(),
        kind,
        requests,
    }
}

/// Latest `finishedAt` across terminated containers
fn latest_termination(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|cs| cs.state.as_ref()?.terminated.as_ref()?.finished_at.as_ref())
        .map(|t| t.0)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pod, PodBuilder};
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn test_snapshot_orders_init_before_app() {
        let pod = PodBuilder::new("uid-1", "team-a", "web-0", "10")
            .app("web", &[("cpu", "250m")])
            .init("migrate", &[("cpu", "1")])
            .sidecar("mesh", &[("memory", "64Mi")])
            .phase("Running")
            .node("node-1")
            .build();

        let snapshot = snapshot_from_pod(&pod).unwrap();
        let kinds: Vec<ContainerKind> = snapshot.containers.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ContainerKind::Init, ContainerKind::Sidecar, ContainerKind::App]
        );
        assert_eq!(snapshot.containers[1].name, "mesh");
        assert_eq!(snapshot.containers[2].requests["cpu"], "250m");
        assert_eq!(snapshot.phase, PodPhase::Running);
        assert_eq!(snapshot.node_name.as_deref(), Some("node-1"));
        assert_eq!(snapshot.resource_version, ResourceVersion::new("10"));
        assert_eq!(snapshot.identity.uid, "uid-1");
    }

    #[test]
    fn test_snapshot_requires_uid() {
        let mut pod = pod("uid-1", "team-a", "web-0", "10");
        pod.metadata.uid = None;
        assert_eq!(
            snapshot_from_pod(&pod),
            Err(SnapshotError::MissingUid("team-a/web-0".to_string()))
        );
    }

    #[test]
    fn test_snapshot_records_latest_termination() {
        let early = Utc::now() - chrono::Duration::minutes(5);
        let late = Utc::now();
        let terminated = |at: DateTime<Utc>| ContainerStatus {
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    finished_at: Some(Time(at)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut pod = pod("uid-1", "team-a", "job-0", "10");
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            container_statuses: Some(vec![terminated(early), terminated(late)]),
            ..Default::default()
        });

        let snapshot = snapshot_from_pod(&pod).unwrap();
        assert_eq!(snapshot.finished_at, Some(late));
        assert!(snapshot.phase.is_terminal());
    }
}
