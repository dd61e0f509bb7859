//! Shared fixtures for unit tests

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Running pod with a single app container requesting 100m CPU
pub fn pod(uid: &str, namespace: &str, name: &str, resource_version: &str) -> Pod {
    PodBuilder::new(uid, namespace, name, resource_version)
        .app("main", &[("cpu", "100m")])
        .phase("Running")
        .build()
}

pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(uid: &str, namespace: &str, name: &str, resource_version: &str) -> Self {
        Self {
            pod: Pod {
                metadata: ObjectMeta {
                    uid: Some(uid.to_string()),
                    namespace: Some(namespace.to_string()),
                    name: Some(name.to_string()),
                    resource_version: Some(resource_version.to_string()),
                    ..Default::default()
                },
                spec: Some(PodSpec::default()),
                status: Some(PodStatus::default()),
            },
        }
    }

    pub fn app(mut self, name: &str, requests: &[(&str, &str)]) -> Self {
        self.spec().containers.push(container(name, requests, None));
        self
    }

    pub fn init(mut self, name: &str, requests: &[(&str, &str)]) -> Self {
        self.spec()
            .init_containers
            .get_or_insert_with(Vec::new)
            .push(container(name, requests, None));
        self
    }

    pub fn sidecar(mut self, name: &str, requests: &[(&str, &str)]) -> Self {
        self.spec()
            .init_containers
            .get_or_insert_with(Vec::new)
            .push(container(name, requests, Some("Always")));
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        if let Some(status) = self.pod.status.as_mut() {
            status.phase = Some(phase.to_string());
        }
        self
    }

    pub fn node(mut self, node: &str) -> Self {
        self.spec().node_name = Some(node.to_string());
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }

    fn spec(&mut self) -> &mut PodSpec {
        self.pod.spec.get_or_insert_with(PodSpec::default)
    }
}

fn container(name: &str, requests: &[(&str, &str)], restart_policy: Option<&str>) -> Container {
    let requests: BTreeMap<String, Quantity> = requests
        .iter()
        .map(|(r, q)| (r.to_string(), Quantity(q.to_string())))
        .collect();

    Container {
        name: name.to_string(),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        restart_policy: restart_policy.map(str::to_string),
        ..Default::default()
    }
}
