//! `kube`-backed cluster API

use super::{ClusterApi, ClusterError, PodEventStream, PodList, PodWatchEvent};
use crate::models::{ResourceVersion, Scope};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::PathBuf;
use tracing::{debug, info};

/// Default server-side watch timeout; the API server closes the watch after it
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

/// Build a client from an explicit kubeconfig, or in-cluster / default config
pub async fn init_kube_client(kubeconfig: Option<PathBuf>) -> Result<Client, ClusterError> {
    let client = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
                ClusterError::ConnectionFailed(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    ClusterError::ConnectionFailed(format!(
                        "failed to load kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            Client::try_from(config).map_err(|e| {
                ClusterError::ConnectionFailed(format!("failed to create client: {}", e))
            })?
        }
        None => Client::try_default()
            .await
            .map_err(|e| ClusterError::ConnectionFailed(format!("failed to create client: {}", e)))?,
    };
    Ok(client)
}

/// Cluster API backed by a `kube` client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    watch_timeout_secs: u32,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
        }
    }

    /// Set the server-side watch timeout
    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs;
        self
    }

    /// Check that the API server answers at all
    pub async fn probe(&self) -> Result<(), ClusterError> {
        let version = self.client.apiserver_version().await.map_err(classify)?;
        info!(
            major = %version.major,
            minor = %version.minor,
            platform = %version.platform,
            "Connected to cluster API"
        );
        Ok(())
    }

    fn api(&self, scope: &Scope) -> Api<Pod> {
        match scope {
            Scope::AllNamespaces => Api::all(self.client.clone()),
            Scope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_pods(&self, scope: &Scope) -> Result<PodList, ClusterError> {
        let list = self
            .api(scope)
            .list(&ListParams::default())
            .await
            .map_err(classify)?;

        let resource_version = ResourceVersion::new(list.metadata.resource_version.unwrap_or_default());
        debug!(scope = %scope, pods = list.items.len(), resource_version = %resource_version, "Listed pods");

        Ok(PodList {
            pods: list.items,
            resource_version,
        })
    }

    async fn watch_pods(
        &self,
        scope: &Scope,
        resource_version: &ResourceVersion,
    ) -> Result<PodEventStream, ClusterError> {
        let params = WatchParams::default()
            .timeout(self.watch_timeout_secs);
        // Bookmarks are enabled by default in kube 0.87 `WatchParams`.

        let stream = self
            .api(scope)
            .watch(&params, resource_version.as_str())
            .await
            .map_err(classify)?;

        Ok(stream
            .map(|item| match item {
                Ok(WatchEvent::Added(pod)) => Ok(PodWatchEvent::Added(pod)),
                Ok(WatchEvent::Modified(pod)) => Ok(PodWatchEvent::Modified(pod)),
                Ok(WatchEvent::Deleted(pod)) => Ok(PodWatchEvent::Deleted(pod)),
                Ok(WatchEvent::Bookmark(bookmark)) => Ok(PodWatchEvent::Bookmark(
                    ResourceVersion::new(bookmark.metadata.resource_version),
                )),
                Ok(WatchEvent::Error(response)) => {
                    Err(ClusterError::from_status(response.code, response.message))
                }
                Err(e) => Err(classify(e)),
            })
            .boxed())
    }
}

fn classify(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => ClusterError::from_status(response.code, response.message),
        other => ClusterError::TransientStreamError(other.to_string()),
    }
}
