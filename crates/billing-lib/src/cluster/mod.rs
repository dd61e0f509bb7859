//! Cluster API collaborator
//!
//! The watch session talks to the cluster only through [`ClusterApi`]:
//! a full list returning pods and a resource version cursor, and a watch
//! returning a lazy stream of pod events starting from a cursor. The
//! production implementation is backed by `kube`; tests script their own.

mod kube_api;

pub use kube_api::{init_kube_client, KubeClusterApi};

use crate::models::{ResourceVersion, Scope};
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// Errors reported by the cluster API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// The watch cursor is too old (HTTP 410 Gone); a fresh list is needed
    #[error("resource version expired: {0}")]
    ExpiredResourceVersion(String),
    /// Network or transport failure, worth retrying
    #[error("transient stream error: {0}")]
    TransientStreamError(String),
    /// Credentials rejected or missing permissions
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The client could not be built or the API server is unreachable
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

impl ClusterError {
    /// Classify an HTTP status code returned by the API server
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            410 => ClusterError::ExpiredResourceVersion(message),
            401 | 403 => ClusterError::Unauthorized(message),
            _ => ClusterError::TransientStreamError(format!("{} ({})", message, code)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::ExpiredResourceVersion(_) => "expired_resource_version",
            ClusterError::TransientStreamError(_) => "transient_stream_error",
            ClusterError::Unauthorized(_) => "unauthorized",
            ClusterError::ConnectionFailed(_) => "connection_failed",
        }
    }

    /// Errors no amount of reconnecting will fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::Unauthorized(_))
    }
}

/// Result of a full list
#[derive(Debug, Clone, Default)]
pub struct PodList {
    pub pods: Vec<Pod>,
    pub resource_version: ResourceVersion,
}

/// One delivery from a watch stream
#[derive(Debug, Clone)]
pub enum PodWatchEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
    /// Progress marker carrying only a newer resource version
    Bookmark(ResourceVersion),
}

/// Lazy, possibly infinite stream of watch deliveries
pub type PodEventStream = BoxStream<'static, Result<PodWatchEvent, ClusterError>>;

/// Access to pods in the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List all pods in scope together with the list's resource version
    async fn list_pods(&self, scope: &Scope) -> Result<PodList, ClusterError>;

    /// Open a watch on pods in scope, starting after `resource_version`
    async fn watch_pods(
        &self,
        scope: &Scope,
        resource_version: &ResourceVersion,
    ) -> Result<PodEventStream, ClusterError>;
}
