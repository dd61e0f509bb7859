//! Pod event normalization
//!
//! Turns raw pod deliveries (list items and watch events) into billing
//! events, dropping deliveries that carry nothing new for billing:
//! duplicates, stale versions and status-only updates. Change detection
//! compares the resource version and a SHA-256 fingerprint of the
//! billing-relevant parts of the pod against a per-UID cache owned by the
//! calling watch session.

use crate::models::{
    BillingEventKind, BillingRecord, ContainerKind, EffectiveRequest, PodIdentity, PodPhase,
    PodSnapshot, ResourceVersion,
};
use crate::pod::snapshot_from_pod;
use crate::reducer;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// How a raw pod delivery reached us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    /// Item of a full list (initial listing or resync)
    Listed,
    Added,
    Modified,
    Deleted,
}

/// Why a delivery produced no billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ExcludedNamespace,
    /// Same resource version as the last one seen for this pod
    Duplicate,
    /// Older resource version than the last one seen for this pod
    Stale,
    /// Newer version, but nothing billing-relevant changed
    Unchanged,
    /// Object could not be interpreted as a pod (e.g. no uid)
    InvalidObject,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ExcludedNamespace => "excluded_namespace",
            SkipReason::Duplicate => "duplicate",
            SkipReason::Stale => "stale",
            SkipReason::Unchanged => "unchanged",
            SkipReason::InvalidObject => "invalid_object",
        }
    }
}

/// Normalized billing event for one pod at one resource version
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub pod: PodIdentity,
    pub resource_version: ResourceVersion,
    pub effective_request: EffectiveRequest,
    pub observed_at: DateTime<Utc>,
    pub kind: BillingEventKind,
    pub phase: PodPhase,
    pub node_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Reduction error text when a request quantity was malformed
    pub malformed: Option<String>,
    /// Synthesized closure or fallback request rather than a delivered state
    pub inferred: bool,
}

impl NormalizedEvent {
    pub fn to_record(&self) -> BillingRecord {
        BillingRecord {
            pod_uid: self.pod.uid.clone(),
            namespace: self.pod.namespace.clone(),
            name: self.pod.name.clone(),
            node_name: self.node_name.clone(),
            phase: self.phase,
            resource_version: self.resource_version.clone(),
            effective_request: self.effective_request.clone(),
            observed_at: self.observed_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            kind: self.kind,
            malformed: self.malformed.clone(),
            inferred: self.inferred,
        }
    }
}

/// Outcome of normalizing one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Emit(NormalizedEvent),
    Skip(SkipReason),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    identity: PodIdentity,
    resource_version: ResourceVersion,
    fingerprint: String,
    last_request: EffectiveRequest,
    phase: PodPhase,
    node_name: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Last-seen state per pod UID, owned by a single watch session
#[derive(Debug, Default)]
pub struct NormalizerCache {
    entries: HashMap<String, CacheEntry>,
}

impl NormalizerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    /// Last resource version seen for a pod
    pub fn resource_version(&self, uid: &str) -> Option<&ResourceVersion> {
        self.entries.get(uid).map(|e| &e.resource_version)
    }

    /// Last effective request emitted for a pod
    pub fn last_request(&self, uid: &str) -> Option<&EffectiveRequest> {
        self.entries.get(uid).map(|e| &e.last_request)
    }
}

/// Namespaces whose pods are never billed
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    excluded: HashSet<String>,
    excluded_prefixes: Vec<String>,
}

impl NamespaceFilter {
    pub fn new(
        excluded: impl IntoIterator<Item = String>,
        excluded_prefixes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            excluded: excluded.into_iter().collect(),
            excluded_prefixes: excluded_prefixes.into_iter().collect(),
        }
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.excluded.contains(namespace)
            || self
                .excluded_prefixes
                .iter()
                .any(|prefix| namespace.starts_with(prefix.as_str()))
    }
}

/// Converts raw pod deliveries into billing events
#[derive(Debug, Clone, Default)]
pub struct PodEventNormalizer {
    filter: NamespaceFilter,
}

impl PodEventNormalizer {
    pub fn new(filter: NamespaceFilter) -> Self {
        Self { filter }
    }

    /// Normalize one delivery, updating the session cache
    pub fn normalize(
        &self,
        cache: &mut NormalizerCache,
        pod: &Pod,
        kind: RawEventKind,
        resource_version: &ResourceVersion,
        observed_at: DateTime<Utc>,
    ) -> Normalized {
        let mut snapshot = match snapshot_from_pod(pod) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, resource_version = %resource_version, "Ignoring pod delivery");
                return Normalized::Skip(SkipReason::InvalidObject);
            }
        };
        snapshot.resource_version = resource_version.clone();

        if self.filter.is_excluded(&snapshot.identity.namespace) {
            return Normalized::Skip(SkipReason::ExcludedNamespace);
        }

        if kind == RawEventKind::Deleted {
            return Normalized::Emit(self.deleted_event(cache, snapshot, observed_at));
        }

        if let Some(entry) = cache.entries.get(&snapshot.identity.uid) {
            if *resource_version == entry.resource_version {
                return Normalized::Skip(SkipReason::Duplicate);
            }
            if *resource_version < entry.resource_version {
                debug!(
                    uid = %snapshot.identity.uid,
                    resource_version = %resource_version,
                    last_seen = %entry.resource_version,
                    "Skipping stale pod delivery"
                );
                return Normalized::Skip(SkipReason::Stale);
            }
        }

        let fingerprint = fingerprint(&snapshot);
        if let Some(entry) = cache.entries.get_mut(&snapshot.identity.uid) {
            if entry.fingerprint == fingerprint {
                entry.resource_version = resource_version.clone();
                return Normalized::Skip(SkipReason::Unchanged);
            }
        }

        let (effective_request, malformed) = reduce(&snapshot);
        cache.entries.insert(
            snapshot.identity.uid.clone(),
            CacheEntry {
                identity: snapshot.identity.clone(),
                resource_version: resource_version.clone(),
                fingerprint,
                last_request: effective_request.clone(),
                phase: snapshot.phase,
                node_name: snapshot.node_name.clone(),
                started_at: snapshot.started_at,
                finished_at: snapshot.finished_at,
            },
        );

        Normalized::Emit(NormalizedEvent {
            pod: snapshot.identity,
            resource_version: resource_version.clone(),
            effective_request,
            observed_at,
            kind: BillingEventKind::Observed,
            phase: snapshot.phase,
            node_name: snapshot.node_name,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
            malformed,
            inferred: false,
        })
    }

    /// Close the billing window of every cached pod missing from a full list
    ///
    /// Pods deleted while the session was disconnected never produce a
    /// delete event; the list's resource version stamps their closure.
    pub fn close_vanished(
        &self,
        cache: &mut NormalizerCache,
        live_uids: &HashSet<String>,
        resource_version: &ResourceVersion,
        observed_at: DateTime<Utc>,
    ) -> Vec<NormalizedEvent> {
        let mut vanished: Vec<String> = cache
            .entries
            .keys()
            .filter(|uid| !live_uids.contains(*uid))
            .cloned()
            .collect();
        vanished.sort();

        vanished
            .into_iter()
            .filter_map(|uid| cache.entries.remove(&uid))
            .map(|entry| NormalizedEvent {
                pod: entry.identity,
                resource_version: resource_version.clone(),
                effective_request: entry.last_request,
                observed_at,
                kind: BillingEventKind::Deleted,
                phase: entry.phase,
                node_name: entry.node_name,
                started_at: entry.started_at,
                finished_at: entry.finished_at,
                malformed: None,
                inferred: true,
            })
            .collect()
    }

    fn deleted_event(
        &self,
        cache: &mut NormalizerCache,
        snapshot: PodSnapshot,
        observed_at: DateTime<Utc>,
    ) -> NormalizedEvent {
        let cached = cache.entries.remove(&snapshot.identity.uid);
        let (effective_request, malformed, inferred) =
            match reducer::effective_request(&snapshot.containers) {
                Ok(request) => (request, None, false),
                Err(e) => {
                    let fallback = cached.map(|entry| entry.last_request).unwrap_or_default();
                    (fallback, Some(e.to_string()), true)
                }
            };

        NormalizedEvent {
            pod: snapshot.identity,
            resource_version: snapshot.resource_version,
            effective_request,
            observed_at,
            kind: BillingEventKind::Deleted,
            phase: snapshot.phase,
            node_name: snapshot.node_name,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
            malformed,
            inferred,
        }
    }
}

fn reduce(snapshot: &PodSnapshot) -> (EffectiveRequest, Option<String>) {
    match reducer::effective_request(&snapshot.containers) {
        Ok(request) => (request, None),
        Err(e) => {
            warn!(
                uid = %snapshot.identity.uid,
                namespace = %snapshot.identity.namespace,
                pod = %snapshot.identity.name,
                resource_version = %snapshot.resource_version,
                error = %e,
                "Malformed resource quantity, flagging billing event"
            );
            (EffectiveRequest::new(), Some(e.to_string()))
        }
    }
}

/// SHA-256 over container kinds, names and requests, phase and node
fn fingerprint(snapshot: &PodSnapshot) -> String {
    let mut hasher = Sha256::new();
    for container in &snapshot.containers {
        let kind = match container.kind {
            ContainerKind::App => "app",
            ContainerKind::Init => "init",
            ContainerKind::Sidecar => "sidecar",
        };
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(container.name.as_bytes());
        hasher.update([0u8]);
        for (resource, quantity) in &container.requests {
            hasher.update(resource.as_bytes());
            hasher.update(b"=");
            hasher.update(quantity.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([1u8]);
    }
    hasher.update(snapshot.phase.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(snapshot.node_name.as_deref().unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}
