//! Core data models for the billing agent

use crate::quantity::Quantity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// How a container participates in a pod's resource accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// Regular container, runs for the pod's lifetime
    App,
    /// Init container, runs to completion before the next one starts
    Init,
    /// Restartable init container (restart policy `Always`), keeps running
    /// alongside the app containers once started
    Sidecar,
}

/// A container and the resources it requests, quantities still unparsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub kind: ContainerKind,
    /// resource name -> raw quantity string (e.g. "cpu" -> "250m")
    pub requests: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, kind: ContainerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            requests: BTreeMap::new(),
        }
    }

    /// Builder-style helper to add a request
    pub fn with_request(mut self, resource: impl Into<String>, quantity: impl Into<String>) -> Self {
        self.requests.insert(resource.into(), quantity.into());
        self
    }
}

/// Pod lifecycle phase as reported by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Returns true once all containers have terminated for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

/// Opaque, ordered cursor attached to objects and events by the cluster API
///
/// Numeric versions compare numerically; anything else falls back to
/// comparing by length and then lexically, which keeps the order total.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn sort_key(&self) -> (u8, u64, usize, &str) {
        match self.0.parse::<u64>() {
            Ok(n) => (0, n, 0, ""),
            Err(_) => (1, 0, self.0.len(), self.0.as_str()),
        }
    }
}

impl PartialEq for ResourceVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ResourceVersion {}

impl PartialOrd for ResourceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl Hash for ResourceVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state);
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Durable identity of a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodIdentity {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Billing-relevant view of a pod at one resource version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub identity: PodIdentity,
    pub resource_version: ResourceVersion,
    /// Init containers in declared order, followed by app containers
    pub containers: Vec<ContainerSpec>,
    pub phase: PodPhase,
    pub node_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Latest container termination time, if any container has terminated
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-resource request a scheduler would reserve for a pod
///
/// Resources absent from every container are omitted rather than stored as
/// zero, so "unspecified" stays distinguishable from "explicitly zero".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectiveRequest(BTreeMap<String, Quantity>);

impl EffectiveRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &str) -> Option<Quantity> {
        self.0.get(resource).copied()
    }

    /// Requested amount, treating unspecified resources as zero
    pub fn get_or_zero(&self, resource: &str) -> Quantity {
        self.get(resource).unwrap_or(Quantity::ZERO)
    }

    pub fn insert(&mut self, resource: impl Into<String>, quantity: Quantity) {
        self.0.insert(resource.into(), quantity);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Quantity)> for EffectiveRequest {
    fn from_iter<T: IntoIterator<Item = (String, Quantity)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for EffectiveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(r, q)| format!("{}={}", r, q)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Kind of billing observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingEventKind {
    Observed,
    Deleted,
}

impl BillingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventKind::Observed => "observed",
            BillingEventKind::Deleted => "deleted",
        }
    }
}

/// Immutable billing row appended to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub pod_uid: String,
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub node_name: Option<String>,
    pub phase: PodPhase,
    pub resource_version: ResourceVersion,
    pub effective_request: EffectiveRequest,
    pub observed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub kind: BillingEventKind,
    /// Set when a request quantity could not be parsed; the request is then
    /// empty and the record should be excluded or reviewed by billing
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub malformed: Option<String>,
    /// Set when the record was synthesized rather than delivered: a closure
    /// for a pod missing from a relist, or a delete whose request fell back
    /// to the last known one. `observed_at` is then an upper bound.
    #[serde(default)]
    pub inferred: bool,
}

/// Scope a watch session covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    AllNamespaces,
    Namespace(String),
}

impl Scope {
    /// Build scopes from a namespace list; an empty list means cluster-wide
    pub fn from_namespaces(namespaces: &[String]) -> Vec<Scope> {
        if namespaces.is_empty() {
            vec![Scope::AllNamespaces]
        } else {
            namespaces
                .iter()
                .map(|ns| Scope::Namespace(ns.clone()))
                .collect()
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Scope::AllNamespaces => "*",
            Scope::Namespace(ns) => ns,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::AllNamespaces => f.write_str("all-namespaces"),
            Scope::Namespace(ns) => write!(f, "namespace/{}", ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_version_numeric_order() {
        let a = ResourceVersion::new("9");
        let b = ResourceVersion::new("10");
        assert!(a < b);
        assert_eq!(ResourceVersion::new("007"), ResourceVersion::new("7"));
    }

    #[test]
    fn test_resource_version_opaque_order() {
        assert!(ResourceVersion::new("abc") < ResourceVersion::new("abcd"));
        assert!(ResourceVersion::new("abd") > ResourceVersion::new("abc"));
        // Numeric versions sort before opaque ones
        assert!(ResourceVersion::new("99999") < ResourceVersion::new("x"));
    }

    #[test]
    fn test_pod_phase_parse() {
        assert_eq!(PodPhase::parse(Some("Running")), PodPhase::Running);
        assert_eq!(PodPhase::parse(Some("bogus")), PodPhase::Unknown);
        assert_eq!(PodPhase::parse(None), PodPhase::Unknown);
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
    }

    #[test]
    fn test_scope_from_namespaces() {
        assert_eq!(Scope::from_namespaces(&[]), vec![Scope::AllNamespaces]);
        let scopes = Scope::from_namespaces(&["a".to_string(), "b".to_string()]);
        assert_eq!(
            scopes,
            vec![
                Scope::Namespace("a".to_string()),
                Scope::Namespace("b".to_string())
            ]
        );
        assert_eq!(scopes[0].label(), "a");
    }

    #[test]
    fn test_billing_record_serializes_kind_lowercase() {
        let record = BillingRecord {
            pod_uid: "uid-1".to_string(),
            namespace: "team-a".to_string(),
            name: "web-0".to_string(),
            node_name: None,
            phase: PodPhase::Running,
            resource_version: ResourceVersion::new("42"),
            effective_request: EffectiveRequest::new(),
            observed_at: Utc::now(),
            started_at: None,
            finished_at: None,
            kind: BillingEventKind::Deleted,
            malformed: None,
            inferred: true,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "deleted");
        assert_eq!(json["resource_version"], "42");
        assert_eq!(json["inferred"], true);
        assert!(json.get("malformed").is_none());
    }

    #[test]
    fn test_billing_record_without_inferred_defaults_to_delivered() {
        let json = serde_json::json!({
            "pod_uid": "uid-1",
            "namespace": "team-a",
            "name": "web-0",
            "phase": "Running",
            "resource_version": "42",
            "effective_request": {},
            "observed_at": "2026-01-05T10:00:00Z",
            "kind": "observed"
        });
        let record: BillingRecord = serde_json::from_value(json).unwrap();
        assert!(!record.inferred);
    }
}
