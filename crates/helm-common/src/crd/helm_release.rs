//! HelmRelease: a Helm release driven toward the chart and values in its spec

use std::time::Duration;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{parse_duration, Condition, ConditionStatus, READY_CONDITION};

/// API group of helm kinds
pub const HELM_GROUP: &str = "helm.toolkit.fluxcd.io";
/// API version of helm kinds
pub const HELM_VERSION: &str = "v2alpha1";
/// Kind name of HelmRelease
pub const HELM_RELEASE_KIND: &str = "HelmRelease";

/// Interval used when a release does not set one
pub const DEFAULT_RELEASE_INTERVAL: Duration = Duration::from_secs(300);

/// HelmRelease declares a Helm release built from a HelmChart artifact.
///
/// Example:
/// ```yaml
/// apiVersion: helm.toolkit.fluxcd.io/v2alpha1
/// kind: HelmRelease
/// metadata:
///   name: frontend
///   namespace: default
/// spec:
///   interval: 5m
///   chart:
///     name: podinfo
///     version: "^4.0.0"
///     sourceRef:
///       kind: HelmRepository
///       name: podinfo
///   dependsOn:
///     - backend
///     - infra/redis
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "helm.toolkit.fluxcd.io",
    version = "v2alpha1",
    kind = "HelmRelease",
    namespaced,
    status = "HelmReleaseStatus",
    shortname = "hr",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// Chart to build the release from
    pub chart: HelmChartTemplate,

    /// Interval at which the release is reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Suspend further reconciliation of this release
    #[serde(default)]
    pub suspend: bool,

    /// Helm release name, defaults to `<targetNamespace>-<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Namespace the release is installed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Releases that must be ready before this one is reconciled,
    /// as `name` (same namespace) or `namespace/name`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Values passed to the chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

/// Template of the HelmChart generated for a release
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartTemplate {
    /// Chart name in the repository
    pub name: String,

    /// Semver range of the chart version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Source the chart is fetched from
    pub source_ref: CrossNamespaceObjectReference,
}

/// Reference to an object that may live in another namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceObjectReference {
    /// Kind of the referent
    pub kind: String,
    /// Name of the referent
    pub name: String,
    /// Namespace of the referent, defaults to the referrer's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Observed state of a HelmRelease
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    /// Generation last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions of the release
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Chart revision of the last successful apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,

    /// Chart revision of the last apply attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,

    /// `namespace/name` of the HelmChart this release is built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart: Option<String>,
}

impl HelmReleaseStatus {
    /// The `Ready` condition, if reported
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == READY_CONDITION)
    }

    /// Replace the `Ready` condition
    ///
    /// The transition time is kept when the status does not change.
    pub fn set_ready(&mut self, mut condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == READY_CONDITION) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

/// A parsed `dependsOn` entry
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DependencyRef {
    /// Namespace of the dependency
    pub namespace: String,
    /// Name of the dependency
    pub name: String,
}

impl std::fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl DependencyRef {
    /// Parse `name` or `namespace/name`, defaulting the namespace
    pub fn parse(entry: &str, default_namespace: &str) -> Result<Self, String> {
        let entry = entry.trim();
        let (namespace, name) = match entry.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (default_namespace, entry),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(format!("invalid dependsOn entry {:?}", entry));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl HelmRelease {
    /// Configured reconcile interval, or the default when unset
    pub fn reconcile_interval(&self) -> Result<Duration, String> {
        match self.spec.interval.as_deref() {
            Some(raw) => parse_duration(raw),
            None => Ok(DEFAULT_RELEASE_INTERVAL),
        }
    }

    /// Parsed `dependsOn` entries
    pub fn dependencies(&self) -> Result<Vec<DependencyRef>, String> {
        let namespace = self.namespace().unwrap_or_default();
        self.spec
            .depends_on
            .iter()
            .map(|entry| DependencyRef::parse(entry, &namespace))
            .collect()
    }

    /// Whether this release lists `namespace/name` as a dependency
    pub fn depends_on(&self, namespace: &str, name: &str) -> bool {
        self.dependencies()
            .map(|deps| deps.iter().any(|d| d.namespace == namespace && d.name == name))
            .unwrap_or(false)
    }

    /// Ready when the `Ready` condition is true for the current generation
    pub fn is_ready(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        let ready = status
            .conditions
            .iter()
            .any(|c| c.type_ == READY_CONDITION && c.status == ConditionStatus::True);
        ready && status.observed_generation == self.metadata.generation
    }

    /// Name of the HelmChart generated for this release (`<namespace>-<name>`)
    pub fn chart_name(&self) -> String {
        format!("{}-{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Namespace of the HelmChart generated for this release
    pub fn chart_namespace(&self) -> String {
        self.spec
            .chart
            .source_ref
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace().unwrap_or_default())
    }
}
