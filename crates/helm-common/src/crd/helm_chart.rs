//! HelmChart: a chart artifact produced by the source controller
//!
//! This process never writes HelmCharts; it watches their artifact revision
//! to trigger the releases built from them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus, READY_CONDITION};

/// API group of source kinds
pub const SOURCE_GROUP: &str = "source.toolkit.fluxcd.io";
/// API version of source kinds
pub const SOURCE_VERSION: &str = "v1alpha1";
/// Kind name of HelmChart
pub const HELM_CHART_KIND: &str = "HelmChart";

/// HelmChart describes a chart to be fetched from a Helm repository.
///
/// Example:
/// ```yaml
/// apiVersion: source.toolkit.fluxcd.io/v1alpha1
/// kind: HelmChart
/// metadata:
///   name: default-podinfo
///   namespace: default
/// spec:
///   name: podinfo
///   version: "^4.0.0"
///   helmRepositoryRef:
///     name: podinfo
///   interval: 1m
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1alpha1",
    kind = "HelmChart",
    namespaced,
    status = "HelmChartStatus",
    shortname = "hc",
    printcolumn = r#"{"name":"Chart","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.artifact.revision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    /// Name of the chart in the repository
    pub name: String,

    /// Semver range of the chart version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Repository the chart is fetched from
    pub helm_repository_ref: LocalObjectReference,

    /// How often the source controller checks for a new chart version
    pub interval: String,
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    /// Name of the referent
    pub name: String,
}

/// Observed state of a HelmChart
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartStatus {
    /// Conditions reported by the source controller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Download URL of the latest artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Latest packaged chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}

/// A packaged chart produced by the source controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Path of the artifact on the source controller's storage
    pub path: String,
    /// Download URL
    pub url: String,
    /// Chart version the artifact was built from
    #[serde(default)]
    pub revision: String,
    /// SHA1 checksum of the artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// When the artifact was last produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

impl HelmChart {
    /// Revision of the current artifact, if one has been produced
    pub fn artifact_revision(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.artifact.as_ref())
            .map(|a| a.revision.as_str())
            .filter(|r| !r.is_empty())
    }

    /// Whether the source controller reports the chart as ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == READY_CONDITION && c.status == ConditionStatus::True)
            })
            .unwrap_or(false)
    }
}
