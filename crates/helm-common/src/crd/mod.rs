//! Custom resource kinds understood by the helm controller
//!
//! `HelmChart` is owned by the source controller and only read here;
//! `HelmRelease` is the kind this process reconciles.

mod helm_chart;
mod helm_release;
mod types;

pub use helm_chart::{
    Artifact, HelmChart, HelmChartSpec, HelmChartStatus, LocalObjectReference,
    HELM_CHART_KIND, SOURCE_GROUP, SOURCE_VERSION,
};
pub use helm_release::{
    CrossNamespaceObjectReference, DependencyRef, HelmChartTemplate, HelmRelease,
    HelmReleaseSpec, HelmReleaseStatus, DEFAULT_RELEASE_INTERVAL, HELM_GROUP, HELM_RELEASE_KIND,
    HELM_VERSION,
};
pub use types::{parse_duration, Condition, ConditionStatus, READY_CONDITION};
