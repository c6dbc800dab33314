//! HelmRelease reconciler
//!
//! Releases listing `dependsOn` entries are held back until every
//! dependency reports Ready for its current generation; until then the
//! release is marked `DependencyNotReady` and revisited after the configured
//! dependency interval (a zero interval waits for the release's next change
//! instead). Ready releases are handed to a [`ReleaseApplier`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use helm_common::crd::{
    Condition, ConditionStatus, DependencyRef, HelmChart, HelmRelease, HelmReleaseStatus,
};
use helm_common::metrics::{self, RequeueReason};
use helm_common::{Error, KindId, ObjectKey, WatchEvent, RECONCILE_AT_ANNOTATION};
use tracing::{debug, info};

use super::{Action, Context, ControllerRegistration, Reconciler, SetupWithHost};
use crate::config::{DEFAULT_CONCURRENT, DEFAULT_REQUEUE_DEPENDENCY};
use crate::error::AttachmentError;
use crate::host::RuntimeHost;

/// Registration name of the HelmRelease reconciler
pub const HELM_RELEASE_CONTROLLER: &str = "helmrelease";

/// Ready reason while a dependency is not ready
pub const DEPENDENCY_NOT_READY_REASON: &str = "DependencyNotReady";
/// Ready reason when the chart artifact is unavailable
pub const ARTIFACT_FAILED_REASON: &str = "ArtifactFailed";
/// Ready reason after a successful apply
pub const RECONCILIATION_SUCCEEDED_REASON: &str = "ReconciliationSucceeded";

/// Applies a release whose dependencies are ready
///
/// Returns the status to record on the release.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReleaseApplier: Send + Sync + 'static {
    /// Drive `release` toward its spec
    async fn apply(&self, release: &HelmRelease, ctx: &Context)
        -> Result<HelmReleaseStatus, Error>;
}

/// Applier that tracks the release's HelmChart artifact
///
/// Records the chart reference and promotes the artifact revision to the
/// last applied revision. Ready follows artifact availability.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChartStatusApplier;

impl ChartStatusApplier {
    /// Create the applier
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReleaseApplier for ChartStatusApplier {
    async fn apply(
        &self,
        release: &HelmRelease,
        ctx: &Context,
    ) -> Result<HelmReleaseStatus, Error> {
        let charts = ctx.descriptor(&KindId::of::<HelmChart>())?;
        let chart_key = ObjectKey::namespaced(release.chart_namespace(), release.chart_name());

        let chart: Option<HelmChart> = match ctx.client.get(charts, &chart_key).await? {
            Some(obj) => Some(charts.decode(&obj)?),
            None => None,
        };

        let mut status = release.status.clone().unwrap_or_default();
        status.helm_chart = Some(chart_key.to_string());
        status.observed_generation = release.metadata.generation;

        match chart.as_ref().and_then(HelmChart::artifact_revision) {
            Some(revision) => {
                status.last_attempted_revision = Some(revision.to_string());
                status.last_applied_revision = Some(revision.to_string());
                status.set_ready(Condition::ready(
                    ConditionStatus::True,
                    RECONCILIATION_SUCCEEDED_REASON,
                    format!("release reconciliation succeeded for revision {revision}"),
                ));
            }
            None => {
                status.set_ready(Condition::ready(
                    ConditionStatus::False,
                    ARTIFACT_FAILED_REASON,
                    format!("HelmChart '{chart_key}' has no artifact"),
                ));
            }
        }
        Ok(status)
    }
}

/// Tunables of the HelmRelease controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelmReleaseReconcilerOptions {
    /// Maximum number of releases reconciled at once
    pub max_concurrent_reconciles: usize,
    /// Revisit interval for releases waiting on dependencies; zero disables
    /// the timed revisit
    pub dependency_requeue_interval: Duration,
}

impl Default for HelmReleaseReconcilerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: DEFAULT_CONCURRENT,
            dependency_requeue_interval: DEFAULT_REQUEUE_DEPENDENCY,
        }
    }
}

/// Dependency-aware HelmRelease controller
pub struct HelmReleaseReconciler {
    applier: Arc<dyn ReleaseApplier>,
    options: HelmReleaseReconcilerOptions,
}

impl HelmReleaseReconciler {
    /// Create a reconciler delegating ready releases to `applier`
    pub fn new(applier: Arc<dyn ReleaseApplier>, options: HelmReleaseReconcilerOptions) -> Self {
        Self { applier, options }
    }

    /// First dependency that is missing or not ready
    async fn unready_dependency(
        &self,
        dependencies: &[DependencyRef],
        ctx: &Context,
    ) -> Result<Option<DependencyRef>, Error> {
        let releases = ctx.descriptor(&KindId::of::<HelmRelease>())?;
        for dependency in dependencies {
            let key = ObjectKey::namespaced(&dependency.namespace, &dependency.name);
            let ready = match ctx.client.get(releases, &key).await? {
                Some(obj) => releases.decode::<HelmRelease>(&obj)?.is_ready(),
                None => false,
            };
            if !ready {
                return Ok(Some(dependency.clone()));
            }
        }
        Ok(None)
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        status: &HelmReleaseStatus,
        ctx: &Context,
    ) -> Result<(), Error> {
        let releases = ctx.descriptor(&KindId::of::<HelmRelease>())?;
        let status = serde_json::to_value(status)?;
        ctx.client.patch_status(releases, key, status).await
    }
}

#[async_trait]
impl Reconciler for HelmReleaseReconciler {
    async fn reconcile(&self, key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
        let releases = ctx.descriptor(&KindId::of::<HelmRelease>())?;
        let Some(obj) = ctx.client.get(releases, key).await? else {
            debug!(release = %key, "release no longer exists");
            return Ok(Action::await_change());
        };
        let release: HelmRelease = releases.decode(&obj)?;

        if release.spec.suspend {
            info!(release = %key, "reconciliation is suspended");
            return Ok(Action::await_change());
        }

        let interval = release
            .reconcile_interval()
            .map_err(|e| Error::validation_for(key.to_string(), e))?;
        let dependencies = release
            .dependencies()
            .map_err(|e| Error::validation_for(key.to_string(), e))?;
        if let Some(own) = dependencies.iter().find(|d| {
            Some(d.namespace.as_str()) == key.namespace.as_deref() && d.name == key.name
        }) {
            return Err(Error::validation_for(
                key.to_string(),
                format!("release cannot depend on itself ({own})"),
            ));
        }

        if let Some(dependency) = self.unready_dependency(&dependencies, ctx).await? {
            let requeue = self.options.dependency_requeue_interval;
            info!(
                release = %key,
                dependency = %dependency,
                retry_in = ?requeue,
                "dependencies do not meet ready condition, retrying"
            );
            let mut status = release.status.clone().unwrap_or_default();
            status.set_ready(Condition::ready(
                ConditionStatus::False,
                DEPENDENCY_NOT_READY_REASON,
                format!("dependency '{dependency}' is not ready"),
            ));
            self.write_status(key, &status, ctx).await?;
            if requeue.is_zero() {
                return Ok(Action::await_change());
            }
            metrics::record_requeue(HELM_RELEASE_CONTROLLER, RequeueReason::Dependency);
            return Ok(Action::requeue(requeue));
        }
        if !dependencies.is_empty() {
            debug!(release = %key, "all dependencies are ready");
        }

        let status = self.applier.apply(&release, ctx).await?;
        self.write_status(key, &status, ctx).await?;
        info!(
            release = %key,
            revision = ?status.last_applied_revision,
            next_in = ?interval,
            "release reconciled"
        );
        metrics::record_requeue(HELM_RELEASE_CONTROLLER, RequeueReason::Scheduled);
        Ok(Action::requeue(interval))
    }
}

/// Generation and reconcile request last seen per release
type SeenMarkers = DashMap<ObjectKey, (Option<i64>, Option<String>)>;

/// Accepts a release event only when its generation or its
/// `fluxcd.io/reconcileAt` annotation changed, so status writes do not
/// trigger another reconcile
fn spec_or_request_changed(seen: &SeenMarkers, event: &WatchEvent) -> bool {
    let obj = event.object();
    let Some(key) = ObjectKey::from_object(obj) else {
        return false;
    };
    if let WatchEvent::Deleted(_) = event {
        seen.remove(&key);
        return true;
    }
    let marker = (
        obj.metadata.generation,
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(RECONCILE_AT_ANNOTATION))
            .cloned(),
    );
    match seen.insert(key, marker.clone()) {
        Some(previous) => previous != marker,
        None => true,
    }
}

impl SetupWithHost for HelmReleaseReconciler {
    fn attach_to(self, host: &mut RuntimeHost) -> Result<(), AttachmentError> {
        let concurrency = self.options.max_concurrent_reconciles;
        let seen = SeenMarkers::new();
        host.attach(
            ControllerRegistration::new(HELM_RELEASE_CONTROLLER, KindId::of::<HelmRelease>(), self)
                .filter_primary(move |event| spec_or_request_changed(&seen, event))
                .concurrency(concurrency),
        )
    }
}
