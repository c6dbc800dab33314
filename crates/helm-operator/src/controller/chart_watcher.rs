//! HelmChart watcher
//!
//! When the source controller publishes a new chart artifact, every
//! HelmRelease built from that chart is asked to reconcile by stamping
//! the `fluxcd.io/reconcileAt` annotation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use helm_common::crd::{HelmChart, HelmRelease};
use helm_common::{Error, KindId, ObjectKey, WatchEvent, RECONCILE_AT_ANNOTATION};
use tracing::{debug, info, warn};

use super::{Action, Context, ControllerRegistration, Reconciler, SetupWithHost};
use crate::error::AttachmentError;
use crate::host::RuntimeHost;

/// Registration name of the HelmChart watcher
pub const HELM_CHART_CONTROLLER: &str = "helmchart";

/// Requests release reconciles on chart artifact changes
#[derive(Debug, Default)]
pub struct HelmChartWatcher {
    /// Last artifact revision seen per chart; `None` while no artifact exists
    revisions: Arc<DashMap<ObjectKey, Option<String>>>,
}

impl HelmChartWatcher {
    /// Create a watcher with an empty revision cache
    pub fn new() -> Self {
        Self::default()
    }

    async fn request_release_reconciles(
        &self,
        chart: &ObjectKey,
        ctx: &Context,
    ) -> Result<usize, Error> {
        let releases = ctx.descriptor(&KindId::of::<HelmRelease>())?;
        let chart_ref = chart.to_string();
        let requested_at = Utc::now().to_rfc3339();
        let mut requested = 0;

        for obj in ctx.client.list(releases, None).await? {
            let release: HelmRelease = match releases.decode(&obj) {
                Ok(release) => release,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable HelmRelease");
                    continue;
                }
            };
            let built_from_chart = release
                .status
                .as_ref()
                .and_then(|s| s.helm_chart.as_deref())
                == Some(chart_ref.as_str());
            if !built_from_chart {
                continue;
            }
            let Some(key) = ObjectKey::from_object(&obj) else {
                continue;
            };

            let annotations =
                BTreeMap::from([(RECONCILE_AT_ANNOTATION.to_string(), requested_at.clone())]);
            ctx.client.patch_annotations(releases, &key, annotations).await?;
            debug!(release = %key, chart = %chart_ref, "requested release reconcile");
            requested += 1;
        }
        Ok(requested)
    }
}

#[async_trait]
impl Reconciler for HelmChartWatcher {
    async fn reconcile(&self, key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
        let charts = ctx.descriptor(&KindId::of::<HelmChart>())?;
        let Some(obj) = ctx.client.get(charts, key).await? else {
            self.revisions.remove(key);
            return Ok(Action::await_change());
        };
        let chart: HelmChart = charts.decode(&obj)?;
        let revision = chart.artifact_revision().map(str::to_string);

        let previous = match self.revisions.get(key) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(chart = %key, revision = ?revision, "tracking chart");
                self.revisions.insert(key.clone(), revision);
                return Ok(Action::await_change());
            }
        };
        if previous == revision {
            return Ok(Action::await_change());
        }
        if revision.is_none() {
            // Artifact withdrawn; nothing new to release
            self.revisions.insert(key.clone(), revision);
            return Ok(Action::await_change());
        }

        let requested = self.request_release_reconciles(key, ctx).await?;
        info!(
            chart = %key,
            from = ?previous,
            to = ?revision,
            releases = requested,
            "chart artifact changed"
        );
        // Only remember the revision once every release has been notified
        self.revisions.insert(key.clone(), revision);
        Ok(Action::await_change())
    }
}

/// Deleted charts are never reconciled, so their revision is dropped here
fn forget_deleted(revisions: &DashMap<ObjectKey, Option<String>>, event: &WatchEvent) -> bool {
    if let WatchEvent::Deleted(obj) = event {
        if let Some(key) = ObjectKey::from_object(obj) {
            revisions.remove(&key);
        }
    }
    true
}

impl SetupWithHost for HelmChartWatcher {
    fn attach_to(self, host: &mut RuntimeHost) -> Result<(), AttachmentError> {
        let revisions = Arc::clone(&self.revisions);
        host.attach(
            ControllerRegistration::new(HELM_CHART_CONTROLLER, KindId::of::<HelmChart>(), self)
                .filter_primary(move |event| forget_deleted(&revisions, event)),
        )
    }
}
