//! Controller registrations and the runtime that drives them
//!
//! A [`ControllerRegistration`] names the kinds a controller watches, how
//! watched records map to the keys it reconciles, how many keys it may
//! reconcile at once and the [`Reconciler`] that does the work. The host
//! turns each attached registration into a `kube::runtime::Controller` fed
//! from the cluster client's watch streams.

mod backoff;
pub mod chart_watcher;
pub mod release;
pub(crate) mod runner;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use helm_common::{
    ClusterClient, Error, KindId, ObjectKey, ResourceKindDescriptor, TypeRegistry, WatchEvent,
};
use kube::api::DynamicObject;
use tokio_util::sync::CancellationToken;

use crate::error::AttachmentError;
use crate::host::RuntimeHost;

pub use backoff::BackoffPolicy;
pub use chart_watcher::{HelmChartWatcher, HELM_CHART_CONTROLLER};
pub use kube::runtime::controller::Action;
pub use release::{
    ChartStatusApplier, HelmReleaseReconciler, HelmReleaseReconcilerOptions, ReleaseApplier,
    HELM_RELEASE_CONTROLLER,
};

/// Shared state handed to every reconcile
#[derive(Clone)]
pub struct Context {
    /// Control-plane access
    pub client: Arc<dyn ClusterClient>,
    /// Kinds known to this process
    pub registry: Arc<TypeRegistry>,
    /// Cancelled when the host begins shutting down
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a context
    pub fn new(
        client: Arc<dyn ClusterClient>,
        registry: Arc<TypeRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            registry,
            cancel,
        }
    }

    /// Descriptor of a registered kind
    pub fn descriptor(&self, id: &KindId) -> Result<&ResourceKindDescriptor, Error> {
        Ok(self.registry.lookup(id)?)
    }
}

/// Drives the records of one kind toward their desired state
///
/// Errors that report `is_retryable()` are retried with per-key exponential
/// backoff. Anything else waits for the next change to the record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Reconcile the record identified by `key`
    async fn reconcile(&self, key: &ObjectKey, ctx: &Context) -> Result<Action, Error>;
}

/// Maps a record of a watched kind to the primary keys that must be reconciled
pub type KeyMapper = Arc<dyn Fn(&DynamicObject) -> Vec<ObjectKey> + Send + Sync>;

/// Decides whether a primary watch event triggers a reconcile
pub type EventFilter = Arc<dyn Fn(&WatchEvent) -> bool + Send + Sync>;

/// A secondary kind and how its records become primary keys
#[derive(Clone)]
pub(crate) struct WatchSource {
    pub(crate) kind: KindId,
    pub(crate) mapper: KeyMapper,
}

/// Everything the host needs to run one controller
pub struct ControllerRegistration {
    name: String,
    primary: KindId,
    filter: EventFilter,
    secondary: Vec<WatchSource>,
    concurrency: usize,
    backoff: BackoffPolicy,
    reconciler: Arc<dyn Reconciler>,
}

impl ControllerRegistration {
    /// Register `reconciler` for records of `primary`, one reconcile at a time
    pub fn new(name: impl Into<String>, primary: KindId, reconciler: impl Reconciler) -> Self {
        Self {
            name: name.into(),
            primary,
            filter: Arc::new(|_: &WatchEvent| true),
            secondary: Vec::new(),
            concurrency: 1,
            backoff: BackoffPolicy::default(),
            reconciler: Arc::new(reconciler),
        }
    }

    /// Only reconcile primary records for events accepted by `predicate`
    ///
    /// Rejected events still update the controller's cache.
    pub fn filter_primary<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&WatchEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(predicate);
        self
    }

    /// Also watch `kind`, reconciling the primary keys returned by `mapper`
    pub fn watches<F>(mut self, kind: KindId, mapper: F) -> Self
    where
        F: Fn(&DynamicObject) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        self.secondary.push(WatchSource {
            kind,
            mapper: Arc::new(mapper),
        });
        self
    }

    /// Maximum number of keys reconciled at once
    pub fn concurrency(mut self, max_concurrent_reconciles: usize) -> Self {
        self.concurrency = max_concurrent_reconciles;
        self
    }

    /// Retry curve for failed reconciles
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    /// Unique registration name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of the reconciled records
    pub fn primary_kind(&self) -> &KindId {
        &self.primary
    }

    /// Every kind this controller watches, primary first
    pub fn watched_kinds(&self) -> impl Iterator<Item = &KindId> {
        std::iter::once(&self.primary).chain(self.secondary.iter().map(|s| &s.kind))
    }

    /// Maximum number of keys reconciled at once
    pub fn max_concurrent_reconciles(&self) -> usize {
        self.concurrency
    }

    pub(crate) fn filter(&self) -> EventFilter {
        Arc::clone(&self.filter)
    }

    pub(crate) fn secondary(&self) -> &[WatchSource] {
        &self.secondary
    }

    pub(crate) fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff
    }

    pub(crate) fn reconciler(&self) -> Arc<dyn Reconciler> {
        Arc::clone(&self.reconciler)
    }
}

impl fmt::Debug for ControllerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRegistration")
            .field("name", &self.name)
            .field("watches", &self.watched_kinds().collect::<Vec<_>>())
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// A controller that knows how to register itself with the host
pub trait SetupWithHost {
    /// Attach this controller to `host`
    fn attach_to(self, host: &mut RuntimeHost) -> Result<(), AttachmentError>;
}

impl SetupWithHost for ControllerRegistration {
    fn attach_to(self, host: &mut RuntimeHost) -> Result<(), AttachmentError> {
        host.attach(self)
    }
}
