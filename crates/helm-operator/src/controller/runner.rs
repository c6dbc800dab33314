//! One attached controller on `kube::runtime::Controller`
//!
//! The primary kind's watch fills a reflector store and triggers reconciles;
//! secondary kinds only trigger. Per-key deduplication, delayed requeues, the
//! concurrency limit and the graceful drain are the kube runtime's.

use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{future, FutureExt, Stream, StreamExt};
use helm_common::metrics::{self, ReconcileResult, ReconcileTimer, RequeueReason};
use helm_common::{Error, KindId, ObjectKey, WatchEvent};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::controller::{Config, Controller};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::backoff::ErrorBackoff;
use super::{Action, Context, ControllerRegistration, EventFilter, Reconciler};
use crate::error::RunError;

/// Handed to every reconcile and error policy call of one controller
struct Shared {
    controller: String,
    reconciler: Arc<dyn Reconciler>,
    ctx: Context,
    backoff: ErrorBackoff,
}

/// Running controller owned by the host
pub(crate) struct ControllerHandle {
    name: String,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Build the kube controller for `registration` and spawn it
    ///
    /// The controller stops taking work once `ctx.cancel` fires. A watch
    /// that ends before that is reported on `fatal`.
    pub(crate) fn start(
        registration: &ControllerRegistration,
        ctx: Context,
        fatal: mpsc::UnboundedSender<RunError>,
    ) -> Result<Self, RunError> {
        let name = registration.name().to_string();
        let start_failed = |e: Error| RunError::ControllerStart {
            controller: name.clone(),
            message: e.to_string(),
        };

        let primary = ctx.descriptor(registration.primary_kind()).map_err(start_failed)?;
        let primary_ar = primary.api_resource();
        let writer = Writer::new(primary_ar.clone());
        let reader = writer.as_reader();
        let triggers = primary_triggers(
            &name,
            primary.id(),
            ctx.client.watch(primary),
            registration.filter(),
            writer,
        );
        let triggers = report_end(
            triggers,
            name.clone(),
            primary.id().clone(),
            ctx.cancel.clone(),
            fatal.clone(),
        );
        let mut controller = Controller::for_stream_with(triggers, reader, primary_ar.clone());

        for source in registration.secondary() {
            let descriptor = ctx.descriptor(&source.kind).map_err(start_failed)?;
            let objects = report_end(
                secondary_objects(&name, &source.kind, ctx.client.watch(descriptor)),
                name.clone(),
                source.kind.clone(),
                ctx.cancel.clone(),
                fatal.clone(),
            );
            let mapper = Arc::clone(&source.mapper);
            let owner = primary_ar.clone();
            controller = controller.watches_stream_with(
                objects,
                move |obj: DynamicObject| {
                    mapper(&obj)
                        .iter()
                        .map(|key| object_ref(key, &owner))
                        .collect::<Vec<_>>()
                },
                descriptor.api_resource(),
            );
        }

        let concurrency =
            u16::try_from(registration.max_concurrent_reconciles()).unwrap_or(u16::MAX);
        let shutdown = ctx.cancel.clone();
        let shared = Arc::new(Shared {
            controller: name.clone(),
            reconciler: registration.reconciler(),
            ctx,
            backoff: ErrorBackoff::new(registration.backoff_policy()),
        });

        info!(controller = %name, concurrency, "starting controller");
        let task = tokio::spawn(
            controller
                .with_config(Config::default().concurrency(concurrency))
                .graceful_shutdown_on(shutdown.cancelled_owned())
                .run(reconcile, error_policy, shared)
                .for_each(log_reconcile_result(name.clone()))
                .in_current_span(),
        );

        Ok(Self { name, task })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the controller to finish its in-flight reconciles
    pub(crate) async fn join(&mut self) {
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!(controller = %self.name, error = %e, "controller exited abnormally");
            }
        }
    }

    /// Abandon whatever is still running
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Primary records as controller triggers, mirrored into `store`
///
/// Every event updates the store; only events accepted by `filter` trigger.
/// Deletions never trigger since a record missing from the store is not
/// reconciled.
fn primary_triggers(
    controller: &str,
    kind: &KindId,
    events: BoxStream<'static, helm_common::Result<WatchEvent>>,
    filter: EventFilter,
    mut store: Writer<DynamicObject>,
) -> impl Stream<Item = Result<DynamicObject, watcher::Error>> + Send + 'static {
    // Reconcilers read through the client, so the store is ready while empty
    store.apply_watcher_event(&watcher::Event::Init);
    store.apply_watcher_event(&watcher::Event::InitDone);

    let controller = controller.to_string();
    let kind = kind.clone();
    events.filter_map(move |event| {
        let trigger = match event {
            Ok(event) => {
                let accepted = filter(&event);
                match event {
                    WatchEvent::Applied(obj) => {
                        store.apply_watcher_event(&watcher::Event::Apply(obj.clone()));
                        accepted.then_some(obj)
                    }
                    WatchEvent::Deleted(obj) => {
                        store.apply_watcher_event(&watcher::Event::Delete(obj));
                        None
                    }
                }
            }
            Err(e) => {
                warn!(controller = %controller, kind = %kind, error = %e, "watch error");
                None
            }
        };
        future::ready(trigger.map(Ok))
    })
}

/// Records of a secondary kind, deleted ones included
fn secondary_objects(
    controller: &str,
    kind: &KindId,
    events: BoxStream<'static, helm_common::Result<WatchEvent>>,
) -> impl Stream<Item = Result<DynamicObject, watcher::Error>> + Send + 'static {
    let controller = controller.to_string();
    let kind = kind.clone();
    events.filter_map(move |event| {
        let obj = match event {
            Ok(WatchEvent::Applied(obj) | WatchEvent::Deleted(obj)) => Some(Ok(obj)),
            Err(e) => {
                warn!(controller = %controller, kind = %kind, error = %e, "watch error");
                None
            }
        };
        future::ready(obj)
    })
}

/// Reports on `fatal` when `stream` ends before `cancel` fires
fn report_end<S, T>(
    stream: S,
    controller: String,
    kind: KindId,
    cancel: CancellationToken,
    fatal: mpsc::UnboundedSender<RunError>,
) -> impl Stream<Item = T> + Send + 'static
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    let ended = stream::once(async move {
        if !cancel.is_cancelled() {
            let _ = fatal.send(RunError::WatchEnded { controller, kind });
        }
        None::<T>
    })
    .filter_map(future::ready);
    stream.chain(ended)
}

fn object_ref(key: &ObjectKey, ar: &ApiResource) -> ObjectRef<DynamicObject> {
    let reference = ObjectRef::new_with(&key.name, ar.clone());
    match &key.namespace {
        Some(ns) => reference.within(ns),
        None => reference,
    }
}

async fn reconcile(obj: Arc<DynamicObject>, shared: Arc<Shared>) -> Result<Action, Error> {
    let Some(key) = ObjectKey::from_object(&obj) else {
        return Ok(Action::await_change());
    };

    let timer = ReconcileTimer::start(shared.controller.as_str());
    let span = tracing::info_span!("reconcile", controller = %shared.controller, key = %key);
    let result = AssertUnwindSafe(shared.reconciler.reconcile(&key, &shared.ctx).instrument(span))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(controller = %shared.controller, key = %key, "reconcile panicked");
            Err(Error::internal_with_context(key.to_string(), "reconcile panicked"))
        });

    match &result {
        Ok(action) => {
            shared.backoff.forget(&key);
            if *action == Action::await_change() {
                timer.finish(ReconcileResult::Success);
            } else {
                timer.finish(ReconcileResult::Requeue);
            }
        }
        Err(_) => timer.finish(ReconcileResult::Error),
    }
    result
}

fn error_policy(obj: Arc<DynamicObject>, error: &Error, shared: Arc<Shared>) -> Action {
    let retryable = error.is_retryable();
    metrics::record_reconcile_error(&shared.controller, retryable);
    let Some(key) = ObjectKey::from_object(&obj) else {
        return Action::await_change();
    };

    if !retryable {
        error!(
            controller = %shared.controller,
            key = %key,
            error = %error,
            "reconciliation error, waiting for next change"
        );
        return Action::await_change();
    }

    let delay = shared.backoff.next_delay(&key);
    error!(
        controller = %shared.controller,
        key = %key,
        error = %error,
        retry_in = ?delay,
        "reconciliation error"
    );
    metrics::record_requeue(&shared.controller, RequeueReason::Error);
    Action::requeue(delay)
}

fn log_reconcile_result<T: Debug, E: Debug>(
    controller: String,
) -> impl Fn(Result<T, E>) -> future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(controller = %controller, ?action, "reconciliation completed"),
            Err(e) => warn!(controller = %controller, error = ?e, "reconciliation error"),
        }
        future::ready(())
    }
}
