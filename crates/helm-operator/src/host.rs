//! Runtime host shared by every controller in the process
//!
//! The host owns the cluster client, the type registry, the optional leader
//! elector and the attached controllers. Its lifecycle only moves forward:
//!
//! ```text
//! Uninitialized -> Configured -> Registering -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! `Uninitialized` is the [`HostBuilder`]; a built host starts `Configured`,
//! the first attachment moves it to `Registering` and [`RuntimeHost::run`]
//! carries it the rest of the way.

use std::fmt;
use std::sync::Arc;

use helm_common::leader_election::LeaseLeaderElector;
use helm_common::metrics;
use helm_common::{ClusterClient, KubeClusterClient, LeaderElection, TypeRegistry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProcessOptions;
use crate::controller::runner::ControllerHandle;
use crate::controller::{Context, ControllerRegistration};
use crate::error::{AttachmentError, ConstructionError, RunError};
use crate::metrics_server;

/// In-cluster service account namespace file
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
/// Lease namespace when nothing else is known
const FALLBACK_LEASE_NAMESPACE: &str = "default";

/// Lifecycle state of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostState {
    /// Options and registry are being assembled
    Uninitialized,
    /// Shared runtime built, nothing attached yet
    Configured,
    /// At least one controller attached
    Registering,
    /// Controllers dispatching work
    Running,
    /// Draining in-flight work
    ShuttingDown,
    /// Terminal
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Configured => "configured",
            Self::Registering => "registering",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Builder for [`RuntimeHost`]
pub struct HostBuilder {
    options: ProcessOptions,
    registry: TypeRegistry,
    client: Option<Arc<dyn ClusterClient>>,
    leader_election: Option<Arc<dyn LeaderElection>>,
    metrics_registry: Option<prometheus::Registry>,
}

impl HostBuilder {
    /// Use this cluster client
    pub fn client(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Gate dispatch on this elector; ignored unless leader election is enabled
    pub fn leader_election(mut self, elector: Arc<dyn LeaderElection>) -> Self {
        self.leader_election = Some(elector);
        self
    }

    /// Registry served on `/metrics`
    pub fn metrics_registry(mut self, registry: prometheus::Registry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    /// Build the host in the `Configured` state
    pub fn build(self) -> Result<RuntimeHost, ConstructionError> {
        let client = self.client.ok_or_else(|| {
            ConstructionError::Client("no cluster client configured".to_string())
        })?;

        let leader_election = match (self.options.enable_leader_election, self.leader_election) {
            (true, Some(elector)) => Some(elector),
            (true, None) => {
                return Err(ConstructionError::LeaderElection(
                    "leader election enabled without an elector".to_string(),
                ))
            }
            (false, Some(_)) => {
                debug!("leader election disabled, ignoring configured elector");
                None
            }
            (false, None) => None,
        };

        let (state, _) = watch::channel(HostState::Uninitialized);
        let mut host = RuntimeHost {
            options: self.options,
            registry: Arc::new(self.registry),
            client,
            leader_election,
            metrics_registry: self.metrics_registry.unwrap_or_default(),
            registrations: Vec::new(),
            state,
            history: vec![HostState::Uninitialized],
        };
        host.transition(HostState::Configured);
        Ok(host)
    }
}

/// Shared runtime hosting every controller of the process
pub struct RuntimeHost {
    options: ProcessOptions,
    registry: Arc<TypeRegistry>,
    client: Arc<dyn ClusterClient>,
    leader_election: Option<Arc<dyn LeaderElection>>,
    metrics_registry: prometheus::Registry,
    registrations: Vec<ControllerRegistration>,
    state: watch::Sender<HostState>,
    history: Vec<HostState>,
}

impl RuntimeHost {
    /// Start assembling a host; the registry can no longer change once built
    pub fn builder(options: ProcessOptions, registry: TypeRegistry) -> HostBuilder {
        HostBuilder {
            options,
            registry,
            client: None,
            leader_election: None,
            metrics_registry: None,
        }
    }

    /// Connect to the cluster and build the production host
    pub async fn connect(
        options: ProcessOptions,
        registry: TypeRegistry,
        metrics_registry: prometheus::Registry,
    ) -> Result<Self, ConstructionError> {
        let client = KubeClusterClient::infer()
            .await
            .map_err(|e| ConstructionError::Client(e.to_string()))?;

        let mut builder = Self::builder(options.clone(), registry)
            .client(Arc::new(client.clone()))
            .metrics_registry(metrics_registry);

        if options.enable_leader_election {
            let namespace = lease_namespace(&options);
            let identity = lease_identity()?;
            info!(
                lease = %options.leader_election_id,
                namespace = %namespace,
                identity = %identity,
                "leader election enabled"
            );
            builder = builder.leader_election(Arc::new(LeaseLeaderElector::new(
                client.inner().clone(),
                &options.leader_election_id,
                &namespace,
                &identity,
            )));
        }

        builder.build()
    }

    /// Current lifecycle state
    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    /// Every state the host has been in, oldest first
    pub fn history(&self) -> &[HostState] {
        &self.history
    }

    /// Process options the host was built with
    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    /// Kinds known to this host
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Names of the attached controllers, in attachment order
    pub fn attached(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name()).collect()
    }

    /// Attach a controller; rejected registrations leave the host unchanged
    pub fn attach(&mut self, registration: ControllerRegistration) -> Result<(), AttachmentError> {
        let state = self.state();
        if !matches!(state, HostState::Configured | HostState::Registering) {
            return Err(AttachmentError::InvalidState {
                controller: registration.name().to_string(),
                state,
            });
        }
        if let Some(kind) = registration
            .watched_kinds()
            .find(|kind| !self.registry.contains(kind))
        {
            return Err(AttachmentError::UnregisteredKind {
                controller: registration.name().to_string(),
                kind: kind.clone(),
            });
        }
        if self.registrations.iter().any(|r| r.name() == registration.name()) {
            return Err(AttachmentError::DuplicateName(registration.name().to_string()));
        }
        if registration.max_concurrent_reconciles() == 0 {
            return Err(AttachmentError::ZeroConcurrency(registration.name().to_string()));
        }

        info!(
            controller = %registration.name(),
            kind = %registration.primary_kind(),
            concurrency = registration.max_concurrent_reconciles(),
            "controller attached"
        );
        self.registrations.push(registration);
        if state == HostState::Configured {
            self.transition(HostState::Registering);
        }
        Ok(())
    }

    /// Run every attached controller until `shutdown` fires or a fatal error
    ///
    /// Waits for leadership first when leader election is enabled. On the way
    /// out, in-flight reconciles get the graceful shutdown timeout to finish
    /// and leadership is released. The host always ends `Stopped`, and the
    /// first fatal error (if any) is returned.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), RunError> {
        let state = self.state();
        if state != HostState::Registering {
            return Err(RunError::InvalidState(state));
        }
        self.transition(HostState::Running);

        let workers_token = shutdown.child_token();
        let mut running = Running::default();
        let outcome = self.serve(&shutdown, &workers_token, &mut running).await;

        // No new reconcile may start once ShuttingDown is visible
        workers_token.cancel();
        self.transition(HostState::ShuttingDown);
        match &outcome {
            Ok(()) => info!("shutting down controllers"),
            Err(e) => error!(error = %e, "shutting down controllers after fatal error"),
        }

        let drained = running.drain(self.options.graceful_shutdown_timeout).await;

        if let Some(elector) = &self.leader_election {
            if elector.is_leader() {
                if let Err(e) = elector.release_leadership().await {
                    warn!(error = %e, "failed to release leadership");
                }
            }
            metrics::set_leader(false);
        }

        self.transition(HostState::Stopped);
        info!("controller manager stopped");
        outcome.and(drained)
    }

    async fn serve(
        &self,
        shutdown: &CancellationToken,
        workers_token: &CancellationToken,
        running: &mut Running,
    ) -> Result<(), RunError> {
        if let Some(addr) = self.options.metrics_addr.addr() {
            running.metrics = Some(
                metrics_server::serve(
                    addr,
                    self.metrics_registry.clone(),
                    self.state.subscribe(),
                    workers_token.clone(),
                )
                .await?,
            );
        }

        if let Some(elector) = &self.leader_election {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested before leadership was acquired");
                    return Ok(());
                }
                acquired = elector.acquire_leadership() => acquired?,
            }
            metrics::set_leader(true);
        }

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let ctx = Context::new(
            Arc::clone(&self.client),
            Arc::clone(&self.registry),
            workers_token.clone(),
        );
        for registration in &self.registrations {
            running.controllers.push(ControllerHandle::start(
                registration,
                ctx.clone(),
                fatal_tx.clone(),
            )?);
        }
        drop(fatal_tx);
        info!(controllers = running.controllers.len(), "controller manager running");

        let elector = self.leader_election.clone();
        let leadership_lost = async move {
            match elector {
                Some(elector) => elector.leadership_lost().await,
                None => std::future::pending().await,
            }
        };
        let mut metrics_task = running.metrics.take();
        let (result, metrics_exited) = {
            let metrics_exit = async {
                match metrics_task.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown signal received");
                    (Ok(()), false)
                }
                _ = leadership_lost => {
                    error!("leadership lost");
                    (Err(RunError::LeadershipLost), false)
                }
                Some(err) = fatal_rx.recv() => (Err(err), false),
                exit = metrics_exit => {
                    let result = match exit {
                        // The server only stops cleanly on shutdown
                        Ok(Ok(())) => {
                            info!("shutdown signal received");
                            Ok(())
                        }
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(RunError::MetricsServer {
                            addr: self.options.metrics_addr.to_string(),
                            message: e.to_string(),
                        }),
                    };
                    (result, true)
                }
            }
        };

        // A finished server task must not be awaited again while draining
        if !metrics_exited {
            running.metrics = metrics_task;
        }
        result
    }

    fn transition(&mut self, next: HostState) {
        let current = self.state();
        debug_assert!(next > current, "host state cannot move from {current} to {next}");
        debug!(from = %current, to = %next, "host state transition");
        self.history.push(next);
        self.state.send_replace(next);
    }
}

/// Tasks started by a run
#[derive(Default)]
struct Running {
    controllers: Vec<ControllerHandle>,
    metrics: Option<JoinHandle<Result<(), RunError>>>,
}

impl Running {
    async fn drain(mut self, timeout: std::time::Duration) -> Result<(), RunError> {
        let finished = tokio::time::timeout(timeout, async {
            for controller in &mut self.controllers {
                controller.join().await;
                debug!(controller = %controller.name(), "controller stopped");
            }
        })
        .await;

        if finished.is_err() {
            warn!(timeout = ?timeout, "abandoning in-flight reconciles");
            for controller in &self.controllers {
                controller.abort();
            }
            if let Some(handle) = self.metrics.take() {
                handle.abort();
            }
            return Err(RunError::DrainTimeout(timeout));
        }

        if let Some(handle) = self.metrics.take() {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("metrics server did not stop in time");
            }
        }
        Ok(())
    }
}

/// Namespace of the lease: flag, then `POD_NAMESPACE`, then the service account
fn lease_namespace(options: &ProcessOptions) -> String {
    options
        .leader_election_namespace
        .clone()
        .or_else(|| std::env::var("POD_NAMESPACE").ok().filter(|ns| !ns.is_empty()))
        .or_else(|| {
            std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
                .ok()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
        })
        .unwrap_or_else(|| FALLBACK_LEASE_NAMESPACE.to_string())
}

/// Holder identity of this replica: `POD_NAME`, then `HOSTNAME`
fn lease_identity() -> Result<String, ConstructionError> {
    ["POD_NAME", "HOSTNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .ok_or_else(|| {
            ConstructionError::LeaderElection(
                "cannot determine identity: neither POD_NAME nor HOSTNAME is set".to_string(),
            )
        })
}
