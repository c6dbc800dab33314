//! Leader election using Kubernetes Leases
//!
//! Only the replica holding the lease dispatches reconcile work. The runtime
//! host consumes leadership through the [`LeaderElection`] trait;
//! [`LeaseLeaderElector`] implements it over the coordination.k8s.io/v1 Lease API.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we retry.
//! This prevents race conditions where two replicas both think they acquired
//! leadership.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::FIELD_MANAGER;

/// Default lease name, shared by every replica of the controller
pub const DEFAULT_LEASE_NAME: &str = "5b6ca942.fluxcd.io";

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease object is malformed
    #[error("invalid lease {name}: {message}")]
    InvalidLease {
        /// Lease name
        name: String,
        /// What is wrong with it
        message: String,
    },
}

/// Fleet-wide mutual exclusion consumed by the runtime host
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Block until this replica holds leadership
    async fn acquire_leadership(&self) -> Result<(), LeaderElectionError>;

    /// Give up leadership so another replica can take over immediately
    async fn release_leadership(&self) -> Result<(), LeaderElectionError>;

    /// Whether this replica currently holds leadership
    fn is_leader(&self) -> bool;

    /// Resolves once leadership acquired earlier is lost
    async fn leadership_lost(&self);
}

/// Leader elector using Kubernetes Leases
pub struct LeaseLeaderElector {
    state: Arc<LeaseState>,
    renewal_task: Mutex<Option<JoinHandle<()>>>,
}

struct LeaseState {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    leader: watch::Sender<bool>,
}

impl LeaseLeaderElector {
    /// Create a new leader elector with default timing (15s lease, 10s renew deadline, 2s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        let (leader, _) = watch::channel(false);
        Self {
            state: Arc::new(LeaseState {
                client,
                lease_name: lease_name.to_string(),
                namespace: namespace.to_string(),
                identity: identity.to_string(),
                lease_duration: LEASE_DURATION,
                renew_deadline: RENEW_DEADLINE,
                retry_period: RETRY_PERIOD,
                leader,
            }),
            renewal_task: Mutex::new(None),
        }
    }

    /// Identity this replica writes into the lease
    pub fn identity(&self) -> &str {
        &self.state.identity
    }
}

#[async_trait]
impl LeaderElection for LeaseLeaderElector {
    async fn acquire_leadership(&self) -> Result<(), LeaderElectionError> {
        let state = &self.state;
        info!(
            identity = %state.identity,
            lease = %state.lease_name,
            namespace = %state.namespace,
            "Waiting for leadership..."
        );

        loop {
            match state.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => {
                    debug!(
                        identity = %state.identity,
                        retry_secs = state.retry_period.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    // Transient errors shouldn't stop us
                    warn!(
                        identity = %state.identity,
                        error = %e,
                        retry_secs = state.retry_period.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(state.retry_period).await;
        }

        info!(identity = %state.identity, "Leadership acquired");
        state.leader.send_replace(true);

        let renewing = Arc::clone(&self.state);
        let handle = tokio::spawn(async move { renewing.renewal_loop().await });
        if let Some(previous) = self.renewal_task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        if let Some(handle) = self.renewal_task.lock().await.take() {
            handle.abort();
        }
        self.state.leader.send_replace(false);
        self.state.release_lease().await
    }

    fn is_leader(&self) -> bool {
        *self.state.leader.borrow()
    }

    async fn leadership_lost(&self) {
        let mut rx = self.state.leader.subscribe();
        let _ = rx.wait_for(|held| !*held).await;
    }
}

impl Drop for LeaseLeaderElector {
    fn drop(&mut self) {
        if let Ok(mut task) = self.renewal_task.try_lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl LeaseState {
    /// Try to acquire or renew the lease atomically
    ///
    /// Uses resourceVersion for compare-and-swap semantics:
    /// - Read lease and its resourceVersion
    /// - Decide if we can acquire/renew
    /// - Update with resourceVersion - fails if lease changed since read
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return self.create_lease(&api, now).await;
        };

        let resource_version = lease.metadata.resource_version.clone().ok_or_else(|| {
            LeaderElectionError::InvalidLease {
                name: self.lease_name.clone(),
                message: "missing resourceVersion".to_string(),
            }
        })?;

        match decide(lease.spec.as_ref(), now, &self.identity) {
            LeaseDecision::Renew => {
                self.write_lease(&api, &lease, resource_version, now, false)
                    .await
            }
            LeaseDecision::TakeOver => {
                self.write_lease(&api, &lease, resource_version, now, true)
                    .await
            }
            LeaseDecision::Wait => Ok(false),
        }
    }

    /// Create a new lease (first leader)
    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew our lease or take over an expired one, guarded by resourceVersion
    async fn write_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        resource_version: String,
        now: chrono::DateTime<Utc>,
        take_over: bool,
    ) -> Result<bool, LeaderElectionError> {
        let mut updated = existing.clone();
        updated.metadata.resource_version = Some(resource_version);
        let spec = updated.spec.get_or_insert_with(LeaseSpec::default);
        spec.renew_time = Some(MicroTime(now));
        if take_over {
            spec.holder_identity = Some(self.identity.clone());
            spec.lease_duration_seconds = Some(self.lease_duration.as_secs() as i32);
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }

        match api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                if take_over {
                    info!(identity = %self.identity, "Took over expired lease");
                } else {
                    debug!(identity = %self.identity, "Lease renewed");
                }
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, take_over, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renewal loop that runs while we hold leadership
    ///
    /// Another holder winning the lease ends leadership immediately; API
    /// errors end it once no renewal succeeded within the renew deadline.
    async fn renewal_loop(&self) {
        let mut last_renewal = Instant::now();
        loop {
            tokio::time::sleep(self.retry_period).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken by another holder");
                    break;
                }
                Err(e) if last_renewal.elapsed() < self.renew_deadline => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Renew deadline exceeded");
                    break;
                }
            }
        }
        warn!(identity = %self.identity, "Leadership lost");
        self.leader.send_replace(false);
    }

    /// Release the lease by clearing the holder identity
    ///
    /// This allows another replica to immediately acquire leadership instead of
    /// waiting for the lease to expire.
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let (params, patch) = release_patch(Utc::now());
        api.patch(&self.lease_name, &params, &Patch::Merge(&patch))
            .await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// What a replica may do with the lease it just read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseDecision {
    /// We are the holder
    Renew,
    /// Nobody holds a live lease
    TakeOver,
    /// Another replica holds a live lease
    Wait,
}

fn decide(spec: Option<&LeaseSpec>, now: DateTime<Utc>, identity: &str) -> LeaseDecision {
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty());
    if holder == Some(identity) {
        return LeaseDecision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration_secs) {
        (None, _, _) => true,
        (Some(_), Some(rt), Some(duration)) => {
            now > rt.0 + chrono::Duration::seconds(i64::from(duration))
        }
        // A holder without renew time or duration cannot prove it is alive
        _ => true,
    };
    if expired {
        LeaseDecision::TakeOver
    } else {
        LeaseDecision::Wait
    }
}

/// Merge patch that clears the holder and backdates the renew time so the
/// lease is immediately acquirable
fn release_patch(now: DateTime<Utc>) -> (PatchParams, serde_json::Value) {
    let past = now - chrono::Duration::seconds(60);
    let patch = json!({
        "spec": {
            "holderIdentity": null,
            "renewTime": past.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
        }
    });
    // force is only valid for server-side apply
    let mut params = PatchParams::default();
    params.field_manager = Some(FIELD_MANAGER.to_string());
    (params, patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_elector_reports_leadership() {
        let mut elector = MockLeaderElection::new();
        elector
            .expect_acquire_leadership()
            .times(1)
            .returning(|| Ok(()));
        elector.expect_is_leader().return_const(true);

        elector.acquire_leadership().await.unwrap();
        assert!(elector.is_leader());
    }

    #[test]
    fn lease_timings_follow_client_go_ordering() {
        assert!(LEASE_DURATION > RENEW_DEADLINE);
        assert!(RENEW_DEADLINE > RETRY_PERIOD);
    }

    fn spec(holder: Option<&str>, renewed_secs_ago: Option<i64>) -> LeaseSpec {
        let now = now();
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(15),
            renew_time: renewed_secs_ago.map(|ago| MicroTime(now - chrono::Duration::seconds(ago))),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn own_lease_is_renewed() {
        let lease = spec(Some("replica-a"), Some(5));
        assert_eq!(decide(Some(&lease), now(), "replica-a"), LeaseDecision::Renew);

        // Even past its duration, our own lease is renewed rather than taken over
        let stale = spec(Some("replica-a"), Some(60));
        assert_eq!(decide(Some(&stale), now(), "replica-a"), LeaseDecision::Renew);
    }

    #[test]
    fn live_foreign_lease_is_left_alone() {
        let lease = spec(Some("replica-b"), Some(5));
        assert_eq!(decide(Some(&lease), now(), "replica-a"), LeaseDecision::Wait);

        let at_the_edge = spec(Some("replica-b"), Some(15));
        assert_eq!(decide(Some(&at_the_edge), now(), "replica-a"), LeaseDecision::Wait);
    }

    #[test]
    fn expired_foreign_lease_is_taken_over() {
        let lease = spec(Some("replica-b"), Some(16));
        assert_eq!(decide(Some(&lease), now(), "replica-a"), LeaseDecision::TakeOver);
    }

    #[test]
    fn missing_renew_time_or_holder_is_taken_over() {
        let never_renewed = spec(Some("replica-b"), None);
        assert_eq!(
            decide(Some(&never_renewed), now(), "replica-a"),
            LeaseDecision::TakeOver
        );

        let released = spec(None, Some(60));
        assert_eq!(decide(Some(&released), now(), "replica-a"), LeaseDecision::TakeOver);

        let cleared = spec(Some(""), Some(1));
        assert_eq!(decide(Some(&cleared), now(), "replica-a"), LeaseDecision::TakeOver);

        assert_eq!(decide(None, now(), "replica-a"), LeaseDecision::TakeOver);
    }

    #[test]
    fn release_is_a_plain_merge_patch() {
        let (params, patch) = release_patch(now());
        assert!(!params.force, "force is rejected for merge patches");
        assert_eq!(params.field_manager.as_deref(), Some(FIELD_MANAGER));
        assert!(patch["spec"]["holderIdentity"].is_null());

        let renew = DateTime::parse_from_rfc3339(patch["spec"]["renewTime"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        assert!(renew < now());

        let mut released = spec(Some("replica-a"), Some(0));
        released.holder_identity = None;
        released.renew_time = Some(MicroTime(renew));
        assert_eq!(decide(Some(&released), now(), "replica-b"), LeaseDecision::TakeOver);
    }
}
