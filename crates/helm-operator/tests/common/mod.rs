//! Shared fixtures for host integration tests
//!
//! [`InMemoryClient`] stands in for the API server: records live in a map,
//! every write is broadcast to watchers and status writes are logged with
//! the (paused) tokio clock so tests can check timing.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use helm_common::crd::{
    Artifact, Condition, ConditionStatus, CrossNamespaceObjectReference, HelmChart, HelmChartSpec,
    HelmChartStatus, HelmChartTemplate, HelmRelease, HelmReleaseSpec, HelmReleaseStatus,
    LocalObjectReference,
};
use helm_common::{
    ClusterClient, Error, KindId, LeaderElection, LeaderElectionError, ObjectKey,
    ResourceKindDescriptor, Scope, TypeRegistry, WatchEvent,
};
use helm_operator::{MetricsBindAddress, ProcessOptions};
use kube::api::DynamicObject;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A status write observed by the in-memory client
#[derive(Debug, Clone)]
pub struct StatusWrite {
    pub key: ObjectKey,
    pub status: serde_json::Value,
    pub at: Instant,
}

/// In-memory control plane
pub struct InMemoryClient {
    objects: Mutex<BTreeMap<(KindId, ObjectKey), DynamicObject>>,
    events: broadcast::Sender<(KindId, WatchEvent)>,
    status_writes: Mutex<Vec<StatusWrite>>,
    end_watches: CancellationToken,
}

impl InMemoryClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            events,
            status_writes: Mutex::new(Vec::new()),
            end_watches: CancellationToken::new(),
        })
    }

    /// Create or replace a record, bumping its generation
    pub fn apply(&self, kind: &ResourceKindDescriptor, mut obj: DynamicObject) {
        let key = ObjectKey::from_object(&obj).expect("record has a name");
        let mut objects = self.objects.lock().unwrap();
        let generation = objects
            .get(&(kind.id().clone(), key.clone()))
            .and_then(|o| o.metadata.generation)
            .unwrap_or(0);
        obj.metadata.generation = Some(generation + 1);
        objects.insert((kind.id().clone(), key), obj.clone());
        drop(objects);
        let _ = self.events.send((kind.id().clone(), WatchEvent::Applied(obj)));
    }

    /// Replace a record's status without touching its generation
    pub fn set_status(&self, kind: &ResourceKindDescriptor, key: &ObjectKey, status: serde_json::Value) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&(kind.id().clone(), key.clone()))
            .expect("record exists");
        obj.data["status"] = status;
        let obj = obj.clone();
        drop(objects);
        let _ = self.events.send((kind.id().clone(), WatchEvent::Applied(obj)));
    }

    pub fn object(&self, kind: &ResourceKindDescriptor, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind.id().clone(), key.clone()))
            .cloned()
    }

    pub fn status_writes(&self, key: &ObjectKey) -> Vec<StatusWrite> {
        self.status_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|w| &w.key == key)
            .cloned()
            .collect()
    }

    /// Make every open watch stream end
    pub fn end_watches(&self) {
        self.end_watches.cancel();
    }
}

#[async_trait]
impl ClusterClient for InMemoryClient {
    async fn get(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
    ) -> helm_common::Result<Option<DynamicObject>> {
        Ok(self.object(kind, key))
    }

    async fn list(
        &self,
        kind: &ResourceKindDescriptor,
        namespace: Option<String>,
    ) -> helm_common::Result<Vec<DynamicObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((id, key), _)| {
                id == kind.id() && (namespace.is_none() || key.namespace == namespace)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    fn watch(&self, kind: &ResourceKindDescriptor) -> BoxStream<'static, helm_common::Result<WatchEvent>> {
        let rx = self.events.subscribe();
        let kind_id = kind.id().clone();
        let initial: Vec<helm_common::Result<WatchEvent>> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((id, _), _)| id == &kind_id)
            .map(|(_, obj)| Ok(WatchEvent::Applied(obj.clone())))
            .collect();
        let ended = self.end_watches.clone();

        let live = stream::unfold((rx, kind_id, ended), |(mut rx, kind_id, ended)| async move {
            loop {
                let received = tokio::select! {
                    _ = ended.cancelled() => return None,
                    received = rx.recv() => received,
                };
                match received {
                    Ok((id, event)) if id == kind_id => {
                        return Some((Ok(event), (rx, kind_id, ended)));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(initial).chain(live).boxed()
    }

    async fn patch_annotations(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
        annotations: BTreeMap<String, String>,
    ) -> helm_common::Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let Some(obj) = objects.get_mut(&(kind.id().clone(), key.clone())) else {
            return Err(Error::client_permanent(key.to_string(), "not found"));
        };
        obj.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);
        let obj = obj.clone();
        drop(objects);
        let _ = self.events.send((kind.id().clone(), WatchEvent::Applied(obj)));
        Ok(())
    }

    async fn patch_status(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> helm_common::Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let Some(obj) = objects.get_mut(&(kind.id().clone(), key.clone())) else {
            return Err(Error::client_permanent(key.to_string(), "not found"));
        };
        if !obj.data["status"].is_object() {
            obj.data["status"] = serde_json::json!({});
        }
        if let (Some(current), Some(patch)) = (obj.data["status"].as_object_mut(), status.as_object()) {
            for (field, value) in patch {
                current.insert(field.clone(), value.clone());
            }
        }
        let obj = obj.clone();
        drop(objects);

        self.status_writes.lock().unwrap().push(StatusWrite {
            key: key.clone(),
            status,
            at: Instant::now(),
        });
        let _ = self.events.send((kind.id().clone(), WatchEvent::Applied(obj)));
        Ok(())
    }
}

/// Leader elector driven by the test
pub struct ScriptedLeaderElection {
    leader: watch::Sender<bool>,
    granted: watch::Sender<bool>,
    released: Mutex<bool>,
}

impl ScriptedLeaderElection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            leader: watch::channel(false).0,
            granted: watch::channel(false).0,
            released: Mutex::new(false),
        })
    }

    /// Let the pending acquisition succeed
    pub fn grant(&self) {
        self.granted.send_replace(true);
    }

    /// Take leadership away
    pub fn revoke(&self) {
        self.leader.send_replace(false);
    }

    pub fn released(&self) -> bool {
        *self.released.lock().unwrap()
    }
}

#[async_trait]
impl LeaderElection for ScriptedLeaderElection {
    async fn acquire_leadership(&self) -> Result<(), LeaderElectionError> {
        let mut granted = self.granted.subscribe();
        let _ = granted.wait_for(|g| *g).await;
        self.leader.send_replace(true);
        Ok(())
    }

    async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        *self.released.lock().unwrap() = true;
        self.leader.send_replace(false);
        Ok(())
    }

    fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    async fn leadership_lost(&self) {
        let mut leader = self.leader.subscribe();
        let _ = leader.wait_for(|held| !*held).await;
    }
}

/// Options with metrics disabled so tests never bind ports
pub fn options() -> ProcessOptions {
    ProcessOptions {
        metrics_addr: MetricsBindAddress::Disabled,
        graceful_shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn widget_kind() -> ResourceKindDescriptor {
    ResourceKindDescriptor::new(KindId::new("example.io", "v1", "Widget"), "widgets", Scope::Namespaced)
}

pub fn widget_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry.register(widget_kind()).unwrap();
    registry
}

pub fn widget(name: &str) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &widget_kind().api_resource()).within("default");
    obj.data = serde_json::json!({ "spec": { "size": 1 } });
    obj
}

pub fn release_kind() -> ResourceKindDescriptor {
    ResourceKindDescriptor::for_resource::<HelmRelease>(Scope::Namespaced)
}

pub fn chart_kind() -> ResourceKindDescriptor {
    ResourceKindDescriptor::for_resource::<HelmChart>(Scope::Namespaced)
}

pub fn release(namespace: &str, name: &str, depends_on: &[&str]) -> DynamicObject {
    let mut hr = HelmRelease::new(
        name,
        HelmReleaseSpec {
            chart: HelmChartTemplate {
                name: "podinfo".to_string(),
                version: None,
                source_ref: CrossNamespaceObjectReference {
                    kind: "HelmRepository".to_string(),
                    name: "podinfo".to_string(),
                    namespace: None,
                },
            },
            interval: Some("5m".to_string()),
            suspend: false,
            release_name: None,
            target_namespace: None,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            values: None,
        },
    );
    hr.metadata.namespace = Some(namespace.to_string());
    release_kind().encode(&hr).unwrap()
}

pub fn chart(namespace: &str, name: &str, revision: &str) -> DynamicObject {
    let mut chart = HelmChart::new(
        name,
        HelmChartSpec {
            name: "podinfo".to_string(),
            version: None,
            helm_repository_ref: LocalObjectReference {
                name: "podinfo".to_string(),
            },
            interval: "1m".to_string(),
        },
    );
    chart.metadata.namespace = Some(namespace.to_string());
    chart.status = Some(HelmChartStatus {
        artifact: Some(Artifact {
            path: format!("helmchart/{namespace}/{name}.tgz"),
            url: format!("http://source-controller/{namespace}/{name}.tgz"),
            revision: revision.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    chart_kind().encode(&chart).unwrap()
}

/// Ready status for the given generation
pub fn ready_status(generation: i64) -> serde_json::Value {
    serde_json::to_value(HelmReleaseStatus {
        observed_generation: Some(generation),
        conditions: vec![Condition::ready(ConditionStatus::True, "ReconciliationSucceeded", "ok")],
        ..Default::default()
    })
    .unwrap()
}

pub fn decode_release(obj: &DynamicObject) -> HelmRelease {
    release_kind().decode(obj).unwrap()
}

/// Poll `condition` on the tokio clock until it holds
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..6_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}
