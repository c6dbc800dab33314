//! Cluster client capability
//!
//! Controllers reach the control plane only through [`ClusterClient`], so the
//! runtime and the reconcilers can be exercised against an in-memory store.
//! [`KubeClusterClient`] is the production implementation over `kube::Client`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use serde_json::json;

use crate::type_registry::ResourceKindDescriptor;
use crate::{Error, Result, FIELD_MANAGER};

/// Connection timeout for the API server
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for API requests; watches are closed server-side before this
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Server-side watch timeout, kept below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Namespace/name of a resource record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped records
    pub namespace: Option<String>,
    /// Record name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced record
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped record
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of a dynamic record, `None` if it has no name
    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.clone()?;
        Some(Self {
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Change observed on a watched kind
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Record was created or modified (or listed on watch start)
    Applied(DynamicObject),
    /// Record was deleted
    Deleted(DynamicObject),
}

impl WatchEvent {
    /// The record carried by the event
    pub fn object(&self) -> &DynamicObject {
        match self {
            Self::Applied(obj) | Self::Deleted(obj) => obj,
        }
    }
}

/// Access to resource records in the control plane
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a record, `None` if it does not exist
    async fn get(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>>;

    /// List records of a kind, optionally within one namespace
    async fn list(
        &self,
        kind: &ResourceKindDescriptor,
        namespace: Option<String>,
    ) -> Result<Vec<DynamicObject>>;

    /// Stream of changes to every record of a kind
    ///
    /// The stream starts with an `Applied` event per existing record and
    /// recovers from transient errors on its own; it only ends when the
    /// client can no longer watch the kind.
    fn watch(&self, kind: &ResourceKindDescriptor) -> BoxStream<'static, Result<WatchEvent>>;

    /// Merge the given annotations into a record's metadata
    async fn patch_annotations(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Merge the given JSON into a record's status subresource
    async fn patch_status(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<()>;
}

/// Production client over `kube::Client`
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    /// Wrap an existing client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster or kubeconfig configuration
    pub async fn infer() -> std::result::Result<Self, kube::Error> {
        let mut config = kube::Config::infer()
            .await
            .map_err(kube::Error::InferConfig)?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
        Ok(Self::new(kube::Client::try_from(config)?))
    }

    /// Underlying kube client
    pub fn inner(&self) -> &kube::Client {
        &self.client
    }

    fn api(&self, kind: &ResourceKindDescriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>> {
        let api = self.api(kind, key.namespace.as_deref());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        kind: &ResourceKindDescriptor,
        namespace: Option<String>,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.api(kind, namespace.as_deref());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    fn watch(&self, kind: &ResourceKindDescriptor) -> BoxStream<'static, Result<WatchEvent>> {
        let api = self.api(kind, None);
        let kind_name = kind.id().to_string();
        watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
            .default_backoff()
            .filter_map(move |event| {
                let item = match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::Applied(obj)))
                    }
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(Error::client(kind_name.clone(), e.to_string()))),
                };
                futures::future::ready(item)
            })
            .boxed()
    }

    async fn patch_annotations(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api = self.api(kind, key.namespace.as_deref());
        let patch = json!({ "metadata": { "annotations": annotations } });
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        kind: &ResourceKindDescriptor,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<()> {
        let api = self.api(kind, key.namespace.as_deref());
        let patch = json!({ "status": status });
        api.patch_status(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}
