//! Type registry: the set of resource kinds this process understands
//!
//! Built once at start-up and then moved into the runtime host, which shares
//! it behind an `Arc`. There is no mutation API on a shared registry, so
//! every controller sees the same immutable set of kinds.

use std::collections::HashMap;

use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::crd::{HelmChart, HelmRelease};

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A descriptor for this kind was already registered
    #[error("kind {0} is already registered")]
    AlreadyRegistered(String),

    /// No descriptor is registered for this kind
    #[error("kind {0} is not registered")]
    NotFound(String),

    /// A record was decoded with the descriptor of another kind
    #[error("expected kind {expected}, found {found}")]
    KindMismatch {
        /// Kind of the descriptor
        expected: String,
        /// apiVersion/kind of the record
        found: String,
    },

    /// The record carries no apiVersion/kind
    #[error("record has no type metadata")]
    MissingTypeMeta,

    /// JSON conversion failed
    #[error("codec error for {kind}: {message}")]
    Codec {
        /// Kind being converted
        kind: String,
        /// Underlying serde error
        message: String,
    },
}

/// Group/version/kind triple identifying a resource kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindId {
    /// API group, empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind name
    pub kind: String,
}

impl KindId {
    /// Create a kind identifier
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Identifier of a statically typed kube resource
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(K::group(&()), K::version(&()), K::kind(&()))
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for KindId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Whether records of a kind live in a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Namespaced kind
    Namespaced,
    /// Cluster-scoped kind
    Cluster,
}

/// Schema and encoding rules of one resource kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKindDescriptor {
    id: KindId,
    plural: String,
    scope: Scope,
}

impl ResourceKindDescriptor {
    /// Describe a kind from its identifier and plural name
    pub fn new(id: KindId, plural: impl Into<String>, scope: Scope) -> Self {
        Self {
            id,
            plural: plural.into(),
            scope,
        }
    }

    /// Describe a statically typed kube resource
    pub fn for_resource<K: Resource<DynamicType = ()>>(scope: Scope) -> Self {
        Self::new(KindId::of::<K>(), K::plural(&()), scope)
    }

    /// Kind identifier
    pub fn id(&self) -> &KindId {
        &self.id
    }

    /// Plural resource name used in API paths
    pub fn plural(&self) -> &str {
        &self.plural
    }

    /// Scope of the kind
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Whether records of this kind are namespaced
    pub fn is_namespaced(&self) -> bool {
        self.scope == Scope::Namespaced
    }

    /// kube `ApiResource` for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.id.group.clone(),
            version: self.id.version.clone(),
            api_version: self.id.api_version(),
            kind: self.id.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// Decode a dynamic record into its typed form
    ///
    /// Fails when the record's apiVersion/kind is not this descriptor's.
    pub fn decode<K: DeserializeOwned>(&self, obj: &DynamicObject) -> Result<K, RegistryError> {
        let types = obj.types.as_ref().ok_or(RegistryError::MissingTypeMeta)?;
        if types.api_version != self.id.api_version() || types.kind != self.id.kind {
            return Err(RegistryError::KindMismatch {
                expected: self.id.to_string(),
                found: format!("{}, Kind={}", types.api_version, types.kind),
            });
        }
        serde_json::to_value(obj)
            .and_then(serde_json::from_value)
            .map_err(|e| self.codec_error(e))
    }

    /// Encode a typed record into a dynamic one with type metadata stamped
    pub fn encode<K: Serialize>(&self, obj: &K) -> Result<DynamicObject, RegistryError> {
        let mut value = serde_json::to_value(obj).map_err(|e| self.codec_error(e))?;
        let map = value.as_object_mut().ok_or_else(|| RegistryError::Codec {
            kind: self.id.to_string(),
            message: "record is not a JSON object".to_string(),
        })?;
        map.insert("apiVersion".to_string(), self.id.api_version().into());
        map.insert("kind".to_string(), self.id.kind.clone().into());
        serde_json::from_value(value).map_err(|e| self.codec_error(e))
    }

    fn codec_error(&self, e: serde_json::Error) -> RegistryError {
        RegistryError::Codec {
            kind: self.id.to_string(),
            message: e.to_string(),
        }
    }
}

/// Mapping from kind identifier to descriptor
#[derive(Debug, Default)]
pub struct TypeRegistry {
    entries: HashMap<KindId, ResourceKindDescriptor>,
}

impl TypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind; each kind may be registered once
    pub fn register(&mut self, descriptor: ResourceKindDescriptor) -> Result<(), RegistryError> {
        if self.entries.contains_key(descriptor.id()) {
            return Err(RegistryError::AlreadyRegistered(descriptor.id().to_string()));
        }
        debug!(kind = %descriptor.id(), "registered resource kind");
        self.entries.insert(descriptor.id().clone(), descriptor);
        Ok(())
    }

    /// Descriptor of a registered kind
    pub fn lookup(&self, id: &KindId) -> Result<&ResourceKindDescriptor, RegistryError> {
        self.entries
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Whether a kind is registered
    pub fn contains(&self, id: &KindId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no kind is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered kind identifiers, in no particular order
    pub fn kinds(&self) -> impl Iterator<Item = &KindId> {
        self.entries.keys()
    }
}

/// Registry with every kind the helm controller works with: the core kinds
/// used for coordination and values, HelmChart and HelmRelease
pub fn default_registry() -> Result<TypeRegistry, RegistryError> {
    let mut registry = TypeRegistry::new();
    registry.register(ResourceKindDescriptor::for_resource::<Lease>(Scope::Namespaced))?;
    registry.register(ResourceKindDescriptor::for_resource::<ConfigMap>(Scope::Namespaced))?;
    registry.register(ResourceKindDescriptor::for_resource::<Secret>(Scope::Namespaced))?;
    registry.register(ResourceKindDescriptor::for_resource::<HelmChart>(Scope::Namespaced))?;
    registry.register(ResourceKindDescriptor::for_resource::<HelmRelease>(Scope::Namespaced))?;
    Ok(registry)
}
