//! Common types for the helm controller: resource kinds, the type registry,
//! the cluster client and leader election capabilities, errors and telemetry

#![warn(missing_docs)]

pub mod client;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod metrics;
pub mod telemetry;
pub mod type_registry;

pub use client::{ClusterClient, KubeClusterClient, ObjectKey, WatchEvent};
pub use error::Error;
pub use leader_election::{LeaderElection, LeaderElectionError, LeaseLeaderElector};
pub use type_registry::{
    default_registry, KindId, RegistryError, ResourceKindDescriptor, Scope, TypeRegistry,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side write made by this process
pub const FIELD_MANAGER: &str = "helm-controller";

/// Annotation that requests an out-of-band reconcile of a resource
pub const RECONCILE_AT_ANNOTATION: &str = "fluxcd.io/reconcileAt";
