//! Helm controller manager
//!
//! Hosts the HelmChart watcher and the dependency-aware HelmRelease
//! reconciler on one shared runtime: a single cluster client, one type
//! registry, optional leader election and a metrics endpoint.

pub mod config;
pub mod controller;
pub mod error;
pub mod host;
mod metrics_server;
pub mod signals;

pub use config::{MetricsBindAddress, ProcessOptions};
pub use controller::{
    Action, Context, ControllerRegistration, HelmChartWatcher, HelmReleaseReconciler,
    HelmReleaseReconcilerOptions, Reconciler, SetupWithHost,
};
pub use error::{AttachmentError, ConstructionError, RunError, ValidationError};
pub use host::{HostState, RuntimeHost};
