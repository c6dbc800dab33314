//! Fatal error taxonomy of the controller manager
//!
//! Every error here aborts the process: construction and attachment errors
//! before the host runs, [`RunError`] once it does. Reconcile-level failures
//! are [`helm_common::Error`] and never surface through these types.

use std::time::Duration;

use helm_common::{KindId, LeaderElectionError};
use thiserror::Error;

use crate::host::HostState;

/// Invalid start-up parameters
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Command line could not be parsed, or help/version was requested
    #[error(transparent)]
    Arguments(#[from] clap::Error),

    /// A flag parsed but its value is not acceptable
    #[error("invalid value for --{flag}: {message}")]
    Invalid {
        /// Flag name without dashes
        flag: &'static str,
        /// What is wrong with the value
        message: String,
    },
}

impl ValidationError {
    /// Whether this is a `--help`/`--version` request rather than an error
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            Self::Arguments(e) if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            )
        )
    }

    /// Print the message the way clap would and exit the process
    ///
    /// Help and version exit 0; every real validation failure exits non-zero.
    pub fn exit(&self) -> ! {
        match self {
            Self::Arguments(e) => e.exit(),
            Self::Invalid { .. } => {
                eprintln!("error: {self}");
                std::process::exit(2)
            }
        }
    }
}

/// Failure to build the shared runtime
#[derive(Debug, Error)]
pub enum ConstructionError {
    /// Connection to the control plane could not be established
    #[error("unable to build cluster client: {0}")]
    Client(String),

    /// Leader election was requested but cannot be initialized
    #[error("unable to initialize leader election: {0}")]
    LeaderElection(String),
}

/// Failure to attach a controller registration to the host
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachmentError {
    /// The registration watches a kind missing from the type registry
    #[error("controller {controller} watches unregistered kind {kind}")]
    UnregisteredKind {
        /// Registration name
        controller: String,
        /// The unknown kind
        kind: KindId,
    },

    /// A registration with this name is already attached
    #[error("controller {0} is already attached")]
    DuplicateName(String),

    /// The host no longer accepts registrations
    #[error("controller {controller} cannot be attached while the host is {state}")]
    InvalidState {
        /// Registration name
        controller: String,
        /// Host state at the time of the call
        state: HostState,
    },

    /// The registration allows no concurrent reconciles at all
    #[error("controller {0} must allow at least one concurrent reconcile")]
    ZeroConcurrency(String),
}

/// Failure while the host is running
#[derive(Debug, Error)]
pub enum RunError {
    /// `run` was called in a state other than `Registering`
    #[error("host cannot run while {0}")]
    InvalidState(HostState),

    /// Leadership could not be acquired
    #[error("leader election failed: {0}")]
    LeaderElection(#[from] LeaderElectionError),

    /// Leadership was lost while running
    #[error("leader election lost")]
    LeadershipLost,

    /// A watch stream ended while the host was running
    #[error("watch of {kind} for controller {controller} ended unexpectedly")]
    WatchEnded {
        /// Registration owning the watch
        controller: String,
        /// Watched kind
        kind: KindId,
    },

    /// A controller could not be built from its registration
    #[error("controller {controller} could not start: {message}")]
    ControllerStart {
        /// Registration name
        controller: String,
        /// What went wrong
        message: String,
    },

    /// The metrics endpoint could not be served
    #[error("metrics endpoint failed on {addr}: {message}")]
    MetricsServer {
        /// Bind address
        addr: String,
        /// Underlying I/O error
        message: String,
    },

    /// In-flight reconciles did not finish within the shutdown timeout
    #[error("in-flight reconciles did not finish within {0:?}")]
    DrainTimeout(Duration),
}
