//! Error types for reconcile-level operations
//!
//! These errors never cross the controller boundary as fatal: the runtime logs
//! them and requeues the resource according to [`Error::is_retryable`].

use thiserror::Error;

use crate::type_registry::RegistryError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for reconcile operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cluster client error raised by a non-kube client implementation
    #[error("client error for {resource}: {message}")]
    Client {
        /// Resource being accessed (`namespace/name` or kind)
        resource: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Validation error for resource specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource with the invalid spec
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Type registry lookup or decode failure
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "watcher", "applier")
        context: String,
    },
}

impl Error {
    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable client error
    pub fn client(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Client {
            resource: resource.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a client error that will not succeed on retry
    pub fn client_permanent(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Client {
            resource: resource.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Whether requeueing with backoff can make this error go away
    ///
    /// Spec and decode problems need a change to the resource itself, so they
    /// wait for the next watch event instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { source } => match source {
                kube::Error::Api(ae) => !matches!(ae.code, 400 | 403 | 422),
                _ => true,
            },
            Self::Client { retryable, .. } => *retryable,
            Self::Validation { .. } | Self::Serialization { .. } | Self::Registry(_) => false,
            Self::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
