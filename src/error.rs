//! Error types for the KernelManager operator
//!
//! Errors are structured with fields to aid debugging in production. The
//! reconciler is the only place that turns an error into policy; every other
//! layer just reports what went wrong via [`Error::class`].

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Coarse error taxonomy used by the reconciler to pick a retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed spec or template; recorded as a terminal condition
    Validation,
    /// Store unavailable, conflict, timeout; retried with backoff
    Transient,
    /// The object vanished; treated as a state transition
    Gone,
    /// The platform rejected the rendered workload outright
    UnrecoverableCreate,
}

/// Main error type for KernelManager operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error not otherwise classified
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for the template or connection config
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the KernelManager with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.connectionConfig.shellPort")
        field: Option<String>,
    },

    /// Optimistic concurrency conflict (stale resourceVersion or AlreadyExists)
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Object the write targeted
        resource: String,
        /// Server message
        message: String,
    },

    /// The object disappeared between observation and action
    #[error("{kind} {name} is gone")]
    Gone {
        /// Kind of the missing object
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// The platform refused to create the rendered workload
    #[error("workload {resource} rejected by the platform: {message}")]
    UnrecoverableCreate {
        /// Name of the rejected workload
        resource: String,
        /// Rejection message from the API server
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "store")
        context: String,
    },
}

impl Error {
    /// Create a validation error without field context
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a "gone" error for an object that vanished
    pub fn gone(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Gone {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an unrecoverable create error
    pub fn unrecoverable_create(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UnrecoverableCreate {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube-rs error returned while operating on `kind`/`name`.
    ///
    /// 404 becomes [`Error::Gone`] and 409 becomes [`Error::Conflict`]; every
    /// other API or transport failure stays a transient [`Error::Kube`].
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Self::gone(kind, name),
            kube::Error::Api(ae) if ae.code == 409 => {
                Self::conflict(format!("{kind}/{name}"), ae.message.clone())
            }
            _ => Self::Kube { source: err },
        }
    }

    /// Taxonomy bucket for this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation { .. } => ErrorClass::Validation,
            Error::Gone { .. } => ErrorClass::Gone,
            Error::UnrecoverableCreate { .. } => ErrorClass::UnrecoverableCreate,
            Error::Kube { .. }
            | Error::Conflict { .. }
            | Error::Serialization { .. }
            | Error::Internal { .. } => ErrorClass::Transient,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and unrecoverable create errors require a spec change.
    /// Serialization errors point at a code bug and are not retried either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
                    && ae.code != 409
                    && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::Gone { .. } => true,
            Error::UnrecoverableCreate { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for optimistic concurrency conflicts, which requeue immediately
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Field path for validation errors
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Human-readable message without the variant prefix
    pub fn message(&self) -> String {
        match self {
            Error::Validation { message, .. }
            | Error::Conflict { message, .. }
            | Error::UnrecoverableCreate { message, .. }
            | Error::Serialization { message }
            | Error::Internal { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
