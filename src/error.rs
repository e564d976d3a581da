//! Error types for the CertMerge operator
//!
//! Per-source problems (missing Secret, wrong type, empty selector) never
//! become an `Error`: the reconciler absorbs them and logs. Everything here is
//! a pass-level failure that the controller's error policy retries.

use std::time::Duration;

use thiserror::Error;

/// Main error type for CertMerge operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The CertMerge spec cannot produce an output Secret
    #[error("validation error for {certmerge}: {message}")]
    Validation {
        /// `namespace/name` of the offending CertMerge
        certmerge: String,
        /// Description of what's invalid
        message: String,
    },

    /// An owner reference could not be attached to the output Secret
    #[error("ownership error for {certmerge}: {message}")]
    Ownership {
        /// `namespace/name` of the owning CertMerge
        certmerge: String,
        /// Description of what failed
        message: String,
    },

    /// An API call exceeded its deadline
    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        /// The call that was abandoned (e.g. "get secret ns1/tls-a")
        operation: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error for the given CertMerge
    pub fn validation(certmerge: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            certmerge: certmerge.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership error for the given CertMerge
    pub fn ownership(certmerge: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Ownership {
            certmerge: certmerge.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the API server rejected a write on a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Check if retrying the same pass can succeed without a spec change
    ///
    /// Validation errors need the user to fix the CertMerge. Conflicts,
    /// throttling and timeouts are transient. Other 4xx answers are treated
    /// as permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            _ if self.is_conflict() => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 429 || !(400..500).contains(&ae.code),
            Error::Kube(_) => true,
            Error::Validation { .. } => false,
            Error::Ownership { .. } => true,
            Error::Timeout { .. } => true,
            Error::Internal(_) => true,
        }
    }
}
