//! Error taxonomy shared by drivers, patterns, and the launcher.
//!
//! Drivers convert backend-specific failures into this taxonomy at the
//! adapter boundary; everything above the adapters translates errors without
//! masking the class. All library operations return [`Result<T>`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for Prism operations
pub type Result<T> = std::result::Result<T, PrismError>;

/// Error classes carried on the wire and across crate boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed config or request; never retried
    Validation,
    /// Unknown process, identity, or key
    NotFound,
    /// Already running, already initialized, duplicate with different shape
    Conflict,
    /// Resource cap, too many identities, pool exhausted
    CapacityExhausted,
    /// Backend blip or timeout under threshold; retried up to policy bound
    Transient,
    /// Driver in unrecoverable state, repeated crash
    Fatal,
    /// Some targets succeeded and some failed
    Partial,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CapacityExhausted => "capacity-exhausted",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Error type for Prism operations
#[derive(Error, Debug, Clone)]
pub enum PrismError {
    /// Malformed config or request; surfaced to the caller, never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown process, identity, or key
    #[error("not found: {0}")]
    NotFound(String),

    /// Already running, already initialized, duplicate registration
    #[error("conflict: {0}")]
    Conflict(String),

    /// Resource cap reached; `retry_after` hints when to try again
    #[error("capacity exhausted: {reason}")]
    CapacityExhausted {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Backend connection blip or timeout under threshold
    #[error("transient failure: {0}")]
    Transient(String),

    /// Driver in an unrecoverable state
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// Batch where some targets succeeded and some failed
    #[error("partial failure: {succeeded} succeeded, {failed} failed")]
    Partial {
        succeeded: usize,
        failed: usize,
        reasons: Vec<String>,
    },
}

impl PrismError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn exhausted(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::CapacityExhausted {
            reason: reason.into(),
            retry_after,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Timeout surfaced as a transient failure
    pub fn timeout(what: impl std::fmt::Display) -> Self {
        Self::Transient(format!("deadline exceeded: {what}"))
    }

    /// Cancellation surfaced as a transient failure
    pub fn cancelled(what: impl std::fmt::Display) -> Self {
        Self::Transient(format!("cancelled: {what}"))
    }

    /// The taxonomy class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrismError::Validation(_) => ErrorKind::Validation,
            PrismError::NotFound(_) => ErrorKind::NotFound,
            PrismError::Conflict(_) => ErrorKind::Conflict,
            PrismError::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            PrismError::Transient(_) => ErrorKind::Transient,
            PrismError::Fatal(_) => ErrorKind::Fatal,
            PrismError::Partial { .. } => ErrorKind::Partial,
        }
    }

    /// Retry hint attached to capacity errors, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PrismError::CapacityExhausted { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Transient errors are the only class worth retrying locally
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Rebuild an error of the given class from wire fields
    pub fn from_wire(kind: ErrorKind, message: String, retry_after: Option<Duration>) -> Self {
        match kind {
            ErrorKind::Validation => PrismError::Validation(message),
            ErrorKind::NotFound => PrismError::NotFound(message),
            ErrorKind::Conflict => PrismError::Conflict(message),
            ErrorKind::CapacityExhausted => PrismError::CapacityExhausted {
                reason: message,
                retry_after,
            },
            ErrorKind::Transient => PrismError::Transient(message),
            ErrorKind::Fatal => PrismError::Fatal(message),
            ErrorKind::Partial => PrismError::Partial {
                succeeded: 0,
                failed: 0,
                reasons: vec![message],
            },
        }
    }
}

impl From<std::io::Error> for PrismError {
    fn from(e: std::io::Error) -> Self {
        PrismError::Transient(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for PrismError {
    fn from(e: serde_json::Error) -> Self {
        PrismError::Validation(format!("invalid json: {e}"))
    }
}
