//! Error types shared across the Vaultic crates.
//!
//! The subsystem has a closed error taxonomy: every failure a caller can
//! observe is one of the [`KmsError`] variants below. Module code never
//! invents ad hoc error strings for new failure classes; it picks the
//! variant that matches and attaches names/ids/operations as context.
//!
//! Two rules hold everywhere:
//!
//! 1. **No secret material in errors.** Messages carry secret *names*, key
//!    *ids* and timestamps only. Plaintext values and key bytes never enter
//!    an error, its `Display` output, or anything derived from it.
//! 2. **Classification over string matching.** Callers decide how to react
//!    via [`ErrorClassification`] (`is_retryable`, `severity`), not by
//!    parsing messages.
//!
//! Boot-time `Configuration` errors are fatal and abort startup. Runtime
//! errors propagate to the calling collaborator, which retries (`Timeout`,
//! retryable `Storage`) or fails the enclosing operation (everything else).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Standard result type for Vaultic operations.
pub type KmsResult<T> = Result<T, KmsError>;

/// Error taxonomy for the secret/key-management subsystem.
///
/// Variants are `Clone` so coalesced cache loads can hand the same failure
/// to every waiting caller, and `Serialize` so collaborators can ship them
/// over IPC boundaries without re-wrapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KmsError {
    /// Missing or malformed bootstrap configuration (master key, config
    /// fields). Fatal at startup.
    Configuration { message: String, field: Option<String> },

    /// Requested secret name or data-key id does not exist.
    NotFound { name: String },

    /// Secret exists but its TTL has elapsed.
    Expired { name: String },

    /// Authentication tag or AAD mismatch during envelope decryption.
    /// Security-relevant; always logged to the audit sink by the caller.
    Decryption { key_id: String },

    /// A rotation raced with a concurrent delete or rotate of the same
    /// record.
    RotationConflict { name: String },

    /// An external dependency did not respond in time. Retryable.
    Timeout { operation: String, duration: Duration },

    /// Encoding or decoding of a persisted representation failed.
    Serialization { message: String, format: Option<String> },

    /// Backing store failure (connection pool, I/O, SQL).
    Storage { message: String, operation: Option<String>, retryable: bool },

    /// Invariant violation that should not occur in normal operation.
    Internal { message: String },
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { message, field } => {
                if let Some(field) = field {
                    write!(f, "Configuration error in field '{}': {}", field, message)
                } else {
                    write!(f, "Configuration error: {}", message)
                }
            }
            Self::NotFound { name } => write!(f, "Not found: '{}'", name),
            Self::Expired { name } => write!(f, "Secret expired: '{}'", name),
            Self::Decryption { key_id } => {
                write!(f, "Decryption failed for envelope under key '{}'", key_id)
            }
            Self::RotationConflict { name } => {
                write!(f, "Rotation conflict on secret '{}'", name)
            }
            Self::Timeout { operation, duration } => {
                write!(f, "Operation '{}' timed out after {:?}", operation, duration)
            }
            Self::Serialization { message, format } => {
                if let Some(format) = format {
                    write!(f, "Serialization error ({}): {}", format, message)
                } else {
                    write!(f, "Serialization error: {}", message)
                }
            }
            Self::Storage { message, operation, .. } => {
                if let Some(op) = operation {
                    write!(f, "Storage error during '{}': {}", op, message)
                } else {
                    write!(f, "Storage error: {}", message)
                }
            }
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for KmsError {}

impl KmsError {
    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into(), field: None }
    }

    /// Create a configuration error for a specific field.
    pub fn configuration_field<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Configuration { message: message.into(), field: Some(field.into()) }
    }

    /// Create a not-found error for a secret name or key id.
    pub fn not_found<S: Into<String>>(name: S) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create an expired-secret error.
    pub fn expired<S: Into<String>>(name: S) -> Self {
        Self::Expired { name: name.into() }
    }

    /// Create a decryption error referencing the key id the envelope named.
    pub fn decryption<S: Into<String>>(key_id: S) -> Self {
        Self::Decryption { key_id: key_id.into() }
    }

    /// Create a rotation-conflict error.
    pub fn rotation_conflict<S: Into<String>>(name: S) -> Self {
        Self::RotationConflict { name: name.into() }
    }

    /// Create a timeout error for a named operation.
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Create a serialization error.
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization { message: message.into(), format: None }
    }

    /// Create a serialization error with format information.
    pub fn serialization_format<F: Into<String>, S: Into<String>>(format: F, message: S) -> Self {
        Self::Serialization { message: message.into(), format: Some(format.into()) }
    }

    /// Create a non-retryable storage error.
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage { message: message.into(), operation: None, retryable: false }
    }

    /// Create a storage error for a specific operation.
    pub fn storage_op<O: Into<String>, S: Into<String>>(operation: O, message: S) -> Self {
        Self::Storage {
            message: message.into(),
            operation: Some(operation.into()),
            retryable: false,
        }
    }

    /// Create a retryable storage error (transient pool/connection faults).
    pub fn storage_transient<O: Into<String>, S: Into<String>>(operation: O, message: S) -> Self {
        Self::Storage { message: message.into(), operation: Some(operation.into()), retryable: true }
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }
}

/// Standard interface for classifying errors by their characteristics.
///
/// Collaborators use this to drive retry logic and alerting without
/// matching on variants or messages.
pub trait ErrorClassification {
    /// Can the failed operation be retried as-is?
    fn is_retryable(&self) -> bool;

    /// Severity level for monitoring and alerting.
    fn severity(&self) -> ErrorSeverity;

    /// Does this error require immediate attention?
    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }
}

impl ErrorClassification for KmsError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Configuration { .. } => ErrorSeverity::Error,
            Self::NotFound { .. } => ErrorSeverity::Info,
            Self::Expired { .. } => ErrorSeverity::Info,
            Self::Decryption { .. } => ErrorSeverity::Critical,
            Self::RotationConflict { .. } => ErrorSeverity::Warning,
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Serialization { .. } => ErrorSeverity::Error,
            Self::Storage { .. } => ErrorSeverity::Error,
            Self::Internal { .. } => ErrorSeverity::Critical,
        }
    }
}

/// Unified severity levels for monitoring and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Informational, expected conditions (missing name, expired record).
    Info,
    /// Degraded but operational (timeouts, conflicts).
    Warning,
    /// Failure requiring attention.
    Error,
    /// System integrity at risk (failed authentication tags, invariant
    /// violations).
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_format("JSON", err.to_string())
    }
}
