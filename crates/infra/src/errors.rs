//! Conversions from storage-layer errors into the domain error taxonomy.
//!
//! The storage crates surface their own error types (rusqlite, r2d2,
//! serde_json); this module keeps those conversions on the infrastructure
//! side so core code only ever sees [`KmsError`]. Busy/locked databases
//! and pool exhaustion map to *retryable* storage errors; everything else
//! is permanent.

use thiserror::Error;
use vaultic_common::KmsError;

/// Infrastructure-side storage error, converted into [`KmsError`] at the
/// port boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stored timestamp '{0}'")]
    Timestamp(String),
}

impl StorageError {
    /// Whether retrying the same operation can reasonably succeed.
    fn is_transient(&self) -> bool {
        match self {
            Self::Pool(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Convert into the domain error, tagged with the failing operation.
    pub fn into_kms(self, operation: &str) -> KmsError {
        match &self {
            Self::Json(e) => KmsError::serialization_format("JSON", e.to_string()),
            _ if self.is_transient() => {
                KmsError::storage_transient(operation, self.to_string())
            }
            _ => KmsError::storage_op(operation, self.to_string()),
        }
    }
}

/// Map a blocking-task join failure. A panic inside a storage task is a
/// bug, not a storage condition.
pub(crate) fn map_join_error(err: tokio::task::JoinError) -> KmsError {
    KmsError::internal(format!("storage task failed: {err}"))
}
