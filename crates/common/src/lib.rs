//! Shared foundation for the Vaultic secret-management crates.
//!
//! Two concerns live here because every other crate needs them:
//!
//! - [`error`]: the `KmsError` taxonomy with severity/retryability
//!   classification, used across core and infra.
//! - [`secret`]: the [`SecretString`] wrapper that keeps plaintext secret
//!   values out of logs, debug output and serialized structures.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod error;
pub mod secret;

pub use error::{ErrorClassification, ErrorSeverity, KmsError, KmsResult};
pub use secret::SecretString;
