//! Vaultic core: envelope encryption, key lifecycle, and the secret
//! access layer.
//!
//! Components, leaf-first:
//!
//! - [`master_key`]: loads the single root key from a trusted external
//!   source at process start.
//! - [`keys`]: generates, stores and rotates the symmetric data keys that
//!   envelopes are encrypted with.
//! - [`envelope`] / [`cipher`]: the self-describing encrypted payload and
//!   the stateless AES-256-GCM primitive that produces and consumes it.
//! - [`store`]: named secrets persisted as envelopes plus metadata, with
//!   TTL expiry and record-level rotation, over a pluggable backend.
//! - [`manager`]: the public façade — time-bounded cache with coalesced
//!   misses, batch retrieval, backup/restore, rotation orchestration.
//! - [`config`]: typed application configuration merging plain environment
//!   values with secrets, plus the secret-free public projection.
//! - [`context`]: the ordered bootstrap sequence and lifecycle owner.
//!
//! Construction order at boot is strict: master key → key manager →
//! store → manager → config loader. [`context::KmsContext::init`] encodes
//! that sequence; request-serving components are built only after it
//! returns.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod cipher;
pub mod config;
pub mod context;
pub mod envelope;
pub mod keys;
pub mod manager;
pub mod master_key;
pub mod store;

// Re-export commonly used types for convenience
// ------------------------------
pub use cipher::EnvelopeCipher;
pub use config::{AppConfig, ConfigLoader, ConnectionInfo, PublicConfig, SeedSecret, Settings};
pub use context::{BootstrapConfig, KeyRingBackend, KmsContext};
pub use envelope::{Envelope, ALGORITHM, ENVELOPE_VERSION};
pub use keys::{DataKey, DataKeyInfo, KeyManager, RotationPolicy, WrappedDataKey};
pub use manager::{CacheConfig, KmsStatus, SecretsManager};
pub use master_key::{KeySource, MasterKey, MasterKeyProvider};
pub use store::{
    ListFilter, MemoryBackend, SecretBackend, SecretMetadata, SecretRecord, SecretStore,
    StoreConfig, StoreOptions,
};
pub use vaultic_common::{ErrorClassification, ErrorSeverity, KmsError, KmsResult, SecretString};
