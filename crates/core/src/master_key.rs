//! Master key loading.
//!
//! The master key is the single root secret of the subsystem: 32 bytes of
//! externally supplied key material, held only in process memory for the
//! process lifetime and never persisted here. Every other component is
//! constructed after — and depends on — a successful load, so a missing or
//! malformed key is fatal and aborts startup. There is no retry and no
//! lazy loading.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use vaultic_common::{KmsError, KmsResult, SecretString};
use zeroize::Zeroizing;

/// Master key length in raw bytes.
pub const MASTER_KEY_LEN: usize = 32;

/// Environment variable the default key source reads.
pub const MASTER_KEY_ENV: &str = "VAULTIC_MASTER_KEY";

/// Source to load the master key from.
///
/// Supports multiple sources for flexibility in different environments:
/// an environment variable (the usual production path, injected by the
/// orchestrator), a key file (mounted secret volumes), or a direct value
/// (tests and local tooling).
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Read the base64-encoded key from an environment variable.
    Environment { var_name: String },

    /// Read the base64-encoded key from a file.
    File { path: PathBuf },

    /// Use the given base64-encoded value directly.
    Direct { encoded: SecretString },
}

impl Default for KeySource {
    fn default() -> Self {
        Self::Environment { var_name: MASTER_KEY_ENV.to_string() }
    }
}

/// The root key. 32 bytes, zeroed on drop, exposed to logs only as a
/// SHA-256-based fingerprint.
pub struct MasterKey {
    material: Zeroizing<[u8; MASTER_KEY_LEN]>,
    fingerprint: String,
}

impl MasterKey {
    fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        let fingerprint = fingerprint(&bytes);
        Self { material: Zeroizing::new(bytes), fingerprint }
    }

    /// Generate a fresh random master key.
    ///
    /// Intended for provisioning tooling and tests; production deployments
    /// supply the key externally.
    pub fn generate() -> Self {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Raw key material.
    ///
    /// # Security Warning
    /// The returned reference should not be stored or logged. Use only for
    /// immediate cryptographic operations.
    pub fn material(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.material
    }

    /// Short fingerprint safe for logs and status output.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("material", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Loads the master key from the configured source at process start.
pub struct MasterKeyProvider;

impl MasterKeyProvider {
    /// Load the master key.
    ///
    /// # Errors
    /// Returns `KmsError::Configuration` if the source is absent, the value
    /// is not valid base64, or it does not decode to exactly 32 bytes.
    /// All of these are fatal at startup.
    #[instrument(skip_all, fields(source = ?std::mem::discriminant(source)))]
    pub fn load(source: &KeySource) -> KmsResult<MasterKey> {
        let encoded = match source {
            KeySource::Environment { var_name } => {
                info!(var = %var_name, "loading master key from environment");
                SecretString::new(std::env::var(var_name).map_err(|_| {
                    warn!(var = %var_name, "master key environment variable not set");
                    KmsError::configuration_field(
                        "master_key",
                        format!("environment variable {var_name} not set"),
                    )
                })?)
            }
            KeySource::File { path } => {
                info!(path = %path.display(), "loading master key from file");
                SecretString::new(
                    std::fs::read_to_string(path)
                        .map_err(|e| {
                            warn!(path = %path.display(), error = %e, "master key file unreadable");
                            KmsError::configuration_field(
                                "master_key",
                                format!("key file {} unreadable: {e}", path.display()),
                            )
                        })?
                        .trim()
                        .to_string(),
                )
            }
            KeySource::Direct { encoded } => encoded.clone(),
        };

        let key = Self::decode(&encoded)?;
        info!(fingerprint = %key.fingerprint(), "master key loaded");
        Ok(key)
    }

    fn decode(encoded: &SecretString) -> KmsResult<MasterKey> {
        let decoded = Zeroizing::new(BASE64.decode(encoded.expose().as_bytes()).map_err(|_| {
            KmsError::configuration_field("master_key", "value is not valid base64")
        })?);

        if decoded.len() != MASTER_KEY_LEN {
            return Err(KmsError::configuration_field(
                "master_key",
                format!("decoded key must be {MASTER_KEY_LEN} bytes, got {}", decoded.len()),
            ));
        }

        let mut bytes = [0u8; MASTER_KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(MasterKey::from_bytes(bytes))
    }
}

/// Short key fingerprint: base64 of the first 8 bytes of SHA-256.
fn fingerprint(material: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material);
    let digest = hasher.finalize();
    BASE64.encode(&digest[..8])
}
