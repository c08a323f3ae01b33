//! Encrypted named-secret persistence.
//!
//! [`SecretStore`] owns the record-level lifecycle: it encrypts values
//! with the currently active data key on write, resolves each envelope's
//! `keyId` back through the [`KeyManager`] on read, applies lazy expiry on
//! every read, and supports an explicit sweep for records whose TTL has
//! passed.
//!
//! Persistence itself sits behind the [`SecretBackend`] port so the core
//! stays storage-agnostic; [`MemoryBackend`] here serves tests and
//! single-process deployments, and `vaultic-infra` provides the SQLite
//! adapter. Every backend call is bounded by the store's operation
//! timeout, which surfaces as a retryable `KmsError::Timeout`.
//!
//! The secret name is bound into each envelope as AAD, so a record copied
//! or renamed in the backing store fails authentication instead of
//! decrypting under the wrong name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};
use vaultic_common::{KmsError, KmsResult, SecretString};

use crate::cipher::EnvelopeCipher;
use crate::envelope::Envelope;
use crate::keys::KeyManager;

/// Options for storing a secret. Defaults: no TTL, no tags.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Days until the record expires. Zero or negative values produce a
    /// record that is already expired on its next read.
    pub ttl_days: Option<i64>,

    /// Free-form labels persisted with the record metadata.
    pub tags: HashMap<String, String>,
}

impl StoreOptions {
    /// Set a TTL in days.
    pub fn with_ttl_days(mut self, days: i64) -> Self {
        self.ttl_days = Some(days);
        self
    }

    /// Attach a tag.
    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A persisted secret: envelope plus metadata. Never contains plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub name: String,
    pub envelope: Envelope,
    pub tags: HashMap<String, String>,
    pub ttl_days: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SecretRecord {
    /// Whether the record's TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now >= expires_at)
    }

    /// The non-sensitive projection of this record.
    pub fn metadata(&self) -> SecretMetadata {
        SecretMetadata {
            name: self.name.clone(),
            tags: self.tags.clone(),
            ttl_days: self.ttl_days,
            created_at: self.created_at,
            expires_at: self.expires_at,
            key_id: self.envelope.key_id.clone(),
        }
    }
}

/// Listing/record metadata: everything except the payload.
#[derive(Debug, Clone, Serialize)]
pub struct SecretMetadata {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub ttl_days: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub key_id: String,
}

/// Filter for [`SecretStore::list_secrets`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only names starting with this prefix.
    pub name_prefix: Option<String>,

    /// Only records carrying this exact tag key/value pair.
    pub tag: Option<(String, String)>,
}

impl ListFilter {
    fn matches(&self, record: &SecretRecord) -> bool {
        if let Some(prefix) = &self.name_prefix {
            if !record.name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some((key, value)) = &self.tag {
            if record.tags.get(key) != Some(value) {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts for status reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub expired: usize,
}

/// Persistence port for secret records.
///
/// Implementations must be safe for concurrent use. `put` has upsert
/// semantics; `replace` writes only when the name already exists, which is
/// what lets the store detect rotation conflicts.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Insert or overwrite a record.
    async fn put(&self, record: SecretRecord) -> KmsResult<()>;

    /// Overwrite a record only if the name already exists. Returns whether
    /// a record was replaced.
    async fn replace(&self, record: SecretRecord) -> KmsResult<bool>;

    /// Fetch a record by name.
    async fn fetch(&self, name: &str) -> KmsResult<Option<SecretRecord>>;

    /// Remove a record by name. Returns whether a record existed.
    async fn remove(&self, name: &str) -> KmsResult<bool>;

    /// All records, in no particular order.
    async fn list(&self) -> KmsResult<Vec<SecretRecord>>;
}

/// In-memory backend for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, SecretRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    async fn put(&self, record: SecretRecord) -> KmsResult<()> {
        self.records.write().await.insert(record.name.clone(), record);
        Ok(())
    }

    async fn replace(&self, record: SecretRecord) -> KmsResult<bool> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.name) {
            records.insert(record.name.clone(), record);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn fetch(&self, name: &str) -> KmsResult<Option<SecretRecord>> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn remove(&self, name: &str) -> KmsResult<bool> {
        Ok(self.records.write().await.remove(name).is_some())
    }

    async fn list(&self) -> KmsResult<Vec<SecretRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// Store tuning knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound for a single backend operation.
    pub op_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { op_timeout: Duration::from_secs(5) }
    }
}

/// Record-level secret storage over a pluggable backend.
pub struct SecretStore {
    keys: Arc<KeyManager>,
    backend: Arc<dyn SecretBackend>,
    config: StoreConfig,
}

impl SecretStore {
    /// Create a store with default configuration.
    pub fn new(keys: Arc<KeyManager>, backend: Arc<dyn SecretBackend>) -> Self {
        Self::with_config(keys, backend, StoreConfig::default())
    }

    /// Create a store with explicit configuration.
    pub fn with_config(
        keys: Arc<KeyManager>,
        backend: Arc<dyn SecretBackend>,
        config: StoreConfig,
    ) -> Self {
        Self { keys, backend, config }
    }

    /// Encrypt `value` under the active data key and persist it.
    ///
    /// Overwrites an existing record with the same name; the overwrite is
    /// logged as a rotation for audit purposes.
    #[instrument(skip(self, value))]
    pub async fn store_secret(
        &self,
        name: &str,
        value: &SecretString,
        opts: StoreOptions,
    ) -> KmsResult<SecretMetadata> {
        validate_name(name)?;

        let existed = self
            .bounded("store_secret", self.backend.fetch(name))
            .await?
            .is_some();

        let record = self.encrypt_record(name, value, opts.ttl_days, opts.tags)?;
        let metadata = record.metadata();
        self.bounded("store_secret", self.backend.put(record)).await?;

        info!(
            secret = %name,
            key_id = %metadata.key_id,
            rotated = existed,
            "secret stored"
        );
        Ok(metadata)
    }

    /// Load, decrypt and return the named secret.
    ///
    /// # Errors
    /// - `KmsError::NotFound` when no record exists.
    /// - `KmsError::Expired` when the record's TTL has elapsed (checked
    ///   lazily on every read, independent of the sweep).
    /// - `KmsError::Decryption` when the envelope fails authentication or
    ///   references an unknown key — never silently treated as not-found.
    #[instrument(skip(self))]
    pub async fn get_secret(&self, name: &str) -> KmsResult<SecretString> {
        let record = self
            .bounded("get_secret", self.backend.fetch(name))
            .await?
            .ok_or_else(|| KmsError::not_found(name))?;

        if record.is_expired(Utc::now()) {
            debug!(secret = %name, "read of expired secret rejected");
            return Err(KmsError::expired(name));
        }

        // An envelope whose keyId no longer resolves is undecryptable;
        // fail closed rather than reporting a missing record.
        let key = self.keys.key(&record.envelope.key_id).map_err(|_| {
            error!(
                target: "vaultic::audit",
                secret = %name,
                key_id = %record.envelope.key_id,
                "SECURITY EVENT: envelope references unknown data key"
            );
            KmsError::decryption(record.envelope.key_id.clone())
        })?;

        let plaintext = EnvelopeCipher::decrypt(&record.envelope, &key, Some(name.as_bytes()))?;
        String::from_utf8(plaintext)
            .map(SecretString::new)
            .map_err(|_| KmsError::internal("decrypted payload is not valid UTF-8"))
    }

    /// Re-encrypt an existing secret with a new value under the currently
    /// active key.
    ///
    /// # Errors
    /// - `KmsError::NotFound` when the record does not exist.
    /// - `KmsError::RotationConflict` when the record was deleted by a
    ///   concurrent caller between lookup and write.
    #[instrument(skip(self, value))]
    pub async fn rotate_secret(
        &self,
        name: &str,
        value: &SecretString,
    ) -> KmsResult<SecretMetadata> {
        let existing = self
            .bounded("rotate_secret", self.backend.fetch(name))
            .await?
            .ok_or_else(|| KmsError::not_found(name))?;

        let record =
            self.encrypt_record(name, value, existing.ttl_days, existing.tags.clone())?;
        let metadata = record.metadata();

        let replaced = self.bounded("rotate_secret", self.backend.replace(record)).await?;
        if !replaced {
            return Err(KmsError::rotation_conflict(name));
        }

        info!(secret = %name, key_id = %metadata.key_id, "secret rotated");
        Ok(metadata)
    }

    /// Remove a secret. Returns whether a record existed.
    #[instrument(skip(self))]
    pub async fn delete_secret(&self, name: &str) -> KmsResult<bool> {
        let removed = self.bounded("delete_secret", self.backend.remove(name)).await?;
        if removed {
            info!(secret = %name, "secret deleted");
        }
        Ok(removed)
    }

    /// Whether a record with this name exists (expired or not).
    pub async fn contains(&self, name: &str) -> KmsResult<bool> {
        Ok(self.bounded("contains", self.backend.fetch(name)).await?.is_some())
    }

    /// Metadata for all records matching the filter. Never includes
    /// plaintext or ciphertext.
    pub async fn list_secrets(&self, filter: Option<&ListFilter>) -> KmsResult<Vec<SecretMetadata>> {
        let records = self.bounded("list_secrets", self.backend.list()).await?;
        let mut metas: Vec<SecretMetadata> = records
            .iter()
            .filter(|record| filter.map_or(true, |f| f.matches(record)))
            .map(SecretRecord::metadata)
            .collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(metas)
    }

    /// All raw records, for backup export. Envelopes stay encrypted.
    pub(crate) async fn export_records(&self) -> KmsResult<Vec<SecretRecord>> {
        self.bounded("export_records", self.backend.list()).await
    }

    /// Import a record verbatim if the name is not already taken. Returns
    /// whether it was written.
    pub(crate) async fn import_record(&self, record: SecretRecord) -> KmsResult<bool> {
        if self.contains(&record.name).await? {
            return Ok(false);
        }
        self.bounded("import_record", self.backend.put(record)).await?;
        Ok(true)
    }

    /// Remove every record whose TTL has elapsed. Each record is checked
    /// and deleted individually so the sweep never holds a lock across
    /// unrelated secrets.
    pub async fn sweep_expired(&self) -> KmsResult<usize> {
        let now = Utc::now();
        let records = self.bounded("sweep_expired", self.backend.list()).await?;

        let mut removed = 0;
        for record in records {
            if record.is_expired(now)
                && self.bounded("sweep_expired", self.backend.remove(&record.name)).await?
            {
                debug!(secret = %record.name, "expired secret swept");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "expiry sweep completed");
        }
        Ok(removed)
    }

    /// Aggregate record counts for status reporting.
    pub async fn stats(&self) -> KmsResult<StoreStats> {
        let now = Utc::now();
        let records = self.bounded("stats", self.backend.list()).await?;
        let expired = records.iter().filter(|r| r.is_expired(now)).count();
        Ok(StoreStats { total: records.len(), expired })
    }

    fn encrypt_record(
        &self,
        name: &str,
        value: &SecretString,
        ttl_days: Option<i64>,
        tags: HashMap<String, String>,
    ) -> KmsResult<SecretRecord> {
        let key = self.keys.active_key();
        let envelope = EnvelopeCipher::encrypt(value.expose_bytes(), &key, Some(name.as_bytes()))?;

        let created_at = Utc::now();
        let expires_at = ttl_days.map(|days| created_at + chrono::Duration::days(days));

        Ok(SecretRecord { name: name.to_string(), envelope, tags, ttl_days, created_at, expires_at })
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = KmsResult<T>>,
    ) -> KmsResult<T> {
        tokio::time::timeout(self.config.op_timeout, fut)
            .await
            .map_err(|_| KmsError::timeout(operation, self.config.op_timeout))?
    }
}

fn validate_name(name: &str) -> KmsResult<()> {
    if name.is_empty() {
        return Err(KmsError::configuration_field("name", "secret name must not be empty"));
    }
    Ok(())
}
