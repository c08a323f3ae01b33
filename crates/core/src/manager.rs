//! Public-facing secrets façade with caching.
//!
//! [`SecretsManager`] is the interface the rest of the application talks
//! to. It wraps the [`SecretStore`] with a short-TTL in-memory cache so
//! hot secrets are not decrypted on every request, coalesces concurrent
//! cache misses for the same name into a single underlying decrypt, and
//! invalidates synchronously on every write so no caller can observe a
//! stale value after a successful rotation.
//!
//! The cache holds plaintext only inside [`SecretString`] values and is
//! never persisted. Its TTL is independent of — and typically much
//! shorter than — the record TTL enforced by the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use tracing::{debug, info, instrument};
use vaultic_common::{KmsError, KmsResult, SecretString};

use crate::keys::KeyManager;
use crate::store::{ListFilter, SecretMetadata, SecretRecord, SecretStore, StoreOptions};

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for cached plaintext entries.
    pub ttl: Duration,

    /// Maximum number of cached entries.
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(60), max_capacity: 10_000 }
    }
}

impl CacheConfig {
    /// Create a config with a custom TTL (useful for testing).
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl, ..Self::default() }
    }

    /// Log configuration at startup.
    pub fn log_config(&self) {
        info!(
            ttl_seconds = self.ttl.as_secs(),
            max_capacity = self.max_capacity,
            "secret cache configuration loaded"
        );
    }
}

/// Operational status snapshot. Carries counts and ids only — no
/// plaintext, no key material.
#[derive(Debug, Clone, Serialize)]
pub struct KmsStatus {
    pub initialized: bool,
    pub data_keys: usize,
    pub active_key_id: String,
    pub master_key_fingerprint: String,
    pub rotation_due: bool,
    pub secrets: usize,
    pub expired_secrets: usize,
    pub cache_entries: u64,
}

/// Caching, auditable access layer over the secret store.
pub struct SecretsManager {
    keys: Arc<KeyManager>,
    store: Arc<SecretStore>,
    cache: Cache<String, SecretString>,
}

impl SecretsManager {
    /// Create a manager with default cache configuration.
    pub fn new(keys: Arc<KeyManager>, store: Arc<SecretStore>) -> Self {
        Self::with_config(keys, store, CacheConfig::default())
    }

    /// Create a manager with explicit cache configuration.
    pub fn with_config(
        keys: Arc<KeyManager>,
        store: Arc<SecretStore>,
        config: CacheConfig,
    ) -> Self {
        config.log_config();
        let cache = Cache::builder()
            .time_to_live(config.ttl)
            .max_capacity(config.max_capacity)
            .build();
        Self { keys, store, cache }
    }

    /// Resolve a secret, serving from cache when possible.
    ///
    /// Concurrent misses for the same name are coalesced into a single
    /// underlying fetch/decrypt; the remaining callers await that result.
    /// Errors are returned to every waiting caller and never cached.
    #[instrument(skip(self))]
    pub async fn get_secret(&self, name: &str) -> KmsResult<SecretString> {
        let store = Arc::clone(&self.store);
        let lookup = name.to_string();

        self.cache
            .try_get_with(name.to_string(), async move {
                debug!(secret = %lookup, "cache miss, decrypting from store");
                store.get_secret(&lookup).await
            })
            .await
            .map_err(|e: Arc<KmsError>| (*e).clone())
    }

    /// Batch variant of [`get_secret`](Self::get_secret).
    ///
    /// A failure for one name never aborts retrieval of the others; the
    /// result maps every requested name to its own outcome.
    pub async fn get_secrets(&self, names: &[&str]) -> HashMap<String, KmsResult<SecretString>> {
        let mut results = HashMap::with_capacity(names.len());
        for name in names {
            results.insert((*name).to_string(), self.get_secret(name).await);
        }
        results
    }

    /// Store a secret and invalidate its cache entry before returning.
    pub async fn set_secret(
        &self,
        name: &str,
        value: &SecretString,
        opts: StoreOptions,
    ) -> KmsResult<SecretMetadata> {
        let metadata = self.store.store_secret(name, value, opts).await?;
        self.cache.invalidate(name).await;
        Ok(metadata)
    }

    /// Rotate a secret's value and invalidate its cache entry before
    /// returning. Every `get_secret` that starts after this completes
    /// observes the new value.
    pub async fn rotate_secret(&self, name: &str, value: &SecretString) -> KmsResult<SecretMetadata> {
        let metadata = self.store.rotate_secret(name, value).await?;
        self.cache.invalidate(name).await;
        Ok(metadata)
    }

    /// Delete a secret and invalidate its cache entry.
    pub async fn delete_secret(&self, name: &str) -> KmsResult<bool> {
        let removed = self.store.delete_secret(name).await?;
        self.cache.invalidate(name).await;
        Ok(removed)
    }

    /// Metadata listing, delegated to the store.
    pub async fn list_secrets(&self, filter: Option<&ListFilter>) -> KmsResult<Vec<SecretMetadata>> {
        self.store.list_secrets(filter).await
    }

    /// Export every record verbatim — envelopes stay encrypted, nothing is
    /// decrypted during backup, so the export preserves the at-rest
    /// encryption property.
    pub async fn backup_secrets(&self) -> KmsResult<Vec<SecretRecord>> {
        let records = self.store.export_records().await?;
        info!(records = records.len(), "secret backup exported");
        Ok(records)
    }

    /// Re-import backup records verbatim. Names that already exist are
    /// skipped; returns the number of records written.
    pub async fn restore_secrets(&self, records: Vec<SecretRecord>) -> KmsResult<usize> {
        let mut imported = 0;
        for record in records {
            if self.store.import_record(record).await? {
                imported += 1;
            }
        }
        info!(imported, "secret backup restored");
        Ok(imported)
    }

    /// Operational status: key counts, secret counts, expiry backlog,
    /// cache size. Exposes no plaintext and no key material.
    pub async fn get_status(&self) -> KmsResult<KmsStatus> {
        let stats = self.store.stats().await?;
        Ok(KmsStatus {
            initialized: true,
            data_keys: self.keys.key_count(),
            active_key_id: self.keys.active_key_id(),
            master_key_fingerprint: self.keys.master_fingerprint().to_string(),
            rotation_due: self.keys.rotation_due(),
            secrets: stats.total,
            expired_secrets: stats.expired,
            cache_entries: self.cache.entry_count(),
        })
    }

    /// The key manager backing this instance, for collaborators that
    /// encrypt ad hoc payloads directly.
    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }
}
