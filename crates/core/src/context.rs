//! Subsystem bootstrap and lifecycle.
//!
//! [`KmsContext`] is the explicit context object the surrounding
//! application constructs once at boot and passes by reference into every
//! collaborator that needs secret access — there is no module-level
//! singleton. Initialization is a strictly ordered, one-time, blocking
//! sequence:
//!
//! 1. [`MasterKeyProvider`] loads the root key.
//! 2. [`KeyManager`] builds (or restores) the data-key ring.
//! 3. [`SecretStore`] and [`SecretsManager`] come up over the backend.
//! 4. Seed secrets are imported (idempotent; existing names are kept).
//! 5. [`ConfigLoader`] produces the validated application configuration.
//!
//! Any failure along the way is fatal: no retry loop, no degraded-mode
//! startup. Only after the sequence completes does the context spawn the
//! background expiry sweep, and only then may request-serving components
//! be constructed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vaultic_common::KmsResult;

use crate::config::{AppConfig, ConfigLoader, SeedSecret, Settings};
use crate::keys::{DataKeyInfo, KeyManager, RotationPolicy, WrappedDataKey};
use crate::manager::{CacheConfig, KmsStatus, SecretsManager};
use crate::master_key::{KeySource, MasterKeyProvider};
use crate::store::{SecretBackend, SecretStore, StoreConfig, StoreOptions};

/// Persistence port for the wrapped data-key ring.
///
/// Implementations only ever see key material encrypted under the master
/// key ([`WrappedDataKey`]); plaintext keys never reach a backend.
#[async_trait]
pub trait KeyRingBackend: Send + Sync {
    /// Load the persisted ring. An empty result means first run.
    async fn load_keyring(&self) -> KmsResult<Vec<WrappedDataKey>>;

    /// Persist the full ring, replacing any previous state.
    async fn store_keyring(&self, keys: &[WrappedDataKey]) -> KmsResult<()>;
}

/// Everything `init` needs, declared once with typed fields.
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    /// Where the master key comes from.
    pub key_source: KeySource,

    /// Secrets imported into the store on first run. Names that already
    /// exist are left untouched.
    pub seed_secrets: Vec<SeedSecret>,

    /// Plain runtime settings (cache, sweep, timeouts, rotation period).
    pub settings: Settings,
}

/// The subsystem's root object: owns the key manager, the store, the
/// manager façade and the background sweep.
pub struct KmsContext {
    keys: Arc<KeyManager>,
    store: Arc<SecretStore>,
    secrets: Arc<SecretsManager>,
    config: AppConfig,
    keyring_backend: Option<Arc<dyn KeyRingBackend>>,
    sweep_task: JoinHandle<()>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for KmsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsContext")
            .field("config", &self.config)
            .field("keyring_backend", &self.keyring_backend.is_some())
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl KmsContext {
    /// Run the ordered bootstrap sequence.
    ///
    /// # Errors
    /// Any error here is fatal to startup: a missing/malformed master key,
    /// a key ring that fails to unwrap, an unreachable backend, or invalid
    /// application configuration.
    pub async fn init(
        bootstrap: BootstrapConfig,
        backend: Arc<dyn SecretBackend>,
        keyring_backend: Option<Arc<dyn KeyRingBackend>>,
    ) -> KmsResult<Self> {
        info!("starting secret subsystem bootstrap");

        let master = MasterKeyProvider::load(&bootstrap.key_source)?;

        let policy = RotationPolicy { rotation_days: bootstrap.settings.key_rotation_days };
        let keys = match &keyring_backend {
            Some(ring_backend) => {
                let wrapped = ring_backend.load_keyring().await?;
                if wrapped.is_empty() {
                    let keys = KeyManager::with_policy(master, policy);
                    ring_backend.store_keyring(&keys.export_wrapped()?).await?;
                    keys
                } else {
                    KeyManager::from_wrapped(master, &wrapped, policy)?
                }
            }
            None => KeyManager::with_policy(master, policy),
        };
        let keys = Arc::new(keys);

        let store = Arc::new(SecretStore::with_config(
            Arc::clone(&keys),
            backend,
            StoreConfig { op_timeout: bootstrap.settings.store_timeout() },
        ));

        let secrets = Arc::new(SecretsManager::with_config(
            Arc::clone(&keys),
            Arc::clone(&store),
            CacheConfig {
                ttl: bootstrap.settings.cache_ttl(),
                max_capacity: bootstrap.settings.cache_max_capacity,
            },
        ));

        let seeded = import_seeds(&store, &secrets, &bootstrap.seed_secrets).await?;
        if seeded > 0 {
            info!(seeded, "seed secrets imported");
        }

        let config = ConfigLoader::load(&bootstrap.settings, &secrets).await?;

        let sweep_task = spawn_sweep(Arc::clone(&store), bootstrap.settings.sweep_interval());

        info!(
            environment = %config.environment,
            data_keys = keys.key_count(),
            "secret subsystem initialized"
        );

        Ok(Self {
            keys,
            store,
            secrets,
            config,
            keyring_backend,
            sweep_task,
            initialized: AtomicBool::new(true),
        })
    }

    /// The secrets façade collaborators call at request time.
    pub fn secrets(&self) -> &Arc<SecretsManager> {
        &self.secrets
    }

    /// The key manager, for collaborators encrypting ad hoc payloads.
    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// The underlying store (administrative surface).
    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    /// The validated application configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Rotate the data key and persist the updated wrapped ring.
    pub async fn rotate_data_key(&self) -> KmsResult<DataKeyInfo> {
        let new_key = self.keys.rotate_data_key();
        if let Some(ring_backend) = &self.keyring_backend {
            ring_backend.store_keyring(&self.keys.export_wrapped()?).await?;
        }
        Ok(DataKeyInfo { id: new_key.id().to_string(), created_at: new_key.created_at(), active: true })
    }

    /// Status snapshot reflecting the context lifecycle state.
    pub async fn status(&self) -> KmsResult<KmsStatus> {
        let mut status = self.secrets.get_status().await?;
        status.initialized = self.initialized.load(Ordering::SeqCst);
        Ok(status)
    }

    /// Stop background work. Idempotent; the context is unusable for
    /// request traffic afterwards only by convention — reads still work,
    /// but no sweep runs.
    pub fn shutdown(&self) {
        if self.initialized.swap(false, Ordering::SeqCst) {
            self.sweep_task.abort();
            info!("secret subsystem shut down");
        }
    }
}

impl Drop for KmsContext {
    fn drop(&mut self) {
        self.sweep_task.abort();
    }
}

async fn import_seeds(
    store: &SecretStore,
    secrets: &SecretsManager,
    seeds: &[SeedSecret],
) -> KmsResult<usize> {
    let mut seeded = 0;
    for seed in seeds {
        if store.contains(&seed.name).await? {
            continue;
        }
        let opts = StoreOptions { ttl_days: seed.ttl_days, tags: seed.tags.clone() };
        secrets.set_secret(&seed.name, &seed.value, opts).await?;
        seeded += 1;
    }
    Ok(seeded)
}

fn spawn_sweep(store: Arc<SecretStore>, interval: std::time::Duration) -> JoinHandle<()> {
    // tokio::time::interval rejects a zero period.
    let interval = interval.max(std::time::Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = store.sweep_expired().await {
                warn!(error = %e, "expiry sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    //! Unit tests for the bootstrap context.
    use std::collections::HashMap;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use tokio::sync::RwLock;
    use vaultic_common::{KmsError, SecretString};

    use super::*;
    use crate::config::{SECRET_DATABASE_URL, SECRET_JWT_SECRET};
    use crate::store::MemoryBackend;

    struct MemoryKeyRing {
        entries: RwLock<Vec<WrappedDataKey>>,
    }

    impl MemoryKeyRing {
        fn new() -> Self {
            Self { entries: RwLock::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl KeyRingBackend for MemoryKeyRing {
        async fn load_keyring(&self) -> KmsResult<Vec<WrappedDataKey>> {
            Ok(self.entries.read().await.clone())
        }

        async fn store_keyring(&self, keys: &[WrappedDataKey]) -> KmsResult<()> {
            *self.entries.write().await = keys.to_vec();
            Ok(())
        }
    }

    fn direct_key_source() -> KeySource {
        KeySource::Direct {
            encoded: SecretString::new(BASE64.encode([9u8; 32])),
        }
    }

    fn bootstrap() -> BootstrapConfig {
        BootstrapConfig {
            key_source: direct_key_source(),
            seed_secrets: vec![
                SeedSecret {
                    name: SECRET_DATABASE_URL.to_string(),
                    value: SecretString::from("postgres://app:pw@db.internal/ledger"),
                    ttl_days: None,
                    tags: HashMap::new(),
                },
                SeedSecret {
                    name: SECRET_JWT_SECRET.to_string(),
                    value: SecretString::from("0123456789abcdef0123456789abcdef"),
                    ttl_days: None,
                    tags: HashMap::new(),
                },
            ],
            settings: Settings::default(),
        }
    }

    /// Validates `KmsContext::init` behavior for the ordered bootstrap
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms seeds are imported, config resolves, and status reports
    ///   an initialized subsystem.
    #[tokio::test]
    async fn bootstrap_sequence_completes() {
        let ctx = KmsContext::init(bootstrap(), Arc::new(MemoryBackend::new()), None)
            .await
            .unwrap();

        assert_eq!(
            ctx.secrets().get_secret(SECRET_JWT_SECRET).await.unwrap().expose(),
            "0123456789abcdef0123456789abcdef"
        );
        assert_eq!(ctx.config().environment, "development");

        let status = ctx.status().await.unwrap();
        assert!(status.initialized);
        assert_eq!(status.data_keys, 1);
        assert_eq!(status.secrets, 2);

        ctx.shutdown();
        let status = ctx.status().await.unwrap();
        assert!(!status.initialized);
    }

    /// Validates `KmsContext::init` behavior for the missing master key
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures bootstrap aborts with a `Configuration` error.
    #[tokio::test]
    async fn bootstrap_fails_without_master_key() {
        let mut config = bootstrap();
        config.key_source =
            KeySource::Environment { var_name: "VAULTIC_TEST_BOOT_NO_KEY".to_string() };

        let err = KmsContext::init(config, Arc::new(MemoryBackend::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KmsError::Configuration { .. }));
    }

    /// Validates seed import idempotency across re-initialization.
    ///
    /// Assertions:
    /// - Confirms a value changed after the first boot survives a second
    ///   boot with the same seeds.
    #[tokio::test]
    async fn seeds_do_not_overwrite_existing_records() {
        let backend = Arc::new(MemoryBackend::new());
        let keyring = Arc::new(MemoryKeyRing::new());

        let ctx = KmsContext::init(
            bootstrap(),
            Arc::clone(&backend) as Arc<dyn SecretBackend>,
            Some(Arc::clone(&keyring) as Arc<dyn KeyRingBackend>),
        )
        .await
        .unwrap();
        ctx.secrets()
            .rotate_secret(SECRET_JWT_SECRET, &SecretString::from("rotated-value-0123456789"))
            .await
            .unwrap();
        ctx.shutdown();
        drop(ctx);

        let ctx = KmsContext::init(
            bootstrap(),
            Arc::clone(&backend) as Arc<dyn SecretBackend>,
            Some(keyring as Arc<dyn KeyRingBackend>),
        )
        .await
        .unwrap();
        assert_eq!(
            ctx.secrets().get_secret(SECRET_JWT_SECRET).await.unwrap().expose(),
            "rotated-value-0123456789"
        );
    }

    /// Validates wrapped key-ring persistence across restarts.
    ///
    /// Assertions:
    /// - Confirms a secret written before "restart" decrypts after the
    ///   ring is restored from the keyring backend.
    /// - Confirms the restored ring keeps the rotated key history.
    #[tokio::test]
    async fn keyring_survives_restart() {
        let backend = Arc::new(MemoryBackend::new());
        let keyring = Arc::new(MemoryKeyRing::new());

        let ctx = KmsContext::init(
            bootstrap(),
            Arc::clone(&backend) as Arc<dyn SecretBackend>,
            Some(Arc::clone(&keyring) as Arc<dyn KeyRingBackend>),
        )
        .await
        .unwrap();

        ctx.secrets()
            .set_secret("RECOVERY_KEY", &SecretString::from("phrase"), StoreOptions::default())
            .await
            .unwrap();
        ctx.rotate_data_key().await.unwrap();
        ctx.shutdown();
        drop(ctx);

        let ctx = KmsContext::init(
            bootstrap(),
            Arc::clone(&backend) as Arc<dyn SecretBackend>,
            Some(keyring as Arc<dyn KeyRingBackend>),
        )
        .await
        .unwrap();

        assert_eq!(ctx.key_manager().key_count(), 2);
        assert_eq!(ctx.secrets().get_secret("RECOVERY_KEY").await.unwrap().expose(), "phrase");
    }

    /// Validates the periodic sweep removes expired records without
    /// blocking reads.
    ///
    /// Assertions:
    /// - Confirms an expired record disappears after a sweep interval.
    /// - Confirms a live record remains readable throughout.
    #[tokio::test]
    async fn background_sweep_collects_expired_records() {
        let mut config = bootstrap();
        config.settings.sweep_interval_seconds = 0; // sub-second ticks via interval floor
        let ctx = KmsContext::init(config, Arc::new(MemoryBackend::new()), None)
            .await
            .unwrap();

        ctx.secrets()
            .set_secret("EPHEMERAL", &SecretString::from("x"), StoreOptions::default().with_ttl_days(-1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = ctx.status().await.unwrap();
        assert_eq!(status.expired_secrets, 0);
        assert!(ctx
            .secrets()
            .get_secret(SECRET_JWT_SECRET)
            .await
            .is_ok());
        ctx.shutdown();
    }
}
