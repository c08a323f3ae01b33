//! Data key lifecycle management.
//!
//! A [`DataKey`] is the symmetric key envelopes are actually encrypted
//! with. The [`KeyManager`] owns the ring of all data keys ever created in
//! this process: exactly one is *active* (used for new encryptions) and the
//! rest are *historical*, retained so previously produced envelopes remain
//! decryptable. Keys are immutable once constructed and shared as
//! `Arc<DataKey>`, so a reader can never observe a torn key record: an
//! in-flight encryption either completes with the key it already obtained
//! or picks up the new active key on its next call.
//!
//! For persistence across restarts the ring can be exported with each
//! key's material encrypted under the master key ([`WrappedDataKey`]); the
//! master key itself never leaves process memory.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use vaultic_common::{KmsError, KmsResult};
use zeroize::Zeroizing;

use crate::envelope::{IV_LEN, TAG_LEN};
use crate::master_key::MasterKey;

/// Data key length in raw bytes.
pub const DATA_KEY_LEN: usize = 32;

/// A symmetric encryption key. Immutable once created.
pub struct DataKey {
    id: String,
    material: Zeroizing<[u8; DATA_KEY_LEN]>,
    created_at: DateTime<Utc>,
}

impl DataKey {
    fn generate() -> Self {
        let mut material = [0u8; DATA_KEY_LEN];
        OsRng.fill_bytes(&mut material);
        Self {
            id: Uuid::new_v4().to_string(),
            material: Zeroizing::new(material),
            created_at: Utc::now(),
        }
    }

    fn from_parts(id: String, material: [u8; DATA_KEY_LEN], created_at: DateTime<Utc>) -> Self {
        Self { id, material: Zeroizing::new(material), created_at }
    }

    /// Stable key id referenced by envelopes.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw key material.
    ///
    /// # Security Warning
    /// The returned reference should not be stored or logged. Use only for
    /// immediate cryptographic operations.
    pub fn material(&self) -> &[u8; DATA_KEY_LEN] {
        &self.material
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("id", &self.id)
            .field("material", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Key metadata for status and operational visibility. Carries no material.
#[derive(Debug, Clone, Serialize)]
pub struct DataKeyInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// How often the active data key should be rotated.
///
/// Rotation itself stays an explicit operator action; the policy only
/// drives the `rotation_due` status signal.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Number of days between rotations.
    pub rotation_days: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self { rotation_days: 90 }
    }
}

impl RotationPolicy {
    /// Check whether a key created at `created_at` is due for rotation.
    ///
    /// If the system clock went backwards the elapsed time defaults to
    /// zero and a warning is logged, so clock issues never trigger a
    /// premature rotation signal.
    pub fn is_due(&self, created_at: DateTime<Utc>) -> bool {
        let elapsed = Utc::now().signed_duration_since(created_at);
        if elapsed < chrono::Duration::zero() {
            warn!("system clock went backwards during rotation check, treating key as fresh");
            return false;
        }
        elapsed.num_days() >= i64::from(self.rotation_days)
    }
}

/// A data key whose material is encrypted under the master key.
///
/// This is the only representation of a data key that may leave process
/// memory. The key id doubles as AAD, binding the wrapped blob to its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedDataKey {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    #[serde(with = "crate::envelope::b64")]
    pub iv: Vec<u8>,
    #[serde(with = "crate::envelope::b64")]
    pub tag: Vec<u8>,
    #[serde(with = "crate::envelope::b64")]
    pub wrapped_material: Vec<u8>,
}

#[derive(Debug)]
struct KeyRing {
    active_id: String,
    keys: HashMap<String, Arc<DataKey>>,
}

/// Generates, stores and rotates data keys.
///
/// Rotations serialize on the internal write lock; reads of existing keys
/// take the read lock only and never block each other.
#[derive(Debug)]
pub struct KeyManager {
    master: MasterKey,
    ring: RwLock<KeyRing>,
    policy: RotationPolicy,
}

impl KeyManager {
    /// Create a manager with a freshly generated active key.
    pub fn new(master: MasterKey) -> Self {
        Self::with_policy(master, RotationPolicy::default())
    }

    /// Create a manager with a custom rotation policy.
    pub fn with_policy(master: MasterKey, policy: RotationPolicy) -> Self {
        let initial = Arc::new(DataKey::generate());
        info!(key_id = %initial.id(), "initial data key generated");

        let mut keys = HashMap::new();
        let active_id = initial.id().to_string();
        keys.insert(active_id.clone(), initial);

        Self { master, ring: RwLock::new(KeyRing { active_id, keys }), policy }
    }

    /// Reconstruct a manager from a previously exported wrapped ring.
    ///
    /// # Errors
    /// Returns `KmsError::Configuration` if the ring is empty, names no
    /// active key, or any entry fails to unwrap under the supplied master
    /// key — all fatal at startup.
    pub fn from_wrapped(
        master: MasterKey,
        wrapped: &[WrappedDataKey],
        policy: RotationPolicy,
    ) -> KmsResult<Self> {
        if wrapped.is_empty() {
            return Err(KmsError::configuration_field("keyring", "wrapped key ring is empty"));
        }

        let mut keys = HashMap::new();
        let mut active_id = None;
        for entry in wrapped {
            let material = unwrap_material(&master, entry)?;
            let key =
                Arc::new(DataKey::from_parts(entry.id.clone(), material, entry.created_at));
            if entry.active {
                active_id = Some(entry.id.clone());
            }
            keys.insert(entry.id.clone(), key);
        }

        let active_id = active_id.ok_or_else(|| {
            KmsError::configuration_field("keyring", "wrapped key ring has no active key")
        })?;

        info!(keys = keys.len(), active_key_id = %active_id, "key ring restored");
        Ok(Self { master, ring: RwLock::new(KeyRing { active_id, keys }), policy })
    }

    /// The key used for new encryptions.
    pub fn active_key(&self) -> Arc<DataKey> {
        let ring = self.ring.read();
        Arc::clone(&ring.keys[&ring.active_id])
    }

    /// Id of the currently active key.
    pub fn active_key_id(&self) -> String {
        self.ring.read().active_id.clone()
    }

    /// Resolve a specific key by id, active or historical.
    ///
    /// # Errors
    /// Returns `KmsError::NotFound` for unknown ids.
    pub fn key(&self, id: &str) -> KmsResult<Arc<DataKey>> {
        self.ring
            .read()
            .keys
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| KmsError::not_found(id))
    }

    /// Generate a new data key, mark it active, and demote the previous
    /// active key to historical.
    ///
    /// Atomic with respect to concurrent encryption: callers that already
    /// hold the old `Arc<DataKey>` finish with it; callers that read after
    /// the swap observe the new key.
    pub fn rotate_data_key(&self) -> Arc<DataKey> {
        let new_key = Arc::new(DataKey::generate());

        let mut ring = self.ring.write();
        let previous = std::mem::replace(&mut ring.active_id, new_key.id().to_string());
        ring.keys.insert(new_key.id().to_string(), Arc::clone(&new_key));
        drop(ring);

        info!(previous_key_id = %previous, new_key_id = %new_key.id(), "data key rotated");
        new_key
    }

    /// Number of keys in the ring (active + historical).
    pub fn key_count(&self) -> usize {
        self.ring.read().keys.len()
    }

    /// Whether the active key has outlived the rotation policy.
    pub fn rotation_due(&self) -> bool {
        self.policy.is_due(self.active_key().created_at())
    }

    /// Metadata for every key in the ring. Never includes material.
    pub fn list_keys(&self) -> Vec<DataKeyInfo> {
        let ring = self.ring.read();
        let mut infos: Vec<DataKeyInfo> = ring
            .keys
            .values()
            .map(|key| DataKeyInfo {
                id: key.id().to_string(),
                created_at: key.created_at(),
                active: key.id() == ring.active_id,
            })
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Fingerprint of the master key, for status output.
    pub fn master_fingerprint(&self) -> &str {
        self.master.fingerprint()
    }

    /// Export the full ring with every key's material encrypted under the
    /// master key. Safe to persist.
    pub fn export_wrapped(&self) -> KmsResult<Vec<WrappedDataKey>> {
        let ring = self.ring.read();
        let mut wrapped = Vec::with_capacity(ring.keys.len());
        for key in ring.keys.values() {
            wrapped.push(wrap_material(&self.master, key, key.id() == ring.active_id)?);
        }
        wrapped.sort_by_key(|entry| entry.created_at);
        Ok(wrapped)
    }
}

fn master_cipher(master: &MasterKey) -> KmsResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(master.material())
        .map_err(|e| KmsError::internal(format!("failed to build key-wrap cipher: {e}")))
}

fn wrap_material(master: &MasterKey, key: &DataKey, active: bool) -> KmsResult<WrappedDataKey> {
    let cipher = master_cipher(master)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut out = cipher
        .encrypt(&Nonce::from(iv), Payload { msg: key.material(), aad: key.id().as_bytes() })
        .map_err(|e| KmsError::internal(format!("key wrap failed: {e}")))?;
    let tag = out.split_off(out.len() - TAG_LEN);

    Ok(WrappedDataKey {
        id: key.id().to_string(),
        created_at: key.created_at(),
        active,
        iv: iv.to_vec(),
        tag,
        wrapped_material: out,
    })
}

fn unwrap_material(
    master: &MasterKey,
    entry: &WrappedDataKey,
) -> KmsResult<[u8; DATA_KEY_LEN]> {
    if entry.iv.len() != IV_LEN || entry.tag.len() != TAG_LEN {
        return Err(KmsError::configuration_field(
            "keyring",
            format!("wrapped key '{}' has malformed iv or tag", entry.id),
        ));
    }

    let cipher = master_cipher(master)?;
    let mut buffer = entry.wrapped_material.clone();
    buffer.extend_from_slice(&entry.tag);

    let iv: [u8; IV_LEN] = entry.iv.as_slice().try_into().map_err(|_| {
        KmsError::configuration_field("keyring", format!("wrapped key '{}' iv length", entry.id))
    })?;

    let material = Zeroizing::new(
        cipher
            .decrypt(&Nonce::from(iv), Payload { msg: &buffer, aad: entry.id.as_bytes() })
            .map_err(|_| {
                warn!(key_id = %entry.id, "failed to unwrap data key under supplied master key");
                KmsError::configuration_field(
                    "keyring",
                    format!("failed to unwrap data key '{}' under the supplied master key", entry.id),
                )
            })?,
    );

    if material.len() != DATA_KEY_LEN {
        return Err(KmsError::configuration_field(
            "keyring",
            format!("unwrapped key '{}' has unexpected length", entry.id),
        ));
    }

    let mut bytes = [0u8; DATA_KEY_LEN];
    bytes.copy_from_slice(&material);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    //! Unit tests for data key management.
    use super::*;
    use crate::master_key::MasterKey;

    /// Validates `KeyManager::new` behavior for the initial ring scenario.
    ///
    /// Assertions:
    /// - Confirms exactly one key exists and it is active.
    #[test]
    fn new_manager_has_one_active_key() {
        let manager = KeyManager::new(MasterKey::generate());
        assert_eq!(manager.key_count(), 1);

        let infos = manager.list_keys();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].active);
        assert_eq!(infos[0].id, manager.active_key_id());
    }

    /// Validates `KeyManager::rotate_data_key` behavior for the history
    /// preservation scenario.
    ///
    /// Assertions:
    /// - Confirms the old key remains resolvable by id after rotation.
    /// - Confirms the active id changed to the new key.
    #[test]
    fn rotation_preserves_history() {
        let manager = KeyManager::new(MasterKey::generate());
        let old_id = manager.active_key_id();

        let new_key = manager.rotate_data_key();
        assert_ne!(new_key.id(), old_id);
        assert_eq!(manager.active_key_id(), new_key.id());
        assert_eq!(manager.key_count(), 2);

        let old_key = manager.key(&old_id).unwrap();
        assert_eq!(old_key.id(), old_id);
    }

    /// Validates `KeyManager::key` behavior for the unknown id scenario.
    ///
    /// Assertions:
    /// - Ensures a `NotFound` error surfaces.
    #[test]
    fn unknown_key_id_is_not_found() {
        let manager = KeyManager::new(MasterKey::generate());
        let err = manager.key("no-such-key").unwrap_err();
        assert!(matches!(err, KmsError::NotFound { .. }));
    }

    // MasterKey is deliberately not Clone; tests that need the same key in
    // two places rebuild it from the encoded material.
    fn reload_master(key: &MasterKey) -> MasterKey {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        use crate::master_key::{KeySource, MasterKeyProvider};
        let encoded = vaultic_common::SecretString::new(BASE64.encode(key.material()));
        MasterKeyProvider::load(&KeySource::Direct { encoded }).unwrap()
    }

    /// Validates wrapped export/import round-trip of the key ring.
    ///
    /// Assertions:
    /// - Confirms restored keys decrypt to the same material.
    /// - Confirms the active id survives the round trip.
    #[test]
    fn wrapped_ring_round_trip() {
        let master = MasterKey::generate();
        let master_copy = reload_master(&master);

        let manager = KeyManager::new(master);
        manager.rotate_data_key();
        let active_id = manager.active_key_id();
        let active_material = *manager.active_key().material();

        let wrapped = manager.export_wrapped().unwrap();
        assert_eq!(wrapped.len(), 2);

        let restored =
            KeyManager::from_wrapped(master_copy, &wrapped, RotationPolicy::default()).unwrap();
        assert_eq!(restored.active_key_id(), active_id);
        assert_eq!(restored.active_key().material(), &active_material);
        assert_eq!(restored.key_count(), 2);
    }

    /// Validates `KeyManager::from_wrapped` behavior for the wrong master
    /// key scenario.
    ///
    /// Assertions:
    /// - Ensures unwrapping under a different master key fails with a
    ///   `Configuration` error.
    #[test]
    fn wrong_master_key_fails_unwrap() {
        let manager = KeyManager::new(MasterKey::generate());
        let wrapped = manager.export_wrapped().unwrap();

        let err =
            KeyManager::from_wrapped(MasterKey::generate(), &wrapped, RotationPolicy::default())
                .unwrap_err();
        assert!(matches!(err, KmsError::Configuration { .. }));
    }

    /// Validates `RotationPolicy::is_due` behavior for fresh and aged keys.
    ///
    /// Assertions:
    /// - Ensures a just-created key is not due.
    /// - Ensures a key older than the period is due.
    /// - Ensures a future-dated key (clock skew) is not due.
    #[test]
    fn rotation_policy_due_checks() {
        let policy = RotationPolicy { rotation_days: 30 };
        assert!(!policy.is_due(Utc::now()));
        assert!(policy.is_due(Utc::now() - chrono::Duration::days(31)));
        assert!(!policy.is_due(Utc::now() + chrono::Duration::hours(1)));
    }

    /// Validates `DataKey` debug output for the redaction scenario.
    ///
    /// Assertions:
    /// - Ensures key material never appears in debug formatting.
    #[test]
    fn data_key_debug_redacts_material() {
        let manager = KeyManager::new(MasterKey::generate());
        let debug = format!("{:?}", manager.active_key());
        assert!(debug.contains("[REDACTED]"));
    }

}
