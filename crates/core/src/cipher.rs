//! Stateless AES-256-GCM envelope encryption.
//!
//! [`EnvelopeCipher`] is the single authenticated-encryption primitive in
//! the subsystem. It carries no state: every call is a pure function of
//! the plaintext, the supplied [`DataKey`] and the optional AAD, plus a
//! fresh random IV, so it is safe to invoke concurrently from any number
//! of callers.
//!
//! Decryption fails closed. Any authentication mismatch — wrong key,
//! tampered ciphertext or tag, AAD that differs from the one bound at
//! encryption time — yields `KmsError::Decryption` and never partial
//! plaintext. Those failures are security-relevant and are logged to the
//! audit sink here, without any payload data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::error;
use vaultic_common::{KmsError, KmsResult};

use crate::envelope::{Envelope, ALGORITHM, ENVELOPE_VERSION, IV_LEN, TAG_LEN};
use crate::keys::DataKey;

/// Stateless authenticated-encryption primitive over data keys.
pub struct EnvelopeCipher;

impl EnvelopeCipher {
    /// Encrypt `plaintext` under `key`, producing a self-describing
    /// envelope.
    ///
    /// A fresh 12-byte IV is generated per call; no two envelopes ever
    /// share an IV under the same key. The optional AAD is bound into the
    /// authentication tag and stored in clear inside the envelope.
    pub fn encrypt(plaintext: &[u8], key: &DataKey, aad: Option<&[u8]>) -> KmsResult<Envelope> {
        let cipher = data_key_cipher(key)?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut out = cipher
            .encrypt(&Nonce::from(iv), Payload { msg: plaintext, aad: aad.unwrap_or(&[]) })
            .map_err(|e| KmsError::internal(format!("encryption failed: {e}")))?;
        let tag = out.split_off(out.len() - TAG_LEN);

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            algorithm: ALGORITHM.to_string(),
            key_id: key.id().to_string(),
            iv: iv.to_vec(),
            tag,
            ciphertext: out,
            aad: aad.map(<[u8]>::to_vec),
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Decrypt an envelope with the data key its `keyId` references.
    ///
    /// When `aad` is `None`, the AAD stored in the envelope (if any) is
    /// used; passing `Some` lets the caller re-assert the binding context
    /// explicitly, and a mismatch fails authentication.
    ///
    /// # Errors
    /// Returns `KmsError::Decryption` on any authentication failure, key
    /// mismatch, or malformed envelope field. Never returns partial
    /// plaintext.
    pub fn decrypt(envelope: &Envelope, key: &DataKey, aad: Option<&[u8]>) -> KmsResult<Vec<u8>> {
        if envelope.algorithm != ALGORITHM || envelope.version != ENVELOPE_VERSION {
            return Err(audit_failure(&envelope.key_id, "unsupported algorithm or version"));
        }
        if envelope.key_id != key.id() {
            return Err(audit_failure(&envelope.key_id, "envelope references a different key"));
        }
        if envelope.iv.len() != IV_LEN || envelope.tag.len() != TAG_LEN {
            return Err(audit_failure(&envelope.key_id, "malformed iv or tag"));
        }

        let cipher = data_key_cipher(key)?;

        let iv: [u8; IV_LEN] = envelope
            .iv
            .as_slice()
            .try_into()
            .map_err(|_| audit_failure(&envelope.key_id, "malformed iv"))?;

        let mut buffer = envelope.ciphertext.clone();
        buffer.extend_from_slice(&envelope.tag);

        let aad_bytes = aad.or(envelope.aad.as_deref()).unwrap_or(&[]);

        cipher
            .decrypt(&Nonce::from(iv), Payload { msg: &buffer, aad: aad_bytes })
            .map_err(|_| audit_failure(&envelope.key_id, "authentication tag mismatch"))
    }
}

fn data_key_cipher(key: &DataKey) -> KmsResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.material())
        .map_err(|e| KmsError::internal(format!("failed to build cipher: {e}")))
}

/// Log a decryption failure to the audit sink and build the typed error.
/// The reason describes the check that failed; no payload data is logged.
fn audit_failure(key_id: &str, reason: &str) -> KmsError {
    error!(
        target: "vaultic::audit",
        key_id = %key_id,
        reason = %reason,
        "SECURITY EVENT: envelope decryption failed"
    );
    KmsError::decryption(key_id)
}

#[cfg(test)]
mod tests {
    //! Unit tests for the envelope cipher.
    use super::*;
    use crate::keys::KeyManager;
    use crate::master_key::MasterKey;

    fn manager() -> KeyManager {
        KeyManager::new(MasterKey::generate())
    }

    /// Validates encrypt/decrypt round-trip behavior.
    ///
    /// Assertions:
    /// - Confirms decrypted bytes equal the plaintext, with and without
    ///   AAD.
    #[test]
    fn round_trip() {
        let key = manager().active_key();
        let plaintext = b"sensitive payload";

        let envelope = EnvelopeCipher::encrypt(plaintext, &key, None).unwrap();
        assert_eq!(EnvelopeCipher::decrypt(&envelope, &key, None).unwrap(), plaintext);

        let bound = EnvelopeCipher::encrypt(plaintext, &key, Some(b"user-42")).unwrap();
        assert_eq!(
            EnvelopeCipher::decrypt(&bound, &key, Some(b"user-42")).unwrap(),
            plaintext
        );
    }

    /// Validates IV uniqueness across calls.
    ///
    /// Assertions:
    /// - Ensures two encryptions of the same plaintext under the same key
    ///   produce different IVs and ciphertexts.
    #[test]
    fn fresh_iv_per_call() {
        let key = manager().active_key();

        let a = EnvelopeCipher::encrypt(b"same input", &key, None).unwrap();
        let b = EnvelopeCipher::encrypt(b"same input", &key, None).unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    /// Validates tamper detection on every authenticated component.
    ///
    /// Assertions:
    /// - Ensures flipping one bit of ciphertext, tag or AAD produces a
    ///   `Decryption` error.
    #[test]
    fn tamper_detection() {
        let key = manager().active_key();
        let envelope = EnvelopeCipher::encrypt(b"payload", &key, Some(b"ctx")).unwrap();

        let mut tampered = envelope.clone();
        tampered.ciphertext[0] ^= 0x01;
        assert!(matches!(
            EnvelopeCipher::decrypt(&tampered, &key, None).unwrap_err(),
            KmsError::Decryption { .. }
        ));

        let mut tampered = envelope.clone();
        tampered.tag[0] ^= 0x01;
        assert!(matches!(
            EnvelopeCipher::decrypt(&tampered, &key, None).unwrap_err(),
            KmsError::Decryption { .. }
        ));

        let mut tampered = envelope.clone();
        if let Some(aad) = tampered.aad.as_mut() {
            aad[0] ^= 0x01;
        }
        assert!(matches!(
            EnvelopeCipher::decrypt(&tampered, &key, None).unwrap_err(),
            KmsError::Decryption { .. }
        ));
    }

    /// Validates explicit AAD mismatch rejection.
    ///
    /// Assertions:
    /// - Ensures decrypting with a different caller-supplied AAD fails.
    #[test]
    fn aad_mismatch_fails() {
        let key = manager().active_key();
        let envelope = EnvelopeCipher::encrypt(b"payload", &key, Some(b"user-1")).unwrap();

        let err = EnvelopeCipher::decrypt(&envelope, &key, Some(b"user-2")).unwrap_err();
        assert!(matches!(err, KmsError::Decryption { .. }));
    }

    /// Validates wrong-key rejection.
    ///
    /// Assertions:
    /// - Ensures an envelope is rejected by a key other than the one its
    ///   `keyId` references.
    #[test]
    fn wrong_key_fails() {
        let km = manager();
        let old_key = km.active_key();
        let envelope = EnvelopeCipher::encrypt(b"payload", &old_key, None).unwrap();

        let new_key = km.rotate_data_key();
        let err = EnvelopeCipher::decrypt(&envelope, &new_key, None).unwrap_err();
        assert!(matches!(err, KmsError::Decryption { .. }));
    }

    /// Validates rotation keeps old envelopes decryptable via `getKey`.
    ///
    /// Assertions:
    /// - Confirms the pre-rotation envelope still decrypts with the
    ///   historical key.
    #[test]
    fn old_envelopes_survive_rotation() {
        let km = manager();
        let old_id = km.active_key_id();
        let envelope = EnvelopeCipher::encrypt(b"before rotation", &km.active_key(), None).unwrap();

        km.rotate_data_key();

        let historical = km.key(&old_id).unwrap();
        assert_eq!(
            EnvelopeCipher::decrypt(&envelope, &historical, None).unwrap(),
            b"before rotation"
        );
    }

    /// Validates algorithm pinning on the decrypt path.
    ///
    /// Assertions:
    /// - Ensures an envelope claiming another algorithm is rejected.
    #[test]
    fn rejects_foreign_algorithm() {
        let key = manager().active_key();
        let mut envelope = EnvelopeCipher::encrypt(b"payload", &key, None).unwrap();
        envelope.algorithm = "aes-128-cbc".to_string();

        let err = EnvelopeCipher::decrypt(&envelope, &key, None).unwrap_err();
        assert!(matches!(err, KmsError::Decryption { .. }));
    }
}
