//! Self-describing encrypted envelope format.
//!
//! An [`Envelope`] is the unit everything else in the subsystem stores and
//! moves: the AES-256-GCM output of one encryption call, together with the
//! metadata needed to decrypt it later without any out-of-band knowledge.
//! The `key_id` field binds the envelope to the exact data key that
//! produced it, which is what decouples key rotation from the ability to
//! read old data.
//!
//! ## Wire format
//!
//! Envelopes serialize to JSON with short field names and base64 byte
//! fields, bit-exact where persisted or transmitted:
//!
//! ```json
//! {
//!   "v": 1,
//!   "alg": "aes-256-gcm",
//!   "keyId": "<string>",
//!   "iv": "<base64, 12 raw bytes>",
//!   "tag": "<base64, 16 raw bytes>",
//!   "ciphertext": "<base64>",
//!   "aad": "<base64, optional>",
//!   "timestamp": <unix millis>
//! }
//! ```

use serde::{Deserialize, Serialize};
use vaultic_common::{KmsError, KmsResult};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// The only algorithm this subsystem produces or consumes.
pub const ALGORITHM: &str = "aes-256-gcm";

/// AES-GCM initialization vector length in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// Self-describing encrypted payload. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope format version.
    #[serde(rename = "v")]
    pub version: u32,

    /// Cipher identifier; always [`ALGORITHM`].
    #[serde(rename = "alg")]
    pub algorithm: String,

    /// Id of the data key that produced this envelope.
    #[serde(rename = "keyId")]
    pub key_id: String,

    /// Fresh random IV, generated per encryption call.
    #[serde(with = "b64")]
    pub iv: Vec<u8>,

    /// GCM authentication tag over ciphertext and AAD.
    #[serde(with = "b64")]
    pub tag: Vec<u8>,

    /// The encrypted payload.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,

    /// Additional authenticated data bound into the tag, stored in clear.
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub aad: Option<Vec<u8>>,

    /// Creation time, unix milliseconds.
    pub timestamp: i64,
}

impl Envelope {
    /// Serialize to the JSON wire representation.
    pub fn to_json(&self) -> KmsResult<String> {
        serde_json::to_string(self).map_err(KmsError::from)
    }

    /// Parse an envelope from its JSON wire representation.
    pub fn from_json(raw: &str) -> KmsResult<Self> {
        serde_json::from_str(raw).map_err(KmsError::from)
    }
}

/// Base64 (standard alphabet) encoding for byte fields.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Base64 encoding for optional byte fields.
pub(crate) mod b64_opt {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
