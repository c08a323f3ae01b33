//! Secret value wrapper with automatic memory zeroization.
//!
//! Every plaintext secret in the subsystem lives inside a [`SecretString`]
//! from the moment it is decrypted (or read from bootstrap input) until it
//! is dropped. The wrapper redacts itself through every generic path a
//! value can leak: `Debug`, `Display`, and `Serialize` all produce `***`,
//! and the underlying memory is zeroed on drop. Reading the plaintext is
//! only possible through the deliberate [`SecretString::expose`] call.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secret string that zeroes memory on drop and redacts on stringify.
///
/// # Security Note
/// While this type implements `Eq` for convenience, prefer
/// [`SecretString::constant_time_eq`] for security-sensitive comparisons to
/// prevent timing attacks.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    /// Create a new secret string.
    pub fn new(s: String) -> Self {
        Self { inner: s }
    }

    /// Expose the inner value (use with caution).
    ///
    /// # Security Warning
    /// The exposed value should not be stored or logged.
    /// Use only for immediate operations that require the string value.
    pub fn expose(&self) -> &str {
        &self.inner
    }

    /// Expose the inner value as bytes, for encryption input.
    pub fn expose_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    /// Get length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Compare with another secret string in constant time.
    pub fn constant_time_eq(&self, other: &SecretString) -> bool {
        constant_time_eq(self.inner.as_bytes(), other.inner.as_bytes())
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl FromStr for SecretString {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.to_string()))
    }
}

// PartialEq and Eq for convenience. Not constant-time; use
// constant_time_eq() for security-sensitive comparisons.
impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for SecretString {}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString(***)")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

// Serialization always redacts. A SecretString that ends up inside a
// status payload, a log-friendly struct, or an accidental to_json emits
// "***" rather than the plaintext.
impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

// Deserialization from a plain string is allowed so bootstrap seed files
// can carry secret values into the store.
impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SecretVisitor;

        impl Visitor<'_> for SecretVisitor {
            type Value = SecretString;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a secret string value")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(SecretString::new(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(SecretString::new(v))
            }
        }

        deserializer.deserialize_string(SecretVisitor)
    }
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}
