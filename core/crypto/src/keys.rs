//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of the CFB initialization block in bytes (128-bit).
pub const IV_LENGTH: usize = 16;

/// Length of salts and key seeds in bytes.
pub const SALT_LENGTH: usize = 32;

/// Symmetric key plus initialization block used for every stream transform.
///
/// Derived either from the user password (to wrap the key seed) or from the
/// key seed itself (the session key that encrypts blobs and the index).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    key: [u8; KEY_LENGTH],
    iv: [u8; IV_LENGTH],
}

impl SessionKey {
    /// Create a session key from raw parts.
    pub fn from_parts(key: [u8; KEY_LENGTH], iv: [u8; IV_LENGTH]) -> Self {
        Self { key, iv }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn key(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Get the initialization block.
    pub fn iv(&self) -> &[u8; IV_LENGTH] {
        &self.iv
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        let key_eq = self.key[..].ct_eq(&other.key[..]);
        let iv_eq = self.iv[..].ct_eq(&other.iv[..]);
        (key_eq & iv_eq).into()
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Password-independent secret the session key is derived from.
///
/// Generated once at vault creation and stable across password changes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySeed([u8; SALT_LENGTH]);

impl KeySeed {
    /// Generate a random key seed.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut seed);
        Self(seed)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the seed bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for KeySeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySeed([REDACTED])")
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}
