//! Key derivation using PBKDF2-HMAC-SHA256.
//!
//! One derivation yields 48 bytes: the first 32 become the AES-256 key and
//! the remaining 16 the CFB initialization block.

use hmac::Hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::keys::{Salt, SessionKey, IV_LENGTH, KEY_LENGTH};
use satchel_common::{Error, Result};

/// Iteration count used for vaults unless configured otherwise.
pub const DEFAULT_ITERATIONS: u32 = 50_000;

/// Lowest iteration count accepted by [`KdfParams::with_iterations`].
pub const MIN_ITERATIONS: u32 = 1_000;

/// Parameters for PBKDF2 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Number of PBKDF2 rounds.
    pub iterations: u32,
}

impl KdfParams {
    /// Create parameters with a custom iteration count.
    ///
    /// # Errors
    /// - Returns error if `iterations` is below [`MIN_ITERATIONS`]
    pub fn with_iterations(iterations: u32) -> Result<Self> {
        if iterations < MIN_ITERATIONS {
            return Err(Error::InvalidInput(format!(
                "KDF iterations must be at least {}, got {}",
                MIN_ITERATIONS, iterations
            )));
        }
        Ok(Self { iterations })
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// Derive a session key from a secret and salt.
///
/// The secret is either the user password (yielding the wrapping key for
/// the control file) or the actual key seed (yielding the vault session key).
///
/// # Errors
/// - Returns error if `secret` is empty
/// - Returns error if the PBKDF2 output length is rejected
///
/// # Security
/// - The secret is not stored or logged
/// - The intermediate buffer is zeroized after derivation
pub fn derive_key(secret: &[u8], salt: &Salt, params: &KdfParams) -> Result<SessionKey> {
    if secret.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let mut output = [0u8; KEY_LENGTH + IV_LENGTH];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(secret, salt.as_bytes(), params.iterations, &mut output)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    let mut key = [0u8; KEY_LENGTH];
    let mut iv = [0u8; IV_LENGTH];
    key.copy_from_slice(&output[..KEY_LENGTH]);
    iv.copy_from_slice(&output[KEY_LENGTH..]);
    output.zeroize();

    Ok(SessionKey::from_parts(key, iv))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams::with_iterations(MIN_ITERATIONS).unwrap()
    }

    #[test]
    fn test_default_iterations() {
        assert_eq!(KdfParams::default().iterations, 50_000);
    }

    #[test]
    fn test_too_few_iterations_rejected() {
        assert!(KdfParams::with_iterations(10).is_err());
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = Salt::from_bytes([42u8; 32]);

        let key1 = derive_key(b"test-password-123", &salt, &fast()).unwrap();
        let key2 = derive_key(b"test-password-123", &salt, &fast()).unwrap();

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_derive_key_different_salt() {
        let key1 = derive_key(b"pw", &Salt::from_bytes([1u8; 32]), &fast()).unwrap();
        let key2 = derive_key(b"pw", &Salt::from_bytes([2u8; 32]), &fast()).unwrap();

        assert_ne!(key1.key(), key2.key());
    }

    #[test]
    fn test_derive_key_different_password() {
        let salt = Salt::from_bytes([42u8; 32]);

        let key1 = derive_key(b"password1", &salt, &fast()).unwrap();
        let key2 = derive_key(b"password2", &salt, &fast()).unwrap();

        assert_ne!(key1.key(), key2.key());
    }

    #[test]
    fn test_key_and_iv_differ() {
        let key = derive_key(b"pw", &Salt::from_bytes([9u8; 32]), &fast()).unwrap();
        assert_ne!(&key.key()[..IV_LENGTH], &key.iv()[..]);
    }

    #[test]
    fn test_derive_key_empty_password_fails() {
        assert!(derive_key(b"", &Salt::generate(), &fast()).is_err());
    }
}
