//! Vault control file and password management.
//!
//! The session key is never derived from the password directly. A random
//! salt and a random key seed are generated once at vault creation; the seed
//! is stored wrapped under a key derived from `salt + password`, and the
//! session key is derived from `salt + seed`. Changing the password only
//! rewraps the seed, so no blob ever needs re-encryption.
//!
//! Layout (80 bytes): `salt[32] || AES-256-CFB(wrap_key, seed[32] || check[16])`
//! where `check` is the first 16 bytes of SHA-256(seed).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::kdf::{derive_key, KdfParams};
use crate::keys::{KeySeed, Salt, SessionKey, SALT_LENGTH};
use crate::stream::{decrypt_bytes, encrypt_bytes};
use satchel_common::{Error, Result};

const CHECK_LENGTH: usize = 16;

/// Length of the wrapped key seed in bytes.
pub const WRAPPED_LENGTH: usize = SALT_LENGTH + CHECK_LENGTH;

/// Exact size of a control file in bytes.
pub const CONTROL_FILE_LEN: usize = SALT_LENGTH + WRAPPED_LENGTH;

/// Persisted salt and password-wrapped key seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub salt: Salt,
    pub wrapped: [u8; WRAPPED_LENGTH],
}

impl ControlRecord {
    /// Serialize to the fixed-size on-disk form.
    pub fn to_bytes(&self) -> [u8; CONTROL_FILE_LEN] {
        let mut out = [0u8; CONTROL_FILE_LEN];
        out[..SALT_LENGTH].copy_from_slice(self.salt.as_bytes());
        out[SALT_LENGTH..].copy_from_slice(&self.wrapped);
        out
    }

    /// Parse the on-disk form.
    ///
    /// # Errors
    /// - `InvalidCredentials` if the length is wrong; a damaged control file
    ///   is indistinguishable from one the password cannot open
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CONTROL_FILE_LEN {
            debug!(len = bytes.len(), "Control file has unexpected length");
            return Err(Error::InvalidCredentials);
        }
        let mut salt = [0u8; SALT_LENGTH];
        let mut wrapped = [0u8; WRAPPED_LENGTH];
        salt.copy_from_slice(&bytes[..SALT_LENGTH]);
        wrapped.copy_from_slice(&bytes[SALT_LENGTH..]);
        Ok(Self {
            salt: Salt::from_bytes(salt),
            wrapped,
        })
    }

    /// Read a control file.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Write a control file, replacing any existing content.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Derives session keys from a password and the vault control file.
#[derive(Debug, Clone, Default)]
pub struct KeyManager {
    params: KdfParams,
}

impl KeyManager {
    /// Create a key manager with the given KDF parameters.
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// KDF parameters in use.
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Derive the session key, creating the control file if it is missing.
    ///
    /// # Postconditions
    /// - If the control file did not exist it now holds a fresh salt and a
    ///   fresh key seed wrapped under `password`
    /// - An existing control file is never modified
    ///
    /// # Errors
    /// - `InvalidCredentials` if the password does not unwrap the seed or the
    ///   file is malformed
    /// - `InvalidInput` if the password is empty
    /// - I/O errors reading or writing the control file
    pub fn derive_or_initialize(&self, control_path: &Path, password: &[u8]) -> Result<SessionKey> {
        if password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }

        if control_path.exists() {
            let record = ControlRecord::read(control_path)?;
            let seed = self.unwrap_seed(&record, password)?;
            return derive_key(seed.as_bytes(), &record.salt, &self.params);
        }

        let salt = Salt::generate();
        let seed = KeySeed::generate();
        let record = ControlRecord {
            wrapped: self.wrap_seed(&salt, password, &seed)?,
            salt,
        };
        record.write(control_path)?;
        info!(path = %control_path.display(), "Created vault control file");

        derive_key(seed.as_bytes(), &record.salt, &self.params)
    }

    /// Rewrap the key seed under a new password.
    ///
    /// The control file is copied to a `.bak` sibling first. A wrong old
    /// password aborts before anything is written. If writing the new file
    /// fails, the backup is moved back over the control file. The backup is
    /// removed only after the new file is fully written.
    ///
    /// # Postconditions
    /// - Returns the same session key as before; blobs stay decryptable
    ///
    /// # Errors
    /// - `InvalidCredentials` if `old_password` is wrong
    /// - `InvalidInput` if `new_password` is empty
    pub fn change_password(
        &self,
        control_path: &Path,
        old_password: &[u8],
        new_password: &[u8],
    ) -> Result<SessionKey> {
        self.rewrap(control_path, old_password, new_password, ControlRecord::write)
    }

    fn rewrap(
        &self,
        control_path: &Path,
        old_password: &[u8],
        new_password: &[u8],
        write: impl FnOnce(&ControlRecord, &Path) -> Result<()>,
    ) -> Result<SessionKey> {
        if new_password.is_empty() {
            return Err(Error::InvalidInput("New password cannot be empty".to_string()));
        }

        let backup = backup_path(control_path);
        fs::copy(control_path, &backup)?;

        let record = match ControlRecord::read(control_path) {
            Ok(record) => record,
            Err(e) => {
                discard_backup(&backup);
                return Err(e);
            }
        };
        let seed = match self.unwrap_seed(&record, old_password) {
            Ok(seed) => seed,
            Err(e) => {
                discard_backup(&backup);
                return Err(e);
            }
        };

        let written = self
            .wrap_seed(&record.salt, new_password, &seed)
            .and_then(|wrapped| {
                let updated = ControlRecord {
                    salt: record.salt.clone(),
                    wrapped,
                };
                write(&updated, control_path)
            });

        if let Err(e) = written {
            warn!(error = %e, "Password change failed, restoring control file");
            restore_backup(&backup, control_path)?;
            return Err(e);
        }

        discard_backup(&backup);
        info!("Vault password changed");
        derive_key(seed.as_bytes(), &record.salt, &self.params)
    }

    fn wrap_seed(&self, salt: &Salt, password: &[u8], seed: &KeySeed) -> Result<[u8; WRAPPED_LENGTH]> {
        let wrap_key = derive_key(password, salt, &self.params)?;

        let mut plain = Zeroizing::new([0u8; WRAPPED_LENGTH]);
        plain[..SALT_LENGTH].copy_from_slice(seed.as_bytes());
        plain[SALT_LENGTH..].copy_from_slice(&seed_check(seed.as_bytes()));

        let encrypted = encrypt_bytes(&wrap_key, &plain[..])?;
        let mut wrapped = [0u8; WRAPPED_LENGTH];
        wrapped.copy_from_slice(&encrypted);
        Ok(wrapped)
    }

    fn unwrap_seed(&self, record: &ControlRecord, password: &[u8]) -> Result<KeySeed> {
        let wrap_key = derive_key(password, &record.salt, &self.params)?;
        let plain = Zeroizing::new(decrypt_bytes(&wrap_key, &record.wrapped)?);
        if plain.len() != WRAPPED_LENGTH {
            return Err(Error::InvalidCredentials);
        }

        let mut seed = [0u8; SALT_LENGTH];
        seed.copy_from_slice(&plain[..SALT_LENGTH]);
        let seed = KeySeed::from_bytes(seed);

        let expected = seed_check(seed.as_bytes());
        if !bool::from(expected[..].ct_eq(&plain[SALT_LENGTH..])) {
            return Err(Error::InvalidCredentials);
        }
        Ok(seed)
    }
}

fn seed_check(seed: &[u8]) -> [u8; CHECK_LENGTH] {
    let digest = Sha256::digest(seed);
    let mut check = [0u8; CHECK_LENGTH];
    check.copy_from_slice(&digest[..CHECK_LENGTH]);
    check
}

/// Path of the backup kept while a password change is in flight.
pub fn backup_path(control_path: &Path) -> PathBuf {
    control_path.with_extension("bak")
}

fn restore_backup(backup: &Path, control_path: &Path) -> Result<()> {
    if backup.exists() {
        fs::rename(backup, control_path)?;
    }
    Ok(())
}

fn discard_backup(backup: &Path) {
    if let Err(e) = fs::remove_file(backup) {
        warn!(path = %backup.display(), error = %e, "Could not remove control backup");
    }
}
