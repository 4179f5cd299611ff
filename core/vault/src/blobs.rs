//! Encrypted blob files inside the vault directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::VaultLayout;
use satchel_common::Result;
use satchel_crypto::{decrypt_file, encrypt_file, SessionKey};

/// Length of a blob token: a UUID in simple form.
pub const TOKEN_LENGTH: usize = 32;

/// Fresh random blob token.
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether a file name inside a prefix directory looks like a blob.
///
/// Anything with an extension is left alone.
pub fn is_blob_name(name: &str) -> bool {
    name.len() >= 2 && !name.contains('.')
}

/// Blob files stored under two-character prefix directories.
#[derive(Debug, Clone)]
pub struct BlobStore {
    layout: VaultLayout,
}

impl BlobStore {
    pub fn new(layout: VaultLayout) -> Self {
        Self { layout }
    }

    pub fn path_for(&self, token: &str) -> PathBuf {
        self.layout.blob_path(token)
    }

    pub fn exists(&self, token: &str) -> bool {
        self.path_for(token).is_file()
    }

    /// Encrypt `source` into the blob, replacing previous content.
    ///
    /// On failure the partial blob is left for the caller to discard.
    pub fn write_from(&self, source: &Path, token: &str, key: &SessionKey) -> Result<u64> {
        fs::create_dir_all(self.layout.blob_dir(token))?;
        let written = encrypt_file(source, &self.path_for(token), key)?;
        debug!(token, bytes = written, "Wrote blob");
        Ok(written)
    }

    /// Decrypt the blob into `target`.
    ///
    /// A failed decryption removes the partial target.
    pub fn read_to(&self, token: &str, target: &Path, key: &SessionKey) -> Result<u64> {
        match decrypt_file(&self.path_for(token), target, key) {
            Ok(read) => Ok(read),
            Err(e) => {
                discard(target);
                Err(e)
            }
        }
    }

    /// Remove a blob and its prefix directory once empty.
    ///
    /// Returns whether a blob was removed.
    pub fn remove(&self, token: &str) -> Result<bool> {
        let path = self.path_for(token);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        // Fails harmlessly while other blobs share the directory.
        let _ = fs::remove_dir(self.layout.blob_dir(token));
        Ok(true)
    }
}

/// Best-effort removal of a partial output file.
pub(crate) fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove partial file");
        }
    }
}
