//! Vault directory layout and engine options.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use satchel_common::{local_host_name, Error, Result};
use satchel_crypto::KdfParams;

/// Salt and wrapped key seed.
pub const CONTROL_FILENAME: &str = "control.dat";
/// Encrypted index.
pub const INDEX_FILENAME: &str = "index.dat";
/// Previous generation of the encrypted index.
pub const INDEX_BACKUP_FILENAME: &str = "index.bak";
/// Encrypted index being written during close.
pub const INDEX_NEW_FILENAME: &str = "index.new";

/// Free space kept in reserve on the vault device.
pub const DEFAULT_HEADROOM_BYTES: u64 = 5 * 1024 * 1024;

/// Where everything lives inside a vault directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn control_path(&self) -> PathBuf {
        self.root.join(CONTROL_FILENAME)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }

    pub fn index_backup_path(&self) -> PathBuf {
        self.root.join(INDEX_BACKUP_FILENAME)
    }

    pub fn index_new_path(&self) -> PathBuf {
        self.root.join(INDEX_NEW_FILENAME)
    }

    /// Directory holding a blob: the first two characters of its token.
    pub fn blob_dir(&self, token: &str) -> PathBuf {
        self.root.join(token.get(..2).unwrap_or(token))
    }

    pub fn blob_path(&self, token: &str) -> PathBuf {
        self.blob_dir(token).join(token)
    }

    /// Whether a vault has been created here.
    pub fn exists(&self) -> bool {
        self.control_path().is_file()
    }
}

/// Engine options.
///
/// Missing fields in a JSON options file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultOptions {
    /// Name recorded on every entry this machine syncs.
    pub host_name: String,
    /// Free space that must remain after each new blob.
    pub headroom_bytes: u64,
    pub kdf: KdfParams,
    /// Extract below this folder instead of the original locations.
    pub extract_folder: Option<PathBuf>,
    /// Where the decrypted working index lives while a vault is open.
    /// Defaults to the system temporary directory.
    pub work_folder: Option<PathBuf>,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            host_name: local_host_name(),
            headroom_bytes: DEFAULT_HEADROOM_BYTES,
            kdf: KdfParams::default(),
            extract_folder: None,
            work_folder: None,
        }
    }
}

impl VaultOptions {
    /// Load options from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_name.trim().is_empty() {
            return Err(Error::InvalidInput("Host name cannot be empty".to_string()));
        }
        KdfParams::with_iterations(self.kdf.iterations)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_paths_use_two_character_prefix() {
        let layout = VaultLayout::new("/vault");
        let token = "3fa85f6457174562b3fc2c963f66afa6";

        assert_eq!(layout.blob_dir(token), PathBuf::from("/vault/3f"));
        assert_eq!(layout.blob_path(token), PathBuf::from("/vault/3f").join(token));
        assert_eq!(layout.control_path(), PathBuf::from("/vault/control.dat"));
    }

    #[test]
    fn test_partial_options_use_defaults() {
        let options = VaultOptions::from_json(r#"{ "host_name": "laptop" }"#).unwrap();

        assert_eq!(options.host_name, "laptop");
        assert_eq!(options.headroom_bytes, DEFAULT_HEADROOM_BYTES);
        assert_eq!(options.kdf, KdfParams::default());
        assert!(options.extract_folder.is_none());
        assert!(options.work_folder.is_none());
    }

    #[test]
    fn test_options_json_roundtrip() {
        let options = VaultOptions {
            host_name: "desk".to_string(),
            headroom_bytes: 1,
            kdf: KdfParams::with_iterations(1_000).unwrap(),
            extract_folder: Some(PathBuf::from("/restore")),
            work_folder: Some(PathBuf::from("/scratch")),
        };
        let text = options.to_json().unwrap();
        assert_eq!(VaultOptions::from_json(&text).unwrap(), options);
    }

    #[test]
    fn test_options_reject_weak_kdf() {
        let result = VaultOptions::from_json(r#"{ "kdf": { "iterations": 10 } }"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
