//! State of an open vault.
//!
//! A session owns the session key, the decrypted working copy of the index
//! and the cancellation flags shared by batches and the validation sweep.
//! The key is zeroized when the session is dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempPath;

use crate::blobs::BlobStore;
use crate::config::VaultLayout;
use crate::space::{ensure_space, SpaceProbe};
use satchel_common::Result;
use satchel_crypto::SessionKey;
use satchel_index::{IgnoreMatcher, IndexStore};

/// Cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings a session takes from the engine options.
#[derive(Clone)]
pub(crate) struct SessionSettings {
    pub host: String,
    pub headroom: u64,
    pub extract_folder: Option<PathBuf>,
    pub probe: Arc<dyn SpaceProbe>,
}

/// An open vault.
pub struct VaultSession {
    layout: VaultLayout,
    // Declared before `working` so the connection closes before the file goes.
    store: IndexStore,
    working: TempPath,
    key: SessionKey,
    blobs: BlobStore,
    settings: SessionSettings,
    ignore: Mutex<Option<Arc<IgnoreMatcher>>>,
    cancel: AbortFlag,
    shutdown: AbortFlag,
}

/// What close needs back from a session.
pub(crate) struct SessionParts {
    pub layout: VaultLayout,
    pub store: IndexStore,
    pub working: TempPath,
    pub key: SessionKey,
}

impl VaultSession {
    pub(crate) fn new(
        layout: VaultLayout,
        key: SessionKey,
        store: IndexStore,
        working: TempPath,
        settings: SessionSettings,
    ) -> Self {
        Self {
            blobs: BlobStore::new(layout.clone()),
            layout,
            store,
            working,
            key,
            settings,
            ignore: Mutex::new(None),
            cancel: AbortFlag::new(),
            shutdown: AbortFlag::new(),
        }
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub(crate) fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Host name recorded on entries synced by this machine.
    pub fn host(&self) -> &str {
        &self.settings.host
    }

    pub fn extract_folder(&self) -> Option<&Path> {
        self.settings.extract_folder.as_deref()
    }

    /// Per-batch user cancel.
    pub fn cancel_flag(&self) -> &AbortFlag {
        &self.cancel
    }

    /// Set once the vault starts closing.
    pub fn shutdown_flag(&self) -> &AbortFlag {
        &self.shutdown
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_set() || self.shutdown.is_set()
    }

    /// Compiled ignore patterns, built on first use after a change.
    pub fn ignore_matcher(&self) -> Result<Arc<IgnoreMatcher>> {
        let mut cached = self.ignore.lock();
        if let Some(matcher) = cached.as_ref() {
            return Ok(Arc::clone(matcher));
        }
        let matcher = Arc::new(IgnoreMatcher::reload(&self.store)?);
        *cached = Some(Arc::clone(&matcher));
        Ok(matcher)
    }

    pub fn invalidate_ignore_matcher(&self) {
        *self.ignore.lock() = None;
    }

    /// Check free space for a blob of `file_size` bytes.
    pub fn ensure_space(&self, file_size: u64) -> Result<()> {
        let index_size = std::fs::metadata(&self.working)?.len();
        ensure_space(
            self.settings.probe.as_ref(),
            self.layout.root(),
            index_size,
            file_size,
            self.settings.headroom,
        )
    }

    pub(crate) fn into_parts(self) -> SessionParts {
        SessionParts {
            layout: self.layout,
            store: self.store,
            working: self.working,
            key: self.key,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::space::FsSpaceProbe;
    use satchel_crypto::{derive_key, KdfParams, Salt};

    pub(crate) fn test_key() -> SessionKey {
        derive_key(
            b"session-test",
            &Salt::from_bytes([7u8; 32]),
            &KdfParams::with_iterations(1_000).unwrap(),
        )
        .unwrap()
    }

    /// A session over `root` with a fresh, empty index.
    pub(crate) fn session(root: &Path, host: &str) -> VaultSession {
        let working = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let store = IndexStore::create(&working).unwrap();
        with_store(root, host, store, working)
    }

    /// Like [`session`], but the index was created and closed beforehand,
    /// so nothing is marked changed yet.
    pub(crate) fn reopened_session(root: &Path, host: &str) -> VaultSession {
        let working = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        IndexStore::create(&working).unwrap().close().unwrap();
        let store = IndexStore::open(&working).unwrap();
        assert!(!store.data_changed());
        with_store(root, host, store, working)
    }

    fn with_store(root: &Path, host: &str, store: IndexStore, working: TempPath) -> VaultSession {
        VaultSession::new(
            VaultLayout::new(root),
            test_key(),
            store,
            working,
            SessionSettings {
                host: host.to_string(),
                headroom: 0,
                extract_folder: None,
                probe: Arc::new(FsSpaceProbe),
            },
        )
    }
}
