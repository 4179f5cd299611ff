//! Vault engine: lifecycle and entry points for every vault operation.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::{NamedTempFile, TempPath};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blobs::discard;
use crate::config::{VaultLayout, VaultOptions};
use crate::operations;
use crate::policy::HostDecisionProvider;
use crate::progress::{BatchReport, ProgressObserver};
use crate::session::{SessionParts, SessionSettings, VaultSession};
use crate::space::{FsSpaceProbe, SpaceProbe};
use crate::validation::{validate, ValidationSummary};
use satchel_common::{Error, Result, SensitiveBytes};
use satchel_crypto::{decrypt_file, encrypt_file, KeyManager, SessionKey};
use satchel_index::{IndexEntry, IndexStore, ListQuery, SyncKind, SyncPoint};

const WRITE_BACK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Closed,
    Creating,
    Open,
}

type ValidationTask = JoinHandle<Result<ValidationSummary>>;

/// Opens, mutates and closes one vault at a time.
///
/// Batches (`sync`, `extract`, `delete`) run on the blocking pool one after
/// another. While a vault is open a validation sweep runs in the
/// background; `close` stops it, waits for it and for any running batch,
/// then writes the index back into the vault if it changed.
pub struct VaultEngine {
    options: VaultOptions,
    keys: KeyManager,
    probe: Arc<dyn SpaceProbe>,
    state: EngineState,
    session: Option<Arc<VaultSession>>,
    validation: Option<ValidationTask>,
    batch_gate: Arc<AsyncMutex<()>>,
}

impl VaultEngine {
    pub fn new(options: VaultOptions) -> Self {
        Self {
            keys: KeyManager::new(options.kdf),
            options,
            probe: Arc::new(FsSpaceProbe),
            state: EngineState::Closed,
            session: None,
            validation: None,
            batch_gate: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Replace the free-space probe used before writing new blobs.
    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn options(&self) -> &VaultOptions {
        &self.options
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn host_name(&self) -> &str {
        &self.options.host_name
    }

    fn session(&self) -> Result<&Arc<VaultSession>> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No vault is open".to_string()))
    }

    fn ensure_closed(&self) -> Result<()> {
        if self.state != EngineState::Closed {
            return Err(Error::InvalidState("A vault is already open".to_string()));
        }
        Ok(())
    }

    // ---- lifecycle ----

    /// Create a new vault in `dir` and open it.
    ///
    /// # Postconditions
    /// - `dir` holds a control file; the index is written on close even if
    ///   nothing is added
    ///
    /// # Errors
    /// - `AlreadyExists` if `dir` already holds a vault
    /// - `InvalidInput` if the password is empty
    pub async fn create(&mut self, dir: &Path, password: &[u8]) -> Result<()> {
        self.ensure_closed()?;
        self.state = EngineState::Creating;

        let layout = VaultLayout::new(dir);
        let keys = self.keys.clone();
        let work = self.options.work_folder.clone();
        let password = SensitiveBytes::from(password);
        let created = run_blocking("create", move || {
            initialize(&layout, &keys, password.as_bytes(), work.as_deref())
                .map(|opened| (layout, opened))
        })
        .await;

        match created {
            Ok((layout, (key, store, working))) => {
                info!(vault = %layout.root().display(), "Vault created");
                self.start(layout, key, store, working);
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Closed;
                Err(e)
            }
        }
    }

    /// Open an existing vault.
    ///
    /// # Errors
    /// - `NotFound` if `dir` holds no vault
    /// - `InvalidCredentials` if the password is wrong or the index cannot
    ///   be read; the vault directory is left untouched
    pub async fn open(&mut self, dir: &Path, password: &[u8]) -> Result<()> {
        self.ensure_closed()?;

        let layout = VaultLayout::new(dir);
        let keys = self.keys.clone();
        let work = self.options.work_folder.clone();
        let password = SensitiveBytes::from(password);
        let (layout, (key, store, working)) = run_blocking("open", move || {
            load_index(&layout, &keys, password.as_bytes(), work.as_deref())
                .map(|opened| (layout, opened))
        })
        .await?;

        info!(vault = %layout.root().display(), host = %self.options.host_name, "Vault opened");
        self.start(layout, key, store, working);
        Ok(())
    }

    fn start(&mut self, layout: VaultLayout, key: SessionKey, store: IndexStore, working: TempPath) {
        let settings = SessionSettings {
            host: self.options.host_name.clone(),
            headroom: self.options.headroom_bytes,
            extract_folder: self.options.extract_folder.clone(),
            probe: Arc::clone(&self.probe),
        };
        let session = Arc::new(VaultSession::new(layout, key, store, working, settings));

        let sweeper = Arc::clone(&session);
        self.validation = Some(tokio::task::spawn_blocking(move || validate(&sweeper)));
        self.session = Some(session);
        self.state = EngineState::Open;
    }

    /// Stop background work and write the index back if it changed.
    ///
    /// Closing an engine with no open vault does nothing.
    pub async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        session.shutdown_flag().set();
        session.cancel_flag().set();

        let _gate = self.batch_gate.lock().await;
        if let Some(task) = self.validation.take() {
            match task.await {
                Ok(Ok(summary)) => debug!(?summary, "Validation stopped"),
                Ok(Err(e)) => warn!(error = %e, "Validation failed"),
                Err(e) => warn!(error = %e, "Validation task failed"),
            }
        }

        let session = match Arc::try_unwrap(session) {
            Ok(session) => session,
            Err(shared) => {
                shared.shutdown_flag().reset();
                shared.cancel_flag().reset();
                self.session = Some(shared);
                return Err(Error::InvalidState("Vault is still in use".to_string()));
            }
        };

        self.state = EngineState::Closed;
        run_blocking("close", move || write_back(session.into_parts())).await
    }

    /// Wait for the background validation sweep started at open.
    ///
    /// Returns `None` when no sweep is pending.
    pub async fn wait_for_validation(&mut self) -> Result<Option<ValidationSummary>> {
        match self.validation.take() {
            Some(task) => task.await.map_err(join_error("validation"))?.map(Some),
            None => Ok(None),
        }
    }

    /// Rewrap the key seed under a new password. The open index stays usable
    /// and no blob is touched.
    pub fn change_password(&self, old_password: &[u8], new_password: &[u8]) -> Result<()> {
        let session = self.session()?;
        let key = self.keys.change_password(
            &session.layout().control_path(),
            old_password,
            new_password,
        )?;
        if &key != session.key() {
            return Err(Error::Invariant(
                "Session key changed with the password".to_string(),
            ));
        }
        Ok(())
    }

    /// Request that the running batch stop after its current item.
    pub fn abort(&self) {
        if let Some(session) = &self.session {
            session.cancel_flag().set();
        }
    }

    // ---- batches ----

    async fn run_batch<F>(&self, name: &'static str, work: F) -> Result<BatchReport>
    where
        F: FnOnce(&VaultSession) -> Result<BatchReport> + Send + 'static,
    {
        let session = Arc::clone(self.session()?);
        let gate = Arc::clone(&self.batch_gate).lock_owned().await;
        session.cancel_flag().reset();

        run_blocking(name, move || {
            let result = work(&session);
            drop(session);
            drop(gate);
            result
        })
        .await
    }

    /// Push every sync point of this host into the vault.
    pub async fn sync(&self, observer: Arc<dyn ProgressObserver>) -> Result<BatchReport> {
        self.run_batch("sync", move |session| {
            operations::sync_all(session, observer.as_ref())
        })
        .await
    }

    /// Decrypt files and folders back to disk, asking `decisions` about
    /// files synced by other hosts.
    pub async fn extract(
        &self,
        items: Vec<IndexEntry>,
        decisions: Arc<dyn HostDecisionProvider>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<BatchReport> {
        self.run_batch("extract", move |session| {
            operations::extract_items(session, &items, decisions.as_ref(), observer.as_ref())
        })
        .await
    }

    /// Remove files and folders with their blobs.
    pub async fn delete(
        &self,
        items: Vec<IndexEntry>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<BatchReport> {
        self.run_batch("delete", move |session| {
            operations::delete_items(session, &items, observer.as_ref())
        })
        .await
    }

    /// Files the next sync would visit.
    pub async fn count_sync_files(&self) -> Result<u64> {
        let session = Arc::clone(self.session()?);
        run_blocking("count", move || operations::count_sync_files(&session)).await
    }

    /// Files below a selection.
    pub fn count_selected(&self, items: &[IndexEntry]) -> Result<u64> {
        operations::count_selected(self.session()?, items)
    }

    /// Decrypt one file to a temporary location removed when dropped.
    pub async fn preview_copy(&self, entry: IndexEntry) -> Result<TempPath> {
        let session = Arc::clone(self.session()?);
        run_blocking("preview", move || operations::preview_copy(&session, &entry)).await
    }

    // ---- index ----

    /// Retag every entry of `old_host` as `new_host`.
    pub fn move_host(&self, old_host: &str, new_host: &str) -> Result<usize> {
        self.session()?.store().move_host(old_host, new_host)
    }

    pub fn hosts(&self) -> Result<Vec<String>> {
        self.session()?.store().list_hosts()
    }

    pub fn list_folder(&self, query: &ListQuery) -> Result<Vec<IndexEntry>> {
        self.session()?.store().list_folder(query)
    }

    /// Folder id for a full path, if the folder exists.
    pub fn find_folder(&self, path: &str) -> Result<Option<i64>> {
        self.session()?.store().find_folder(path)
    }

    pub fn find_or_create_folder(&self, path: &str) -> Result<i64> {
        self.session()?.store().find_or_create_folder(path)
    }

    pub fn file_details(&self, path: &str, host: &str) -> Result<Option<IndexEntry>> {
        self.session()?.store().get_file_details(path, host)
    }

    /// Entries a full path selects: the folder itself, or the file as
    /// synced by each host.
    pub fn resolve(&self, path: &str) -> Result<Vec<IndexEntry>> {
        let store = self.session()?.store();
        if let Some(id) = store.find_folder(path)? {
            return Ok(vec![IndexEntry::folder(path, id)]);
        }
        let mut entries = Vec::new();
        for host in store.list_hosts()? {
            if let Some(entry) = store.get_file_details(path, &host)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Register a local file or folder to be pushed by this host.
    pub fn add_sync_point(&self, path: &Path) -> Result<SyncPoint> {
        let session = self.session()?;
        let absolute = fs::canonicalize(path)?;
        let kind = if absolute.is_dir() {
            SyncKind::Folder
        } else {
            SyncKind::File
        };
        let point = SyncPoint {
            host: session.host().to_string(),
            path: absolute.to_string_lossy().into_owned(),
            kind,
        };
        session.store().insert_sync_point(&point)?;
        info!(path = %point.path, ?kind, "Sync point added");
        Ok(point)
    }

    /// Unregister one of this host's sync points. Entries already synced stay.
    pub fn remove_sync_point(&self, path: &str) -> Result<bool> {
        let session = self.session()?;
        session.store().delete_sync_point(session.host(), path)
    }

    /// Sync points of every host.
    pub fn sync_points(&self) -> Result<Vec<SyncPoint>> {
        self.session()?.store().list_sync_points()
    }

    pub fn add_ignore_pattern(&self, pattern: &str) -> Result<()> {
        let session = self.session()?;
        session.store().insert_ignore_pattern(pattern)?;
        session.invalidate_ignore_matcher();
        Ok(())
    }

    pub fn remove_ignore_pattern(&self, pattern: &str) -> Result<bool> {
        let session = self.session()?;
        let removed = session.store().delete_ignore_pattern(pattern)?;
        session.invalidate_ignore_matcher();
        Ok(removed)
    }

    pub fn ignore_patterns(&self) -> Result<Vec<String>> {
        self.session()?.store().list_ignore_patterns()
    }

    pub fn parameter(&self, name: &str) -> Result<Option<String>> {
        self.session()?.store().get_parameter(name)
    }

    pub fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        self.session()?.store().set_parameter(name, value)
    }
}

impl Drop for VaultEngine {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.shutdown_flag().set();
            warn!("Vault engine dropped while open; changes since open are lost");
        }
    }
}

fn join_error(name: &'static str) -> impl Fn(tokio::task::JoinError) -> Error {
    move |e| Error::InvalidState(format!("{name} task failed: {e}"))
}

async fn run_blocking<T, F>(name: &'static str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(join_error(name))?
}

type OpenedIndex = (SessionKey, IndexStore, TempPath);

fn working_copy(work_folder: Option<&Path>) -> Result<TempPath> {
    let file = match work_folder {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            NamedTempFile::new_in(dir)?
        }
        None => NamedTempFile::new()?,
    };
    Ok(file.into_temp_path())
}

fn initialize(
    layout: &VaultLayout,
    keys: &KeyManager,
    password: &[u8],
    work_folder: Option<&Path>,
) -> Result<OpenedIndex> {
    if layout.exists() {
        return Err(Error::AlreadyExists(format!(
            "Vault already exists at {}",
            layout.root().display()
        )));
    }
    fs::create_dir_all(layout.root())?;

    let control = layout.control_path();
    let key = keys.derive_or_initialize(&control, password)?;

    let opened = working_copy(work_folder).and_then(|working| {
        let store = IndexStore::create(&working)?;
        store.mark_changed();
        Ok((store, working))
    });
    match opened {
        Ok((store, working)) => Ok((key, store, working)),
        Err(e) => {
            discard(&control);
            Err(e)
        }
    }
}

fn load_index(
    layout: &VaultLayout,
    keys: &KeyManager,
    password: &[u8],
    work_folder: Option<&Path>,
) -> Result<OpenedIndex> {
    if !layout.exists() {
        return Err(Error::NotFound(format!(
            "No vault at {}",
            layout.root().display()
        )));
    }
    let key = keys.derive_or_initialize(&layout.control_path(), password)?;

    let index = layout.index_path();
    if !index.is_file() {
        return Err(Error::NotFound(format!("Index missing: {}", index.display())));
    }

    let working = working_copy(work_folder)?;
    decrypt_file(&index, &working, &key)?;

    let store = IndexStore::open(&working)?;
    if !store.is_valid() {
        warn!("Index failed its validity check");
        return Err(Error::InvalidCredentials);
    }
    store.update_schema()?;
    Ok((key, store, working))
}

/// Vacuum, re-encrypt and swap the index into the vault.
fn write_back(parts: SessionParts) -> Result<()> {
    let SessionParts {
        layout,
        store,
        working,
        key,
    } = parts;

    let changed = store.data_changed();
    if changed {
        if let Err(e) = store.vacuum() {
            warn!(error = %e, "Index vacuum failed");
        }
    }
    if let Err(e) = store.close() {
        return Err(if changed { keep_working(working, e) } else { e });
    }

    if !changed {
        debug!("Index unchanged, not rewritten");
        return Ok(());
    }

    let fresh = layout.index_new_path();
    let encrypted = encrypt_file(&working, &fresh, &key).or_else(|e| {
        warn!(error = %e, "Index write failed, retrying");
        std::thread::sleep(WRITE_BACK_RETRY_DELAY);
        encrypt_file(&working, &fresh, &key)
    });
    if let Err(e) = encrypted {
        discard(&fresh);
        return Err(keep_working(working, e));
    }

    if let Err(e) = swap_in(&layout) {
        return Err(keep_working(working, e));
    }
    info!(vault = %layout.root().display(), "Index written back");
    Ok(())
}

/// Rotate `index.dat` to `index.bak` and move `index.new` into its place.
///
/// On failure `index.dat` is left as it was before the call.
fn swap_in(layout: &VaultLayout) -> Result<()> {
    let fresh = layout.index_new_path();
    let current = layout.index_path();
    let backup = layout.index_backup_path();

    let rotated = current.exists();
    if rotated {
        discard(&backup);
        if let Err(e) = fs::rename(&current, &backup) {
            discard(&fresh);
            return Err(e.into());
        }
    }

    if let Err(e) = fs::rename(&fresh, &current) {
        if rotated {
            if let Err(restore) = fs::rename(&backup, &current) {
                warn!(error = %restore, "Could not restore previous index");
                return Err(e.into());
            }
        }
        discard(&fresh);
        return Err(e.into());
    }
    Ok(())
}

/// Leave the plaintext working index on disk so unsaved changes can be
/// recovered by hand.
fn keep_working(working: TempPath, error: Error) -> Error {
    match working.keep() {
        Ok(kept) => warn!(path = %kept.display(), "Working index kept for recovery"),
        Err(keep) => warn!(error = %keep, "Working index lost"),
    }
    error
}
