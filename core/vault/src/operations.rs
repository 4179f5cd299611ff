//! Sync, extract and delete batches.
//!
//! Every batch runs synchronously on a blocking thread, polls the session's
//! abort flags before each item and reports per item through a
//! [`Reporter`]. Per-item failures are recorded and the batch moves on;
//! only fatal errors end it with `Err`.

use std::fs;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::blobs::new_token;
use crate::policy::{HostDecisionProvider, HostPolicy, PolicyOutcome};
use crate::progress::{BatchReport, ProgressObserver, Reporter};
use crate::session::VaultSession;
use crate::walker::{EntryKind, FsWalker, WalkEntry};
use satchel_common::{from_unix_nanos, to_unix_nanos, Error, Result};
use satchel_index::{IndexEntry, ListQuery, SyncPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Added,
    Updated,
    Unchanged,
}

fn local_sync_points(session: &VaultSession) -> Result<Vec<SyncPoint>> {
    Ok(session
        .store()
        .list_sync_points()?
        .into_iter()
        .filter(|point| point.host == session.host())
        .collect())
}

/// Direct children of a folder row, files and synthetic folder rows alike.
fn children(session: &VaultSession, folder: &IndexEntry) -> Result<Vec<IndexEntry>> {
    session
        .store()
        .list_folder(&ListQuery::folder(folder.parent_folder_id, folder.path.clone()))
}

// ---- sync ----

/// Push every sync point owned by this host into the vault.
pub(crate) fn sync_all(
    session: &VaultSession,
    observer: &dyn ProgressObserver,
) -> Result<BatchReport> {
    let mut reporter = Reporter::new(observer);
    let matcher = session.ignore_matcher()?;
    let points = local_sync_points(session)?;
    info!(host = session.host(), points = points.len(), "Sync started");

    'points: for point in &points {
        let walker = FsWalker::new(
            &point.path,
            |path: &Path| matcher.matches(&path.to_string_lossy()),
            || session.is_aborted(),
        );

        for item in walker {
            let file = match item {
                Ok(file) => file,
                Err(failure) => {
                    reporter.failed(&failure.path, &failure.error);
                    continue;
                }
            };
            if file.kind != EntryKind::File {
                continue;
            }

            let path = file.path.to_string_lossy().into_owned();
            match sync_file(session, &path, &file) {
                Ok(SyncOutcome::Unchanged) => reporter.unchanged(&path),
                Ok(outcome) => {
                    debug!(path, ?outcome, "Synced");
                    reporter.processed(&path);
                }
                Err(e @ Error::InsufficientSpace { .. }) => {
                    warn!(path, error = %e, "Vault is full, stopping sync");
                    reporter.failed(&path, &e);
                    reporter.abort();
                    break 'points;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(path, error = %e, "Sync failed");
                    reporter.failed(&path, &e);
                }
            }
        }

        if session.is_aborted() {
            reporter.abort();
            break;
        }
    }

    let report = reporter.finish();
    info!(
        processed = report.processed,
        unchanged = report.unchanged,
        failed = report.failures.len(),
        aborted = report.aborted,
        "Sync finished"
    );
    Ok(report)
}

fn sync_file(session: &VaultSession, path: &str, file: &WalkEntry) -> Result<SyncOutcome> {
    let store = session.store();
    let mod_date = to_unix_nanos(file.modified);
    let create_date = file.created.map(to_unix_nanos).unwrap_or(0);

    if let Some(mut existing) = store.get_file_details(path, session.host())? {
        if existing.size == file.size && existing.mod_date == mod_date {
            return Ok(SyncOutcome::Unchanged);
        }

        session.ensure_space(file.size.saturating_sub(existing.size))?;
        session
            .blobs()
            .write_from(&file.path, &existing.encrypted_name, session.key())?;
        existing.size = file.size;
        existing.mod_date = mod_date;
        existing.create_date = create_date;
        store.update_file_detail(&existing)?;
        return Ok(SyncOutcome::Updated);
    }

    session.ensure_space(file.size)?;

    let entry = IndexEntry {
        path: path.to_string(),
        encrypted_name: new_token(),
        size: file.size,
        create_date,
        mod_date,
        parent_folder_id: store.find_or_create_folder(path)?,
        host: session.host().to_string(),
    };
    // The row goes in first so validation never sees an unindexed blob.
    store.insert_file_detail(&entry)?;

    if let Err(e) = session
        .blobs()
        .write_from(&file.path, &entry.encrypted_name, session.key())
    {
        if let Err(cleanup) = store.delete_file(&entry.path, &entry.host) {
            warn!(path, error = %cleanup, "Could not remove entry of failed sync");
        }
        if let Err(cleanup) = session.blobs().remove(&entry.encrypted_name) {
            warn!(path, error = %cleanup, "Could not remove partial blob");
        }
        return Err(e);
    }
    Ok(SyncOutcome::Added)
}

/// Files the next sync would visit.
pub(crate) fn count_sync_files(session: &VaultSession) -> Result<u64> {
    let matcher = session.ignore_matcher()?;
    let mut count = 0;
    for point in local_sync_points(session)? {
        count += FsWalker::new(
            &point.path,
            |path: &Path| matcher.matches(&path.to_string_lossy()),
            || session.is_aborted(),
        )
        .filter(|item| matches!(item, Ok(entry) if entry.kind == EntryKind::File))
        .count() as u64;
    }
    Ok(count)
}

// ---- extract ----

/// Where an entry is written when extraction is redirected: its path
/// components below `folder`, without root or drive prefix.
pub fn redirect_target(folder: &Path, original: &str) -> PathBuf {
    let mut target = folder.to_path_buf();
    for component in Path::new(original).components() {
        if let Component::Normal(name) = component {
            target.push(name);
        }
    }
    target
}

/// Decrypt the selected files and folders back to disk.
pub(crate) fn extract_items(
    session: &VaultSession,
    items: &[IndexEntry],
    decisions: &dyn HostDecisionProvider,
    observer: &dyn ProgressObserver,
) -> Result<BatchReport> {
    let mut reporter = Reporter::new(observer);
    let mut policy = HostPolicy::Ask;

    for item in items {
        if extract_entry(session, item, &mut policy, decisions, &mut reporter)? == Flow::Stop {
            break;
        }
    }

    let report = reporter.finish();
    info!(
        processed = report.processed,
        skipped = report.skipped,
        failed = report.failures.len(),
        aborted = report.aborted,
        "Extract finished"
    );
    Ok(report)
}

fn extract_entry(
    session: &VaultSession,
    entry: &IndexEntry,
    policy: &mut HostPolicy,
    decisions: &dyn HostDecisionProvider,
    reporter: &mut Reporter<'_>,
) -> Result<Flow> {
    if session.is_aborted() {
        reporter.abort();
        return Ok(Flow::Stop);
    }

    if entry.is_folder() {
        let listing = match children(session, entry) {
            Ok(listing) => listing,
            Err(e) => {
                reporter.failed(&entry.path, &e);
                return Ok(Flow::Continue);
            }
        };
        for child in &listing {
            if extract_entry(session, child, policy, decisions, reporter)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        return Ok(Flow::Continue);
    }

    match policy.resolve(entry, session.host(), decisions) {
        PolicyOutcome::Extract => {}
        PolicyOutcome::Skip => {
            reporter.skipped(&entry.path, "owned by another host");
            return Ok(Flow::Continue);
        }
        PolicyOutcome::Cancel => {
            info!(path = %entry.path, "Extraction cancelled");
            reporter.abort();
            return Ok(Flow::Stop);
        }
    }

    match extract_file(session, entry) {
        Ok(target) => {
            debug!(path = %entry.path, target = %target.display(), "Extracted");
            reporter.processed(&entry.path);
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(path = %entry.path, error = %e, "Extract failed");
            reporter.failed(&entry.path, &e);
        }
    }
    Ok(Flow::Continue)
}

fn extract_file(session: &VaultSession, entry: &IndexEntry) -> Result<PathBuf> {
    let target = match session.extract_folder() {
        Some(folder) => redirect_target(folder, &entry.path),
        None => PathBuf::from(&entry.path),
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    session
        .blobs()
        .read_to(&entry.encrypted_name, &target, session.key())?;

    // Creation time is not settable on every platform; only mtime is restored.
    let modified = FileTime::from_system_time(from_unix_nanos(entry.mod_date));
    filetime::set_file_mtime(&target, modified)?;
    Ok(target)
}

/// Decrypt one blob to a temporary file keeping the original extension.
/// The file is deleted when the returned path is dropped.
pub(crate) fn preview_copy(session: &VaultSession, entry: &IndexEntry) -> Result<TempPath> {
    if entry.is_folder() {
        return Err(Error::InvalidInput(format!("{} is a folder", entry.path)));
    }

    let suffix = Path::new(&entry.path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let temp = tempfile::Builder::new()
        .prefix("satchel-preview-")
        .suffix(&suffix)
        .tempfile()?
        .into_temp_path();

    session
        .blobs()
        .read_to(&entry.encrypted_name, &temp, session.key())?;
    Ok(temp)
}

/// Files below the selection, counting folders recursively.
pub(crate) fn count_selected(session: &VaultSession, items: &[IndexEntry]) -> Result<u64> {
    let mut count = 0;
    for item in items {
        if item.is_folder() {
            count += count_selected(session, &children(session, item)?)?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

// ---- delete ----

/// Remove the selected files and folders from the vault.
pub(crate) fn delete_items(
    session: &VaultSession,
    items: &[IndexEntry],
    observer: &dyn ProgressObserver,
) -> Result<BatchReport> {
    let mut reporter = Reporter::new(observer);

    for item in items {
        if session.is_aborted() {
            reporter.abort();
            break;
        }
        let flow = if item.is_folder() {
            delete_folder(session, item, &mut reporter)?
        } else {
            delete_file(session, item, &mut reporter);
            Flow::Continue
        };
        if flow == Flow::Stop {
            reporter.abort();
            break;
        }
    }

    if let Err(e) = session.store().delete_childless_folders() {
        warn!(error = %e, "Could not remove empty folders");
        reporter.failed("", &e);
    }

    let report = reporter.finish();
    info!(
        processed = report.processed,
        failed = report.failures.len(),
        aborted = report.aborted,
        "Delete finished"
    );
    Ok(report)
}

fn delete_file(session: &VaultSession, entry: &IndexEntry, reporter: &mut Reporter<'_>) {
    let removed = session
        .store()
        .delete_file(&entry.path, &entry.host)
        .and_then(|_| session.blobs().remove(&entry.encrypted_name));
    match removed {
        Ok(_) => reporter.processed(&entry.path),
        Err(e) => reporter.failed(&entry.path, &e),
    }
}

/// Delete every row below a folder in one transaction, then the blobs.
fn delete_folder(
    session: &VaultSession,
    folder: &IndexEntry,
    reporter: &mut Reporter<'_>,
) -> Result<Flow> {
    let txn = session.store().begin()?;
    let mut doomed = Vec::new();

    let flow = match delete_rows_below(session, folder, &mut doomed) {
        Ok(flow) => flow,
        Err(e) => {
            txn.rollback()?;
            if e.is_fatal() {
                return Err(e);
            }
            reporter.failed(&folder.path, &e);
            return Ok(Flow::Continue);
        }
    };
    txn.commit()?;

    // A blob left behind here is an orphan the next validation removes.
    for entry in &doomed {
        match session.blobs().remove(&entry.encrypted_name) {
            Ok(_) => reporter.processed(&entry.path),
            Err(e) => reporter.failed(&entry.path, &e),
        }
    }
    Ok(flow)
}

fn delete_rows_below(
    session: &VaultSession,
    folder: &IndexEntry,
    doomed: &mut Vec<IndexEntry>,
) -> Result<Flow> {
    for child in children(session, folder)? {
        if session.is_aborted() {
            return Ok(Flow::Stop);
        }
        if child.is_folder() {
            if delete_rows_below(session, &child, doomed)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        } else {
            session.store().delete_file(&child.path, &child.host)?;
            doomed.push(child);
        }
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AlwaysExtract, HostDecision};
    use crate::progress::NoopObserver;
    use crate::session::test_support;
    use proptest::prelude::*;
    use satchel_index::{SyncKind, ROOT_FOLDER_ID};

    fn register(session: &VaultSession, path: &Path) {
        session
            .store()
            .insert_sync_point(&SyncPoint {
                host: session.host().to_string(),
                path: path.to_string_lossy().into_owned(),
                kind: SyncKind::Folder,
            })
            .unwrap();
    }

    fn root_items(session: &VaultSession) -> Vec<IndexEntry> {
        session
            .store()
            .list_folder(&ListQuery::folder(ROOT_FOLDER_ID, ""))
            .unwrap()
    }

    #[test]
    fn test_redirect_strips_root() {
        assert_eq!(
            redirect_target(Path::new("/restore"), "/home/user/a.txt"),
            PathBuf::from("/restore/home/user/a.txt")
        );
        assert_eq!(
            redirect_target(Path::new("/restore"), "rel/b.txt"),
            PathBuf::from("/restore/rel/b.txt")
        );
    }

    proptest! {
        #[test]
        fn prop_redirect_stays_below_folder(
            parts in prop::collection::vec("[a-z]{1,8}|\\.\\.|\\.", 0..6),
            rooted in any::<bool>(),
        ) {
            let original = format!("{}{}", if rooted { "/" } else { "" }, parts.join("/"));
            let folder = Path::new("/restore");
            let target = redirect_target(folder, &original);

            prop_assert!(target.starts_with(folder));
            let rest = target.strip_prefix(folder).unwrap();
            prop_assert!(rest
                .components()
                .all(|c| matches!(c, Component::Normal(_))));
        }
    }

    #[test]
    fn test_sync_skips_foreign_sync_points() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        let src = dir.path().join("src");
        fs::create_dir_all(&vault).unwrap();
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();

        let session = test_support::session(&vault, "h1");
        session
            .store()
            .insert_sync_point(&SyncPoint {
                host: "h2".to_string(),
                path: src.to_string_lossy().into_owned(),
                kind: SyncKind::Folder,
            })
            .unwrap();

        let report = sync_all(&session, &NoopObserver).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(count_sync_files(&session).unwrap(), 0);
    }

    #[test]
    fn test_sync_honours_ignore_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        let src = dir.path().join("src");
        fs::create_dir_all(&vault).unwrap();
        fs::create_dir_all(src.join("build")).unwrap();
        fs::write(src.join("keep.txt"), b"k").unwrap();
        fs::write(src.join("skip.TMP"), b"s").unwrap();
        fs::write(src.join("build").join("out.o"), b"o").unwrap();

        let session = test_support::session(&vault, "h1");
        register(&session, &src);
        session.store().insert_ignore_pattern("*.tmp").unwrap();
        session.store().insert_ignore_pattern("*/build").unwrap();

        assert_eq!(count_sync_files(&session).unwrap(), 1);
        let report = sync_all(&session, &NoopObserver).unwrap();
        assert_eq!(report.processed, 1);
    }

    #[test]
    fn test_changed_file_is_reencrypted_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        let src = dir.path().join("src");
        fs::create_dir_all(&vault).unwrap();
        fs::create_dir_all(&src).unwrap();
        let file = src.join("a.txt");
        fs::write(&file, b"first").unwrap();

        let session = test_support::session(&vault, "h1");
        register(&session, &src);
        sync_all(&session, &NoopObserver).unwrap();
        let path = file.to_string_lossy().into_owned();
        let before = session.store().get_file_details(&path, "h1").unwrap().unwrap();

        fs::write(&file, b"second version").unwrap();
        filetime::set_file_mtime(&file, FileTime::from_unix_time(2_000_000_000, 0)).unwrap();
        let report = sync_all(&session, &NoopObserver).unwrap();

        let after = session.store().get_file_details(&path, "h1").unwrap().unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(after.encrypted_name, before.encrypted_name);
        assert_eq!(after.size, 14);

        let preview = preview_copy(&session, &after).unwrap();
        assert_eq!(fs::read(&preview).unwrap(), b"second version");
        assert!(preview.to_string_lossy().ends_with(".txt"));
    }

    #[test]
    fn test_failed_encrypt_leaves_no_row_or_blob() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        fs::create_dir_all(&vault).unwrap();
        let session = test_support::session(&vault, "h1");

        let missing = WalkEntry {
            path: dir.path().join("vanished.txt"),
            kind: EntryKind::File,
            size: 4,
            modified: std::time::SystemTime::now(),
            created: None,
        };
        let path = missing.path.to_string_lossy().into_owned();

        assert!(sync_file(&session, &path, &missing).is_err());
        assert!(session.store().get_file_details(&path, "h1").unwrap().is_none());
        let leftovers = walkdir::WalkDir::new(&vault)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_extract_restores_content_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        fs::create_dir_all(&vault).unwrap();
        fs::create_dir_all(src.join("nested")).unwrap();
        let file = src.join("nested").join("photo.jpg");
        fs::write(&file, b"jpeg bytes").unwrap();
        let mtime = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&file, mtime).unwrap();

        let mut session = test_support::session(&vault, "h1");
        register(&session, &src);
        sync_all(&session, &NoopObserver).unwrap();
        session = redirect(session, &out);

        let report =
            extract_items(&session, &root_items(&session), &AlwaysExtract, &NoopObserver).unwrap();
        assert_eq!(report.processed, 1);

        let target = redirect_target(&out, &file.to_string_lossy());
        assert_eq!(fs::read(&target).unwrap(), b"jpeg bytes");
        let restored = FileTime::from_last_modification_time(&fs::metadata(&target).unwrap());
        assert_eq!(restored.unix_seconds(), mtime.unix_seconds());
    }

    #[test]
    fn test_extract_cancel_stops_batch() {
        struct CancelAll;
        impl HostDecisionProvider for CancelAll {
            fn decide(&self, _entry: &IndexEntry, _local_host: &str) -> HostDecision {
                HostDecision::Cancel
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        let src = dir.path().join("src");
        fs::create_dir_all(&vault).unwrap();
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        fs::write(src.join("b.txt"), b"b").unwrap();

        let session = test_support::session(&vault, "h2");
        register(&session, &src);
        sync_all(&session, &NoopObserver).unwrap();
        let session = rehost(session, "h1", &dir.path().join("out"));

        let report = extract_items(&session, &root_items(&session), &CancelAll, &NoopObserver).unwrap();
        assert!(report.aborted);
        assert_eq!(report.processed, 0);
    }

    #[test]
    fn test_delete_folder_removes_rows_blobs_and_empty_folders() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        let src = dir.path().join("src");
        fs::create_dir_all(&vault).unwrap();
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("top.txt"), b"t").unwrap();
        fs::write(src.join("sub").join("a.txt"), b"a").unwrap();
        fs::write(src.join("sub").join("b.txt"), b"b").unwrap();

        let session = test_support::session(&vault, "h1");
        register(&session, &src);
        sync_all(&session, &NoopObserver).unwrap();

        let src_text = src.to_string_lossy().into_owned();
        let src_folder = session.store().find_folder(&src_text).unwrap().unwrap();
        let sub_row: Vec<_> = session
            .store()
            .list_folder(&ListQuery::folder(src_folder, src_text.clone()))
            .unwrap()
            .into_iter()
            .filter(|e| e.is_folder())
            .collect();
        assert_eq!(sub_row.len(), 1);
        assert_eq!(count_selected(&session, &sub_row).unwrap(), 2);

        let sub_entries = children(&session, &sub_row[0]).unwrap();
        let report = delete_items(&session, &sub_row, &NoopObserver).unwrap();

        assert_eq!(report.processed, 2);
        for entry in &sub_entries {
            assert!(!session.blobs().exists(&entry.encrypted_name));
        }
        let sub_text = src.join("sub").to_string_lossy().into_owned();
        assert_eq!(session.store().find_folder(&sub_text).unwrap(), None);
        assert_eq!(session.store().count_contents(src_folder).unwrap(), 1);
    }

    #[test]
    fn test_cancel_flag_stops_delete() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        let src = dir.path().join("src");
        fs::create_dir_all(&vault).unwrap();
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();

        let session = test_support::session(&vault, "h1");
        register(&session, &src);
        sync_all(&session, &NoopObserver).unwrap();

        session.cancel_flag().set();
        let report = delete_items(&session, &root_items(&session), &NoopObserver).unwrap();
        assert!(report.aborted);
        assert_eq!(report.processed, 0);
    }

    /// Rebuild a session over the same index with a redirect folder.
    fn redirect(session: VaultSession, out: &Path) -> VaultSession {
        let host = session.host().to_string();
        rehost(session, &host, out)
    }

    fn rehost(session: VaultSession, host: &str, out: &Path) -> VaultSession {
        let parts = session.into_parts();
        VaultSession::new(
            parts.layout,
            parts.key,
            parts.store,
            parts.working,
            crate::session::SessionSettings {
                host: host.to_string(),
                headroom: 0,
                extract_folder: Some(out.to_path_buf()),
                probe: std::sync::Arc::new(crate::space::FsSpaceProbe),
            },
        )
    }
}
