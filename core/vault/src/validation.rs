//! Background sweep deleting orphaned blobs.
//!
//! A blob without an index entry is residue of an interrupted sync. The
//! sweep visits blobs in name order and stores the last name it reached in
//! the `validation_start` parameter, so a sweep cut short by close resumes
//! near the same point on the next open instead of starting over.

use std::fs;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::blobs::is_blob_name;
use crate::session::VaultSession;
use satchel_common::Result;

/// Parameter holding the last blob name the sweep reached.
pub const CHECKPOINT_PARAM: &str = "validation_start";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    /// Blobs looked up in the index.
    pub checked: usize,
    /// Orphans removed.
    pub deleted: usize,
    /// False when shutdown interrupted the sweep.
    pub completed: bool,
}

/// Run one sweep over the vault directory.
///
/// Only the shutdown flag stops the sweep; a user cancel of a batch does not.
pub fn validate(session: &VaultSession) -> Result<ValidationSummary> {
    let store = session.store();
    let shutdown = session.shutdown_flag();
    let resumed_from = store.get_parameter(CHECKPOINT_PARAM)?;
    let checkpoint = resumed_from.clone().unwrap_or_default();
    let checkpoint_prefix = checkpoint.get(..2).unwrap_or("");
    let mut summary = ValidationSummary::default();

    if !checkpoint.is_empty() {
        info!(checkpoint, "Resuming validation");
    }

    let mut walk = WalkDir::new(session.layout().root())
        .min_depth(1)
        .max_depth(2)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(item) = walk.next() {
        if shutdown.is_set() {
            // Keep the checkpoint written during this run.
            if summary.checked > 0 {
                store.mark_changed();
            }
            info!(checked = summary.checked, "Validation interrupted");
            return Ok(summary);
        }

        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Validation could not read entry");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();

        if entry.depth() == 1 {
            let prefix_dir = entry.file_type().is_dir() && name.len() == 2;
            if entry.file_type().is_dir() && (!prefix_dir || name.as_str() < checkpoint_prefix) {
                walk.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_file() || !is_blob_name(&name) {
            continue;
        }
        if !checkpoint.is_empty() && name <= checkpoint {
            continue;
        }

        store.set_parameter_transient(CHECKPOINT_PARAM, &name)?;
        summary.checked += 1;

        if store.index_exists(&name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                info!(blob = %name, "Deleted orphaned blob");
                summary.deleted += 1;
            }
            Err(e) => warn!(blob = %name, error = %e, "Could not delete orphaned blob"),
        }
    }

    if resumed_from.is_some() {
        store.delete_parameter(CHECKPOINT_PARAM)?;
    } else {
        store.delete_parameter_transient(CHECKPOINT_PARAM)?;
    }
    summary.completed = true;
    debug!(checked = summary.checked, deleted = summary.deleted, "Validation finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support;
    use satchel_index::IndexEntry;
    use std::path::Path;

    fn plant(root: &Path, token: &str) -> std::path::PathBuf {
        let dir = root.join(&token[..2]);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(token);
        fs::write(&path, b"orphan").unwrap();
        path
    }

    fn index(session: &VaultSession, token: &str) {
        let path = format!("/data/{token}");
        session
            .store()
            .insert_file_detail(&IndexEntry {
                parent_folder_id: session.store().find_or_create_folder(&path).unwrap(),
                path,
                encrypted_name: token.to_string(),
                size: 6,
                create_date: 0,
                mod_date: 0,
                host: "h1".to_string(),
            })
            .unwrap();
    }

    #[test]
    fn test_deletes_only_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_support::session(dir.path(), "h1");
        let kept = plant(dir.path(), "10000000000000000000000000000000");
        let orphan = plant(dir.path(), "f0000000000000000000000000000000");
        index(&session, "10000000000000000000000000000000");
        fs::write(dir.path().join("control.dat"), b"not a blob").unwrap();
        fs::write(dir.path().join("f0").join("notes.txt"), b"keep").unwrap();

        let summary = validate(&session).unwrap();

        assert_eq!(summary, ValidationSummary { checked: 2, deleted: 1, completed: true });
        assert!(kept.exists());
        assert!(!orphan.exists());
        assert!(dir.path().join("control.dat").exists());
        assert!(dir.path().join("f0").join("notes.txt").exists());
        assert_eq!(session.store().get_parameter(CHECKPOINT_PARAM).unwrap(), None);
    }

    #[test]
    fn test_resumes_after_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_support::session(dir.path(), "h1");
        let early = plant(dir.path(), "10000000000000000000000000000000");
        let late = plant(dir.path(), "f0000000000000000000000000000000");
        session
            .store()
            .set_parameter(CHECKPOINT_PARAM, "80000000000000000000000000000000")
            .unwrap();

        let summary = validate(&session).unwrap();
        assert_eq!(summary.checked, 1);
        assert!(early.exists());
        assert!(!late.exists());

        // Checkpoint cleared, so the next sweep starts from the beginning.
        let summary = validate(&session).unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(!early.exists());
    }

    #[test]
    fn test_shutdown_leaves_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_support::session(dir.path(), "h1");
        let orphan = plant(dir.path(), "a0000000000000000000000000000000");
        session.store().set_parameter(CHECKPOINT_PARAM, "00").unwrap();
        session.shutdown_flag().set();

        let summary = validate(&session).unwrap();

        assert!(!summary.completed);
        assert!(orphan.exists());
        assert_eq!(
            session.store().get_parameter(CHECKPOINT_PARAM).unwrap().as_deref(),
            Some("00")
        );
    }

    #[test]
    fn test_shutdown_before_any_blob_leaves_index_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_support::reopened_session(dir.path(), "h1");
        plant(dir.path(), "c0000000000000000000000000000000");
        session.shutdown_flag().set();

        let summary = validate(&session).unwrap();

        assert_eq!(summary, ValidationSummary::default());
        assert!(!session.store().data_changed());
    }

    #[test]
    fn test_index_rewritten_only_to_clear_stored_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_support::reopened_session(dir.path(), "h1");
        let orphan = plant(dir.path(), "c0000000000000000000000000000000");

        assert!(validate(&session).unwrap().completed);
        assert!(!orphan.exists());
        assert!(!session.store().data_changed());

        session.store().set_parameter_transient(CHECKPOINT_PARAM, "00").unwrap();
        assert!(validate(&session).unwrap().completed);
        assert!(session.store().data_changed());
        assert_eq!(session.store().get_parameter(CHECKPOINT_PARAM).unwrap(), None);
    }

    #[test]
    fn test_user_cancel_does_not_stop_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_support::session(dir.path(), "h1");
        let orphan = plant(dir.path(), "b0000000000000000000000000000000");
        session.cancel_flag().set();

        assert!(validate(&session).unwrap().completed);
        assert!(!orphan.exists());
    }
}
