//! Lazy depth-first enumeration of sync-point subtrees.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

use satchel_common::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

/// A regular file or directory found by the walk.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
    pub created: Option<SystemTime>,
}

impl WalkEntry {
    fn from_metadata(path: PathBuf, kind: EntryKind, metadata: &Metadata) -> Self {
        Self {
            path,
            kind,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            created: metadata.created().ok(),
        }
    }
}

/// An entry that could not be read. The walk carries on after it.
#[derive(Debug)]
pub struct WalkFailure {
    pub path: String,
    pub error: Error,
}

/// Depth-first walk in file-name order.
///
/// Symbolic links are neither followed nor reported, and neither is
/// anything that is not a regular file or directory. Paths accepted by
/// `ignore` are skipped along with everything below them. The walk ends as
/// soon as `abort` returns true.
pub struct FsWalker<I, A> {
    inner: walkdir::IntoIter,
    ignore: I,
    abort: A,
}

impl<I, A> FsWalker<I, A>
where
    I: Fn(&Path) -> bool,
    A: Fn() -> bool,
{
    pub fn new(root: impl AsRef<Path>, ignore: I, abort: A) -> Self {
        let inner = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Self {
            inner,
            ignore,
            abort,
        }
    }
}

impl<I, A> Iterator for FsWalker<I, A>
where
    I: Fn(&Path) -> bool,
    A: Fn() -> bool,
{
    type Item = Result<WalkEntry, WalkFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if (self.abort)() {
                return None;
            }

            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    warn!(path, error = %e, "Enumeration failed");
                    return Some(Err(WalkFailure {
                        path,
                        error: Error::Io(e.into()),
                    }));
                }
            };

            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Folder
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                continue;
            };

            if (self.ignore)(entry.path()) {
                debug!(path = %entry.path().display(), "Ignored");
                if kind == EntryKind::Folder {
                    self.inner.skip_current_dir();
                }
                continue;
            }

            return Some(match entry.metadata() {
                Ok(metadata) => Ok(WalkEntry::from_metadata(
                    entry.into_path(),
                    kind,
                    &metadata,
                )),
                Err(e) => Err(WalkFailure {
                    path: entry.path().display().to_string(),
                    error: Error::Io(e.into()),
                }),
            });
        }
    }
}
