//! SQLite-backed vault index.
//!
//! The index is a plain SQLite database holding the merged directory tree,
//! the sync-point registry, ignore patterns and free-form parameters. The
//! vault engine works on a decrypted copy of it and writes it back only when
//! [`IndexStore::data_changed`] reports a mutation.
//!
//! Every operation takes the single connection lock for its whole duration.
//! The lock is reentrant and an outer [`StoreTransaction`] keeps holding it,
//! so other threads wait until the transaction ends while the owning thread
//! can still call into the store. Helpers open transactions freely: a begin
//! while a transaction is already active is a no-op and only the outermost
//! begin/commit/rollback is real.

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::models::{
    FolderNode, IndexEntry, ListQuery, SortColumn, SyncKind, SyncPoint, ROOT_FOLDER_ID,
};
use satchel_common::{Error, Result};

/// Newest schema version applied by [`IndexStore::update_schema`].
pub const SCHEMA_VERSION: u32 = 1;

const VERSION_PARAM: &str = "version";
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(250);

const BASE_SCHEMA: &str = r#"
    CREATE TABLE directory (
        path TEXT NOT NULL,
        host TEXT NOT NULL,
        encryptedname TEXT NOT NULL,
        size INTEGER NOT NULL,
        moddate INTEGER NOT NULL,
        parent INTEGER NOT NULL,
        PRIMARY KEY (path, host)
    );

    CREATE INDEX IF NOT EXISTS dir_parent_idx ON directory (parent);

    CREATE TABLE sync (
        host TEXT NOT NULL,
        path TEXT NOT NULL,
        type INTEGER NOT NULL,
        PRIMARY KEY (host, path)
    );

    CREATE TABLE folder (
        id INTEGER NOT NULL PRIMARY KEY,
        name TEXT NOT NULL,
        parent INTEGER NOT NULL,
        UNIQUE (name, parent)
    );

    CREATE TABLE params (
        name TEXT NOT NULL PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

const MIGRATION_V1: &str = r#"
    CREATE INDEX IF NOT EXISTS dir_parent_idx ON directory (parent);
    CREATE INDEX IF NOT EXISTS folder_parent_idx ON folder (parent);
    CREATE TABLE IF NOT EXISTS ignore (pattern TEXT NOT NULL PRIMARY KEY);
    ALTER TABLE directory ADD COLUMN createdate INTEGER;
"#;

const ENTRY_COLUMNS: &str =
    "path, encryptedname, size, ifnull(createdate, 0) AS createdate, moddate, parent, host";

/// Folders with neither files nor child folders.
const CHILDLESS_FOLDERS: &str = r#"
    SELECT f.id FROM folder f
    LEFT OUTER JOIN directory d ON d.parent = f.id
    WHERE NOT EXISTS (SELECT 1 FROM folder f2 WHERE f2.parent = f.id)
      AND d.path IS NULL
"#;

pub(crate) fn index_error(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::AlreadyExists(e.to_string())
        }
        _ => Error::Index(e.to_string()),
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<IndexEntry> {
    Ok(IndexEntry {
        path: row.get(0)?,
        encrypted_name: row.get(1)?,
        size: u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
        create_date: row.get(3)?,
        mod_date: row.get(4)?,
        parent_folder_id: row.get(5)?,
        host: row.get(6)?,
    })
}

/// Split a path into the names used for folder nodes.
///
/// The root directory becomes a node named by the platform separator and a
/// drive prefix becomes a node of its own, so absolute paths from every
/// host share a single tree.
pub fn folder_components(path: &str) -> Vec<String> {
    Path::new(path)
        .components()
        .filter_map(|component| match component {
            Component::Prefix(prefix) => Some(prefix.as_os_str().to_string_lossy().into_owned()),
            Component::RootDir => Some(MAIN_SEPARATOR_STR.to_string()),
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            Component::CurDir | Component::ParentDir => None,
        })
        .collect()
}

fn child_prefix(current_path: &str) -> String {
    if current_path.is_empty() || current_path.ends_with(['/', '\\']) {
        current_path.to_string()
    } else {
        format!("{current_path}{MAIN_SEPARATOR_STR}")
    }
}

/// The vault's metadata index.
pub struct IndexStore {
    conn: ReentrantMutex<Connection>,
    path: PathBuf,
    data_changed: AtomicBool,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("path", &self.path)
            .field("data_changed", &self.data_changed())
            .finish()
    }
}

/// An outer transaction spanning several store calls.
///
/// Holds the connection lock until it ends. Rolls back on drop unless
/// committed. When another transaction was already active at
/// [`IndexStore::begin`], commit and rollback are no-ops.
pub struct StoreTransaction<'a> {
    conn: ReentrantMutexGuard<'a, Connection>,
    owned: bool,
    finished: bool,
}

impl StoreTransaction<'_> {
    /// Whether this is the outermost transaction.
    pub fn is_outermost(&self) -> bool {
        self.owned
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        if self.owned {
            finish_transaction(&self.conn, "COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        if self.owned {
            finish_transaction(&self.conn, "ROLLBACK")?;
        }
        Ok(())
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if self.owned && !self.finished {
            if let Err(e) = finish_transaction(&self.conn, "ROLLBACK") {
                warn!(error = %e, "Rollback of abandoned transaction failed");
            }
        }
    }
}

impl IndexStore {
    /// Create a new, empty index at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.create_schema_if_necessary()?;
        store.update_schema()?;
        info!(path = %path.display(), "Created index");
        Ok(store)
    }

    /// Open an existing index file without touching its contents.
    ///
    /// Opening never fails on a file that is not a database; use
    /// [`IndexStore::is_valid`] to find out.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(index_error)?;
        Ok(Self {
            conn: ReentrantMutex::new(conn),
            path: path.to_path_buf(),
            data_changed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smoke test: whether a trivial query against the folder table runs.
    pub fn is_valid(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT id FROM folder LIMIT 1", [], |_| Ok(()))
            .optional()
            .is_ok()
    }

    /// Whether anything was written since open.
    pub fn data_changed(&self) -> bool {
        self.data_changed.load(Ordering::SeqCst)
    }

    /// Force a rewrite on close.
    pub fn mark_changed(&self) {
        self.data_changed.store(true, Ordering::SeqCst);
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(index_error)
    }

    fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        let outermost = conn.is_autocommit();
        if outermost {
            conn.execute_batch("BEGIN").map_err(index_error)?;
        }

        let result = f(&conn);
        if !outermost {
            return result;
        }

        match result {
            Ok(value) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(index_error(e))
                }
            },
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Start an outer transaction. The calling thread keeps the store to
    /// itself until the transaction is committed, rolled back or dropped.
    pub fn begin(&self) -> Result<StoreTransaction<'_>> {
        let conn = self.conn.lock();
        let owned = conn.is_autocommit();
        if owned {
            conn.execute_batch("BEGIN").map_err(index_error)?;
        } else {
            debug!("Transaction already active, joining it");
        }
        Ok(StoreTransaction {
            conn,
            owned,
            finished: false,
        })
    }

    /// Create the base tables when the database is empty.
    pub fn create_schema_if_necessary(&self) -> Result<()> {
        let created = self.with_transaction(|conn| {
            let has_objects = conn
                .query_row("SELECT 1 FROM sqlite_master LIMIT 1", [], |_| Ok(()))
                .optional()
                .map_err(index_error)?
                .is_some();
            if !has_objects {
                conn.execute_batch(BASE_SCHEMA).map_err(index_error)?;
                debug!("Index schema created");
            }
            Ok(!has_objects)
        })?;
        if created {
            self.mark_changed();
        }
        Ok(())
    }

    /// Apply pending one-time migrations gated on the `version` parameter.
    pub fn update_schema(&self) -> Result<()> {
        let migrated = self.with_transaction(|conn| {
            let version = match read_parameter(conn, VERSION_PARAM)? {
                Some(text) => text.trim().parse::<u32>().map_err(|_| {
                    Error::InvalidState(format!("Unreadable index schema version: {text}"))
                })?,
                None => 0,
            };

            if version >= SCHEMA_VERSION {
                // Version 2 is reserved and has no migration content yet.
                return Ok(false);
            }

            conn.execute_batch(MIGRATION_V1).map_err(index_error)?;
            write_parameter(conn, VERSION_PARAM, &SCHEMA_VERSION.to_string())?;
            Ok(true)
        })?;

        if migrated {
            info!(version = SCHEMA_VERSION, "Index schema migrated");
            self.mark_changed();
        }
        Ok(())
    }

    /// Compact the database. Skipped when nothing changed.
    pub fn vacuum(&self) -> Result<bool> {
        if !self.data_changed() {
            return Ok(false);
        }
        self.with_conn(|conn| conn.execute_batch("VACUUM"))?;
        Ok(true)
    }

    /// Release the database file, retrying once if the engine is still busy.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner();
        match conn.close() {
            Ok(()) => Ok(()),
            Err((conn, e)) => {
                warn!(error = %e, "Index still busy on close, retrying");
                std::thread::sleep(RELEASE_RETRY_DELAY);
                conn.close().map_err(|(_, e)| index_error(e))
            }
        }
    }

    // ---- directory entries ----

    pub fn get_file_details(&self, path: &str, host: &str) -> Result<Option<IndexEntry>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM directory WHERE path = ?1 AND host = ?2"),
                params![path, host],
                entry_from_row,
            )
            .optional()
        })
    }

    pub fn insert_file_detail(&self, entry: &IndexEntry) -> Result<()> {
        if entry.encrypted_name.is_empty() {
            return Err(Error::InvalidInput(format!(
                "File entry without blob name: {}",
                entry.path
            )));
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO directory (path, encryptedname, size, createdate, moddate, parent, host)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.path,
                    entry.encrypted_name,
                    entry.size as i64,
                    entry.create_date,
                    entry.mod_date,
                    entry.parent_folder_id,
                    entry.host,
                ],
            )
        })?;
        self.mark_changed();
        Ok(())
    }

    /// Update size and timestamps of an existing entry.
    pub fn update_file_detail(&self, entry: &IndexEntry) -> Result<()> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE directory SET size = ?1, createdate = ?2, moddate = ?3
                 WHERE path = ?4 AND host = ?5",
                params![
                    entry.size as i64,
                    entry.create_date,
                    entry.mod_date,
                    entry.path,
                    entry.host,
                ],
            )
        })?;
        if updated == 0 {
            return Err(Error::NotFound(entry.path.clone()));
        }
        self.mark_changed();
        Ok(())
    }

    /// Remove an entry row. Returns whether a row existed.
    pub fn delete_file(&self, path: &str, host: &str) -> Result<bool> {
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM directory WHERE path = ?1 AND host = ?2",
                params![path, host],
            )
        })?;
        if deleted > 0 {
            self.mark_changed();
        }
        Ok(deleted > 0)
    }

    /// Whether any entry references the blob. Answers `true` on a store
    /// error so that a caller never deletes a blob it cannot prove orphaned.
    pub fn index_exists(&self, encrypted_name: &str) -> bool {
        let found = self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM directory WHERE encryptedname = ?1 LIMIT 1",
                [encrypted_name],
                |_| Ok(()),
            )
            .optional()
        });
        match found {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(error = %e, "Blob lookup failed, keeping blob");
                true
            }
        }
    }

    /// Retag every entry of `old_host` as `new_host`. Returns the row count.
    pub fn move_host(&self, old_host: &str, new_host: &str) -> Result<usize> {
        let moved = self.with_transaction(|conn| {
            conn.execute(
                "UPDATE directory SET host = ?1 WHERE host = ?2",
                params![new_host, old_host],
            )
            .map_err(index_error)
        })?;
        self.mark_changed();
        info!(old_host, new_host, moved, "Moved entries between hosts");
        Ok(moved)
    }

    /// Number of files and child folders directly under a folder.
    pub fn count_contents(&self, folder_id: i64) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT (SELECT count(*) FROM directory WHERE parent = ?1)
                      + (SELECT count(*) FROM folder WHERE parent = ?1)",
                [folder_id],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|count| u64::try_from(count).unwrap_or(0))
    }

    /// Distinct hosts owning at least one entry.
    pub fn list_hosts(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT host FROM directory ORDER BY host")?;
            let hosts = stmt.query_map([], |row| row.get(0))?;
            hosts.collect()
        })
    }

    // ---- folders ----

    /// Walk or create folder nodes for every component of `path` except the
    /// last and return the id of the last component's parent.
    ///
    /// # Errors
    /// - `Invariant` if a folder cannot be read back after insertion
    pub fn find_or_create_folder(&self, path: &str) -> Result<i64> {
        let components = folder_components(path);
        let parents = components.len().saturating_sub(1);

        let (id, created) = self.with_transaction(|conn| {
            let mut parent_id = ROOT_FOLDER_ID;
            let mut created = false;
            for name in &components[..parents] {
                parent_id = match folder_id(conn, name, parent_id)? {
                    Some(id) => id,
                    None => {
                        conn.execute(
                            "INSERT INTO folder (name, parent) VALUES (?1, ?2)",
                            params![name, parent_id],
                        )
                        .map_err(index_error)?;
                        created = true;
                        folder_id(conn, name, parent_id)?.ok_or_else(|| {
                            Error::Invariant(format!("Folder {name} missing after insert"))
                        })?
                    }
                };
            }
            Ok((parent_id, created))
        })?;

        if created {
            self.mark_changed();
        }
        Ok(id)
    }

    /// Id of the folder named by every component of `path`, if it exists.
    pub fn find_folder(&self, path: &str) -> Result<Option<i64>> {
        let components = folder_components(path);
        let conn = self.conn.lock();
        let mut current = ROOT_FOLDER_ID;
        for name in &components {
            match folder_id(&conn, name, current)? {
                Some(id) => current = id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn get_folder(&self, id: i64) -> Result<Option<FolderNode>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, parent FROM folder WHERE id = ?1",
                [id],
                |row| {
                    Ok(FolderNode {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        parent_id: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Files directly under a folder, followed by one synthetic row per
    /// child folder, sorted and paginated as requested.
    pub fn list_folder(&self, query: &ListQuery) -> Result<Vec<IndexEntry>> {
        let mut sql = format!(
            "SELECT path, encryptedname, size, createdate, moddate, parent, host FROM (
                SELECT {ENTRY_COLUMNS} FROM directory WHERE parent = ?1
                UNION ALL
                SELECT ?2 || name AS path, '' AS encryptedname, 0 AS size, 0 AS createdate,
                       0 AS moddate, id AS parent, '' AS host
                FROM folder WHERE parent = ?1)
             ORDER BY {} {}",
            query.sort.column(),
            query.order.keyword()
        );
        if query.sort != SortColumn::Path {
            sql.push_str(", path ASC");
        }
        sql.push_str(" LIMIT ?3 OFFSET ?4");

        let limit: i64 = if query.limit == 0 { -1 } else { i64::from(query.limit) };
        let prefix = child_prefix(&query.current_path);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![query.folder_id, prefix, limit, i64::from(query.offset)],
                entry_from_row,
            )?;
            rows.collect()
        })
    }

    /// Delete folders without files or child folders until none remain.
    /// Returns the number of folders removed.
    pub fn delete_childless_folders(&self) -> Result<usize> {
        let removed = self.with_transaction(|conn| {
            let mut total = 0;
            loop {
                let deleted = conn
                    .execute(&format!("DELETE FROM folder WHERE id IN ({CHILDLESS_FOLDERS})"), [])
                    .map_err(index_error)?;
                if deleted == 0 {
                    break;
                }
                total += deleted;
            }
            Ok(total)
        })?;

        if removed > 0 {
            debug!(removed, "Removed empty folders");
            self.mark_changed();
        }
        Ok(removed)
    }

    // ---- sync points ----

    pub fn insert_sync_point(&self, point: &SyncPoint) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync (host, path, type) VALUES (?1, ?2, ?3)",
                params![point.host, point.path, point.kind.to_db()],
            )
        })?;
        self.mark_changed();
        Ok(())
    }

    pub fn delete_sync_point(&self, host: &str, path: &str) -> Result<bool> {
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sync WHERE host = ?1 AND path = ?2",
                params![host, path],
            )
        })?;
        if deleted > 0 {
            self.mark_changed();
        }
        Ok(deleted > 0)
    }

    pub fn list_sync_points(&self) -> Result<Vec<SyncPoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT host, path, type FROM sync ORDER BY host, path")?;
            let points = stmt.query_map([], |row| {
                Ok(SyncPoint {
                    host: row.get(0)?,
                    path: row.get(1)?,
                    kind: SyncKind::from_db(row.get(2)?),
                })
            })?;
            points.collect()
        })
    }

    // ---- ignore patterns ----

    pub fn insert_ignore_pattern(&self, pattern: &str) -> Result<()> {
        if pattern.is_empty() {
            return Err(Error::InvalidInput("Ignore pattern cannot be empty".to_string()));
        }
        self.with_conn(|conn| conn.execute("INSERT INTO ignore (pattern) VALUES (?1)", [pattern]))?;
        self.mark_changed();
        Ok(())
    }

    pub fn delete_ignore_pattern(&self, pattern: &str) -> Result<bool> {
        let deleted =
            self.with_conn(|conn| conn.execute("DELETE FROM ignore WHERE pattern = ?1", [pattern]))?;
        if deleted > 0 {
            self.mark_changed();
        }
        Ok(deleted > 0)
    }

    pub fn list_ignore_patterns(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT pattern FROM ignore ORDER BY pattern")?;
            let patterns = stmt.query_map([], |row| row.get(0))?;
            patterns.collect()
        })
    }

    // ---- parameters ----

    pub fn get_parameter(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        read_parameter(&conn, name)
    }

    /// Insert or replace a parameter.
    pub fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        {
            let conn = self.conn.lock();
            write_parameter(&conn, name, value)?;
        }
        self.mark_changed();
        Ok(())
    }

    pub fn delete_parameter(&self, name: &str) -> Result<bool> {
        let deleted = self.delete_parameter_transient(name)?;
        if deleted {
            self.mark_changed();
        }
        Ok(deleted)
    }

    /// Write a parameter without requesting a rewrite on close.
    ///
    /// For bookkeeping that only needs to survive when something else
    /// changed, such as a sweep checkpoint.
    pub fn set_parameter_transient(&self, name: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        write_parameter(&conn, name, value)
    }

    /// Delete a parameter without requesting a rewrite on close.
    pub fn delete_parameter_transient(&self, name: &str) -> Result<bool> {
        let deleted =
            self.with_conn(|conn| conn.execute("DELETE FROM params WHERE name = ?1", [name]))?;
        Ok(deleted > 0)
    }
}

fn finish_transaction(conn: &Connection, statement: &str) -> Result<()> {
    if conn.is_autocommit() {
        return Ok(());
    }
    conn.execute_batch(statement).map_err(index_error)
}

fn folder_id(conn: &Connection, name: &str, parent_id: i64) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM folder WHERE name = ?1 AND parent = ?2",
        params![name, parent_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(index_error)
}

fn read_parameter(conn: &Connection, name: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM params WHERE name = ?1", [name], |row| row.get(0))
        .optional()
        .map_err(index_error)
}

fn write_parameter(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO params (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )
    .map_err(index_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, IndexStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::create(&dir.path().join("index.db")).unwrap();
        (dir, store)
    }

    fn entry(store: &IndexStore, path: &str, name: &str, host: &str) -> IndexEntry {
        IndexEntry {
            path: path.to_string(),
            encrypted_name: name.to_string(),
            size: 10,
            create_date: 1_000,
            mod_date: 2_000,
            parent_folder_id: store.find_or_create_folder(path).unwrap(),
            host: host.to_string(),
        }
    }

    #[test]
    fn test_create_is_valid_and_versioned() {
        let (_dir, store) = store();
        assert!(store.is_valid());
        assert!(store.data_changed());
        assert_eq!(
            store.get_parameter(VERSION_PARAM).unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn test_garbage_file_is_not_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        std::fs::write(&path, vec![0x5au8; 4096]).unwrap();

        let store = IndexStore::open(&path).unwrap();
        assert!(!store.is_valid());
    }

    #[test]
    fn test_reopen_does_not_remigrate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        IndexStore::create(&path).unwrap().close().unwrap();

        let store = IndexStore::open(&path).unwrap();
        store.create_schema_if_necessary().unwrap();
        store.update_schema().unwrap();
        assert!(store.is_valid());
        assert_eq!(store.get_parameter(VERSION_PARAM).unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_find_or_create_folder_is_idempotent() {
        let (_dir, store) = store();

        let first = store.find_or_create_folder("/home/user/docs/a.txt").unwrap();
        let second = store.find_or_create_folder("/home/user/docs/a.txt").unwrap();
        let sibling = store.find_or_create_folder("/home/user/docs/b.txt").unwrap();

        assert_eq!(first, second);
        assert_eq!(first, sibling);
        assert_ne!(first, ROOT_FOLDER_ID);

        let folders: i64 = store
            .with_conn(|conn| conn.query_row("SELECT count(*) FROM folder", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(folders, 4);
    }

    #[test]
    fn test_find_folder_resolves_full_path() {
        let (_dir, store) = store();
        let parent = store.find_or_create_folder("/data/photos/cat.jpg").unwrap();

        assert_eq!(store.find_folder("/data/photos").unwrap(), Some(parent));
        assert_eq!(store.find_folder("").unwrap(), Some(ROOT_FOLDER_ID));
        assert_eq!(store.find_folder("/data/videos").unwrap(), None);
    }

    #[test]
    fn test_entry_crud_by_path_and_host() {
        let (_dir, store) = store();
        let mine = entry(&store, "/srv/a.txt", "aaaa", "h1");
        let theirs = entry(&store, "/srv/a.txt", "bbbb", "h2");
        store.insert_file_detail(&mine).unwrap();
        store.insert_file_detail(&theirs).unwrap();

        assert_eq!(store.get_file_details("/srv/a.txt", "h1").unwrap(), Some(mine.clone()));
        assert_eq!(store.get_file_details("/srv/a.txt", "h2").unwrap(), Some(theirs));

        let mut updated = mine.clone();
        updated.size = 99;
        updated.mod_date = 5_000;
        store.update_file_detail(&updated).unwrap();
        assert_eq!(store.get_file_details("/srv/a.txt", "h1").unwrap(), Some(updated));

        assert!(store.delete_file("/srv/a.txt", "h1").unwrap());
        assert!(!store.delete_file("/srv/a.txt", "h1").unwrap());
        assert!(store.get_file_details("/srv/a.txt", "h1").unwrap().is_none());
        assert!(store.index_exists("bbbb"));
        assert!(!store.index_exists("aaaa"));
    }

    #[test]
    fn test_duplicate_entry_is_already_exists() {
        let (_dir, store) = store();
        let e = entry(&store, "/srv/a.txt", "aaaa", "h1");
        store.insert_file_detail(&e).unwrap();

        assert!(matches!(store.insert_file_detail(&e), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_update_missing_entry_is_not_found() {
        let (_dir, store) = store();
        let e = entry(&store, "/srv/a.txt", "aaaa", "h1");
        assert!(matches!(store.update_file_detail(&e), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_folder_merges_files_and_folders() {
        let (_dir, store) = store();
        let file = entry(&store, "/srv/top.txt", "t1", "h1");
        store.insert_file_detail(&file).unwrap();
        store.insert_file_detail(&entry(&store, "/srv/sub/inner.txt", "t2", "h1")).unwrap();

        let listing = store
            .list_folder(&ListQuery::folder(file.parent_folder_id, "/srv"))
            .unwrap();

        assert_eq!(listing.len(), 2);
        let folder = listing.iter().find(|e| e.is_folder()).unwrap();
        assert_eq!(folder.path, format!("/srv{MAIN_SEPARATOR_STR}sub"));
        assert_eq!(folder.size, 0);
        assert_eq!(store.find_folder("/srv/sub").unwrap(), Some(folder.parent_folder_id));
        assert!(listing.iter().any(|e| e == &file));
        assert_eq!(store.count_contents(file.parent_folder_id).unwrap(), 2);
    }

    #[test]
    fn test_list_folder_root_shows_root_node() {
        let (_dir, store) = store();
        store.insert_file_detail(&entry(&store, "/srv/top.txt", "t1", "h1")).unwrap();

        let listing = store.list_folder(&ListQuery::folder(ROOT_FOLDER_ID, "")).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, MAIN_SEPARATOR_STR);
    }

    #[test]
    fn test_list_folder_sort_and_paginate() {
        let (_dir, store) = store();
        for (i, name) in ["c.txt", "a.txt", "b.txt"].iter().enumerate() {
            let mut e = entry(&store, &format!("/srv/{name}"), &format!("blob{i}"), "h1");
            e.size = (i as u64 + 1) * 100;
            store.insert_file_detail(&e).unwrap();
        }
        let folder = store.find_folder("/srv").unwrap().unwrap();

        let by_path = store.list_folder(&ListQuery::folder(folder, "/srv")).unwrap();
        let names: Vec<_> = by_path.iter().map(|e| e.file_name().to_string()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);

        let page = store
            .list_folder(&ListQuery {
                folder_id: folder,
                limit: 2,
                offset: 0,
                current_path: "/srv".to_string(),
                sort: SortColumn::Size,
                order: crate::models::SortOrder::Descending,
            })
            .unwrap();
        let sizes: Vec<_> = page.iter().map(|e| e.size).collect();
        assert_eq!(sizes, [300, 200]);
    }

    #[test]
    fn test_delete_childless_folders_cascades_to_fixed_point() {
        let (_dir, store) = store();
        let deep = entry(&store, "/a/b/c/d.txt", "d1", "h1");
        store.insert_file_detail(&deep).unwrap();
        let keep = entry(&store, "/a/keep.txt", "k1", "h1");
        store.insert_file_detail(&keep).unwrap();

        store.delete_file(&deep.path, "h1").unwrap();
        let removed = store.delete_childless_folders().unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.find_folder("/a/b").unwrap(), None);
        assert_eq!(store.find_folder("/a").unwrap(), Some(keep.parent_folder_id));
        assert_eq!(store.delete_childless_folders().unwrap(), 0);
    }

    #[test]
    fn test_move_host_retags_rows() {
        let (_dir, store) = store();
        store.insert_file_detail(&entry(&store, "/x/1", "n1", "h2")).unwrap();
        store.insert_file_detail(&entry(&store, "/x/2", "n2", "h2")).unwrap();
        store.insert_file_detail(&entry(&store, "/x/3", "n3", "h1")).unwrap();

        assert_eq!(store.move_host("h2", "h1").unwrap(), 2);
        assert_eq!(store.list_hosts().unwrap(), ["h1"]);
    }

    #[test]
    fn test_sync_points_and_ignore_patterns() {
        let (_dir, store) = store();
        let point = SyncPoint {
            host: "h1".to_string(),
            path: "/home/u/docs".to_string(),
            kind: SyncKind::Folder,
        };
        store.insert_sync_point(&point).unwrap();
        assert!(matches!(store.insert_sync_point(&point), Err(Error::AlreadyExists(_))));
        assert_eq!(store.list_sync_points().unwrap(), [point.clone()]);
        assert!(store.delete_sync_point(&point.host, &point.path).unwrap());
        assert!(store.list_sync_points().unwrap().is_empty());

        store.insert_ignore_pattern("*.tmp").unwrap();
        store.insert_ignore_pattern("~*").unwrap();
        assert_eq!(store.list_ignore_patterns().unwrap(), ["*.tmp", "~*"]);
        assert!(store.delete_ignore_pattern("*.tmp").unwrap());
        assert!(!store.delete_ignore_pattern("*.tmp").unwrap());
    }

    #[test]
    fn test_parameters_upsert_and_delete() {
        let (_dir, store) = store();
        assert_eq!(store.get_parameter("validation_start").unwrap(), None);

        store.set_parameter("validation_start", "0a").unwrap();
        store.set_parameter("validation_start", "7f").unwrap();
        assert_eq!(store.get_parameter("validation_start").unwrap().as_deref(), Some("7f"));

        assert!(store.delete_parameter("validation_start").unwrap());
        assert_eq!(store.get_parameter("validation_start").unwrap(), None);
    }

    #[test]
    fn test_transient_parameters_do_not_mark_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        IndexStore::create(&path).unwrap().close().unwrap();

        let store = IndexStore::open(&path).unwrap();
        store.set_parameter_transient("validation_start", "3f").unwrap();
        assert_eq!(store.get_parameter("validation_start").unwrap().as_deref(), Some("3f"));
        assert!(store.delete_parameter_transient("validation_start").unwrap());
        assert!(!store.data_changed());
    }

    #[test]
    fn test_outer_transaction_rollback_discards_nested_work() {
        let (_dir, store) = store();
        let txn = store.begin().unwrap();
        assert!(txn.is_outermost());

        // Helpers open their own transaction; it joins the outer one.
        store.find_or_create_folder("/tmp/x/y.txt").unwrap();
        let nested = store.begin().unwrap();
        assert!(!nested.is_outermost());
        nested.commit().unwrap();

        txn.rollback().unwrap();
        assert_eq!(store.find_folder("/tmp/x").unwrap(), None);
    }

    #[test]
    fn test_outer_transaction_commit_keeps_work() {
        let (_dir, store) = store();
        let txn = store.begin().unwrap();
        store.find_or_create_folder("/tmp/x/y.txt").unwrap();
        txn.commit().unwrap();

        assert!(store.find_folder("/tmp/x").unwrap().is_some());
    }

    #[test]
    fn test_outer_transaction_blocks_other_threads() {
        let (_dir, store) = store();
        let txn = store.begin().unwrap();
        store.insert_ignore_pattern("*.mine").unwrap();

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| store.insert_ignore_pattern("*.other"));
            std::thread::sleep(Duration::from_millis(200));
            assert!(!writer.is_finished());

            txn.rollback().unwrap();
            writer.join().unwrap().unwrap();
        });

        assert_eq!(store.list_ignore_patterns().unwrap(), ["*.other"]);
    }

    #[test]
    fn test_vacuum_skipped_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        IndexStore::create(&path).unwrap().close().unwrap();

        let store = IndexStore::open(&path).unwrap();
        assert!(!store.data_changed());
        assert!(!store.vacuum().unwrap());

        store.set_parameter("k", "v").unwrap();
        assert!(store.vacuum().unwrap());
    }
}
