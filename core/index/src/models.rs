//! Row types stored in the vault index.

use serde::{Deserialize, Serialize};

/// Id of the implicit root folder. It is never materialized as a row.
pub const ROOT_FOLDER_ID: i64 = 0;

/// A file in the merged directory tree, or a synthetic folder row produced
/// by [`crate::IndexStore::list_folder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Full path on the originating host.
    pub path: String,
    /// Blob token. Empty for folder rows.
    pub encrypted_name: String,
    pub size: u64,
    /// Unix nanoseconds. Zero when unknown.
    pub create_date: i64,
    /// Unix nanoseconds.
    pub mod_date: i64,
    /// Owning folder for files; the folder's own id for folder rows.
    pub parent_folder_id: i64,
    pub host: String,
}

impl IndexEntry {
    /// Folder row for `path`, as a listing would return it.
    pub fn folder(path: impl Into<String>, id: i64) -> Self {
        Self {
            path: path.into(),
            encrypted_name: String::new(),
            size: 0,
            create_date: 0,
            mod_date: 0,
            parent_folder_id: id,
            host: String::new(),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.encrypted_name.is_empty()
    }

    /// Final path component, falling back to the whole path.
    pub fn file_name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .find(|part| !part.is_empty())
            .unwrap_or(&self.path)
    }
}

/// A node of the folder tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderNode {
    pub id: i64,
    pub name: String,
    pub parent_id: i64,
}

/// What a sync point refers to on its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncKind {
    Folder,
    File,
}

impl SyncKind {
    pub(crate) fn to_db(self) -> i64 {
        match self {
            SyncKind::Folder => 0,
            SyncKind::File => 1,
        }
    }

    pub(crate) fn from_db(value: i64) -> Self {
        if value == 1 {
            SyncKind::File
        } else {
            SyncKind::Folder
        }
    }
}

/// A local file or folder a host pushes into the vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncPoint {
    pub host: String,
    pub path: String,
    pub kind: SyncKind,
}

/// Sortable columns of a folder listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortColumn {
    #[default]
    Path,
    Size,
    ModDate,
    CreateDate,
    Host,
}

impl SortColumn {
    pub(crate) fn column(self) -> &'static str {
        match self {
            SortColumn::Path => "path",
            SortColumn::Size => "size",
            SortColumn::ModDate => "moddate",
            SortColumn::CreateDate => "createdate",
            SortColumn::Host => "host",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub(crate) fn keyword(self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Parameters of a folder listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub folder_id: i64,
    /// Maximum rows to return. Zero means unlimited.
    pub limit: u32,
    pub offset: u32,
    /// Display path of `folder_id`, prefixed onto synthetic folder rows.
    pub current_path: String,
    pub sort: SortColumn,
    pub order: SortOrder,
}

impl ListQuery {
    /// Unpaginated listing of a folder sorted by path.
    pub fn folder(folder_id: i64, current_path: impl Into<String>) -> Self {
        Self {
            folder_id,
            current_path: current_path.into(),
            ..Self::default()
        }
    }
}
