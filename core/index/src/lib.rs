//! Metadata index for satchel vaults.
//!
//! The index records every file synced into a vault, the folder tree they
//! merge into, which local paths each host pushes, which paths are ignored
//! and a handful of vault parameters.

pub mod ignore;
pub mod models;
pub mod store;

pub use ignore::IgnoreMatcher;
pub use models::{
    FolderNode, IndexEntry, ListQuery, SortColumn, SortOrder, SyncKind, SyncPoint, ROOT_FOLDER_ID,
};
pub use store::{folder_components, IndexStore, StoreTransaction, SCHEMA_VERSION};
