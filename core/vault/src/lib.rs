//! Vault engine for satchel.
//!
//! This crate provides:
//! - Vault creation, open and close with index write-back
//! - Sync of local folders and files into encrypted blobs
//! - Extraction with cross-host decisions, deletion and previews
//! - Background validation that removes orphaned blobs
//!
//! # Architecture
//! [`VaultEngine`] owns at most one open [`VaultSession`]. Batches run on
//! the blocking pool against the session and report per item through a
//! [`ProgressObserver`].

pub mod blobs;
pub mod config;
pub mod manager;
pub mod operations;
pub mod policy;
pub mod progress;
pub mod session;
pub mod space;
pub mod validation;
pub mod walker;

pub use blobs::BlobStore;
pub use config::{VaultLayout, VaultOptions};
pub use manager::{EngineState, VaultEngine};
pub use operations::redirect_target;
pub use policy::{AlwaysExtract, HostDecision, HostDecisionProvider, NeverExtract};
pub use progress::{BatchReport, NoopObserver, ProgressEvent, ProgressObserver, TracingObserver};
pub use session::{AbortFlag, VaultSession};
pub use space::{FsSpaceProbe, SpaceProbe};
pub use validation::ValidationSummary;
