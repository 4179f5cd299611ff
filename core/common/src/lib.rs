//! Common utilities and types shared across satchel crates.
//!
//! This crate provides the error type every other crate reports through,
//! plus small helpers for host names and timestamps.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    format_timestamp, from_unix_nanos, local_host_name, to_unix_nanos, SensitiveBytes,
    UNKNOWN_HOST,
};
