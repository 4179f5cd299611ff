//! Cryptographic primitives for satchel.
//!
//! This crate provides:
//! - PBKDF2-HMAC-SHA256 key derivation producing an AES-256 key and a
//!   CFB initialization block
//! - The control file that wraps the password-independent key seed
//! - Streaming AES-256-CFB encryption for blobs and the index
//!
//! # Security Guarantees
//! - All key material is zeroized on drop
//! - No plaintext, password or key material is ever logged
//! - The control file check value is compared in constant time

pub mod control;
pub mod kdf;
pub mod keys;
pub mod stream;

pub use control::{ControlRecord, KeyManager, CONTROL_FILE_LEN};
pub use kdf::{derive_key, KdfParams};
pub use keys::{KeySeed, Salt, SessionKey};
pub use stream::{
    decrypt_bytes, decrypt_file, encrypt_bytes, encrypt_file, DecryptingStream,
    EncryptingStream, CHUNK_SIZE,
};
