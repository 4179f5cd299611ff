//! Streaming AES-256-CFB encryption for blobs and the index.
//!
//! CFB is self-synchronizing and needs no padding: the ciphertext is exactly
//! as long as the plaintext, and a blob truncated by an interrupted write
//! still decrypts correctly up to the truncation point. Memory use is bounded
//! by the chunk size regardless of the input length.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use tracing::debug;

use crate::keys::SessionKey;
use satchel_common::{Error, Result};

/// Chunk size for streaming transforms (1 MiB).
pub const CHUNK_SIZE: usize = 1024 * 1024;

fn encryptor(key: &SessionKey) -> Result<BufEncryptor<Aes256>> {
    BufEncryptor::<Aes256>::new_from_slices(key.key(), key.iv())
        .map_err(|e| Error::Crypto(format!("Invalid key material: {}", e)))
}

fn decryptor(key: &SessionKey) -> Result<BufDecryptor<Aes256>> {
    BufDecryptor::<Aes256>::new_from_slices(key.key(), key.iv())
        .map_err(|e| Error::Crypto(format!("Invalid key material: {}", e)))
}

/// Read into `buffer`, retrying on interruption. Returns 0 at end of input.
fn read_chunk<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<usize> {
    loop {
        match reader.read(buffer) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Encrypting stream that processes data in fixed chunks.
pub struct EncryptingStream<'a> {
    key: &'a SessionKey,
    chunk_size: usize,
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream.
    pub fn new(key: &'a SessionKey) -> Self {
        Self {
            key,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Set custom chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Encrypt data from reader and write to writer.
    ///
    /// # Postconditions
    /// - Exactly as many bytes are written as were read
    ///
    /// # Errors
    /// - I/O errors from reader/writer
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut cipher = encryptor(self.key)?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_bytes = 0u64;

        loop {
            let bytes_read = read_chunk(&mut reader, &mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            cipher.encrypt(&mut buffer[..bytes_read]);
            writer.write_all(&buffer[..bytes_read])?;
            total_bytes += bytes_read as u64;
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Decrypting stream that processes data in fixed chunks.
pub struct DecryptingStream<'a> {
    key: &'a SessionKey,
    chunk_size: usize,
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream.
    pub fn new(key: &'a SessionKey) -> Self {
        Self {
            key,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Set custom chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Decrypt data from reader and write to writer.
    ///
    /// A wrong key is not detected here; it yields garbage of the same
    /// length. Callers validate the plaintext (the index smoke test, the
    /// control file check value).
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut cipher = decryptor(self.key)?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_bytes = 0u64;

        loop {
            let bytes_read = read_chunk(&mut reader, &mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            cipher.decrypt(&mut buffer[..bytes_read]);
            writer.write_all(&buffer[..bytes_read])?;
            total_bytes += bytes_read as u64;
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Encrypt the file at `src` into `dst`, replacing `dst`.
///
/// On error `dst` may be left partially written; the caller discards it.
pub fn encrypt_file(src: &Path, dst: &Path, key: &SessionKey) -> Result<u64> {
    let input = File::open(src)?;
    let output = File::create(dst)?;
    let written = EncryptingStream::new(key).encrypt_stream(input, &output)?;
    output.sync_all()?;
    debug!(bytes = written, "Encrypted file");
    Ok(written)
}

/// Decrypt the file at `src` into `dst`, replacing `dst`.
///
/// On error `dst` may be left partially written; the caller discards it.
pub fn decrypt_file(src: &Path, dst: &Path, key: &SessionKey) -> Result<u64> {
    let input = File::open(src)?;
    let output = File::create(dst)?;
    let written = DecryptingStream::new(key).decrypt_stream(input, &output)?;
    output.sync_all()?;
    debug!(bytes = written, "Decrypted file");
    Ok(written)
}

/// Encrypt a small in-memory buffer.
pub fn encrypt_bytes(key: &SessionKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(data.len());
    EncryptingStream::new(key).encrypt_stream(data, &mut output)?;
    Ok(output)
}

/// Decrypt a small in-memory buffer.
pub fn decrypt_bytes(key: &SessionKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(data.len());
    DecryptingStream::new(key).decrypt_stream(data, &mut output)?;
    Ok(output)
}
