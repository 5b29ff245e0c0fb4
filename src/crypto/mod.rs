//! Cryptography module for cryptmirror
//!
//! Provides the per-file cipher: AES-256-CBC with PKCS#7 padding under a
//! key/IV pair derived from the mount password and a per-file random salt.
//! Every backing file is `salt || ciphertext`; the salt is regenerated on
//! each re-encryption.

mod kdf;
mod stream;

pub use kdf::{derive_file_key, FileKey, Passphrase};
pub use stream::{decrypt, encrypt};

/// Size of the per-file salt stored at the start of every backing file
pub const SALT_SIZE: usize = 32;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the CBC initialization vector in bytes
pub const IV_SIZE: usize = 16;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// PBKDF2 iteration count. Fixed: part of the on-disk format.
pub const PBKDF2_ITERATIONS: u32 = 50_000;

/// Chunk size for streaming encryption/decryption (1 MiB)
pub const STREAM_CHUNK_SIZE: usize = 1024 * 1024;
