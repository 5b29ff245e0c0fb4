//! Password-based key derivation
//!
//! Stretches `(password, salt)` into a 256-bit key and 128-bit IV with
//! PBKDF2-HMAC-SHA1 at a fixed iteration count. The same pair always
//! derives the same material; distinct per-file salts keep key/IV reuse
//! from ever occurring across files encrypted with one password.

use crate::crypto::{IV_SIZE, KEY_SIZE, PBKDF2_ITERATIONS};
use ring::pbkdf2;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// The mount password, shared by every open handle.
///
/// Cheap to clone; the underlying bytes are zeroized when the last clone
/// is dropped.
#[derive(Clone)]
pub struct Passphrase(Arc<Zeroizing<Vec<u8>>>);

impl Passphrase {
    pub fn new<B: Into<Vec<u8>>>(password: B) -> Self {
        Passphrase(Arc::new(Zeroizing::new(password.into())))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

/// Key material for one file, zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl FileKey {
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }
}

/// Derive the cipher key and IV for one file.
///
/// The key occupies the first 32 bytes of the PBKDF2 output stream and
/// the IV the following 16, so both are fixed by `(password, salt)`.
pub fn derive_file_key(password: &[u8], salt: &[u8]) -> FileKey {
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).expect("iteration count is non-zero");

    let mut material = Zeroizing::new([0u8; KEY_SIZE + IV_SIZE]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA1,
        iterations,
        salt,
        password,
        material.as_mut(),
    );

    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    key.copy_from_slice(&material[..KEY_SIZE]);
    iv.copy_from_slice(&material[KEY_SIZE..]);

    FileKey { key, iv }
}
