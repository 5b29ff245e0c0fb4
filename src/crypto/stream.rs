//! Streaming encryption and decryption of the backing-file format
//!
//! File format: `[salt:32][cbc ciphertext, pkcs#7 padded]`. Plaintext
//! length is recoverable only by decrypting and stripping the padding;
//! there is no length field and no authentication tag. A wrong password
//! therefore surfaces as a padding failure ([`Error::CryptoAuth`]), not a
//! clean "wrong password" error — the format provides confidentiality,
//! not authenticity.
//!
//! Data moves through the cipher in 1 MiB chunks with a one-byte
//! lookahead, so at most one chunk is resident regardless of file size.

use crate::crypto::{derive_file_key, Passphrase, BLOCK_SIZE, SALT_SIZE, STREAM_CHUNK_SIZE};
use crate::error::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{Read, Write};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Extra fill passes over the salt buffer
const SALT_FILL_PASSES: usize = 10;

fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    for _ in 0..SALT_FILL_PASSES {
        OsRng.fill_bytes(&mut salt);
    }
    salt
}

/// Read until `buf` is full or the reader hits EOF. Returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Encrypt `reader` into `writer` under `password`.
///
/// Generates a fresh random salt, writes it as the first 32 bytes of the
/// output, then streams the plaintext through the cipher chunk by chunk.
/// Returns the number of plaintext bytes consumed.
pub fn encrypt<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    password: &Passphrase,
) -> Result<u64> {
    let salt = generate_salt();
    let key = derive_file_key(password.as_bytes(), &salt);
    let mut enc = Aes256CbcEnc::new(key.key().into(), key.iv().into());

    writer.write_all(&salt)?;

    // One block of slack at the end for the padding of the final chunk.
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE + BLOCK_SIZE];
    let mut peek = [0u8; 1];
    let mut total = 0u64;

    let mut len = read_full(reader, &mut buf[..STREAM_CHUNK_SIZE])?;
    loop {
        if read_full(reader, &mut peek)? == 0 {
            // Final chunk: pad and finish.
            total += len as u64;
            let padded = (len / BLOCK_SIZE + 1) * BLOCK_SIZE;
            let ciphertext = enc
                .encrypt_padded_mut::<Pkcs7>(&mut buf[..padded], len)
                .map_err(|_| Error::Internal("padding buffer too small".to_string()))?;
            writer.write_all(ciphertext)?;
            break;
        }

        // A full chunk with more data behind it; always block-aligned.
        total += len as u64;
        for block in buf[..len].chunks_exact_mut(BLOCK_SIZE) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&buf[..len])?;

        buf[0] = peek[0];
        len = 1 + read_full(reader, &mut buf[1..STREAM_CHUNK_SIZE])?;
    }

    writer.flush()?;
    Ok(total)
}

/// Decrypt `reader` into `writer` under `password`.
///
/// Fails with [`Error::CryptoFormat`] if the input is too short to hold a
/// salt, and with [`Error::CryptoAuth`] if the ciphertext is not a whole
/// number of blocks or the final block does not unpad — the latter is
/// what a wrong password looks like. Returns the plaintext length.
pub fn decrypt<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    password: &Passphrase,
) -> Result<u64> {
    let mut salt = [0u8; SALT_SIZE];
    if read_full(reader, &mut salt)? < SALT_SIZE {
        return Err(Error::CryptoFormat);
    }

    let key = derive_file_key(password.as_bytes(), &salt);
    let mut dec = Aes256CbcDec::new(key.key().into(), key.iv().into());

    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut peek = [0u8; 1];
    let mut total = 0u64;

    let mut len = read_full(reader, &mut buf)?;
    loop {
        if read_full(reader, &mut peek)? == 0 {
            // Final chunk: the padding block lives here.
            if len == 0 || len % BLOCK_SIZE != 0 {
                return Err(Error::CryptoAuth);
            }
            let plaintext = dec
                .decrypt_padded_mut::<Pkcs7>(&mut buf[..len])
                .map_err(|_| Error::CryptoAuth)?;
            writer.write_all(plaintext)?;
            total += plaintext.len() as u64;
            break;
        }

        for block in buf[..len].chunks_exact_mut(BLOCK_SIZE) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&buf[..len])?;
        total += len as u64;

        buf[0] = peek[0];
        len = 1 + read_full(reader, &mut buf[1..])?;
    }

    writer.flush()?;
    Ok(total)
}
