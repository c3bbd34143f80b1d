//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! Every sealed blob carries a random 24-byte nonce and is bound to a caller
//! supplied context string (associated data), so a blob moved to another
//! role or name inside the repository fails to open.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use reposync_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Encrypt `plaintext` under `key`, authenticating `context` alongside it.
///
/// # Postconditions
/// - Returns nonce || ciphertext || tag
/// - Output length is plaintext length + NONCE_SIZE + TAG_SIZE
///
/// # Errors
/// - Returns error if key length is incorrect
pub fn seal(key: &[u8], context: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: context,
            },
        )
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a blob produced by [`seal`] with the same key and context.
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if the blob is shorter than NONCE_SIZE + TAG_SIZE
/// - Returns error if authentication fails (wrong key, wrong context, tampering)
pub fn open(key: &[u8], context: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, encrypted) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(
            GenericArray::from_slice(nonce_bytes),
            Payload {
                msg: encrypted,
                aad: context,
            },
        )
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}
