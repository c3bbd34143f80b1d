//! Key types with secure memory handling.
//!
//! The master key never encrypts content directly. Each content blob gets
//! its own key derived from the master key and the blob's content digest,
//! and blob names are a keyed digest so the storage layout leaks nothing
//! about the plaintext beyond sizes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of a KDF salt in bytes.
pub const SALT_LENGTH: usize = 32;

/// Master key derived from the repository passphrase.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    fn derive(&self, label: &[u8], id: &[u8]) -> [u8; KEY_LENGTH] {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(label);
        hasher.update(id);
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&hasher.finalize());
        derived
    }

    /// Derive the key for a content blob identified by its plaintext digest.
    pub fn derive_blob_key(&self, content_id: &[u8]) -> BlobKey {
        BlobKey::from_bytes(self.derive(b"reposync-blob", content_id))
    }

    /// Derive the key sealing the repository manifest.
    pub fn manifest_key(&self) -> BlobKey {
        BlobKey::from_bytes(self.derive(b"reposync-manifest", &[]))
    }

    /// Storage name for a content blob: a keyed digest of its content id,
    /// URL-safe base64 without padding.
    pub fn blob_name(&self, content_id: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.derive(b"reposync-name", content_id))
    }

    /// Constant-time key comparison.
    pub fn ct_eq(&self, other: &MasterKey) -> bool {
        self.key[..].ct_eq(&other.key[..]).into()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Key sealing one blob (file content or the manifest).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlobKey {
    key: [u8; KEY_LENGTH],
}

impl BlobKey {
    /// Create a blob key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey([REDACTED])")
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        Self(rand::random::<[u8; SALT_LENGTH]>())
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_key_derivation() {
        let master = MasterKey::from_bytes([1u8; KEY_LENGTH]);

        let key1 = master.derive_blob_key(b"digest-a");
        let key2 = master.derive_blob_key(b"digest-a");
        assert_eq!(key1.as_bytes(), key2.as_bytes());

        let key3 = master.derive_blob_key(b"digest-b");
        assert_ne!(key1.as_bytes(), key3.as_bytes());
        assert_ne!(master.manifest_key().as_bytes(), key1.as_bytes());
    }

    #[test]
    fn test_blob_name_is_keyed() {
        let a = MasterKey::from_bytes([1u8; KEY_LENGTH]);
        let b = MasterKey::from_bytes([2u8; KEY_LENGTH]);

        let name = a.blob_name(b"digest");
        assert_eq!(name, a.blob_name(b"digest"));
        assert_ne!(name, b.blob_name(b"digest"));
        assert!(!name.contains('/'));
        assert!(!name.contains('='));
    }

    #[test]
    fn test_ct_eq() {
        let a = MasterKey::from_bytes([9u8; KEY_LENGTH]);
        assert!(a.ct_eq(&MasterKey::from_bytes([9u8; KEY_LENGTH])));
        assert!(!a.ct_eq(&MasterKey::from_bytes([8u8; KEY_LENGTH])));
    }

    #[test]
    fn test_salt_generate() {
        assert_ne!(Salt::generate(), Salt::generate());
    }

    #[test]
    fn test_debug_redacts() {
        let master = MasterKey::from_bytes([3u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", master), "MasterKey([REDACTED])");
    }
}
