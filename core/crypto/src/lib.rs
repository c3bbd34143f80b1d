//! Cryptographic primitives for encrypted repositories.
//!
//! This module provides:
//! - Passphrase key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305 with associated data
//! - Zeroizing key types and the per-blob key hierarchy
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Passphrase checks compare in constant time

pub mod aead;
pub mod kdf;
pub mod keys;

pub use aead::{open, seal};
pub use kdf::{create_key_check, derive_key, verify_key_check, KdfParams};
pub use keys::{BlobKey, MasterKey, Salt};
