//! Passphrase key derivation using Argon2id, and the key-check blob used
//! to tell a wrong passphrase apart from a corrupt repository.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::aead::{open, seal};
use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use reposync_common::{Error, Result};

const KEY_CHECK_CONTEXT: &[u8] = b"reposync-key-check";
const KEY_CHECK_PLAINTEXT: &[u8] = b"reposync key check v1";

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Parameters for interactive use, roughly half a second per unlock.
    pub fn interactive() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Cheap parameters for tests and constrained machines.
    pub fn moderate() -> Self {
        Self {
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }

    fn to_argon2(&self) -> Result<Params> {
        Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            Some(KEY_LENGTH),
        )
        .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive a master key from a passphrase and salt using Argon2id.
///
/// # Errors
/// - Returns error if the passphrase is empty
/// - Returns error if Argon2id parameters are invalid
pub fn derive_key(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if passphrase.is_empty() {
        return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
    }

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(passphrase, salt.as_bytes(), &mut key_bytes)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey::from_bytes(key_bytes))
}

/// Seal a known plaintext under `key`, stored next to the salt so a later
/// unlock can verify the passphrase before touching any content.
pub fn create_key_check(key: &MasterKey) -> Result<Vec<u8>> {
    seal(key.as_bytes(), KEY_CHECK_CONTEXT, KEY_CHECK_PLAINTEXT)
}

/// Returns `Ok(false)` when `key` does not open the check blob.
pub fn verify_key_check(key: &MasterKey, check: &[u8]) -> Result<bool> {
    match open(key.as_bytes(), KEY_CHECK_CONTEXT, check) {
        Ok(plaintext) => Ok(plaintext == KEY_CHECK_PLAINTEXT),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let salt = Salt::from_bytes([42u8; 32]);
        let params = KdfParams::moderate();

        let key1 = derive_key(b"test-passphrase", &salt, &params).unwrap();
        let key2 = derive_key(b"test-passphrase", &salt, &params).unwrap();

        assert!(key1.ct_eq(&key2));
    }

    #[test]
    fn test_derive_key_depends_on_salt_and_passphrase() {
        let params = KdfParams::moderate();
        let base = derive_key(b"one", &Salt::from_bytes([1u8; 32]), &params).unwrap();
        let other_salt = derive_key(b"one", &Salt::from_bytes([2u8; 32]), &params).unwrap();
        let other_pass = derive_key(b"two", &Salt::from_bytes([1u8; 32]), &params).unwrap();

        assert!(!base.ct_eq(&other_salt));
        assert!(!base.ct_eq(&other_pass));
    }

    #[test]
    fn test_empty_passphrase_fails() {
        let result = derive_key(b"", &Salt::generate(), &KdfParams::moderate());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_invalid_params_fail() {
        let params = KdfParams {
            memory_cost: 1,
            time_cost: 0,
            parallelism: 0,
        };
        let result = derive_key(b"pw", &Salt::generate(), &params);
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn test_key_check() {
        let salt = Salt::from_bytes([99u8; 32]);
        let params = KdfParams::moderate();
        let key = derive_key(b"secure-passphrase", &salt, &params).unwrap();
        let wrong = derive_key(b"wrong-passphrase", &salt, &params).unwrap();

        let check = create_key_check(&key).unwrap();
        assert!(verify_key_check(&key, &check).unwrap());
        assert!(!verify_key_check(&wrong, &check).unwrap());
        assert!(!verify_key_check(&key, b"garbage").unwrap());
    }
}
