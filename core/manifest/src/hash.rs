//! Content hashing.
//!
//! A `FileHash` is always tagged with the algorithm that produced it, so a
//! manifest migrated to a new default algorithm never mistakes an old
//! digest for a match.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use blake2::digest::consts::U32;
use blake2::Blake2b;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use reposync_common::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Hash algorithm used for file contents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake2b256,
}

impl HashAlgorithm {
    /// Identifier used in persisted manifests and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake2b256 => "blake2b256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "blake2b256" | "blake2b" => Ok(HashAlgorithm::Blake2b256),
            other => Err(Error::InvalidInput(format!(
                "Unknown hash algorithm: {}",
                other
            ))),
        }
    }
}

/// Incremental hasher for one algorithm.
pub enum FileHasher {
    Sha256(Sha256),
    Blake2b256(Blake2b<U32>),
}

impl FileHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => FileHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake2b256 => FileHasher::Blake2b256(Blake2b::<U32>::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            FileHasher::Sha256(h) => h.update(data),
            FileHasher::Blake2b256(h) => h.update(data),
        }
    }

    pub fn finish(self) -> FileHash {
        match self {
            FileHasher::Sha256(h) => FileHash {
                algorithm: HashAlgorithm::Sha256,
                digest: h.finalize().to_vec(),
            },
            FileHasher::Blake2b256(h) => FileHash {
                algorithm: HashAlgorithm::Blake2b256,
                digest: h.finalize().to_vec(),
            },
        }
    }
}

/// Content hash of a file: algorithm tag plus digest bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHash {
    pub algorithm: HashAlgorithm,
    #[serde(serialize_with = "digest_to_base64", deserialize_with = "digest_from_base64")]
    pub digest: Vec<u8>,
}

impl FileHash {
    /// Hash an in-memory buffer.
    pub fn compute(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = FileHasher::new(algorithm);
        hasher.update(data);
        hasher.finish()
    }

    /// Hash everything a reader yields.
    pub fn compute_reader<R: Read>(algorithm: HashAlgorithm, mut reader: R) -> Result<Self> {
        let mut hasher = FileHasher::new(algorithm);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }

    /// Hash a file on disk.
    pub fn compute_file(algorithm: HashAlgorithm, path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::compute_reader(algorithm, file)
    }

    /// Lowercase hex rendering of the digest.
    pub fn hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex())
    }
}

fn digest_to_base64<S: Serializer>(digest: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(digest))
}

fn digest_from_base64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_known_vector() {
        let hash = FileHash::compute(HashAlgorithm::Sha256, b"abc");
        assert_eq!(
            hash.hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(hash.to_string().starts_with("sha256:ba7816bf"));
    }

    #[test]
    fn test_algorithms_never_compare_equal() {
        let a = FileHash::compute(HashAlgorithm::Sha256, b"same bytes");
        let b = FileHash::compute(HashAlgorithm::Blake2b256, b"same bytes");
        assert_eq!(b.digest.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_reader_matches_buffer() {
        let data = vec![7u8; READ_CHUNK * 2 + 13];
        let from_reader =
            FileHash::compute_reader(HashAlgorithm::Blake2b256, data.as_slice()).unwrap();
        assert_eq!(from_reader, FileHash::compute(HashAlgorithm::Blake2b256, &data));
    }

    #[test]
    fn test_compute_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file contents").unwrap();
        let hash = FileHash::compute_file(HashAlgorithm::Sha256, file.path()).unwrap();
        assert_eq!(hash, FileHash::compute(HashAlgorithm::Sha256, b"file contents"));
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!(
            "blake2b256".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Blake2b256
        );
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_serde_uses_base64_digest() {
        let hash = FileHash::compute(HashAlgorithm::Sha256, b"abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert!(json.contains("\"algorithm\":\"sha256\""));
        assert!(json.contains("\"digest\":\"ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=\""));
        let back: FileHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
