//! Encrypting repository proxy.
//!
//! Wraps another proxy. The plaintext manifest is sealed into
//! `/.reposync-crypt/manifest.enc` inside the inner repository, next to a
//! plaintext header holding the KDF salt and parameters. File contents are
//! stored content-addressed under `/data/`, one sealed blob per distinct
//! content hash, so moves, copies and metadata updates only touch the
//! manifest.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::proxy::{staged_name, FileHandle, RepositoryProxy};
use reposync_common::{Error, RepoPath, Result};
use reposync_crypto::{
    create_key_check, derive_key, open, seal, verify_key_check, KdfParams, MasterKey, Salt,
};
use reposync_manifest::{persist, FileEntry, FileHash, FileInfo, Manifest, ManifestInfo};

/// Directory inside the inner repository holding crypt metadata.
pub const CRYPT_DIRNAME: &str = ".reposync-crypt";
const HEADER_FILENAME: &str = "header.json";
const MANIFEST_BLOB: &str = "manifest.enc";
const DATA_DIRNAME: &str = "data";
const MANIFEST_CONTEXT: &[u8] = b"reposync-manifest";

/// Current header format version.
const HEADER_VERSION: u32 = 1;

/// Plaintext header stored next to the sealed manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptHeader {
    pub version: u32,
    /// Base64-encoded KDF salt.
    pub salt: String,
    pub kdf: KdfParams,
    /// Base64-encoded key check blob.
    pub key_check: String,
}

impl CryptHeader {
    fn salt(&self) -> Result<Salt> {
        let bytes = STANDARD
            .decode(&self.salt)
            .map_err(|e| Error::Serialization(format!("Invalid salt: {}", e)))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Serialization("Invalid salt length".to_string()))?;
        Ok(Salt::from_bytes(array))
    }

    fn key_check(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.key_check)
            .map_err(|e| Error::Serialization(format!("Invalid key check: {}", e)))
    }
}

fn crypt_path(name: &str) -> Result<RepoPath> {
    RepoPath::root().join(CRYPT_DIRNAME)?.join(name)
}

/// Repository whose contents are encrypted at rest inside another one.
pub struct CryptRepositoryProxy {
    inner: Arc<dyn RepositoryProxy>,
    key: MasterKey,
    manifest: RwLock<Manifest>,
    dirty: AtomicBool,
}

impl CryptRepositoryProxy {
    /// True if `inner` holds an encrypted repository.
    pub async fn is_crypt_repository(inner: &dyn RepositoryProxy) -> Result<bool> {
        Ok(inner
            .manifest()
            .await?
            .tree()
            .contains_file(&crypt_path(HEADER_FILENAME)?))
    }

    /// Initialize an encrypted repository inside `inner`.
    ///
    /// # Errors
    /// - `AlreadyExists` if `inner` already holds one
    /// - Key derivation or storage errors
    pub async fn create(
        inner: Arc<dyn RepositoryProxy>,
        passphrase: &[u8],
        params: KdfParams,
        manifest: Manifest,
    ) -> Result<Self> {
        if Self::is_crypt_repository(inner.as_ref()).await? {
            return Err(Error::AlreadyExists(format!(
                "{} already holds an encrypted repository",
                inner.location()
            )));
        }

        let salt = Salt::generate();
        let key = derive_key(passphrase, &salt, &params)?;
        let header = CryptHeader {
            version: HEADER_VERSION,
            salt: STANDARD.encode(salt.as_bytes()),
            kdf: params,
            key_check: STANDARD.encode(create_key_check(&key)?),
        };
        let header_json =
            serde_json::to_vec_pretty(&header).map_err(|e| Error::Serialization(e.to_string()))?;
        write_inner(inner.as_ref(), &crypt_path(HEADER_FILENAME)?, &header_json).await?;

        let proxy = Self {
            inner,
            key,
            manifest: RwLock::new(manifest),
            dirty: AtomicBool::new(true),
        };
        proxy.flush().await?;
        debug!(location = %proxy.location(), "Created encrypted repository");
        Ok(proxy)
    }

    /// Unlock the encrypted repository inside `inner`.
    ///
    /// # Errors
    /// - `NotFound` if `inner` holds no encrypted repository
    /// - `Crypto` if the passphrase is wrong or the manifest was tampered with
    pub async fn open(inner: Arc<dyn RepositoryProxy>, passphrase: &[u8]) -> Result<Self> {
        let header_path = crypt_path(HEADER_FILENAME)?;
        if !Self::is_crypt_repository(inner.as_ref()).await? {
            return Err(Error::NotFound(format!(
                "No encrypted repository in {}",
                inner.location()
            )));
        }
        let header_bytes = inner.get_file(&header_path).await?.read_all().await?;
        let header: CryptHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| Error::Serialization(format!("Invalid crypt header: {}", e)))?;
        if header.version > HEADER_VERSION {
            return Err(Error::Serialization(format!(
                "Unsupported crypt header version {}",
                header.version
            )));
        }

        let key = derive_key(passphrase, &header.salt()?, &header.kdf)?;
        if !verify_key_check(&key, &header.key_check()?)? {
            return Err(Error::Crypto("Wrong passphrase".to_string()));
        }

        let sealed = inner
            .get_file(&crypt_path(MANIFEST_BLOB)?)
            .await?
            .read_all()
            .await?;
        let json = open(key.manifest_key().as_bytes(), MANIFEST_CONTEXT, &sealed)?;
        let json = String::from_utf8(json)
            .map_err(|e| Error::Serialization(format!("Manifest is not UTF-8: {}", e)))?;
        let manifest = persist::from_json(&json)?;
        debug!(location = %inner.location(), files = manifest.tree().file_count(), "Unlocked encrypted repository");

        Ok(Self {
            inner,
            key,
            manifest: RwLock::new(manifest),
            dirty: AtomicBool::new(false),
        })
    }

    fn blob_path(&self, hash: &FileHash) -> Result<RepoPath> {
        let name = self.key.blob_name(hash.to_string().as_bytes());
        RepoPath::root().join(DATA_DIRNAME)?.join(&name)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Seal `data` as `entry` unless its blob already exists, then record it.
    async fn store_plaintext(&self, entry: &FileEntry, data: Vec<u8>) -> Result<()> {
        let algorithm = match &entry.info.hash {
            Some(hash) => hash.algorithm,
            None => self.manifest.read().await.default_hash_algorithm(),
        };
        let actual = FileHash::compute(algorithm, &data);
        if let Some(expected) = &entry.info.hash {
            if *expected != actual || data.len() as u64 != entry.info.length {
                return Err(Error::Storage(format!(
                    "Content of {} changed since its manifest entry was recorded",
                    entry.path
                )));
            }
        }

        let blob = self.blob_path(&actual)?;
        let inner_manifest = self.inner.manifest().await?;
        if !inner_manifest.tree().contains_file(&blob) {
            let context = blob.to_string();
            let blob_key = self.key.derive_blob_key(actual.to_string().as_bytes());
            let sealed = seal(blob_key.as_bytes(), context.as_bytes(), &data)?;
            write_inner(self.inner.as_ref(), &blob, &sealed).await?;
        }

        let previous = {
            let mut manifest = self.manifest.write().await;
            let previous = manifest
                .tree()
                .get_file(&entry.path)
                .and_then(|f| f.info.hash.clone());
            manifest.tree_mut().insert_file(
                &entry.path,
                FileInfo {
                    length: data.len() as u64,
                    last_modified_utc: entry.info.last_modified_utc,
                    registered_utc: entry.info.registered_utc,
                    hash: Some(actual.clone()),
                },
            )?;
            previous
        };
        self.mark_dirty();
        if let Some(old) = previous.filter(|old| *old != actual) {
            self.release_blob(&old).await;
        }
        debug!(path = %entry.path, "Stored encrypted file");
        Ok(())
    }

    /// Delete the blob for `hash` once no file references it.
    async fn release_blob(&self, hash: &FileHash) {
        let referenced = self
            .manifest
            .read()
            .await
            .files()
            .iter()
            .any(|e| e.info.hash.as_ref() == Some(hash));
        if referenced {
            return;
        }
        let blob = match self.blob_path(hash) {
            Ok(blob) => blob,
            Err(_) => return,
        };
        if let Err(e) = self.inner.remove_file(&blob).await {
            warn!(blob = %blob, error = %e, "Could not remove unreferenced blob");
        }
    }

    async fn read_plaintext(&self, path: &RepoPath) -> Result<Vec<u8>> {
        let hash = self
            .manifest
            .read()
            .await
            .tree()
            .get_file(path)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))?
            .info
            .hash
            .clone()
            .ok_or_else(|| Error::Storage(format!("{} has no recorded content", path)))?;

        let blob = self.blob_path(&hash)?;
        let sealed = self.inner.get_file(&blob).await?.read_all().await?;
        let blob_key = self.key.derive_blob_key(hash.to_string().as_bytes());
        open(blob_key.as_bytes(), blob.to_string().as_bytes(), &sealed)
    }

    async fn require_file(&self, path: &RepoPath) -> Result<FileInfo> {
        self.manifest
            .read()
            .await
            .tree()
            .get_file(path)
            .map(|f| f.info.clone())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))
    }

    async fn ensure_vacant(&self, path: &RepoPath) -> Result<()> {
        if self.manifest.read().await.tree().contains_file(path) {
            return Err(Error::AlreadyExists(format!("{} already exists", path)));
        }
        Ok(())
    }
}

/// Write `data` into `inner` at `path` through its staging area.
async fn write_inner(inner: &dyn RepositoryProxy, path: &RepoPath, data: &[u8]) -> Result<()> {
    let staged = inner.temp_directory()?.join(staged_name());
    tokio::fs::write(&staged, data).await?;
    let now = Utc::now();
    let entry = FileEntry::new(
        path.clone(),
        FileInfo {
            length: data.len() as u64,
            last_modified_utc: now,
            registered_utc: now,
            hash: None,
        },
    );
    inner.put_staged_file(&staged, &entry).await
}

#[async_trait]
impl RepositoryProxy for CryptRepositoryProxy {
    fn name(&self) -> &str {
        "crypt"
    }

    fn location(&self) -> String {
        format!("crypt:{}", self.inner.location())
    }

    async fn manifest(&self) -> Result<Manifest> {
        Ok(self.manifest.read().await.clone())
    }

    async fn put_file(&self, source: &dyn RepositoryProxy, entry: &FileEntry) -> Result<()> {
        let data = source.get_file(&entry.path).await?.read_all().await?;
        self.store_plaintext(entry, data).await
    }

    async fn put_staged_file(&self, staged: &Path, entry: &FileEntry) -> Result<()> {
        let data = tokio::fs::read(staged).await?;
        tokio::fs::remove_file(staged).await?;
        self.store_plaintext(entry, data).await
    }

    async fn remove_file(&self, path: &RepoPath) -> Result<()> {
        let removed = self.manifest.write().await.tree_mut().remove_file(path)?;
        self.mark_dirty();
        if let Some(hash) = removed.info.hash {
            self.release_blob(&hash).await;
        }
        debug!(path = %path, "Removed encrypted file");
        Ok(())
    }

    async fn copy_file(&self, from: &RepoPath, to: &FileEntry) -> Result<()> {
        let info = self.require_file(from).await?;
        self.ensure_vacant(&to.path).await?;
        if info.hash != to.info.hash && to.info.hash.is_some() {
            return Err(Error::InvalidInput(format!(
                "Cannot copy {} to {}: content differs",
                from, to.path
            )));
        }
        let copied = FileInfo {
            hash: info.hash,
            length: info.length,
            ..to.info.clone()
        };
        self.manifest
            .write()
            .await
            .tree_mut()
            .insert_file(&to.path, copied)?;
        self.mark_dirty();
        Ok(())
    }

    async fn copy_file_information(&self, target: &RepoPath, other: &FileEntry) -> Result<()> {
        let mut manifest = self.manifest.write().await;
        let file = manifest
            .tree_mut()
            .get_file_mut(target)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", target)))?;
        file.info.last_modified_utc = other.info.last_modified_utc;
        file.info.registered_utc = other.info.registered_utc;
        self.mark_dirty();
        Ok(())
    }

    async fn move_file(&self, from: &RepoPath, to: &FileEntry) -> Result<()> {
        let info = self.require_file(from).await?;
        self.ensure_vacant(&to.path).await?;
        let moved = FileInfo {
            hash: info.hash,
            length: info.length,
            ..to.info.clone()
        };
        self.manifest
            .write()
            .await
            .tree_mut()
            .move_file(from, &to.path, moved)?;
        self.mark_dirty();
        debug!(from = %from, to = %to.path, "Moved encrypted file");
        Ok(())
    }

    async fn copy_manifest_information(&self, other: &ManifestInfo) -> Result<()> {
        self.manifest.write().await.copy_information_from(other);
        self.mark_dirty();
        Ok(())
    }

    async fn get_file(&self, path: &RepoPath) -> Result<FileHandle> {
        Ok(FileHandle::Memory(self.read_plaintext(path).await?))
    }

    async fn clone_file(&self, path: &RepoPath, target_dir: &Path) -> Result<PathBuf> {
        let data = self.read_plaintext(path).await?;
        let target = target_dir.join(staged_name());
        tokio::fs::write(&target, data).await?;
        Ok(target)
    }

    fn temp_directory(&self) -> Result<PathBuf> {
        self.inner.temp_directory()
    }

    async fn flush(&self) -> Result<()> {
        if self.dirty.swap(false, Ordering::SeqCst) {
            let sealed = {
                let manifest = self.manifest.read().await;
                persist::to_json(&manifest).and_then(|json| {
                    seal(
                        self.key.manifest_key().as_bytes(),
                        MANIFEST_CONTEXT,
                        json.as_bytes(),
                    )
                })
            };
            let written = match sealed {
                Ok(sealed) => {
                    let path = crypt_path(MANIFEST_BLOB)?;
                    write_inner(self.inner.as_ref(), &path, &sealed).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                self.mark_dirty();
                return Err(e);
            }
        }
        self.inner.flush().await
    }

    async fn cleanup_before_exit(&self) -> Result<()> {
        self.inner.cleanup_before_exit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepositoryProxy;
    use chrono::{DateTime, TimeZone};
    use reposync_manifest::HashAlgorithm;

    fn p(s: &str) -> RepoPath {
        RepoPath::parse(s).unwrap()
    }

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn new_crypt(inner: Arc<MemoryRepositoryProxy>) -> CryptRepositoryProxy {
        CryptRepositoryProxy::create(
            inner,
            b"correct horse",
            KdfParams::moderate(),
            Manifest::new("secret", HashAlgorithm::Sha256),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_and_read_back() {
        let inner = Arc::new(MemoryRepositoryProxy::new("inner"));
        let crypt = new_crypt(inner.clone()).await;
        let source = MemoryRepositoryProxy::new("src");
        let entry = source.insert_file(&p("/notes/a.txt"), b"plaintext body", t(), t()).unwrap();

        crypt.put_file(&source, &entry).await.unwrap();

        let data = crypt.get_file(&entry.path).await.unwrap().read_all().await.unwrap();
        assert_eq!(data, b"plaintext body");
        assert_eq!(crypt.manifest().await.unwrap().entry(&entry.path).unwrap(), entry);

        // Nothing in the inner repository carries the plaintext or its name.
        for (path, bytes) in inner.contents() {
            assert!(!path.to_string().contains("notes"));
            assert!(!bytes.windows(9).any(|w| w == b"plaintext"));
        }
    }

    #[tokio::test]
    async fn test_open_with_passphrase() {
        let inner = Arc::new(MemoryRepositoryProxy::new("inner"));
        let crypt = new_crypt(inner.clone()).await;
        let source = MemoryRepositoryProxy::new("src");
        let entry = source.insert_file(&p("/a"), b"abc", t(), t()).unwrap();
        crypt.put_file(&source, &entry).await.unwrap();
        crypt.flush().await.unwrap();
        let guid = crypt.manifest().await.unwrap().guid();

        let wrong = CryptRepositoryProxy::open(inner.clone(), b"wrong").await;
        assert!(matches!(wrong, Err(Error::Crypto(_))));

        let reopened = CryptRepositoryProxy::open(inner.clone(), b"correct horse").await.unwrap();
        let manifest = reopened.manifest().await.unwrap();
        assert_eq!(manifest.guid(), guid);
        assert_eq!(manifest.entry(&p("/a")).unwrap(), entry);
    }

    #[tokio::test]
    async fn test_identical_content_shares_one_blob() {
        let inner = Arc::new(MemoryRepositoryProxy::new("inner"));
        let crypt = new_crypt(inner.clone()).await;
        let source = MemoryRepositoryProxy::new("src");
        let a = source.insert_file(&p("/a"), b"dup", t(), t()).unwrap();
        let b = source.insert_file(&p("/b"), b"dup", t(), t()).unwrap();

        crypt.put_file(&source, &a).await.unwrap();
        crypt.put_file(&source, &b).await.unwrap();

        let blobs = |m: &Manifest| {
            m.files()
                .iter()
                .filter(|e| e.path.components()[0] == DATA_DIRNAME)
                .count()
        };
        assert_eq!(blobs(&inner.manifest().await.unwrap()), 1);

        crypt.remove_file(&p("/a")).await.unwrap();
        assert_eq!(blobs(&inner.manifest().await.unwrap()), 1);
        crypt.remove_file(&p("/b")).await.unwrap();
        assert_eq!(blobs(&inner.manifest().await.unwrap()), 0);
    }

    #[tokio::test]
    async fn test_move_is_manifest_only() {
        let inner = Arc::new(MemoryRepositoryProxy::new("inner"));
        let crypt = new_crypt(inner.clone()).await;
        let source = MemoryRepositoryProxy::new("src");
        let entry = source.insert_file(&p("/a"), b"content", t(), t()).unwrap();
        crypt.put_file(&source, &entry).await.unwrap();
        inner.clear_calls();

        let to = FileEntry::new(p("/moved/a"), entry.info.clone());
        crypt.move_file(&p("/a"), &to).await.unwrap();

        assert!(inner.calls().is_empty());
        let data = crypt.get_file(&to.path).await.unwrap().read_all().await.unwrap();
        assert_eq!(data, b"content");
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let inner = Arc::new(MemoryRepositoryProxy::new("inner"));
        new_crypt(inner.clone()).await;
        let again = CryptRepositoryProxy::create(
            inner,
            b"pw",
            KdfParams::moderate(),
            Manifest::new("x", HashAlgorithm::Sha256),
        )
        .await;
        assert!(matches!(again, Err(Error::AlreadyExists(_))));
    }
}
