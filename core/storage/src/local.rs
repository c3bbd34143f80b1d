//! Local filesystem repository proxy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tempfile::TempDir;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::proxy::{staged_name, FileHandle, RepositoryProxy};
use reposync_common::{Error, RepoPath, Result};
use reposync_manifest::{
    persist, FileEntry, FileHash, FileInfo, HashAlgorithm, Manifest, ManifestInfo,
    MANIFEST_FILENAME, METADATA_DIRNAME,
};

/// Repository stored as a plain directory tree, with its manifest under
/// `.reposync/manifest.json`.
pub struct LocalRepositoryProxy {
    root: PathBuf,
    manifest: RwLock<Manifest>,
    dirty: AtomicBool,
    staging: Mutex<Option<TempDir>>,
    released: AtomicBool,
}

impl LocalRepositoryProxy {
    /// Initialize a new repository at `root` with `manifest`.
    ///
    /// # Errors
    /// - `AlreadyExists` if `root` already holds a repository
    /// - I/O errors creating the directory or writing the manifest
    pub fn create(root: impl AsRef<Path>, manifest: Manifest) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if Self::is_repository(&root) {
            return Err(Error::AlreadyExists(format!(
                "{} already holds a repository",
                root.display()
            )));
        }
        std::fs::create_dir_all(root.join(METADATA_DIRNAME))?;
        std::fs::write(Self::manifest_path(&root), persist::to_json(&manifest)?)?;
        debug!(root = %root.display(), guid = %manifest.guid(), "Created local repository");
        Ok(Self::from_parts(root, manifest))
    }

    /// Open an existing repository at `root`.
    ///
    /// # Errors
    /// - `NotFound` if `root` holds no manifest
    /// - `Serialization` if the manifest cannot be decoded
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let path = Self::manifest_path(&root);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "No repository manifest at {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = persist::from_json(&json)?;
        debug!(root = %root.display(), files = manifest.tree().file_count(), "Opened local repository");
        Ok(Self::from_parts(root, manifest))
    }

    fn from_parts(root: PathBuf, manifest: Manifest) -> Self {
        Self {
            root,
            manifest: RwLock::new(manifest),
            dirty: AtomicBool::new(false),
            staging: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// True if `root` holds a repository manifest.
    pub fn is_repository(root: &Path) -> bool {
        Self::manifest_path(root).is_file()
    }

    fn manifest_path(root: &Path) -> PathBuf {
        root.join(METADATA_DIRNAME).join(MANIFEST_FILENAME)
    }

    /// Repository root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace the in-memory manifest, e.g. after a scan.
    pub async fn replace_manifest(&self, manifest: Manifest) {
        *self.manifest.write().await = manifest;
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn to_fs_path(&self, path: &RepoPath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    async fn ensure_vacant(&self, path: &RepoPath) -> Result<()> {
        if self.manifest.read().await.tree().contains_file(path)
            || fs::try_exists(self.to_fs_path(path)).await?
        {
            return Err(Error::AlreadyExists(format!("{} already exists", path)));
        }
        Ok(())
    }

    /// Create the parent directories of `path` on disk.
    async fn prepare_parent(&self, path: &RepoPath) -> Result<PathBuf> {
        let fs_path = self.to_fs_path(path);
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::metadata(&fs_path).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::Storage(format!("{} is a directory on disk", path)));
        }
        Ok(fs_path)
    }

    /// Remove directories left empty below the root, walking upwards.
    async fn prune_empty_dirs(&self, path: &RepoPath) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.is_root() {
                break;
            }
            // remove_dir only succeeds on empty directories.
            if fs::remove_dir(self.to_fs_path(&dir)).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

/// Set a file's modification time.
async fn set_modified(path: &Path, when: DateTime<Utc>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_modified(SystemTime::from(when))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Storage(format!("Blocking task failed: {}", e)))?
}

/// Hash a file on disk off the async runtime.
async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<FileHash> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || FileHash::compute_file(algorithm, &path))
        .await
        .map_err(|e| Error::Storage(format!("Blocking task failed: {}", e)))?
}

#[async_trait]
impl RepositoryProxy for LocalRepositoryProxy {
    fn name(&self) -> &str {
        "local"
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn manifest(&self) -> Result<Manifest> {
        Ok(self.manifest.read().await.clone())
    }

    async fn put_file(&self, source: &dyn RepositoryProxy, entry: &FileEntry) -> Result<()> {
        let staging = self.temp_directory()?;
        let staged = source.clone_file(&entry.path, &staging).await?;
        self.put_staged_file(&staged, entry).await
    }

    async fn put_staged_file(&self, staged: &Path, entry: &FileEntry) -> Result<()> {
        let result: Result<()> = async {
            let length = fs::metadata(staged).await?.len();
            let algorithm = match &entry.info.hash {
                Some(hash) => hash.algorithm,
                None => self.manifest.read().await.default_hash_algorithm(),
            };
            let actual = hash_file(staged, algorithm).await?;
            if let Some(expected) = &entry.info.hash {
                if *expected != actual || length != entry.info.length {
                    return Err(Error::Storage(format!(
                        "Content of {} changed since its manifest entry was recorded",
                        entry.path
                    )));
                }
            }

            set_modified(staged, entry.info.last_modified_utc).await?;
            let target = self.prepare_parent(&entry.path).await?;
            fs::rename(staged, &target).await?;

            let info = FileInfo {
                length,
                last_modified_utc: entry.info.last_modified_utc,
                registered_utc: entry.info.registered_utc,
                hash: Some(actual),
            };
            self.manifest
                .write()
                .await
                .tree_mut()
                .insert_file(&entry.path, info)?;
            self.mark_dirty();
            debug!(path = %entry.path, "Stored file");
            Ok(())
        }
        .await;

        if result.is_err() && fs::try_exists(staged).await.unwrap_or(false) {
            if let Err(e) = fs::remove_file(staged).await {
                warn!(path = %staged.display(), error = %e, "Could not remove staged file");
            }
        }
        result
    }

    async fn remove_file(&self, path: &RepoPath) -> Result<()> {
        if !self.manifest.read().await.tree().contains_file(path) {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        match fs::remove_file(self.to_fs_path(path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "File already gone from disk");
            }
            Err(e) => return Err(e.into()),
        }

        self.manifest.write().await.tree_mut().remove_file(path)?;
        self.mark_dirty();
        self.prune_empty_dirs(path).await;
        debug!(path = %path, "Removed file");
        Ok(())
    }

    async fn copy_file(&self, from: &RepoPath, to: &FileEntry) -> Result<()> {
        if !self.manifest.read().await.tree().contains_file(from) {
            return Err(Error::NotFound(format!("File not found: {}", from)));
        }
        self.ensure_vacant(&to.path).await?;

        let staging = self.temp_directory()?;
        let staged = self.clone_file(from, &staging).await?;
        self.put_staged_file(&staged, to).await
    }

    async fn copy_file_information(&self, target: &RepoPath, other: &FileEntry) -> Result<()> {
        if !self.manifest.read().await.tree().contains_file(target) {
            return Err(Error::NotFound(format!("File not found: {}", target)));
        }

        set_modified(&self.to_fs_path(target), other.info.last_modified_utc).await?;

        let mut manifest = self.manifest.write().await;
        let file = manifest
            .tree_mut()
            .get_file_mut(target)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", target)))?;
        file.info.last_modified_utc = other.info.last_modified_utc;
        file.info.registered_utc = other.info.registered_utc;
        self.mark_dirty();
        debug!(path = %target, "Updated file information");
        Ok(())
    }

    async fn move_file(&self, from: &RepoPath, to: &FileEntry) -> Result<()> {
        if !self.manifest.read().await.tree().contains_file(from) {
            return Err(Error::NotFound(format!("File not found: {}", from)));
        }
        self.ensure_vacant(&to.path).await?;

        let target = self.prepare_parent(&to.path).await?;
        fs::rename(self.to_fs_path(from), &target).await?;

        let mut info = to.info.clone();
        if let Err(e) = set_modified(&target, info.last_modified_utc).await {
            // The rename landed; record the time the file really has.
            warn!(path = %to.path, error = %e, "Could not set modification time");
            if let Ok(modified) = fs::metadata(&target).await.and_then(|m| m.modified()) {
                info.last_modified_utc = modified.into();
            }
        }

        self.manifest
            .write()
            .await
            .tree_mut()
            .move_file(from, &to.path, info)?;
        self.mark_dirty();
        self.prune_empty_dirs(from).await;
        debug!(from = %from, to = %to.path, "Moved file");
        Ok(())
    }

    async fn copy_manifest_information(&self, other: &ManifestInfo) -> Result<()> {
        self.manifest.write().await.copy_information_from(other);
        self.mark_dirty();
        Ok(())
    }

    async fn get_file(&self, path: &RepoPath) -> Result<FileHandle> {
        let fs_path = self.to_fs_path(path);
        if !fs::try_exists(&fs_path).await? {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }
        Ok(FileHandle::Local(fs_path))
    }

    async fn clone_file(&self, path: &RepoPath, target_dir: &Path) -> Result<PathBuf> {
        let fs_path = self.to_fs_path(path);
        if !fs::try_exists(&fs_path).await? {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }
        let target = target_dir.join(staged_name());
        fs::copy(&fs_path, &target).await?;
        Ok(target)
    }

    fn temp_directory(&self) -> Result<PathBuf> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "Repository {} was already released",
                self.root.display()
            )));
        }
        let mut staging = self.staging.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = staging.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new()
            .prefix("staging-")
            .tempdir_in(self.root.join(METADATA_DIRNAME))?;
        let path = dir.path().to_path_buf();
        *staging = Some(dir);
        Ok(path)
    }

    async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let json = match persist::to_json(&*self.manifest.read().await) {
            Ok(json) => json,
            Err(e) => {
                self.mark_dirty();
                return Err(e);
            }
        };

        let path = Self::manifest_path(&self.root);
        let tmp = path.with_extension("json.tmp");
        let written: std::io::Result<()> = async {
            fs::write(&tmp, json.as_bytes()).await?;
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            self.mark_dirty();
            return Err(e.into());
        }
        debug!(root = %self.root.display(), "Saved manifest");
        Ok(())
    }

    async fn cleanup_before_exit(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        let staging = self
            .staging
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dir) = staging {
            dir.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reposync_manifest::ManifestScanner;
    use tempfile::TempDir;

    fn p(s: &str) -> RepoPath {
        RepoPath::parse(s).unwrap()
    }

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, 12, 0, 0).unwrap()
    }

    fn repo_with(dir: &Path, files: &[(&str, &[u8])]) -> LocalRepositoryProxy {
        for (name, data) in files {
            let path = dir.join(name.trim_start_matches('/'));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
        let mut manifest = Manifest::new("test", HashAlgorithm::Sha256);
        ManifestScanner::new(dir).scan(&mut manifest).unwrap();
        LocalRepositoryProxy::create(dir, manifest).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let created = repo_with(dir.path(), &[("a.txt", b"alpha")]);
        let guid = created.manifest().await.unwrap().guid();

        assert!(LocalRepositoryProxy::create(dir.path(), Manifest::new("x", HashAlgorithm::Sha256)).is_err());

        let opened = LocalRepositoryProxy::open(dir.path()).unwrap();
        let manifest = opened.manifest().await.unwrap();
        assert_eq!(manifest.guid(), guid);
        assert!(manifest.tree().contains_file(&p("/a.txt")));
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            LocalRepositoryProxy::open(dir.path()),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_file_between_repositories() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = repo_with(src_dir.path(), &[("docs/a.txt", b"alpha")]);
        let dest = repo_with(dst_dir.path(), &[]);

        let mut entry = source.manifest().await.unwrap().entry(&p("/docs/a.txt")).unwrap();
        entry.info.last_modified_utc = t(3);
        dest.put_file(&source, &entry).await.unwrap();

        let on_disk = dst_dir.path().join("docs/a.txt");
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"alpha");
        let modified: DateTime<Utc> = std::fs::metadata(&on_disk).unwrap().modified().unwrap().into();
        assert_eq!(modified, t(3));
        assert_eq!(dest.manifest().await.unwrap().entry(&entry.path).unwrap(), entry);

        dest.flush().await.unwrap();
        let reopened = LocalRepositoryProxy::open(dst_dir.path()).unwrap();
        assert!(reopened.manifest().await.unwrap().tree().contains_file(&entry.path));
    }

    #[tokio::test]
    async fn test_put_file_rejects_stale_entry() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = repo_with(src_dir.path(), &[("a.txt", b"alpha")]);
        let dest = repo_with(dst_dir.path(), &[]);
        let entry = source.manifest().await.unwrap().entry(&p("/a.txt")).unwrap();

        std::fs::write(src_dir.path().join("a.txt"), b"edited").unwrap();
        assert!(matches!(
            dest.put_file(&source, &entry).await,
            Err(Error::Storage(_))
        ));
        assert!(!dst_dir.path().join("a.txt").exists());
        assert!(dest.manifest().await.unwrap().tree().is_empty());
    }

    #[tokio::test]
    async fn test_move_and_remove_prune_directories() {
        let dir = TempDir::new().unwrap();
        let repo = repo_with(dir.path(), &[("old/deep/f.txt", b"data")]);
        let mut entry = repo.manifest().await.unwrap().entry(&p("/old/deep/f.txt")).unwrap();
        entry.path = p("/new/f.txt");

        repo.move_file(&p("/old/deep/f.txt"), &entry).await.unwrap();
        assert!(!dir.path().join("old").exists());
        assert_eq!(std::fs::read(dir.path().join("new/f.txt")).unwrap(), b"data");

        repo.remove_file(&p("/new/f.txt")).await.unwrap();
        assert!(!dir.path().join("new").exists());
        assert!(repo.manifest().await.unwrap().tree().is_empty());
    }

    #[tokio::test]
    async fn test_move_and_copy_refuse_overwrite() {
        let dir = TempDir::new().unwrap();
        let repo = repo_with(dir.path(), &[("a", b"1"), ("b", b"2")]);
        let b = repo.manifest().await.unwrap().entry(&p("/b")).unwrap();

        assert!(matches!(
            repo.move_file(&p("/a"), &b).await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            repo.copy_file(&p("/a"), &b).await,
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_copy_file_within_repository() {
        let dir = TempDir::new().unwrap();
        let repo = repo_with(dir.path(), &[("a", b"same")]);
        let mut entry = repo.manifest().await.unwrap().entry(&p("/a")).unwrap();
        entry.path = p("/copies/a");

        repo.copy_file(&p("/a"), &entry).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("copies/a")).unwrap(), b"same");
        assert_eq!(repo.manifest().await.unwrap().tree().file_count(), 2);
    }

    #[tokio::test]
    async fn test_copy_file_information() {
        let dir = TempDir::new().unwrap();
        let repo = repo_with(dir.path(), &[("a", b"x")]);
        let mut other = repo.manifest().await.unwrap().entry(&p("/a")).unwrap();
        other.info.last_modified_utc = t(10);
        other.info.registered_utc = t(9);

        repo.copy_file_information(&p("/a"), &other).await.unwrap();
        let entry = repo.manifest().await.unwrap().entry(&p("/a")).unwrap();
        assert_eq!(entry.info, other.info);
        let modified: DateTime<Utc> = std::fs::metadata(dir.path().join("a")).unwrap().modified().unwrap().into();
        assert_eq!(modified, t(10));
    }

    #[tokio::test]
    async fn test_cleanup_releases_staging() {
        let dir = TempDir::new().unwrap();
        let repo = repo_with(dir.path(), &[]);
        let staging = repo.temp_directory().unwrap();
        assert!(staging.starts_with(dir.path().join(METADATA_DIRNAME)));
        assert!(staging.exists());

        repo.cleanup_before_exit().await.unwrap();
        assert!(!staging.exists());
        assert!(repo.temp_directory().is_err());
    }
}
