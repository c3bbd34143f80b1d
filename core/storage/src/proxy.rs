//! Repository proxy trait definition.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use reposync_common::{RepoPath, Result};
use reposync_manifest::{FileEntry, Manifest, ManifestInfo};

/// Read access to one file's content.
#[derive(Debug)]
pub enum FileHandle {
    /// Content lives at a path on the local filesystem.
    Local(PathBuf),
    /// Content already held in memory.
    Memory(Vec<u8>),
}

impl FileHandle {
    /// Read the whole content.
    pub async fn read_all(self) -> Result<Vec<u8>> {
        match self {
            FileHandle::Local(path) => Ok(tokio::fs::read(&path).await?),
            FileHandle::Memory(data) => Ok(data),
        }
    }
}

/// Transport-independent access to one repository.
///
/// Every implementation updates its manifest only after the storage
/// effect of an operation fully landed, so a failed or partial call leaves
/// the manifest describing what is actually stored. Metadata taken from
/// the other side's entry (modification and registration times) is written
/// into both storage and manifest.
#[async_trait]
pub trait RepositoryProxy: Send + Sync {
    /// Transport name (e.g., "local", "crypt", "memory").
    fn name(&self) -> &str;

    /// Human readable location, for messages.
    fn location(&self) -> String;

    /// Snapshot of the current manifest.
    async fn manifest(&self) -> Result<Manifest>;

    /// Transfer `entry`'s content and metadata from `source` into this
    /// repository at `entry.path`, creating or replacing.
    ///
    /// # Errors
    /// - Content read from `source` does not match `entry`'s hash
    /// - Transport I/O errors
    async fn put_file(&self, source: &dyn RepositoryProxy, entry: &FileEntry) -> Result<()>;

    /// Adopt a file already written into this proxy's `temp_directory()`
    /// as `entry`. The staged file is consumed.
    async fn put_staged_file(&self, staged: &Path, entry: &FileEntry) -> Result<()>;

    /// Remove the file at `path`.
    async fn remove_file(&self, path: &RepoPath) -> Result<()>;

    /// Duplicate the file at `from` inside this repository to `to.path`,
    /// recording `to.info`.
    ///
    /// # Errors
    /// - `AlreadyExists` if `to.path` is taken
    async fn copy_file(&self, from: &RepoPath, to: &FileEntry) -> Result<()>;

    /// Metadata-only update of the file at `target` from `other`.
    async fn copy_file_information(&self, target: &RepoPath, other: &FileEntry) -> Result<()>;

    /// Relocate the file at `from` to `to.path`, recording `to.info`.
    ///
    /// # Errors
    /// - `AlreadyExists` if `to.path` is taken
    /// - `NotPermitted` if this transport cannot relocate in place
    async fn move_file(&self, from: &RepoPath, to: &FileEntry) -> Result<()>;

    /// Adopt name, description, ignore patterns and hash method of another
    /// manifest.
    async fn copy_manifest_information(&self, other: &ManifestInfo) -> Result<()>;

    /// Open the file at `path` for reading.
    async fn get_file(&self, path: &RepoPath) -> Result<FileHandle>;

    /// Copy the file at `path` into `target_dir`, returning the new path.
    async fn clone_file(&self, path: &RepoPath, target_dir: &Path) -> Result<PathBuf>;

    /// Staging area for write-then-rename transfers into this repository.
    fn temp_directory(&self) -> Result<PathBuf>;

    /// Persist the manifest if it changed.
    async fn flush(&self) -> Result<()>;

    /// Release staging areas and connections. The proxy must not be used
    /// for writes afterwards.
    async fn cleanup_before_exit(&self) -> Result<()>;
}

/// Name for a file staged into a temp directory.
pub(crate) fn staged_name() -> String {
    format!("{}.part", uuid::Uuid::new_v4())
}
