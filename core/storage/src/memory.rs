//! In-memory repository proxy for testing.
//!
//! Records every contract call and can be told to fail specific
//! operations, so engine behavior (call counts, failure isolation, partial
//! moves) is observable without touching disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

use crate::proxy::{staged_name, FileHandle, RepositoryProxy};
use reposync_common::{Error, RepoPath, Result};
use reposync_manifest::{FileEntry, FileHash, FileInfo, HashAlgorithm, Manifest, ManifestInfo};

/// Contract operation, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyOp {
    PutFile,
    PutStagedFile,
    RemoveFile,
    CopyFile,
    CopyFileInformation,
    MoveFile,
    CopyManifestInformation,
    GetFile,
    CloneFile,
    Flush,
    Cleanup,
}

/// One recorded call. `target` is the second path for copies and moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCall {
    pub op: ProxyOp,
    pub path: Option<RepoPath>,
    pub target: Option<RepoPath>,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Permanent,
    Transient(u32),
}

struct MemoryState {
    manifest: Manifest,
    contents: HashMap<RepoPath, Vec<u8>>,
    calls: Vec<ProxyCall>,
    failures: HashMap<(ProxyOp, RepoPath), Failure>,
    flushes: usize,
}

/// Repository held entirely in memory.
pub struct MemoryRepositoryProxy {
    name: String,
    state: Mutex<MemoryState>,
    staging: Mutex<Option<TempDir>>,
    supports_rename: bool,
}

impl MemoryRepositoryProxy {
    /// Create an empty repository.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let manifest = Manifest::new(name.clone(), HashAlgorithm::Sha256);
        Self::with_manifest(name, manifest)
    }

    /// Create a repository around an existing manifest. Files in the
    /// manifest have no content until `insert_file` provides it.
    pub fn with_manifest(name: impl Into<String>, manifest: Manifest) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                manifest,
                contents: HashMap::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                flushes: 0,
            }),
            staging: Mutex::new(None),
            supports_rename: true,
        }
    }

    /// Refuse in-place relocation, like a transport without rename.
    pub fn without_rename(mut self) -> Self {
        self.supports_rename = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `content` at `path` and record it in the manifest.
    pub fn insert_file(
        &self,
        path: &RepoPath,
        content: &[u8],
        last_modified_utc: DateTime<Utc>,
        registered_utc: DateTime<Utc>,
    ) -> Result<FileEntry> {
        let mut state = self.state();
        let algorithm = state.manifest.default_hash_algorithm();
        let info = FileInfo {
            length: content.len() as u64,
            last_modified_utc,
            registered_utc,
            hash: Some(FileHash::compute(algorithm, content)),
        };
        state.manifest.tree_mut().insert_file(path, info.clone())?;
        state.contents.insert(path.clone(), content.to_vec());
        Ok(FileEntry::new(path.clone(), info))
    }

    /// Stored bytes at `path`.
    pub fn content(&self, path: &RepoPath) -> Option<Vec<u8>> {
        self.state().contents.get(path).cloned()
    }

    /// Every stored path with its bytes, sorted by path.
    pub fn contents(&self) -> Vec<(RepoPath, Vec<u8>)> {
        let mut all: Vec<_> = self
            .state()
            .contents
            .iter()
            .map(|(p, c)| (p.clone(), c.clone()))
            .collect();
        all.sort();
        all
    }

    /// Make every call of `op` on `path` fail.
    pub fn fail_on(&self, op: ProxyOp, path: &RepoPath) {
        self.state()
            .failures
            .insert((op, path.clone()), Failure::Permanent);
    }

    /// Make the next `times` calls of `op` on `path` fail with a
    /// retryable network error.
    pub fn fail_transiently(&self, op: ProxyOp, path: &RepoPath, times: u32) {
        self.state()
            .failures
            .insert((op, path.clone()), Failure::Transient(times));
    }

    /// The call log.
    pub fn calls(&self) -> Vec<ProxyCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of logged calls of `op`.
    pub fn count(&self, op: ProxyOp) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Number of logged calls of `op` whose first path is `path`.
    pub fn count_for(&self, op: ProxyOp, path: &RepoPath) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op && c.path.as_ref() == Some(path))
            .count()
    }

    /// Number of flushes.
    pub fn flushes(&self) -> usize {
        self.state().flushes
    }

    /// Log the call and apply any injected failure.
    fn record(&self, op: ProxyOp, path: Option<&RepoPath>, target: Option<&RepoPath>) -> Result<()> {
        let mut state = self.state();
        state.calls.push(ProxyCall {
            op,
            path: path.cloned(),
            target: target.cloned(),
        });
        let Some(path) = path else {
            return Ok(());
        };
        let key = (op, path.clone());
        match state.failures.get(&key).copied() {
            None => Ok(()),
            Some(Failure::Permanent) => Err(Error::Storage(format!(
                "Injected failure: {:?} {}",
                op, path
            ))),
            Some(Failure::Transient(remaining)) => {
                if remaining <= 1 {
                    state.failures.remove(&key);
                } else {
                    state.failures.insert(key, Failure::Transient(remaining - 1));
                }
                Err(Error::Network(format!(
                    "Injected transient failure: {:?} {}",
                    op, path
                )))
            }
        }
    }

    fn store(&self, entry: &FileEntry, data: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        let algorithm = match &entry.info.hash {
            Some(hash) => hash.algorithm,
            None => state.manifest.default_hash_algorithm(),
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
        let info = FileInfo {
            length: data.len() as u64,
            last_modified_utc: entry.info.last_modified_utc,
            registered_utc: entry.info.registered_utc,
            hash: Some(actual),
        };
        state.manifest.tree_mut().insert_file(&entry.path, info)?;
        state.contents.insert(entry.path.clone(), data);
        Ok(())
    }

    fn read(&self, path: &RepoPath) -> Result<Vec<u8>> {
        self.state()
            .contents
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))
    }

    fn ensure_vacant(&self, path: &RepoPath) -> Result<()> {
        let state = self.state();
        if state.manifest.tree().contains_file(path) || state.contents.contains_key(path) {
            return Err(Error::AlreadyExists(format!("{} already exists", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryProxy for MemoryRepositoryProxy {
    fn name(&self) -> &str {
        "memory"
    }

    fn location(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn manifest(&self) -> Result<Manifest> {
        Ok(self.state().manifest.clone())
    }

    async fn put_file(&self, source: &dyn RepositoryProxy, entry: &FileEntry) -> Result<()> {
        self.record(ProxyOp::PutFile, Some(&entry.path), None)?;
        let data = source.get_file(&entry.path).await?.read_all().await?;
        self.store(entry, data)
    }

    async fn put_staged_file(&self, staged: &Path, entry: &FileEntry) -> Result<()> {
        self.record(ProxyOp::PutStagedFile, Some(&entry.path), None)?;
        let data = tokio::fs::read(staged).await?;
        tokio::fs::remove_file(staged).await?;
        self.store(entry, data)
    }

    async fn remove_file(&self, path: &RepoPath) -> Result<()> {
        self.record(ProxyOp::RemoveFile, Some(path), None)?;
        let mut state = self.state();
        state.manifest.tree_mut().remove_file(path)?;
        state.contents.remove(path);
        Ok(())
    }

    async fn copy_file(&self, from: &RepoPath, to: &FileEntry) -> Result<()> {
        self.record(ProxyOp::CopyFile, Some(from), Some(&to.path))?;
        self.ensure_vacant(&to.path)?;
        let data = self.read(from)?;
        self.store(to, data)
    }

    async fn copy_file_information(&self, target: &RepoPath, other: &FileEntry) -> Result<()> {
        self.record(ProxyOp::CopyFileInformation, Some(target), None)?;
        let mut state = self.state();
        let file = state
            .manifest
            .tree_mut()
            .get_file_mut(target)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", target)))?;
        file.info.last_modified_utc = other.info.last_modified_utc;
        file.info.registered_utc = other.info.registered_utc;
        Ok(())
    }

    async fn move_file(&self, from: &RepoPath, to: &FileEntry) -> Result<()> {
        self.record(ProxyOp::MoveFile, Some(from), Some(&to.path))?;
        if !self.supports_rename {
            return Err(Error::NotPermitted(format!(
                "{} cannot relocate files in place",
                self.location()
            )));
        }
        self.ensure_vacant(&to.path)?;
        let mut state = self.state();
        let data = state
            .contents
            .remove(from)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", from)))?;
        if let Err(e) = state
            .manifest
            .tree_mut()
            .move_file(from, &to.path, to.info.clone())
        {
            state.contents.insert(from.clone(), data);
            return Err(e);
        }
        state.contents.insert(to.path.clone(), data);
        Ok(())
    }

    async fn copy_manifest_information(&self, other: &ManifestInfo) -> Result<()> {
        self.record(ProxyOp::CopyManifestInformation, None, None)?;
        self.state().manifest.copy_information_from(other);
        Ok(())
    }

    async fn get_file(&self, path: &RepoPath) -> Result<FileHandle> {
        self.record(ProxyOp::GetFile, Some(path), None)?;
        Ok(FileHandle::Memory(self.read(path)?))
    }

    async fn clone_file(&self, path: &RepoPath, target_dir: &Path) -> Result<PathBuf> {
        self.record(ProxyOp::CloneFile, Some(path), None)?;
        let data = self.read(path)?;
        let target = target_dir.join(staged_name());
        tokio::fs::write(&target, data).await?;
        Ok(target)
    }

    fn temp_directory(&self) -> Result<PathBuf> {
        let mut staging = self.staging.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = staging.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new().prefix("reposync-memory-").tempdir()?;
        let path = dir.path().to_path_buf();
        *staging = Some(dir);
        Ok(path)
    }

    async fn flush(&self) -> Result<()> {
        self.record(ProxyOp::Flush, None, None)?;
        self.state().flushes += 1;
        Ok(())
    }

    async fn cleanup_before_exit(&self) -> Result<()> {
        self.record(ProxyOp::Cleanup, None, None)?;
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
