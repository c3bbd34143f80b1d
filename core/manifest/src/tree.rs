//! Manifest directory tree.
//!
//! Directories live in an arena owned by `ManifestTree` and are addressed by
//! `DirId`. A directory exclusively owns its files; subdirectories are named
//! by handle. The parent relation on files and directories is a lookup-only
//! handle resolved through the tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hash::FileHash;
use reposync_common::{Error, RepoPath, Result};

/// Handle to a directory slot in a `ManifestTree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(usize);

impl DirId {
    /// The root directory of every tree.
    pub const ROOT: DirId = DirId(0);
}

/// Recorded state of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Length in bytes.
    pub length: u64,
    /// Modification time observed on the storage medium.
    pub last_modified_utc: DateTime<Utc>,
    /// When this manifest first recorded the file.
    pub registered_utc: DateTime<Utc>,
    /// Content hash; `None` until first computed.
    pub hash: Option<FileHash>,
}

impl FileInfo {
    /// True if the hash is usable for content matching.
    pub fn has_hash(&self) -> bool {
        self.hash.is_some()
    }
}

/// A file owned by a manifest directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub name: String,
    pub parent: DirId,
    pub info: FileInfo,
}

/// Detached snapshot of a file, addressed by full path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: RepoPath,
    pub info: FileInfo,
}

impl FileEntry {
    pub fn new(path: RepoPath, info: FileInfo) -> Self {
        Self { path, info }
    }
}

/// A directory in the manifest tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDirectory {
    name: String,
    parent: Option<DirId>,
    files: BTreeMap<String, ManifestFile>,
    subdirs: BTreeMap<String, DirId>,
}

impl ManifestDirectory {
    fn new(name: String, parent: Option<DirId>) -> Self {
        Self {
            name,
            parent,
            files: BTreeMap::new(),
            subdirs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<DirId> {
        self.parent
    }

    /// Files directly in this directory, by name.
    pub fn files(&self) -> impl Iterator<Item = &ManifestFile> {
        self.files.values()
    }

    /// Subdirectory handles, by name.
    pub fn subdirectories(&self) -> impl Iterator<Item = (&str, DirId)> {
        self.subdirs.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.subdirs.is_empty()
    }
}

/// Arena-backed directory tree of a manifest.
#[derive(Debug, Clone)]
pub struct ManifestTree {
    slots: Vec<Option<ManifestDirectory>>,
    free: Vec<usize>,
}

impl Default for ManifestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ManifestTree {
    fn eq(&self, other: &Self) -> bool {
        self.files() == other.files()
    }
}

impl ManifestTree {
    /// Create a tree holding only the root directory.
    pub fn new() -> Self {
        Self {
            slots: vec![Some(ManifestDirectory::new(String::new(), None))],
            free: Vec::new(),
        }
    }

    /// Root directory handle.
    pub fn root(&self) -> DirId {
        DirId::ROOT
    }

    /// Resolve a directory handle.
    pub fn directory(&self, id: DirId) -> Option<&ManifestDirectory> {
        self.slots.get(id.0).and_then(|slot| slot.as_ref())
    }

    fn dir(&self, id: DirId) -> Result<&ManifestDirectory> {
        self.directory(id)
            .ok_or_else(|| Error::Manifest(format!("Dangling directory handle {:?}", id)))
    }

    fn dir_mut(&mut self, id: DirId) -> Result<&mut ManifestDirectory> {
        self.slots
            .get_mut(id.0)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| Error::Manifest(format!("Dangling directory handle {:?}", id)))
    }

    fn alloc(&mut self, dir: ManifestDirectory) -> DirId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(dir);
                DirId(index)
            }
            None => {
                self.slots.push(Some(dir));
                DirId(self.slots.len() - 1)
            }
        }
    }

    /// Find the directory at `path`, if present.
    pub fn find_directory(&self, path: &RepoPath) -> Option<DirId> {
        let mut current = DirId::ROOT;
        for component in path.components() {
            current = *self.directory(current)?.subdirs.get(component)?;
        }
        Some(current)
    }

    /// Look up the file at `path`.
    pub fn get_file(&self, path: &RepoPath) -> Option<&ManifestFile> {
        let name = path.name()?;
        let dir = self.find_directory(&path.parent()?)?;
        self.directory(dir)?.files.get(name)
    }

    /// Look up the file at `path` for in-place edits of its info.
    pub fn get_file_mut(&mut self, path: &RepoPath) -> Option<&mut ManifestFile> {
        let name = path.name()?;
        let dir = self.find_directory(&path.parent()?)?;
        self.slots.get_mut(dir.0)?.as_mut()?.files.get_mut(name)
    }

    pub fn contains_file(&self, path: &RepoPath) -> bool {
        self.get_file(path).is_some()
    }

    /// Full path of a directory.
    pub fn directory_path(&self, id: DirId) -> RepoPath {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(dir_id) = current {
            match self.directory(dir_id) {
                Some(dir) if dir.parent.is_some() => {
                    names.push(dir.name.clone());
                    current = dir.parent;
                }
                _ => break,
            }
        }
        names.reverse();
        // Names were validated on insert.
        RepoPath::from_components(names).unwrap_or_else(|_| RepoPath::root())
    }

    /// Full path of a file.
    pub fn path_of(&self, file: &ManifestFile) -> Result<RepoPath> {
        self.directory_path(file.parent).join(&file.name)
    }

    /// Record a file at `path`, creating intermediate directories and
    /// replacing any existing file there.
    ///
    /// # Errors
    /// - `path` is the root
    /// - a file sits where a directory is needed, or a directory sits at `path`
    pub fn insert_file(&mut self, path: &RepoPath, info: FileInfo) -> Result<()> {
        let (name, parent_path) = match (path.name(), path.parent()) {
            (Some(name), Some(parent)) => (name.to_string(), parent),
            _ => {
                return Err(Error::InvalidInput(
                    "Cannot record a file at the root".to_string(),
                ))
            }
        };

        let mut current = DirId::ROOT;
        for component in parent_path.components() {
            let dir = self.dir(current)?;
            if dir.files.contains_key(component) {
                return Err(Error::Manifest(format!(
                    "Cannot create directory for {}: '{}' is a file",
                    path, component
                )));
            }
            let existing = dir.subdirs.get(component).copied();
            current = match existing {
                Some(id) => id,
                None => {
                    let id = self.alloc(ManifestDirectory::new(component.clone(), Some(current)));
                    self.dir_mut(current)?.subdirs.insert(component.clone(), id);
                    id
                }
            };
        }

        let dir = self.dir_mut(current)?;
        if dir.subdirs.contains_key(&name) {
            return Err(Error::Manifest(format!("{} is a directory", path)));
        }
        dir.files.insert(
            name.clone(),
            ManifestFile {
                name,
                parent: current,
                info,
            },
        );
        Ok(())
    }

    /// Remove the file at `path`, pruning directories left empty.
    pub fn remove_file(&mut self, path: &RepoPath) -> Result<ManifestFile> {
        let not_found = || Error::NotFound(format!("File not found in manifest: {}", path));
        let name = path.name().ok_or_else(not_found)?;
        let dir_id = path
            .parent()
            .and_then(|p| self.find_directory(&p))
            .ok_or_else(not_found)?;
        let removed = self
            .dir_mut(dir_id)?
            .files
            .remove(name)
            .ok_or_else(not_found)?;
        self.prune(dir_id)?;
        Ok(removed)
    }

    fn prune(&mut self, mut id: DirId) -> Result<()> {
        while id != DirId::ROOT {
            let dir = self.dir(id)?;
            if !dir.is_empty() {
                break;
            }
            let parent = dir
                .parent
                .ok_or_else(|| Error::Manifest("Non-root directory without parent".to_string()))?;
            let name = dir.name.clone();
            self.dir_mut(parent)?.subdirs.remove(&name);
            self.slots[id.0] = None;
            self.free.push(id.0);
            id = parent;
        }
        Ok(())
    }

    /// Relocate the file at `from` to `to`, recording `info` for it.
    ///
    /// On failure the tree is left as it was.
    pub fn move_file(&mut self, from: &RepoPath, to: &RepoPath, info: FileInfo) -> Result<()> {
        if self.contains_file(to) {
            return Err(Error::AlreadyExists(format!("{} already exists", to)));
        }
        let removed = self.remove_file(from)?;
        if let Err(e) = self.insert_file(to, info) {
            self.insert_file(from, removed.info)?;
            return Err(e);
        }
        Ok(())
    }

    /// Snapshot of every file, sorted by path.
    pub fn files(&self) -> Vec<FileEntry> {
        let mut out = Vec::new();
        let mut stack = vec![(DirId::ROOT, RepoPath::root())];
        while let Some((id, dir_path)) = stack.pop() {
            let Some(dir) = self.directory(id) else {
                continue;
            };
            for file in dir.files.values() {
                if let Ok(path) = dir_path.join(&file.name) {
                    out.push(FileEntry::new(path, file.info.clone()));
                }
            }
            for (name, sub) in &dir.subdirs {
                if let Ok(path) = dir_path.join(name) {
                    stack.push((*sub, path));
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    pub fn file_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|dir| dir.files.len())
            .sum()
    }

    pub fn total_length(&self) -> u64 {
        self.slots
            .iter()
            .flatten()
            .flat_map(|dir| dir.files.values())
            .map(|file| file.info.length)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{FileHash, HashAlgorithm};
    use chrono::TimeZone;

    fn info(len: u64) -> FileInfo {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        FileInfo {
            length: len,
            last_modified_utc: t,
            registered_utc: t,
            hash: Some(FileHash::compute(HashAlgorithm::Sha256, &len.to_le_bytes())),
        }
    }

    fn p(s: &str) -> RepoPath {
        RepoPath::parse(s).unwrap()
    }

    #[test]
    fn test_insert_creates_directories() {
        let mut tree = ManifestTree::new();
        tree.insert_file(&p("/a/b/c.txt"), info(3)).unwrap();

        let dir = tree.find_directory(&p("/a/b")).unwrap();
        assert_eq!(tree.directory_path(dir), p("/a/b"));
        let file = tree.get_file(&p("/a/b/c.txt")).unwrap();
        assert_eq!(file.parent, dir);
        assert_eq!(tree.path_of(file).unwrap(), p("/a/b/c.txt"));
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn test_insert_replaces_existing_file() {
        let mut tree = ManifestTree::new();
        tree.insert_file(&p("/x"), info(1)).unwrap();
        tree.insert_file(&p("/x"), info(9)).unwrap();
        assert_eq!(tree.file_count(), 1);
        assert_eq!(tree.get_file(&p("/x")).unwrap().info.length, 9);
    }

    #[test]
    fn test_file_directory_conflicts() {
        let mut tree = ManifestTree::new();
        tree.insert_file(&p("/a/b"), info(1)).unwrap();
        assert!(tree.insert_file(&p("/a/b/c"), info(1)).is_err());
        assert!(tree.insert_file(&p("/a"), info(1)).is_err());
        assert!(tree.insert_file(&RepoPath::root(), info(1)).is_err());
    }

    #[test]
    fn test_remove_prunes_empty_directories() {
        let mut tree = ManifestTree::new();
        tree.insert_file(&p("/a/b/c.txt"), info(3)).unwrap();
        tree.insert_file(&p("/a/d.txt"), info(4)).unwrap();

        tree.remove_file(&p("/a/b/c.txt")).unwrap();
        assert!(tree.find_directory(&p("/a/b")).is_none());
        assert!(tree.find_directory(&p("/a")).is_some());

        tree.remove_file(&p("/a/d.txt")).unwrap();
        assert!(tree.find_directory(&p("/a")).is_none());
        assert!(tree.is_empty());
        assert!(matches!(
            tree.remove_file(&p("/a/d.txt")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut tree = ManifestTree::new();
        tree.insert_file(&p("/a/x"), info(1)).unwrap();
        tree.remove_file(&p("/a/x")).unwrap();
        tree.insert_file(&p("/b/y"), info(1)).unwrap();
        assert_eq!(tree.slots.len(), 2);
        assert_eq!(tree.directory_path(tree.find_directory(&p("/b")).unwrap()), p("/b"));
    }

    #[test]
    fn test_move_file() {
        let mut tree = ManifestTree::new();
        tree.insert_file(&p("/old/f"), info(5)).unwrap();
        tree.move_file(&p("/old/f"), &p("/new/g"), info(5)).unwrap();
        assert!(!tree.contains_file(&p("/old/f")));
        assert!(tree.find_directory(&p("/old")).is_none());
        assert_eq!(tree.get_file(&p("/new/g")).unwrap().info, info(5));
    }

    #[test]
    fn test_failed_move_restores_source() {
        let mut tree = ManifestTree::new();
        tree.insert_file(&p("/f"), info(5)).unwrap();
        tree.insert_file(&p("/blocker"), info(1)).unwrap();

        assert!(tree.move_file(&p("/f"), &p("/blocker/g"), info(5)).is_err());
        assert!(tree.contains_file(&p("/f")));
        assert!(matches!(
            tree.move_file(&p("/f"), &p("/blocker"), info(5)),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_files_sorted_by_path() {
        let mut tree = ManifestTree::new();
        tree.insert_file(&p("/b.txt"), info(1)).unwrap();
        tree.insert_file(&p("/a/z.txt"), info(2)).unwrap();
        tree.insert_file(&p("/a.txt"), info(3)).unwrap();

        let paths: Vec<String> = tree.files().iter().map(|e| e.path.to_string()).collect();
        assert_eq!(paths, vec!["/a/z.txt", "/a.txt", "/b.txt"]);
        assert_eq!(tree.total_length(), 6);
    }
}
