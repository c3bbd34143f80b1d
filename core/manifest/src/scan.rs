//! Refresh a manifest from a directory on disk.
//!
//! Files whose length and modification time still match their manifest
//! entry keep their recorded hash without being read again.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::hash::{FileHash, HashAlgorithm};
use crate::ignore::IgnoreMatcher;
use crate::manifest::Manifest;
use crate::persist::METADATA_DIRNAME;
use crate::tree::FileInfo;
use reposync_common::{RepoPath, Result};

/// A path the scan could not read; its manifest state was left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    pub path: Option<RepoPath>,
    pub message: String,
}

/// Outcome of one scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub added: Vec<RepoPath>,
    pub updated: Vec<RepoPath>,
    pub removed: Vec<RepoPath>,
    pub unchanged: usize,
    pub warnings: Vec<ScanWarning>,
}

impl ScanReport {
    /// True if the manifest's file tree changed.
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Walks a repository root and reconciles its manifest with what is on disk.
pub struct ManifestScanner {
    root: PathBuf,
}

impl ManifestScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the tree and update `manifest` in place.
    ///
    /// # Errors
    /// Fails only if the ignore patterns do not compile; per-file problems
    /// end up in `ScanReport::warnings`.
    pub fn scan(&self, manifest: &mut Manifest) -> Result<ScanReport> {
        self.scan_with(manifest, FileHash::compute_file)
    }

    /// `scan` with the file hasher supplied by the caller.
    fn scan_with<H>(&self, manifest: &mut Manifest, hash_file: H) -> Result<ScanReport>
    where
        H: Fn(HashAlgorithm, &Path) -> Result<FileHash>,
    {
        let matcher = IgnoreMatcher::new(manifest.ignore_patterns())?;
        let algorithm = manifest.default_hash_algorithm();
        let now = Utc::now();

        let mut report = ScanReport::default();
        let mut seen: HashSet<RepoPath> = HashSet::new();
        let mut unreadable: Vec<RepoPath> = Vec::new();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(entry, &matcher));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().and_then(|p| self.repo_path(p));
                    warn!(error = %e, "Could not read directory entry");
                    if let Some(path) = &path {
                        unreadable.push(path.clone());
                    }
                    report.warnings.push(ScanWarning {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(path) = self.repo_path(entry.path()) else {
                report.warnings.push(ScanWarning {
                    path: None,
                    message: format!("Unsupported file name: {}", entry.path().display()),
                });
                continue;
            };
            seen.insert(path.clone());

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path, error = %e, "Could not stat file");
                    report.warnings.push(ScanWarning {
                        path: Some(path),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            let length = metadata.len();
            let last_modified_utc: DateTime<Utc> = match metadata.modified() {
                Ok(t) => t.into(),
                Err(e) => {
                    report.warnings.push(ScanWarning {
                        path: Some(path),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let existing = manifest.tree().get_file(&path).map(|f| f.info.clone());
            if let Some(info) = &existing {
                let hash_current = info
                    .hash
                    .as_ref()
                    .is_some_and(|h| h.algorithm == algorithm);
                if info.length == length && info.last_modified_utc == last_modified_utc && hash_current
                {
                    report.unchanged += 1;
                    continue;
                }
            }

            let hash = match hash_file(algorithm, entry.path()) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(path = %path, error = %e, "Could not hash file");
                    report.warnings.push(ScanWarning {
                        path: Some(path),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let registered_utc = existing.as_ref().map_or(now, |info| info.registered_utc);
            let info = FileInfo {
                length,
                last_modified_utc,
                registered_utc,
                hash: Some(hash),
            };
            match manifest.tree_mut().insert_file(&path, info) {
                Ok(()) => {
                    debug!(path = %path, "Recorded file");
                    if existing.is_some() {
                        report.updated.push(path);
                    } else {
                        report.added.push(path);
                    }
                }
                Err(e) => report.warnings.push(ScanWarning {
                    path: Some(path),
                    message: e.to_string(),
                }),
            }
        }

        for entry in manifest.files() {
            if seen.contains(&entry.path) {
                continue;
            }
            if unreadable.iter().any(|dir| entry.path.starts_with(dir)) {
                continue;
            }
            manifest.tree_mut().remove_file(&entry.path)?;
            debug!(path = %entry.path, "File no longer present");
            report.removed.push(entry.path);
        }

        manifest.set_last_update_utc(now);
        Ok(report)
    }

    fn is_excluded(&self, entry: &DirEntry, matcher: &IgnoreMatcher) -> bool {
        if entry.depth() == 1 && entry.file_name() == METADATA_DIRNAME {
            return true;
        }
        match self.repo_path(entry.path()) {
            Some(path) => matcher.is_ignored(&path),
            None => false,
        }
    }

    fn repo_path(&self, path: &Path) -> Option<RepoPath> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let components = relative
            .components()
            .map(|c| c.as_os_str().to_str().map(String::from))
            .collect::<Option<Vec<_>>>()?;
        RepoPath::from_components(components).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use std::fs;
    use tempfile::TempDir;

    fn p(s: &str) -> RepoPath {
        RepoPath::parse(s).unwrap()
    }

    #[test]
    fn test_scan_records_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();
        fs::create_dir_all(dir.path().join(METADATA_DIRNAME)).unwrap();
        fs::write(dir.path().join(METADATA_DIRNAME).join("manifest.json"), b"{}").unwrap();

        let mut manifest = Manifest::new("t", HashAlgorithm::Sha256);
        let report = ManifestScanner::new(dir.path()).scan(&mut manifest).unwrap();

        assert_eq!(report.added, vec![p("/a.txt"), p("/sub/b.txt")]);
        assert_eq!(manifest.tree().file_count(), 2);
        let a = manifest.entry(&p("/a.txt")).unwrap();
        assert_eq!(a.info.length, 5);
        assert_eq!(
            a.info.hash,
            Some(FileHash::compute(HashAlgorithm::Sha256, b"alpha"))
        );
        assert!(manifest.last_update_utc().is_some());
    }

    #[test]
    fn test_rescan_skips_unchanged_and_keeps_registration() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"one").unwrap();
        fs::write(dir.path().join("b.txt"), b"two").unwrap();

        let scanner = ManifestScanner::new(dir.path());
        let mut manifest = Manifest::new("t", HashAlgorithm::Sha256);
        scanner.scan(&mut manifest).unwrap();
        let registered = manifest.entry(&p("/a.txt")).unwrap().info.registered_utc;

        // A bogus hash survives a rescan when length and mtime still match.
        let bogus = FileHash::compute(HashAlgorithm::Sha256, b"not the content");
        manifest
            .tree_mut()
            .get_file_mut(&p("/b.txt"))
            .unwrap()
            .info
            .hash = Some(bogus.clone());

        fs::write(dir.path().join("a.txt"), b"one, longer").unwrap();
        let report = scanner.scan(&mut manifest).unwrap();

        assert_eq!(report.updated, vec![p("/a.txt")]);
        assert_eq!(report.unchanged, 1);
        let a = manifest.entry(&p("/a.txt")).unwrap();
        assert_eq!(a.info.registered_utc, registered);
        assert_eq!(a.info.length, 11);
        assert_eq!(manifest.entry(&p("/b.txt")).unwrap().info.hash, Some(bogus));
    }

    #[test]
    fn test_scan_removes_vanished_and_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        fs::write(dir.path().join("gone.txt"), b"g").unwrap();
        fs::write(dir.path().join("scratch.tmp"), b"t").unwrap();

        let scanner = ManifestScanner::new(dir.path());
        let mut manifest = Manifest::new("t", HashAlgorithm::Sha256);
        scanner.scan(&mut manifest).unwrap();
        assert_eq!(manifest.tree().file_count(), 3);

        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        manifest.set_ignore_patterns(vec!["*.tmp".to_string()]);
        let report = scanner.scan(&mut manifest).unwrap();

        assert_eq!(report.removed, vec![p("/gone.txt"), p("/scratch.tmp")]);
        assert_eq!(manifest.files().len(), 1);
        assert!(report.changed());
    }

    #[test]
    fn test_unreadable_file_keeps_previous_entry() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("locked.txt"), b"v1").unwrap();
        fs::write(dir.path().join("open.txt"), b"v1").unwrap();

        let scanner = ManifestScanner::new(dir.path());
        let mut manifest = Manifest::new("t", HashAlgorithm::Sha256);
        scanner.scan(&mut manifest).unwrap();
        let before = manifest.entry(&p("/locked.txt")).unwrap();

        fs::write(dir.path().join("locked.txt"), b"version two").unwrap();
        fs::write(dir.path().join("open.txt"), b"version two").unwrap();
        let report = scanner
            .scan_with(&mut manifest, |algorithm, path| {
                if path.ends_with("locked.txt") {
                    Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into())
                } else {
                    FileHash::compute_file(algorithm, path)
                }
            })
            .unwrap();

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].path, Some(p("/locked.txt")));
        assert!(report.warnings[0].message.contains("denied"));
        assert_eq!(report.updated, vec![p("/open.txt")]);
        assert!(report.removed.is_empty());
        assert_eq!(manifest.entry(&p("/locked.txt")).unwrap(), before);
    }

    #[test]
    fn test_algorithm_change_forces_rehash() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"data").unwrap();

        let scanner = ManifestScanner::new(dir.path());
        let mut manifest = Manifest::new("t", HashAlgorithm::Sha256);
        scanner.scan(&mut manifest).unwrap();

        manifest.set_default_hash_algorithm(HashAlgorithm::Blake2b256);
        let report = scanner.scan(&mut manifest).unwrap();
        assert_eq!(report.updated, vec![p("/a.txt")]);
        assert_eq!(
            manifest.entry(&p("/a.txt")).unwrap().info.hash.unwrap().algorithm,
            HashAlgorithm::Blake2b256
        );
    }
}
