//! Repository manifest: identity, settings and the file tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::HashAlgorithm;
use crate::tree::{FileEntry, ManifestTree};
use reposync_common::RepoPath;

/// Snapshot of every manifest-level field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestInfo {
    pub name: String,
    pub guid: Uuid,
    pub description: String,
    pub default_hash_algorithm: HashAlgorithm,
    pub ignore_patterns: Vec<String>,
    pub inception_utc: DateTime<Utc>,
    pub info_last_modified_utc: DateTime<Utc>,
}

/// The manifest of one repository.
///
/// `guid` and `inception_utc` are fixed at creation. Every setter of a
/// user-editable field bumps `info_last_modified_utc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    info: ManifestInfo,
    last_update_utc: Option<DateTime<Utc>>,
    tree: ManifestTree,
}

impl Manifest {
    /// Create an empty manifest with a fresh identity.
    pub fn new(name: impl Into<String>, algorithm: HashAlgorithm) -> Self {
        let now = Utc::now();
        Self {
            info: ManifestInfo {
                name: name.into(),
                guid: Uuid::new_v4(),
                description: String::new(),
                default_hash_algorithm: algorithm,
                ignore_patterns: Vec::new(),
                inception_utc: now,
                info_last_modified_utc: now,
            },
            last_update_utc: None,
            tree: ManifestTree::new(),
        }
    }

    /// Reassemble a manifest from persisted parts.
    pub fn from_parts(
        info: ManifestInfo,
        last_update_utc: Option<DateTime<Utc>>,
        tree: ManifestTree,
    ) -> Self {
        Self {
            info,
            last_update_utc,
            tree,
        }
    }

    pub fn info(&self) -> &ManifestInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn guid(&self) -> Uuid {
        self.info.guid
    }

    pub fn description(&self) -> &str {
        &self.info.description
    }

    pub fn default_hash_algorithm(&self) -> HashAlgorithm {
        self.info.default_hash_algorithm
    }

    pub fn ignore_patterns(&self) -> &[String] {
        &self.info.ignore_patterns
    }

    pub fn inception_utc(&self) -> DateTime<Utc> {
        self.info.inception_utc
    }

    pub fn info_last_modified_utc(&self) -> DateTime<Utc> {
        self.info.info_last_modified_utc
    }

    pub fn last_update_utc(&self) -> Option<DateTime<Utc>> {
        self.last_update_utc
    }

    pub fn set_last_update_utc(&mut self, when: DateTime<Utc>) {
        self.last_update_utc = Some(when);
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.info.name = name.into();
        self.touch_info();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.info.description = description.into();
        self.touch_info();
    }

    pub fn set_default_hash_algorithm(&mut self, algorithm: HashAlgorithm) {
        self.info.default_hash_algorithm = algorithm;
        self.touch_info();
    }

    pub fn set_ignore_patterns(&mut self, patterns: Vec<String>) {
        self.info.ignore_patterns = patterns;
        self.touch_info();
    }

    fn touch_info(&mut self) {
        self.info.info_last_modified_utc = Utc::now();
    }

    /// Adopt the user-editable settings of another manifest.
    ///
    /// Copies name, description, ignore patterns, default hash algorithm and
    /// `info_last_modified_utc`; identity and inception stay untouched.
    pub fn copy_information_from(&mut self, other: &ManifestInfo) {
        self.info.name = other.name.clone();
        self.info.description = other.description.clone();
        self.info.ignore_patterns = other.ignore_patterns.clone();
        self.info.default_hash_algorithm = other.default_hash_algorithm;
        self.info.info_last_modified_utc = other.info_last_modified_utc;
    }

    pub fn tree(&self) -> &ManifestTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ManifestTree {
        &mut self.tree
    }

    /// Every file, sorted by path.
    pub fn files(&self) -> Vec<FileEntry> {
        self.tree.files()
    }

    /// Snapshot of the file at `path`.
    pub fn entry(&self, path: &RepoPath) -> Option<FileEntry> {
        self.tree
            .get_file(path)
            .map(|file| FileEntry::new(path.clone(), file.info.clone()))
    }
}
