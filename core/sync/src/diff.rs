//! Manifest comparison.
//!
//! `compare` classifies every path present in either manifest and pairs up
//! files whose content shows up under a different path on the other side.

use std::collections::{BTreeMap, BTreeSet};

use reposync_common::RepoPath;
use reposync_manifest::{FileEntry, FileHash, FileInfo, Manifest, ManifestInfo};

use crate::moves::{order_moves, MoveRequest, MoveStep};

/// The same file as seen from both repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub source: FileEntry,
    pub dest: FileEntry,
}

/// Manifest-level fields of both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDifferences {
    pub source: ManifestInfo,
    pub dest: ManifestInfo,
}

impl ManifestDifferences {
    pub fn name_differs(&self) -> bool {
        self.source.name != self.dest.name
    }

    /// The repositories have different identities.
    pub fn guid_differs(&self) -> bool {
        self.source.guid != self.dest.guid
    }

    pub fn description_differs(&self) -> bool {
        self.source.description != self.dest.description
    }

    pub fn hash_algorithm_differs(&self) -> bool {
        self.source.default_hash_algorithm != self.dest.default_hash_algorithm
    }

    pub fn ignore_patterns_differ(&self) -> bool {
        self.source.ignore_patterns != self.dest.ignore_patterns
    }

    pub fn inception_differs(&self) -> bool {
        self.source.inception_utc != self.dest.inception_utc
    }

    pub fn info_last_modified_differs(&self) -> bool {
        self.source.info_last_modified_utc != self.dest.info_last_modified_utc
    }

    /// True if a field that `copy_manifest_information` carries over
    /// differs. Identity and inception never propagate.
    pub fn propagatable(&self) -> bool {
        self.name_differs()
            || self.description_differs()
            || self.hash_algorithm_differs()
            || self.ignore_patterns_differ()
            || self.info_last_modified_differs()
    }

    /// Names of all differing fields, for reports.
    pub fn differing_fields(&self) -> Vec<&'static str> {
        [
            ("name", self.name_differs()),
            ("guid", self.guid_differs()),
            ("description", self.description_differs()),
            ("hash method", self.hash_algorithm_differs()),
            ("ignore list", self.ignore_patterns_differ()),
            ("inception date", self.inception_differs()),
            ("information date", self.info_last_modified_differs()),
        ]
        .into_iter()
        .filter_map(|(field, differs)| differs.then_some(field))
        .collect()
    }
}

/// Classified differences between a source and a destination manifest.
///
/// Every list is sorted by path (source path for pairs). `moved_order`
/// realizes `moved` on the destination: each step relocates a destination
/// path toward the matching source path, and `MoveStep::pair` indexes
/// `moved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestComparison {
    pub source_only: Vec<FileEntry>,
    pub dest_only: Vec<FileEntry>,
    pub changed_content: Vec<FilePair>,
    pub changed_last_modified: Vec<FilePair>,
    pub changed_registered: Vec<FilePair>,
    pub moved: Vec<FilePair>,
    pub moved_order: Vec<MoveStep>,
    pub manifest: ManifestDifferences,
}

impl ManifestComparison {
    /// Number of file-level differences.
    pub fn file_differences(&self) -> usize {
        self.source_only.len()
            + self.dest_only.len()
            + self.changed_content.len()
            + self.changed_last_modified.len()
            + self.changed_registered.len()
            + self.moved.len()
    }

    /// True if both trees hold the same files with the same metadata.
    pub fn files_identical(&self) -> bool {
        self.file_differences() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Content,
    LastModified,
    Registered,
}

/// Same-path classification. A missing hash on either side counts as a
/// content change.
fn classify(source: &FileInfo, dest: &FileInfo) -> Option<Change> {
    match (&source.hash, &dest.hash) {
        (Some(s), Some(d)) if s == d && source.length == dest.length => {}
        _ => return Some(Change::Content),
    }
    if source.last_modified_utc != dest.last_modified_utc {
        Some(Change::LastModified)
    } else if source.registered_utc != dest.registered_utc {
        Some(Change::Registered)
    } else {
        None
    }
}

/// Compare two manifests.
pub fn compare(source: &Manifest, dest: &Manifest) -> ManifestComparison {
    let dest_files = dest.files();
    let occupied: BTreeSet<RepoPath> = dest_files.iter().map(|e| e.path.clone()).collect();
    let mut dest_by_path: BTreeMap<RepoPath, FileEntry> = dest_files
        .into_iter()
        .map(|e| (e.path.clone(), e))
        .collect();

    let mut source_only = Vec::new();
    let mut changed_content = Vec::new();
    let mut changed_last_modified = Vec::new();
    let mut changed_registered = Vec::new();

    for entry in source.files() {
        let Some(other) = dest_by_path.remove(&entry.path) else {
            source_only.push(entry);
            continue;
        };
        let change = classify(&entry.info, &other.info);
        let pair = FilePair {
            source: entry,
            dest: other,
        };
        match change {
            None => {}
            Some(Change::Content) => changed_content.push(pair),
            Some(Change::LastModified) => changed_last_modified.push(pair),
            Some(Change::Registered) => changed_registered.push(pair),
        }
    }
    let dest_only: Vec<FileEntry> = dest_by_path.into_values().collect();

    let (moved, source_only, dest_only) = detect_moves(source_only, dest_only);
    let requests: Vec<MoveRequest> = moved
        .iter()
        .map(|pair| MoveRequest::new(pair.dest.path.clone(), pair.source.path.clone()))
        .collect();
    let moved_order = order_moves(&requests, &occupied);

    ManifestComparison {
        source_only,
        dest_only,
        changed_content,
        changed_last_modified,
        changed_registered,
        moved,
        moved_order,
        manifest: ManifestDifferences {
            source: source.info().clone(),
            dest: dest.info().clone(),
        },
    }
}

/// Content identity used for move matching. Empty files and files without
/// a hash never match by content.
pub(crate) fn content_key(info: &FileInfo) -> Option<(FileHash, u64)> {
    if info.length == 0 {
        return None;
    }
    info.hash.clone().map(|hash| (hash, info.length))
}

/// Number of directory steps between the parent directories of two paths.
fn directory_distance(a: &RepoPath, b: &RepoPath) -> usize {
    let a_dir = &a.components()[..a.depth().saturating_sub(1)];
    let b_dir = &b.components()[..b.depth().saturating_sub(1)];
    let common = a_dir.iter().zip(b_dir).take_while(|(x, y)| x == y).count();
    a_dir.len() + b_dir.len() - 2 * common
}

/// Pair unmatched files across sides by content.
///
/// Inputs must be sorted by path. A content key held by exactly one file
/// on each side pairs directly. Duplicated content pairs greedily by, in
/// order: same file name, fewest directory steps apart, source path, dest
/// path. Files left over stay unmatched.
fn detect_moves(
    source_only: Vec<FileEntry>,
    dest_only: Vec<FileEntry>,
) -> (Vec<FilePair>, Vec<FileEntry>, Vec<FileEntry>) {
    let mut buckets: BTreeMap<(FileHash, u64), (Vec<usize>, Vec<usize>)> = BTreeMap::new();
    for (i, entry) in source_only.iter().enumerate() {
        if let Some(key) = content_key(&entry.info) {
            buckets.entry(key).or_default().0.push(i);
        }
    }
    for (i, entry) in dest_only.iter().enumerate() {
        if let Some(key) = content_key(&entry.info) {
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.1.push(i);
            }
        }
    }

    let mut matches: Vec<(usize, usize)> = Vec::new();
    for (sources, dests) in buckets.values() {
        match (sources.as_slice(), dests.as_slice()) {
            ([], _) | (_, []) => {}
            ([s], [d]) => matches.push((*s, *d)),
            _ => {
                let mut candidates: Vec<(bool, usize, usize, usize)> = sources
                    .iter()
                    .flat_map(|&s| dests.iter().map(move |&d| (s, d)))
                    .map(|(s, d)| {
                        let a = &source_only[s].path;
                        let b = &dest_only[d].path;
                        (a.name() != b.name(), directory_distance(a, b), s, d)
                    })
                    .collect();
                candidates.sort_unstable();

                let mut used_source = BTreeSet::new();
                let mut used_dest = BTreeSet::new();
                for (_, _, s, d) in candidates {
                    if used_source.contains(&s) || used_dest.contains(&d) {
                        continue;
                    }
                    used_source.insert(s);
                    used_dest.insert(d);
                    matches.push((s, d));
                }
            }
        }
    }
    matches.sort_unstable();

    let mut source_slots: Vec<Option<FileEntry>> = source_only.into_iter().map(Some).collect();
    let mut dest_slots: Vec<Option<FileEntry>> = dest_only.into_iter().map(Some).collect();
    let mut moved = Vec::with_capacity(matches.len());
    for (s, d) in matches {
        if let (Some(source), Some(dest)) = (source_slots[s].take(), dest_slots[d].take()) {
            moved.push(FilePair { source, dest });
        }
    }

    (
        moved,
        source_slots.into_iter().flatten().collect(),
        dest_slots.into_iter().flatten().collect(),
    )
}
