//! Persisted manifest format.
//!
//! The manifest is stored as a JSON document carrying an explicit
//! `format_version`. Version 1 documents predate registration times and
//! the info timestamp; they are upgraded once here, at load time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::hash::{FileHash, HashAlgorithm};
use crate::manifest::{Manifest, ManifestInfo};
use crate::tree::{FileInfo, ManifestTree};
use reposync_common::{Error, RepoPath, Result};

/// Directory holding repository metadata, excluded from scans.
pub const METADATA_DIRNAME: &str = ".reposync";

/// Manifest file name inside `METADATA_DIRNAME`.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Format version written by this build.
pub const FORMAT_VERSION: u32 = 2;

fn legacy_version() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    #[serde(default = "legacy_version")]
    format_version: u32,
    name: String,
    guid: Uuid,
    #[serde(default)]
    description: String,
    #[serde(default)]
    default_hash_algorithm: HashAlgorithm,
    #[serde(default)]
    ignore_patterns: Vec<String>,
    inception_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info_last_modified_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_update_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    root: DirectoryDocument,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryDocument {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    files: Vec<FileDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    directories: Vec<SubdirectoryDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubdirectoryDocument {
    name: String,
    #[serde(flatten)]
    contents: DirectoryDocument,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileDocument {
    name: String,
    length: u64,
    last_modified_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registered_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<FileHash>,
}

/// Serialize a manifest to its persisted JSON form.
pub fn to_json(manifest: &Manifest) -> Result<String> {
    let info = manifest.info();
    let doc = ManifestDocument {
        format_version: FORMAT_VERSION,
        name: info.name.clone(),
        guid: info.guid,
        description: info.description.clone(),
        default_hash_algorithm: info.default_hash_algorithm,
        ignore_patterns: info.ignore_patterns.clone(),
        inception_utc: info.inception_utc,
        info_last_modified_utc: Some(info.info_last_modified_utc),
        last_update_utc: manifest.last_update_utc(),
        root: encode_directory(manifest.tree(), manifest.tree().root())?,
    };
    serde_json::to_string_pretty(&doc).map_err(|e| Error::Serialization(e.to_string()))
}

/// Parse a persisted manifest, upgrading older format versions.
pub fn from_json(json: &str) -> Result<Manifest> {
    let doc: ManifestDocument =
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;

    let legacy = match doc.format_version {
        1 => true,
        FORMAT_VERSION => false,
        other => {
            return Err(Error::Serialization(format!(
                "Unsupported manifest format version {} (this build reads up to {})",
                other, FORMAT_VERSION
            )))
        }
    };
    if legacy {
        debug!(guid = %doc.guid, "Upgrading version 1 manifest");
    }

    let info_last_modified_utc = match (doc.info_last_modified_utc, legacy) {
        (Some(t), _) => t,
        (None, true) => doc.inception_utc,
        (None, false) => {
            return Err(Error::Serialization(
                "Missing info_last_modified_utc".to_string(),
            ))
        }
    };

    let mut tree = ManifestTree::new();
    decode_directory(&mut tree, &RepoPath::root(), doc.root, legacy)?;

    let info = ManifestInfo {
        name: doc.name,
        guid: doc.guid,
        description: doc.description,
        default_hash_algorithm: doc.default_hash_algorithm,
        ignore_patterns: doc.ignore_patterns,
        inception_utc: doc.inception_utc,
        info_last_modified_utc,
    };
    Ok(Manifest::from_parts(info, doc.last_update_utc, tree))
}

fn encode_directory(tree: &ManifestTree, id: crate::tree::DirId) -> Result<DirectoryDocument> {
    let dir = tree
        .directory(id)
        .ok_or_else(|| Error::Manifest(format!("Dangling directory handle {:?}", id)))?;

    let files = dir
        .files()
        .map(|file| FileDocument {
            name: file.name.clone(),
            length: file.info.length,
            last_modified_utc: file.info.last_modified_utc,
            registered_utc: Some(file.info.registered_utc),
            hash: file.info.hash.clone(),
        })
        .collect();

    let mut directories = Vec::new();
    for (name, sub) in dir.subdirectories() {
        directories.push(SubdirectoryDocument {
            name: name.to_string(),
            contents: encode_directory(tree, sub)?,
        });
    }

    Ok(DirectoryDocument { files, directories })
}

fn decode_directory(
    tree: &mut ManifestTree,
    path: &RepoPath,
    doc: DirectoryDocument,
    legacy: bool,
) -> Result<()> {
    for file in doc.files {
        let file_path = path.join(&file.name)?;
        let registered_utc = match (file.registered_utc, legacy) {
            (Some(t), _) => t,
            (None, true) => file.last_modified_utc,
            (None, false) => {
                return Err(Error::Serialization(format!(
                    "Missing registered_utc for {}",
                    file_path
                )))
            }
        };
        if tree.contains_file(&file_path) {
            return Err(Error::Serialization(format!(
                "Duplicate file entry {}",
                file_path
            )));
        }
        tree.insert_file(
            &file_path,
            FileInfo {
                length: file.length,
                last_modified_utc: file.last_modified_utc,
                registered_utc,
                hash: file.hash,
            },
        )?;
    }
    for sub in doc.directories {
        let sub_path = path.join(&sub.name)?;
        decode_directory(tree, &sub_path, sub.contents, legacy)?;
    }
    Ok(())
}
