//! Manifest data model for reposync.
//!
//! A manifest is the persisted record of a repository's file tree with
//! content hashes and timestamps. It, not a live directory listing, is the
//! baseline every comparison works from.

pub mod hash;
pub mod ignore;
pub mod manifest;
pub mod persist;
pub mod scan;
pub mod tree;

pub use hash::{FileHash, FileHasher, HashAlgorithm};
pub use ignore::IgnoreMatcher;
pub use manifest::{Manifest, ManifestInfo};
pub use persist::{from_json, to_json, FORMAT_VERSION, MANIFEST_FILENAME, METADATA_DIRNAME};
pub use scan::{ManifestScanner, ScanReport, ScanWarning};
pub use tree::{DirId, FileEntry, FileInfo, ManifestDirectory, ManifestFile, ManifestTree};
