//! Sync modes and the direction policy for two-way sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use reposync_common::{Error, Result};
use reposync_manifest::{FileEntry, ManifestInfo};

use crate::diff::FilePair;

/// How a comparison is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// One-way, source to destination. Nothing is deleted.
    Update,
    /// Two-way; both sides converge. Nothing is deleted.
    Sync,
    /// Destination becomes an exact copy of the source.
    Mirror,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Update => "update",
            SyncMode::Sync => "sync",
            SyncMode::Mirror => "mirror",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "update" => Ok(SyncMode::Update),
            "sync" => Ok(SyncMode::Sync),
            "mirror" => Ok(SyncMode::Mirror),
            other => Err(Error::InvalidInput(format!("Unknown sync mode: {}", other))),
        }
    }
}

/// One of the two repositories taking part in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Dest,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Source => Side::Dest,
            Side::Dest => Side::Source,
        }
    }

    /// This side's entry of a pair.
    pub fn entry(self, pair: &FilePair) -> &FileEntry {
        match self {
            Side::Source => &pair.source,
            Side::Dest => &pair.dest,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Dest => f.write_str("destination"),
        }
    }
}

/// Side holding the strictly newer timestamp; ties go to the source.
fn newer(source: DateTime<Utc>, dest: DateTime<Utc>) -> Side {
    if dest > source {
        Side::Dest
    } else {
        Side::Source
    }
}

/// Decides which repository receives each change under a sync mode.
///
/// Update and mirror always write the destination. Sync lets the newer
/// side win, breaking exact ties toward the source.
#[derive(Debug, Clone, Copy)]
pub struct DirectionPolicy {
    mode: SyncMode,
}

impl DirectionPolicy {
    pub fn new(mode: SyncMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Side whose copy wins for a content change.
    pub fn content_winner(&self, pair: &FilePair) -> Side {
        match self.mode {
            SyncMode::Sync => newer(
                pair.source.info.last_modified_utc,
                pair.dest.info.last_modified_utc,
            ),
            _ => Side::Source,
        }
    }

    /// Side whose metadata wins for a metadata-only change.
    pub fn information_winner(&self, pair: &FilePair) -> Side {
        match self.mode {
            SyncMode::Sync => {
                if pair.source.info.last_modified_utc != pair.dest.info.last_modified_utc {
                    self.content_winner(pair)
                } else {
                    newer(pair.source.info.registered_utc, pair.dest.info.registered_utc)
                }
            }
            _ => Side::Source,
        }
    }

    /// Side that renamed the file, and whose path therefore stands. The
    /// rename is carried out on the other side.
    pub fn renaming_side(&self, pair: &FilePair) -> Side {
        if self.mode != SyncMode::Sync {
            return Side::Source;
        }
        let (source, dest) = (&pair.source.info, &pair.dest.info);
        if source.registered_utc != dest.registered_utc {
            newer(source.registered_utc, dest.registered_utc)
        } else {
            newer(source.last_modified_utc, dest.last_modified_utc)
        }
    }

    /// Side that receives a file present only on `present`, if any.
    pub fn addition_target(&self, present: Side) -> Option<Side> {
        match (self.mode, present) {
            (_, Side::Source) => Some(Side::Dest),
            (SyncMode::Sync, Side::Dest) => Some(Side::Source),
            _ => None,
        }
    }

    /// True if destination-only files are deleted.
    pub fn removes_dest_only(&self) -> bool {
        self.mode == SyncMode::Mirror
    }

    /// Side whose manifest information wins.
    pub fn manifest_winner(&self, source: &ManifestInfo, dest: &ManifestInfo) -> Side {
        match self.mode {
            SyncMode::Sync => newer(source.info_last_modified_utc, dest.info_last_modified_utc),
            _ => Side::Source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reposync_common::RepoPath;
    use reposync_manifest::FileInfo;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, minute, 0).unwrap()
    }

    fn pair(source: (u32, u32), dest: (u32, u32)) -> FilePair {
        let entry = |(modified, registered): (u32, u32)| {
            FileEntry::new(
                RepoPath::parse("/f").unwrap(),
                FileInfo {
                    length: 1,
                    last_modified_utc: t(modified),
                    registered_utc: t(registered),
                    hash: None,
                },
            )
        };
        FilePair {
            source: entry(source),
            dest: entry(dest),
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Mirror".parse::<SyncMode>().unwrap(), SyncMode::Mirror);
        assert_eq!(SyncMode::Update.to_string(), "update");
        assert!("repair".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_one_way_modes_always_favor_source() {
        for mode in [SyncMode::Update, SyncMode::Mirror] {
            let policy = DirectionPolicy::new(mode);
            let newer_dest = pair((0, 0), (9, 9));
            assert_eq!(policy.content_winner(&newer_dest), Side::Source);
            assert_eq!(policy.information_winner(&newer_dest), Side::Source);
            assert_eq!(policy.renaming_side(&newer_dest), Side::Source);
            assert_eq!(policy.addition_target(Side::Dest), None);
        }
        assert!(DirectionPolicy::new(SyncMode::Mirror).removes_dest_only());
        assert!(!DirectionPolicy::new(SyncMode::Update).removes_dest_only());
    }

    #[test]
    fn test_sync_newer_wins_and_ties_go_to_source() {
        let policy = DirectionPolicy::new(SyncMode::Sync);
        assert_eq!(policy.content_winner(&pair((0, 0), (5, 0))), Side::Dest);
        assert_eq!(policy.content_winner(&pair((5, 0), (0, 0))), Side::Source);
        assert_eq!(policy.content_winner(&pair((3, 0), (3, 0))), Side::Source);

        assert_eq!(policy.information_winner(&pair((1, 0), (1, 4))), Side::Dest);
        assert_eq!(policy.addition_target(Side::Dest), Some(Side::Source));
        assert_eq!(policy.addition_target(Side::Source), Some(Side::Dest));
        assert!(!policy.removes_dest_only());
    }

    #[test]
    fn test_renaming_side() {
        let policy = DirectionPolicy::new(SyncMode::Sync);
        // Registration time decides first.
        assert_eq!(policy.renaming_side(&pair((9, 1), (0, 2))), Side::Dest);
        // Then modification time.
        assert_eq!(policy.renaming_side(&pair((0, 1), (4, 1))), Side::Dest);
        // Then the source.
        assert_eq!(policy.renaming_side(&pair((4, 1), (4, 1))), Side::Source);
    }
}
