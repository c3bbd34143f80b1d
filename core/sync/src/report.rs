//! Apply results and the reporter interface.

use std::fmt;
use std::sync::Mutex;

use reposync_common::RepoPath;

use crate::conflict::Side;

/// Kind of operation issued against a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Relocation inside the target (including temporary hops).
    Move,
    /// Content transfer from the other repository.
    Put,
    /// Duplication of content already present in the target.
    Copy,
    /// Metadata-only update.
    CopyInformation,
    /// Deletion.
    Remove,
    /// Manifest-level information update.
    ManifestInformation,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Move => "move",
            OperationKind::Put => "put",
            OperationKind::Copy => "copy",
            OperationKind::CopyInformation => "update information",
            OperationKind::Remove => "remove",
            OperationKind::ManifestInformation => "manifest information",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one attempted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub kind: OperationKind,
    /// Repository the operation changed.
    pub target: Side,
    /// Path affected in the target; the root for manifest information.
    pub path: RepoPath,
    /// Previous path for moves and copies.
    pub from: Option<RepoPath>,
    /// Error message if the operation failed.
    pub error: Option<String>,
}

impl OperationRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for OperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target)?;
        match &self.from {
            Some(from) => write!(f, " {} -> {}", from, self.path)?,
            None => write!(f, " {}", self.path)?,
        }
        if let Some(error) = &self.error {
            write!(f, ": FAILED ({})", error)?;
        }
        Ok(())
    }
}

/// Results of one apply run, in plan order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub records: Vec<OperationRecord>,
    /// Set when manifest information differed but was not copied because
    /// file operations failed.
    pub manifest_information_withheld: bool,
}

impl ApplyReport {
    pub fn attempted(&self) -> usize {
        self.records.len()
    }

    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationRecord> {
        self.records.iter().filter(|r| !r.succeeded())
    }

    /// Number of attempted operations of `kind`.
    pub fn count(&self, kind: OperationKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Receives apply progress as it happens.
pub trait Reporter: Send + Sync {
    /// Called once per operation, after it finished, in plan order.
    fn on_operation(&self, record: &OperationRecord);

    /// Called for conditions that are not operation failures.
    fn on_warning(&self, message: &str);
}

/// Reporter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_operation(&self, _record: &OperationRecord) {}

    fn on_warning(&self, _message: &str) {}
}

/// Reporter that keeps every event, for inspection after a run.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    operations: Mutex<Vec<OperationRecord>>,
    warnings: Mutex<Vec<String>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> Vec<OperationRecord> {
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Reporter for CollectingReporter {
    fn on_operation(&self, record: &OperationRecord) {
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }

    fn on_warning(&self, message: &str) {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }
}
