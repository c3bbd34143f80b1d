//! Reposync sync engine
//!
//! Compares two repository manifests and carries the differences over:
//! - Diff with move detection and move ordering
//! - Three modes: update, sync (two-way) and mirror
//! - Per-operation retry with exponential backoff
//! - Failure isolation: one failed file never aborts the run

pub mod apply;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod engine;
pub mod moves;
pub mod report;
pub mod retry;

// Re-export main types
pub use apply::apply;
pub use config::SyncConfig;
pub use conflict::{DirectionPolicy, Side, SyncMode};
pub use diff::{compare, FilePair, ManifestComparison, ManifestDifferences};
pub use engine::SyncEngine;
pub use moves::{order_moves, MoveRequest, MoveStep};
pub use report::{
    ApplyReport, CollectingReporter, NullReporter, OperationKind, OperationRecord, Reporter,
};
pub use retry::{RetryConfig, RetryExecutor};
