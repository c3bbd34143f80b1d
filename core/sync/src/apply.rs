//! Realizing a comparison through repository proxies.
//!
//! Phases run in a fixed order: moves, content changes, metadata-only
//! changes, additions, mirror removals, then manifest information. Mirror
//! removals that obstruct a needed path run before the moves. Moves
//! run one at a time in plan order; every other phase runs its operations
//! on a bounded pool. A failed operation is recorded and the run goes on.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::pin::pin;
use tracing::{debug, info, warn};

use reposync_common::{Error, RepoPath, Result};
use reposync_manifest::{FileEntry, FileHash};
use reposync_storage::RepositoryProxy;

use crate::config::SyncConfig;
use crate::conflict::{DirectionPolicy, Side, SyncMode};
use crate::diff::{content_key, FilePair, ManifestComparison};
use crate::moves::{order_moves, MoveRequest, MoveStep};
use crate::report::{ApplyReport, OperationKind, OperationRecord, Reporter};
use crate::retry::RetryExecutor;

/// Apply `comparison` between `source` and `dest` under `mode`.
///
/// Per-file failures end up in the report. An error is returned only if a
/// repository's manifest cannot be read for planning.
pub async fn apply(
    comparison: &ManifestComparison,
    source: &dyn RepositoryProxy,
    dest: &dyn RepositoryProxy,
    mode: SyncMode,
    config: &SyncConfig,
    reporter: &dyn Reporter,
) -> Result<ApplyReport> {
    let applier = Applier {
        source,
        dest,
        policy: DirectionPolicy::new(mode),
        retry: RetryExecutor::new(config.retry_config()),
        concurrency: config.concurrency(),
        reporter,
    };
    applier.run(comparison).await
}

/// A non-move file operation.
enum Planned {
    Put { target: Side, entry: FileEntry },
    Copy { target: Side, from: RepoPath, entry: FileEntry },
    CopyInformation { target: Side, entry: FileEntry },
    Remove { target: Side, path: RepoPath },
}

struct Applier<'a> {
    source: &'a dyn RepositoryProxy,
    dest: &'a dyn RepositoryProxy,
    policy: DirectionPolicy,
    retry: RetryExecutor,
    concurrency: usize,
    reporter: &'a dyn Reporter,
}

impl<'a> Applier<'a> {
    fn proxy(&self, side: Side) -> &'a dyn RepositoryProxy {
        match side {
            Side::Source => self.source,
            Side::Dest => self.dest,
        }
    }

    async fn run(&self, comparison: &ManifestComparison) -> Result<ApplyReport> {
        info!(
            mode = %self.policy.mode(),
            differences = comparison.file_differences(),
            "Applying comparison"
        );
        let mut report = ApplyReport::default();

        // Destination-only files in the way of a path the source needs go
        // before anything lands there; the rest wait for the final phase.
        let (obstructing, leftover) = self.plan_removals(comparison);
        self.run_batch(obstructing, &mut report.records).await;

        self.move_phase(comparison, &mut report.records).await?;

        let content = comparison
            .changed_content
            .iter()
            .map(|pair| {
                let winner = self.policy.content_winner(pair);
                Planned::Put {
                    target: winner.other(),
                    entry: winner.entry(pair).clone(),
                }
            })
            .collect();
        self.run_batch(content, &mut report.records).await;

        let information = comparison
            .changed_last_modified
            .iter()
            .chain(&comparison.changed_registered)
            .map(|pair| {
                let winner = self.policy.information_winner(pair);
                Planned::CopyInformation {
                    target: winner.other(),
                    entry: winner.entry(pair).clone(),
                }
            })
            .collect();
        self.run_batch(information, &mut report.records).await;

        let additions = self.plan_additions(comparison).await?;
        self.run_batch(additions, &mut report.records).await;

        self.run_batch(leftover, &mut report.records).await;

        self.manifest_phase(comparison, &mut report).await;

        info!(
            attempted = report.attempted(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Apply finished"
        );
        Ok(report)
    }

    async fn move_phase(
        &self,
        comparison: &ManifestComparison,
        records: &mut Vec<OperationRecord>,
    ) -> Result<()> {
        if comparison.moved.is_empty() {
            return Ok(());
        }
        if self.policy.mode() != SyncMode::Sync {
            self.realize_moves(Side::Dest, &comparison.moved, &comparison.moved_order, records)
                .await;
            return Ok(());
        }

        // Each rename is carried out on the side that did not make it.
        for side in [Side::Dest, Side::Source] {
            let pairs: Vec<FilePair> = comparison
                .moved
                .iter()
                .filter(|pair| self.policy.renaming_side(pair) == side.other())
                .cloned()
                .collect();
            if pairs.is_empty() {
                continue;
            }
            let requests: Vec<MoveRequest> = pairs
                .iter()
                .map(|pair| {
                    MoveRequest::new(
                        side.entry(pair).path.clone(),
                        side.other().entry(pair).path.clone(),
                    )
                })
                .collect();
            let occupied: BTreeSet<RepoPath> = self
                .proxy(side)
                .manifest()
                .await?
                .files()
                .into_iter()
                .map(|entry| entry.path)
                .collect();
            let order = order_moves(&requests, &occupied);
            self.realize_moves(side, &pairs, &order, records).await;
        }
        Ok(())
    }

    /// Perform `order` on `side`, strictly one step after another.
    async fn realize_moves(
        &self,
        side: Side,
        pairs: &[FilePair],
        order: &[MoveStep],
        records: &mut Vec<OperationRecord>,
    ) {
        for step in order {
            let Some(pair) = pairs.get(step.pair()) else {
                continue;
            };
            // A parked file keeps its own metadata until it reaches its
            // final path.
            let info = if step.is_final() {
                side.other().entry(pair).info.clone()
            } else {
                side.entry(pair).info.clone()
            };
            let to = FileEntry::new(step.to().clone(), info);
            let result = self.relocate(side, step.from(), &to).await;
            let record = self.record(
                OperationKind::Move,
                side,
                to.path,
                Some(step.from().clone()),
                result,
            );
            self.reporter.on_operation(&record);
            records.push(record);
        }
    }

    /// Move in place, or copy and remove where the transport cannot.
    async fn relocate(&self, side: Side, from: &RepoPath, to: &FileEntry) -> Result<()> {
        let proxy = self.proxy(side);
        match self.retry.execute(move || proxy.move_file(from, to)).await {
            Err(Error::NotPermitted(reason)) => {
                debug!(%from, to = %to.path, %reason, "Falling back to copy and remove");
                self.retry.execute(move || proxy.copy_file(from, to)).await?;
                self.retry.execute(move || proxy.remove_file(from)).await
            }
            result => result,
        }
    }

    /// Mirror removals, split into those obstructing a path the source
    /// needs on the destination and all others.
    fn plan_removals(&self, comparison: &ManifestComparison) -> (Vec<Planned>, Vec<Planned>) {
        if !self.policy.removes_dest_only() {
            return (Vec::new(), Vec::new());
        }
        let needed: BTreeSet<RepoPath> = comparison
            .source_only
            .iter()
            .chain(comparison.moved.iter().map(|pair| &pair.source))
            .map(|entry| entry.path.clone())
            .collect();

        let mut obstructing = Vec::new();
        let mut leftover = Vec::new();
        for entry in &comparison.dest_only {
            let removal = Planned::Remove {
                target: Side::Dest,
                path: entry.path.clone(),
            };
            if obstructs(&entry.path, &needed) {
                obstructing.push(removal);
            } else {
                leftover.push(removal);
            }
        }
        (obstructing, leftover)
    }

    /// Additions, reusing content the target already holds where possible.
    async fn plan_additions(&self, comparison: &ManifestComparison) -> Result<Vec<Planned>> {
        let mut planned = Vec::new();
        for (present, entries) in [
            (Side::Source, &comparison.source_only),
            (Side::Dest, &comparison.dest_only),
        ] {
            let Some(target) = self.policy.addition_target(present) else {
                continue;
            };
            if entries.is_empty() {
                continue;
            }

            let mut existing: HashMap<(FileHash, u64), RepoPath> = HashMap::new();
            for entry in self.proxy(target).manifest().await?.files() {
                if let Some(key) = content_key(&entry.info) {
                    existing.entry(key).or_insert(entry.path);
                }
            }

            for entry in entries {
                let local = content_key(&entry.info).and_then(|key| existing.get(&key));
                planned.push(match local {
                    Some(from) => Planned::Copy {
                        target,
                        from: from.clone(),
                        entry: entry.clone(),
                    },
                    None => Planned::Put {
                        target,
                        entry: entry.clone(),
                    },
                });
            }
        }
        Ok(planned)
    }

    /// Run independent operations concurrently, recording them in plan order.
    async fn run_batch(&self, planned: Vec<Planned>, records: &mut Vec<OperationRecord>) {
        if planned.is_empty() {
            return;
        }
        let mut results = pin!(stream::iter(planned)
            .map(|op| self.execute(op))
            .buffered(self.concurrency));
        while let Some(record) = results.next().await {
            self.reporter.on_operation(&record);
            records.push(record);
        }
    }

    async fn execute(&self, op: Planned) -> OperationRecord {
        match op {
            Planned::Put { target, entry } => {
                let proxy = self.proxy(target);
                let other = self.proxy(target.other());
                let entry_ref = &entry;
                let result = self
                    .retry
                    .execute(move || proxy.put_file(other, entry_ref))
                    .await;
                self.record(OperationKind::Put, target, entry.path, None, result)
            }
            Planned::Copy {
                target,
                from,
                entry,
            } => {
                let proxy = self.proxy(target);
                let (from_ref, entry_ref) = (&from, &entry);
                let result = self
                    .retry
                    .execute(move || proxy.copy_file(from_ref, entry_ref))
                    .await;
                self.record(OperationKind::Copy, target, entry.path, Some(from), result)
            }
            Planned::CopyInformation { target, entry } => {
                let proxy = self.proxy(target);
                let entry_ref = &entry;
                let result = self
                    .retry
                    .execute(move || proxy.copy_file_information(&entry_ref.path, entry_ref))
                    .await;
                self.record(OperationKind::CopyInformation, target, entry.path, None, result)
            }
            Planned::Remove { target, path } => {
                let proxy = self.proxy(target);
                let path_ref = &path;
                let result = self.retry.execute(move || proxy.remove_file(path_ref)).await;
                self.record(OperationKind::Remove, target, path, None, result)
            }
        }
    }

    /// Copy manifest information once, and only after a clean run.
    async fn manifest_phase(&self, comparison: &ManifestComparison, report: &mut ApplyReport) {
        let differences = &comparison.manifest;
        if !differences.propagatable() {
            return;
        }
        if !report.is_success() {
            report.manifest_information_withheld = true;
            self.reporter.on_warning(&format!(
                "Manifest information not updated: {} operations failed",
                report.failed()
            ));
            return;
        }

        let winner = self
            .policy
            .manifest_winner(&differences.source, &differences.dest);
        let info = match winner {
            Side::Source => &differences.source,
            Side::Dest => &differences.dest,
        };
        let target = winner.other();
        let proxy = self.proxy(target);
        let result = self
            .retry
            .execute(move || proxy.copy_manifest_information(info))
            .await;
        let record = self.record(
            OperationKind::ManifestInformation,
            target,
            RepoPath::root(),
            None,
            result,
        );
        self.reporter.on_operation(&record);
        report.records.push(record);
    }

    fn record(
        &self,
        kind: OperationKind,
        target: Side,
        path: RepoPath,
        from: Option<RepoPath>,
        result: Result<()>,
    ) -> OperationRecord {
        let error = match result {
            Ok(()) => {
                debug!(%kind, side = %target, %path, "Applied");
                None
            }
            Err(e) => {
                warn!(%kind, side = %target, %path, error = %e, "Operation failed");
                Some(e.to_string())
            }
        };
        OperationRecord {
            kind,
            target,
            path,
            from,
            error,
        }
    }
}

/// True if `path` lies on a directory some needed path requires, or a
/// needed path lies on a directory of `path`.
fn obstructs(path: &RepoPath, needed: &BTreeSet<RepoPath>) -> bool {
    let mut ancestor = path.parent();
    while let Some(dir) = ancestor {
        if needed.contains(&dir) {
            return true;
        }
        ancestor = dir.parent();
    }
    // Ordering is component-wise, so descendants follow `path` directly.
    needed
        .range::<RepoPath, _>((Bound::Excluded(path), Bound::Unbounded))
        .next()
        .is_some_and(|next| next.starts_with(path))
}
