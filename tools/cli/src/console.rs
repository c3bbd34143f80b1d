//! Terminal output for comparisons and apply runs.

use reposync_manifest::FileEntry;
use reposync_sync::{
    ApplyReport, FilePair, ManifestComparison, OperationKind, OperationRecord, Reporter, SyncMode,
};

/// Output switches shared by every command.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOptions {
    pub silent: bool,
    pub detail: bool,
}

/// Prints apply progress as operations finish.
///
/// Operations are listed only with `-detail`; failures are repeated in the
/// summary either way.
pub struct ConsoleReporter {
    options: OutputOptions,
}

impl ConsoleReporter {
    pub fn new(options: OutputOptions) -> Self {
        Self { options }
    }
}

impl Reporter for ConsoleReporter {
    fn on_operation(&self, record: &OperationRecord) {
        if self.options.detail && !self.options.silent {
            println!("  {}", record);
        }
    }

    fn on_warning(&self, message: &str) {
        eprintln!("Warning: {}", message);
    }
}

fn print_entries(entries: &[FileEntry], detail: bool) {
    if detail {
        for entry in entries {
            println!("  {}", entry.path);
        }
    }
}

fn print_pairs(pairs: &[FilePair], detail: bool) {
    if detail {
        for pair in pairs {
            println!("  {}", pair.source.path);
        }
    }
}

/// Print every difference category with its count.
pub fn print_comparison(comparison: &ManifestComparison, options: OutputOptions) {
    if options.silent {
        return;
    }
    let detail = options.detail;

    println!("Source only: {}", comparison.source_only.len());
    print_entries(&comparison.source_only, detail);
    println!("Destination only: {}", comparison.dest_only.len());
    print_entries(&comparison.dest_only, detail);
    println!("Changed content: {}", comparison.changed_content.len());
    print_pairs(&comparison.changed_content, detail);
    println!(
        "Changed last modified: {}",
        comparison.changed_last_modified.len()
    );
    print_pairs(&comparison.changed_last_modified, detail);
    println!("Changed registered: {}", comparison.changed_registered.len());
    print_pairs(&comparison.changed_registered, detail);
    println!("Moved: {}", comparison.moved.len());
    if detail {
        for pair in &comparison.moved {
            println!("  {} -> {}", pair.dest.path, pair.source.path);
        }
    }

    let fields = comparison.manifest.differing_fields();
    if fields.is_empty() {
        println!("Manifest information: identical");
    } else {
        println!("Manifest information: differs ({})", fields.join(", "));
    }
}

/// Print the end-of-run summary.
pub fn print_summary(report: &ApplyReport, mode: SyncMode, options: OutputOptions) {
    if !options.silent {
        println!(
            "{} finished: {} attempted, {} succeeded, {} failed",
            mode,
            report.attempted(),
            report.succeeded(),
            report.failed()
        );
        if options.detail {
            for kind in [
                OperationKind::Move,
                OperationKind::Put,
                OperationKind::Copy,
                OperationKind::CopyInformation,
                OperationKind::Remove,
                OperationKind::ManifestInformation,
            ] {
                let count = report.count(kind);
                if count > 0 {
                    println!("  {}: {}", kind, count);
                }
            }
        }
    }
    if report.failed() > 0 {
        eprintln!("{} operation(s) failed:", report.failed());
        for record in report.failures() {
            eprintln!("  {}", record);
        }
    }
}
