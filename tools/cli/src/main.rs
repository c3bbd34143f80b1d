//! Reposync CLI - compare and synchronize manifest-backed repositories.
//!
//! A location is a local directory (optionally `local:<path>`) or an
//! encrypted repository (`crypt:<path>`).

mod console;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use console::{print_comparison, print_summary, ConsoleReporter, OutputOptions};
use reposync_common::{Error, SensitiveBytes};
use reposync_manifest::{HashAlgorithm, IgnoreMatcher, Manifest, ManifestScanner};
use reposync_storage::{
    create_default_registry, LocalRepositoryProxy, PassphraseProvider, ProxyRegistry,
    RepositoryProxy,
};
use reposync_sync::{SyncConfig, SyncEngine, SyncMode};

/// Environment variable holding the passphrase for encrypted repositories.
const PASSPHRASE_ENV: &str = "REPOSYNC_PASSPHRASE";

/// Flags still accepted in their historical single-dash spelling.
const LEGACY_FLAGS: [&str; 3] = ["-silent", "-detail", "-force"];

#[derive(Parser)]
#[command(name = "reposync")]
#[command(about = "Reposync - Manifest-based repository synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Sync configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Suppress normal output.
    #[arg(long, global = true)]
    silent: bool,

    /// Print per-file detail.
    #[arg(long, global = true)]
    detail: bool,

    /// Proceed with a mirror between unrelated repositories.
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Locations {
    /// Source repository.
    source: String,

    /// Destination repository.
    dest: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Report differences without changing anything.
    Diff(Locations),

    /// Copy changes from source to destination. Nothing is deleted.
    Update(Locations),

    /// Two-way sync; the newer side wins. Nothing is deleted.
    Sync(Locations),

    /// Make the destination an exact copy of the source.
    Mirror(Locations),

    /// Repair a repository against another (not implemented).
    Repair(Locations),

    /// Create a new repository.
    Init {
        /// Repository location.
        location: String,

        /// Repository name (default: directory name).
        #[arg(long)]
        name: Option<String>,

        /// Repository description.
        #[arg(long, default_value = "")]
        description: String,

        /// Hash algorithm: "sha256" or "blake2b256".
        #[arg(long, default_value = "sha256")]
        hash: HashAlgorithm,

        /// Ignore pattern (glob: `*`, `**`, `?`).
        #[arg(long = "ignore")]
        ignore: Vec<String>,
    },

    /// Refresh a local repository's manifest from disk.
    Scan {
        /// Repository directory.
        path: PathBuf,
    },

    /// Show repository information.
    Info {
        /// Repository location.
        location: String,
    },
}

/// Rewrite single-dash legacy flags to their long form.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some(s) if LEGACY_FLAGS.contains(&s) => OsString::from(format!("-{}", s)),
            _ => arg,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.silent {
        Level::WARN
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = OutputOptions {
        silent: cli.silent,
        detail: cli.detail,
    };
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Diff(locations) => cmd_diff(&locations, config, options).await,

        Commands::Update(locations) => {
            cmd_transfer(&locations, SyncMode::Update, config, options, cli.force).await
        }

        Commands::Sync(locations) => {
            cmd_transfer(&locations, SyncMode::Sync, config, options, cli.force).await
        }

        Commands::Mirror(locations) => {
            cmd_transfer(&locations, SyncMode::Mirror, config, options, cli.force).await
        }

        Commands::Repair(locations) => cmd_repair(&locations),

        Commands::Init {
            location,
            name,
            description,
            hash,
            ignore,
        } => cmd_init(&location, name, description, hash, ignore).await,

        Commands::Scan { path } => cmd_scan(&path, options).await,

        Commands::Info { location } => cmd_info(&location).await,
    }
}

/// Load the sync configuration from `path`, else the per-user file, else
/// defaults.
fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    if let Some(path) = path {
        return SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }
    if let Some(dir) = dirs::config_dir() {
        let default = dir.join("reposync").join("config.json");
        if default.is_file() {
            debug!(path = %default.display(), "Using user config");
            return SyncConfig::load(&default)
                .with_context(|| format!("Failed to load config {}", default.display()));
        }
    }
    Ok(SyncConfig::default())
}

/// Prompt for a passphrase securely.
fn prompt_passphrase(prompt: &str) -> reposync_common::Result<SensitiveBytes> {
    let passphrase = rpassword::prompt_password(prompt)?;
    Ok(SensitiveBytes::new(passphrase.into_bytes()))
}

/// Passphrase source for encrypted repositories. With `confirm`, an
/// interactive passphrase is asked for twice.
fn passphrase_provider(confirm: bool) -> PassphraseProvider {
    Arc::new(move |location: &str| {
        if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
            return Ok(SensitiveBytes::new(passphrase.into_bytes()));
        }
        let passphrase = prompt_passphrase(&format!("Passphrase for {}: ", location))?;
        if passphrase.is_empty() {
            return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
        }
        if confirm {
            let again = prompt_passphrase("Confirm passphrase: ")?;
            if again.as_bytes() != passphrase.as_bytes() {
                return Err(Error::InvalidInput("Passphrases do not match".to_string()));
            }
        }
        Ok(passphrase)
    })
}

async fn resolve(
    registry: &ProxyRegistry,
    role: &str,
    location: &str,
) -> Result<Arc<dyn RepositoryProxy>> {
    registry
        .resolve(location)
        .await
        .with_context(|| format!("Cannot open {} '{}'", role, location))
}

/// Open both repositories before anything runs.
async fn open_engine(locations: &Locations, config: SyncConfig) -> Result<SyncEngine> {
    let registry = create_default_registry(passphrase_provider(false))?;
    let source = resolve(&registry, "source repository", &locations.source).await?;
    let dest = resolve(&registry, "destination repository", &locations.dest).await?;
    Ok(SyncEngine::new(source, dest, config))
}

/// Release both repositories, keeping the first error.
async fn finish(engine: &SyncEngine, outcome: Result<()>) -> Result<()> {
    let released = engine.release().await;
    outcome?;
    released.context("Failed to release repositories")
}

/// Report differences.
async fn cmd_diff(locations: &Locations, config: SyncConfig, options: OutputOptions) -> Result<()> {
    let engine = open_engine(locations, config).await?;
    let outcome: Result<()> = async {
        let comparison = engine.compare().await.context("Failed to compare")?;
        print_comparison(&comparison, options);
        Ok(())
    }
    .await;
    finish(&engine, outcome).await
}

/// Run update, sync or mirror.
async fn cmd_transfer(
    locations: &Locations,
    mode: SyncMode,
    config: SyncConfig,
    options: OutputOptions,
    force: bool,
) -> Result<()> {
    let engine = open_engine(locations, config).await?;
    let outcome: Result<()> = async {
        let comparison = engine.compare().await.context("Failed to compare")?;
        if mode == SyncMode::Mirror && comparison.manifest.guid_differs() {
            if !force {
                bail!(
                    "Refusing to mirror: '{}' and '{}' are different repositories (use -force)",
                    locations.source,
                    locations.dest
                );
            }
            warn!("Mirroring between different repositories");
        }
        if comparison.files_identical() && !comparison.manifest.propagatable() {
            info!("Repositories are already in sync");
        }

        let reporter = ConsoleReporter::new(options);
        let report = engine
            .apply(&comparison, mode, &reporter)
            .await
            .with_context(|| format!("Failed to {}", mode))?;
        print_summary(&report, mode, options);
        Ok(())
    }
    .await;
    finish(&engine, outcome).await
}

fn cmd_repair(locations: &Locations) -> Result<()> {
    println!(
        "repair is not implemented ({} -> {})",
        locations.source, locations.dest
    );
    Ok(())
}

/// Default repository name: the last component of the location's path.
fn default_name(location: &str) -> String {
    let path = location
        .strip_prefix("crypt:")
        .or_else(|| location.strip_prefix("local:"))
        .unwrap_or(location);
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repository".to_string())
}

/// Create a new repository.
async fn cmd_init(
    location: &str,
    name: Option<String>,
    description: String,
    hash: HashAlgorithm,
    ignore: Vec<String>,
) -> Result<()> {
    info!("Creating repository: {}", location);

    IgnoreMatcher::new(&ignore).context("Invalid ignore pattern")?;

    let mut manifest = Manifest::new(name.unwrap_or_else(|| default_name(location)), hash);
    manifest.set_description(description);
    manifest.set_ignore_patterns(ignore);

    let registry = create_default_registry(passphrase_provider(true))?;
    let proxy = registry
        .create(location, manifest)
        .await
        .with_context(|| format!("Failed to create repository at '{}'", location))?;
    proxy.flush().await?;
    let manifest = proxy.manifest().await?;
    proxy.cleanup_before_exit().await?;

    println!("Repository created successfully!");
    println!("  Name: {}", manifest.name());
    println!("  GUID: {}", manifest.guid());
    println!("  Location: {}", proxy.location());
    if !location.starts_with("crypt:") {
        println!("\nRun `reposync scan {}` to register existing files.", location);
    }

    Ok(())
}

/// Refresh a local manifest from the files on disk.
async fn cmd_scan(path: &Path, options: OutputOptions) -> Result<()> {
    info!("Scanning: {}", path.display());

    let proxy = LocalRepositoryProxy::open(path)
        .with_context(|| format!("Cannot open repository '{}'", path.display()))?;
    let mut manifest = proxy.manifest().await?;
    let report = ManifestScanner::new(proxy.root())
        .scan(&mut manifest)
        .context("Failed to scan")?;

    for warning in &report.warnings {
        match &warning.path {
            Some(file) => eprintln!("Warning: {}: {}", file, warning.message),
            None => eprintln!("Warning: {}", warning.message),
        }
    }

    if report.changed() {
        proxy.replace_manifest(manifest).await;
        proxy.flush().await.context("Failed to save manifest")?;
    }
    proxy.cleanup_before_exit().await?;

    if !options.silent {
        println!(
            "Scan finished: {} added, {} updated, {} removed, {} unchanged",
            report.added.len(),
            report.updated.len(),
            report.removed.len(),
            report.unchanged
        );
        if options.detail {
            for file in &report.added {
                println!("  added {}", file);
            }
            for file in &report.updated {
                println!("  updated {}", file);
            }
            for file in &report.removed {
                println!("  removed {}", file);
            }
        }
    }

    Ok(())
}

/// Show manifest information.
async fn cmd_info(location: &str) -> Result<()> {
    let registry = create_default_registry(passphrase_provider(false))?;
    let proxy = resolve(&registry, "repository", location).await?;
    let manifest = proxy.manifest().await?;
    proxy.cleanup_before_exit().await?;

    println!("Repository Information:");
    println!("  Name: {}", manifest.name());
    println!("  GUID: {}", manifest.guid());
    println!("  Transport: {}", proxy.name());
    if !manifest.description().is_empty() {
        println!("  Description: {}", manifest.description());
    }
    println!("  Hash: {}", manifest.default_hash_algorithm());
    println!("  Created: {}", manifest.inception_utc());
    println!("  Information modified: {}", manifest.info_last_modified_utc());
    if let Some(updated) = manifest.last_update_utc() {
        println!("  Last update: {}", updated);
    }
    println!("  Files: {}", manifest.tree().file_count());
    if !manifest.ignore_patterns().is_empty() {
        println!("  Ignore patterns:");
        for pattern in manifest.ignore_patterns() {
            println!("    {}", pattern);
        }
    }

    Ok(())
}
