//! satchel CLI - command line front end for encrypted vaults.
//!
//! Every command opens the vault, does its work and closes it again, so
//! the index is written back before the process exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use satchel_common::{format_timestamp, SensitiveBytes};
use satchel_index::{IndexEntry, ListQuery, SortColumn, SortOrder, ROOT_FOLDER_ID, SCHEMA_VERSION};
use satchel_vault::{
    AlwaysExtract, BatchReport, HostDecision, HostDecisionProvider, NeverExtract,
    ProgressObserver, TracingObserver, VaultEngine, VaultLayout, VaultOptions,
};

#[derive(Parser)]
#[command(name = "satchel")]
#[command(about = "satchel - Encrypted multi-host vault")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Options file (default: <config dir>/satchel/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Host name to act as instead of the configured one.
    #[arg(long, global = true)]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Create {
        /// Directory to create the vault in.
        vault: PathBuf,
    },

    /// Show vault information.
    Info { vault: PathBuf },

    /// List a folder of the merged index.
    Ls {
        vault: PathBuf,

        /// Full folder path (default: the root).
        dir: Option<String>,

        #[arg(short, long, value_enum, default_value = "path")]
        sort: SortArg,

        /// Sort descending.
        #[arg(short, long)]
        desc: bool,

        /// Maximum rows (0 for all).
        #[arg(long, default_value_t = 0)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Register a local file or folder to sync from this host.
    AddSync { vault: PathBuf, source: PathBuf },

    /// Unregister a sync point of this host.
    RemoveSync { vault: PathBuf, source: String },

    /// List sync points of every host.
    SyncPoints { vault: PathBuf },

    /// Manage ignore patterns.
    Ignore {
        vault: PathBuf,

        #[command(subcommand)]
        action: IgnoreAction,
    },

    /// Push this host's sync points into the vault.
    Sync { vault: PathBuf },

    /// Decrypt files or folders back to disk.
    Extract {
        vault: PathBuf,

        /// Full paths of files or folders.
        #[arg(required = true)]
        paths: Vec<String>,

        /// Extract below this folder instead of the original locations.
        #[arg(long)]
        to: Option<PathBuf>,

        /// Extract files from other hosts without asking.
        #[arg(long, conflicts_with = "no_all")]
        yes_all: bool,

        /// Skip files from other hosts without asking.
        #[arg(long)]
        no_all: bool,
    },

    /// Remove files or folders from the vault.
    Delete {
        vault: PathBuf,

        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Retag every entry of one host as another.
    MoveHost {
        vault: PathBuf,
        from: String,
        to: String,
    },

    /// Change vault password.
    ChangePassword { vault: PathBuf },
}

#[derive(Subcommand)]
enum IgnoreAction {
    /// Add a pattern (`*` and `?` wildcards, matched against full paths).
    Add { pattern: String },
    Remove { pattern: String },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Path,
    Size,
    Modified,
    Created,
    Host,
}

impl From<SortArg> for SortColumn {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Path => SortColumn::Path,
            SortArg::Size => SortColumn::Size,
            SortArg::Modified => SortColumn::ModDate,
            SortArg::Created => SortColumn::CreateDate,
            SortArg::Host => SortColumn::Host,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = load_options(cli.config.as_deref(), cli.host)?;

    match cli.command {
        Commands::Create { vault } => cmd_create(options, &vault).await,

        Commands::Info { vault } => cmd_info(options, &vault).await,

        Commands::Ls {
            vault,
            dir,
            sort,
            desc,
            limit,
            offset,
        } => {
            let query = ListQuery {
                folder_id: ROOT_FOLDER_ID,
                limit,
                offset,
                current_path: dir.unwrap_or_default(),
                sort: sort.into(),
                order: if desc {
                    SortOrder::Descending
                } else {
                    SortOrder::Ascending
                },
            };
            cmd_ls(options, &vault, query).await
        }

        Commands::AddSync { vault, source } => cmd_add_sync(options, &vault, &source).await,

        Commands::RemoveSync { vault, source } => cmd_remove_sync(options, &vault, &source).await,

        Commands::SyncPoints { vault } => cmd_sync_points(options, &vault).await,

        Commands::Ignore { vault, action } => cmd_ignore(options, &vault, action).await,

        Commands::Sync { vault } => cmd_sync(options, &vault).await,

        Commands::Extract {
            vault,
            paths,
            to,
            yes_all,
            no_all,
        } => {
            let mut options = options;
            if to.is_some() {
                options.extract_folder = to;
            }
            let decisions: Arc<dyn HostDecisionProvider> = if yes_all {
                Arc::new(AlwaysExtract)
            } else if no_all {
                Arc::new(NeverExtract)
            } else {
                Arc::new(TerminalDecisions)
            };
            cmd_extract(options, &vault, &paths, decisions).await
        }

        Commands::Delete { vault, paths } => cmd_delete(options, &vault, &paths).await,

        Commands::MoveHost { vault, from, to } => cmd_move_host(options, &vault, &from, &to).await,

        Commands::ChangePassword { vault } => cmd_change_password(options, &vault).await,
    }
}

/// Read options from `path`, or the default location when it exists.
fn load_options(path: Option<&Path>, host: Option<String>) -> Result<VaultOptions> {
    let path = path.map(Path::to_path_buf).or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("satchel").join("config.json"))
            .filter(|p| p.is_file())
    });

    let mut options = match path {
        Some(path) => VaultOptions::load(&path)
            .with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => VaultOptions::default(),
    };
    if let Some(host) = host {
        options.host_name = host;
    }
    options.validate().context("Invalid options")?;
    Ok(options)
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<SensitiveBytes> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(SensitiveBytes::new(password.into_bytes()))
}

fn prompt_new_password() -> Result<SensitiveBytes> {
    let password = prompt_password("Enter new password: ")?;
    let confirm = prompt_password("Confirm new password: ")?;

    if password.as_bytes() != confirm.as_bytes() {
        anyhow::bail!("Passwords do not match");
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}

async fn open_engine(options: VaultOptions, vault: &Path) -> Result<VaultEngine> {
    let password = prompt_password("Enter password: ")?;
    let mut engine = VaultEngine::new(options);
    engine
        .open(vault, password.as_bytes())
        .await
        .context("Failed to open vault")?;
    Ok(engine)
}

/// Close the engine, reporting the command's error first.
async fn finish<T>(mut engine: VaultEngine, result: Result<T>) -> Result<T> {
    let closed = engine.close().await.context("Failed to close vault");
    let value = result?;
    closed?;
    Ok(value)
}

fn observer() -> Arc<dyn ProgressObserver> {
    Arc::new(TracingObserver)
}

fn print_report(action: &str, report: &BatchReport) {
    println!(
        "{action}: {} processed, {} unchanged, {} skipped, {} failed",
        report.processed,
        report.unchanged,
        report.skipped,
        report.failures.len()
    );
    for (path, error) in &report.failures {
        println!("  failed: {path}: {error}");
    }
    if report.aborted {
        println!("{action} stopped before completion.");
    }
}

/// Create a new vault.
async fn cmd_create(options: VaultOptions, vault: &Path) -> Result<()> {
    info!("Creating new vault at {}", vault.display());

    let password = prompt_new_password()?;
    let mut engine = VaultEngine::new(options);
    engine
        .create(vault, password.as_bytes())
        .await
        .context("Failed to create vault")?;
    let host = engine.host_name().to_string();
    finish(engine, Ok(())).await?;

    println!("Vault created successfully!");
    println!("  Location: {}", vault.display());
    println!("  Host: {host}");
    Ok(())
}

/// Show vault information.
async fn cmd_info(options: VaultOptions, vault: &Path) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = (|| -> Result<()> {
        let layout = VaultLayout::new(vault);
        let index_size = std::fs::metadata(layout.index_path())?.len();

        println!("Vault Information:");
        println!("  Location: {}", vault.display());
        println!("  Index: {index_size} bytes");
        println!(
            "  Schema version: {}",
            engine
                .parameter("version")?
                .unwrap_or_else(|| SCHEMA_VERSION.to_string())
        );
        println!("  This host: {}", engine.host_name());
        println!("  Hosts: {}", engine.hosts()?.join(", "));
        println!("  Sync points: {}", engine.sync_points()?.len());
        println!("  Ignore patterns: {}", engine.ignore_patterns()?.len());
        println!("  KDF iterations: {}", engine.options().kdf.iterations);
        Ok(())
    })();
    finish(engine, result).await
}

/// List a folder.
async fn cmd_ls(options: VaultOptions, vault: &Path, mut query: ListQuery) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = (|| -> Result<()> {
        query.folder_id = engine
            .find_folder(&query.current_path)?
            .with_context(|| format!("No such folder: {}", query.current_path))?;
        let entries = engine.list_folder(&query)?;

        if entries.is_empty() {
            println!("Folder is empty.");
        }
        for entry in &entries {
            print_entry(entry);
        }
        Ok(())
    })();
    finish(engine, result).await
}

fn print_entry(entry: &IndexEntry) {
    if entry.is_folder() {
        println!("  [DIR]  {}/", entry.file_name());
    } else {
        println!(
            "  [FILE] {} ({} bytes, modified {}, host {})",
            entry.file_name(),
            entry.size,
            format_timestamp(entry.mod_date),
            entry.host
        );
    }
}

/// Register a sync point.
async fn cmd_add_sync(options: VaultOptions, vault: &Path, source: &Path) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = engine
        .add_sync_point(source)
        .with_context(|| format!("Failed to add sync point {}", source.display()));
    let point = finish(engine, result).await?;

    println!("Sync point added: {} ({:?})", point.path, point.kind);
    Ok(())
}

/// Unregister a sync point.
async fn cmd_remove_sync(options: VaultOptions, vault: &Path, source: &str) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = engine.remove_sync_point(source).map_err(Into::into);
    if finish(engine, result).await? {
        println!("Sync point removed: {source}");
    } else {
        println!("No sync point {source} for this host.");
    }
    Ok(())
}

/// List sync points.
async fn cmd_sync_points(options: VaultOptions, vault: &Path) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = engine.sync_points().map_err(Into::into);
    let points = finish(engine, result).await?;

    if points.is_empty() {
        println!("No sync points.");
    }
    for point in points {
        println!("  [{}] {} ({:?})", point.host, point.path, point.kind);
    }
    Ok(())
}

/// Manage ignore patterns.
async fn cmd_ignore(options: VaultOptions, vault: &Path, action: IgnoreAction) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = (|| -> Result<()> {
        match action {
            IgnoreAction::Add { pattern } => {
                engine.add_ignore_pattern(&pattern)?;
                println!("Ignore pattern added: {pattern}");
            }
            IgnoreAction::Remove { pattern } => {
                if engine.remove_ignore_pattern(&pattern)? {
                    println!("Ignore pattern removed: {pattern}");
                } else {
                    println!("No ignore pattern {pattern}.");
                }
            }
            IgnoreAction::List => {
                for pattern in engine.ignore_patterns()? {
                    println!("  {pattern}");
                }
            }
        }
        Ok(())
    })();
    finish(engine, result).await
}

/// Sync this host's sync points.
async fn cmd_sync(options: VaultOptions, vault: &Path) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    if let Ok(total) = engine.count_sync_files().await {
        info!("Syncing up to {total} files");
    }
    let result = engine.sync(observer()).await.context("Sync failed");
    let report = finish(engine, result).await?;

    print_report("Sync", &report);
    Ok(())
}

fn resolve_all(engine: &VaultEngine, paths: &[String]) -> Result<Vec<IndexEntry>> {
    let mut items = Vec::new();
    for path in paths {
        let found = engine.resolve(path)?;
        if found.is_empty() {
            warn!("Not in the vault: {path}");
        }
        items.extend(found);
    }
    Ok(items)
}

/// Extract files and folders.
async fn cmd_extract(
    options: VaultOptions,
    vault: &Path,
    paths: &[String],
    decisions: Arc<dyn HostDecisionProvider>,
) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = async {
        let items = resolve_all(&engine, paths)?;
        info!("Extracting {} files", engine.count_selected(&items)?);
        engine
            .extract(items, decisions, observer())
            .await
            .context("Extract failed")
    }
    .await;
    let report = finish(engine, result).await?;

    print_report("Extract", &report);
    Ok(())
}

/// Delete files and folders.
async fn cmd_delete(options: VaultOptions, vault: &Path, paths: &[String]) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = async {
        let items = resolve_all(&engine, paths)?;
        engine
            .delete(items, observer())
            .await
            .context("Delete failed")
    }
    .await;
    let report = finish(engine, result).await?;

    print_report("Delete", &report);
    Ok(())
}

/// Retag one host's entries.
async fn cmd_move_host(options: VaultOptions, vault: &Path, from: &str, to: &str) -> Result<()> {
    let engine = open_engine(options, vault).await?;
    let result = engine.move_host(from, to).map_err(Into::into);
    let moved = finish(engine, result).await?;

    println!("Moved {moved} entries from {from} to {to}.");
    Ok(())
}

/// Change vault password.
async fn cmd_change_password(options: VaultOptions, vault: &Path) -> Result<()> {
    info!("Changing vault password");

    let old_password = prompt_password("Enter current password: ")?;
    let mut engine = VaultEngine::new(options);
    engine
        .open(vault, old_password.as_bytes())
        .await
        .context("Failed to open vault")?;

    let result = prompt_new_password().and_then(|new_password| {
        engine
            .change_password(old_password.as_bytes(), new_password.as_bytes())
            .context("Failed to change password")
    });
    finish(engine, result).await?;

    println!("Password changed successfully!");
    Ok(())
}

/// Asks on the terminal about files synced by other hosts.
struct TerminalDecisions;

impl HostDecisionProvider for TerminalDecisions {
    fn decide(&self, entry: &IndexEntry, local_host: &str) -> HostDecision {
        let mut stdout = io::stdout();
        let _ = write!(
            stdout,
            "{} was synced by {}, not {}. Extract? [y]es/[n]o/[a]ll/[s]kip all/[c]ancel: ",
            entry.path, entry.host, local_host
        );
        let _ = stdout.flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return HostDecision::Cancel;
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => HostDecision::Yes,
            "a" | "all" => HostDecision::YesAll,
            "s" | "skip" => HostDecision::NoAll,
            "c" | "cancel" => HostDecision::Cancel,
            _ => HostDecision::No,
        }
    }
}
