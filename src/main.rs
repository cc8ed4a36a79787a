//! dustpan - Find what is eating your disk, with cached directory sizes.
//!
//! Usage:
//!   dustpan size [PATH]...        Measure directories
//!   dustpan ls [PATH]             List immediate children
//!   dustpan clear-cache [PREFIX]  Drop cached sizes
//!   dustpan delete PATH...        Remove entries and their cached sizes
//!   dustpan --help                Show help

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, eyre};
use tracing_subscriber::EnvFilter;

use dustpan_cache::CacheStore;
use dustpan_core::{EngineConfig, Node, PathKey};
use dustpan_scan::{
    ListingEntry, ScanOutcome, ScanProgress, Scheduler, SizeReport, SortOrder, sort_entries,
};

#[derive(Parser)]
#[command(
    name = "dustpan",
    version,
    about = "Find what is eating your disk",
    long_about = "dustpan measures directory sizes and remembers them.\n\n\
                  Sizes are cached per directory and reused until the \
                  directory's modification time changes."
)]
struct Cli {
    /// Cache database to use instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    cache: Option<PathBuf>,

    /// Do not read or write cached sizes
    #[arg(long, global = true, conflicts_with = "cache")]
    no_cache: bool,

    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure directories and show where the space goes
    Size {
        /// Paths to measure
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        /// Levels of children to show below each root
        #[arg(short, long, default_value = "1")]
        depth: u32,

        /// Number of top entries to show per directory
        #[arg(short = 'n', long, default_value = "10")]
        top: usize,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the immediate children of a directory
    Ls {
        /// Directory to list
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Sort order
        #[arg(short, long, default_value = "name")]
        sort: SortArg,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drop cached sizes for a path and everything below it
    ClearCache {
        /// Prefix to clear (defaults to the whole cache)
        prefix: Option<PathBuf>,
    },

    /// Delete files or directories and forget their cached sizes
    Delete {
        /// Paths to delete
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum SortArg {
    #[default]
    Name,
    Size,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Name => SortOrder::Name,
            SortArg::Size => SortOrder::SizeDesc,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("Invalid config file {}", path.display()))?,
        None => EngineConfig::load(),
    };
    if let Command::Size { depth, .. } = &cli.command {
        config.detail_depth = *depth;
    }

    let store = open_store(&cli, &config)?;
    let (scheduler, _events) =
        Scheduler::new(config, store).context("Failed to start scanner")?;

    let result = match cli.command {
        Command::Size {
            paths,
            depth,
            top,
            json,
        } => run_size(&scheduler, &paths, depth, top, json).await,
        Command::Ls { path, sort, json } => run_ls(&scheduler, &path, sort.into(), json),
        Command::ClearCache { prefix } => run_clear_cache(&scheduler, prefix.as_deref()),
        Command::Delete { paths, yes } => run_delete(&scheduler, &paths, yes),
    };

    scheduler.shutdown().await;
    result
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_store(cli: &Cli, config: &EngineConfig) -> Result<Option<Arc<CacheStore>>> {
    if cli.no_cache {
        return Ok(None);
    }
    let store = match &cli.cache {
        Some(path) => CacheStore::open_with_readers(path, config.read_connections),
        None => CacheStore::open_configured(config),
    }
    .context("Failed to open cache")?;
    Ok(Some(Arc::new(store)))
}

/// Measure each path and print a summary tree.
async fn run_size(
    scheduler: &Scheduler,
    paths: &[PathBuf],
    depth: u32,
    top_n: usize,
    json: bool,
) -> Result<()> {
    let mut handles = Vec::with_capacity(paths.len());
    for (path, handle) in paths.iter().zip(scheduler.request_scans(paths)) {
        let handle = handle.with_context(|| format!("Invalid path {}", path.display()))?;
        if !json {
            eprintln!("Scanning {}...", handle.key());
        }
        handles.push(handle);
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in &handles {
        outcomes.push(handle.wait().await);
    }

    let mut reports: Vec<&SizeReport> = Vec::new();
    let mut failures = 0;
    for (handle, outcome) in handles.iter().zip(&outcomes) {
        match &**outcome {
            ScanOutcome::Failed(e) => {
                failures += 1;
                eprintln!("{}: {}", handle.key(), e);
            }
            ScanOutcome::Cancelled { partial: None } => {
                eprintln!("{}: cancelled", handle.key());
            }
            other => {
                if let Some(report) = other.report() {
                    reports.push(report);
                }
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report, depth, top_n);
        }
    }

    if failures > 0 {
        return Err(eyre!("{failures} path(s) could not be measured"));
    }
    Ok(())
}

fn print_report(report: &SizeReport, max_depth: u32, top_n: usize) {
    let root = &report.root;
    let title = root.key().map_or_else(|| root.name().to_string(), PathKey::to_string);

    println!();
    println!("{}", "─".repeat(60));
    println!(" {} - {}", title, format_size(report.total_size()));
    if let Some(dir) = report.root_dir() {
        println!(
            " {} files, {} directories{}",
            dir.file_count,
            dir.dir_count,
            if dir.from_cache { " (cached)" } else { "" }
        );
    }
    println!("{}", scan_summary(&report.progress, report.duration));
    if !report.is_exact() {
        println!(" Total is a lower bound: some entries could not be read");
    }
    println!("{}", "─".repeat(60));
    println!();

    print_node(root, &title, 0, max_depth, top_n, report.total_size());

    if !report.warnings.is_empty() {
        println!();
        println!("{} warning(s) during scan", report.warnings.len());
        for warning in &report.warnings {
            tracing::info!(path = %warning.path.display(), kind = ?warning.kind, "{}", warning.message);
        }
    }
}

fn scan_summary(progress: &ScanProgress, duration: Duration) -> String {
    let mut line = format!(" Scanned in {:.2}s", duration.as_secs_f64());
    if progress.files_scanned > 0 {
        line.push_str(&format!(" ({:.0} files/s)", progress.files_per_second()));
    }
    if progress.cache_hits > 0 {
        line.push_str(&format!(", {} subtree(s) from cache", progress.cache_hits));
    }
    line
}

/// Print a node and its children.
fn print_node(node: &Node, name: &str, depth: u32, max_depth: u32, top_n: usize, root_size: u64) {
    let indent = "  ".repeat(depth as usize);
    let ratio = if root_size > 0 {
        node.size() as f64 / root_size as f64 * 100.0
    } else {
        0.0
    };

    let bar = make_bar(ratio / 100.0, 10);
    let marker = match node {
        Node::Directory(_) => "/",
        Node::Symlink { .. } => "@",
        Node::Error(_) => "!",
        _ => "",
    };

    println!(
        "{}{}{:<40} {:>10} {:>5.1}% {}",
        indent,
        if node.is_dir() { "▼ " } else { "  " },
        truncate(&format!("{name}{marker}"), 40),
        format_size(node.size()),
        ratio,
        bar
    );

    let Some(dir) = node.as_dir() else {
        return;
    };
    if depth < max_depth {
        let children_to_show = dir.children.iter().take(top_n);
        let remaining = dir.children.len().saturating_sub(top_n);

        for child in children_to_show {
            print_node(child, child.name(), depth + 1, max_depth, top_n, root_size);
        }

        if remaining > 0 {
            let indent = "  ".repeat((depth + 1) as usize);
            println!("{}  ... and {} more", indent, remaining);
        }
    }
}

/// List a directory.
fn run_ls(scheduler: &Scheduler, path: &Path, order: SortOrder, json: bool) -> Result<()> {
    let mut entries = scheduler
        .list_children(path)
        .with_context(|| format!("Cannot list {}", path.display()))?;
    sort_entries(&mut entries, order);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

fn print_entry(entry: &ListingEntry) {
    let size = match (entry.size, &entry.error) {
        (_, Some(error)) => format!("({:?})", error.kind),
        (Some(size), None) => format_size(size),
        (None, None) => "-".to_string(),
    };
    println!("{:<7} {:>10}  {}", entry.kind.to_string(), size, entry.name);
}

/// Clear cached sizes under `prefix`, or everything.
fn run_clear_cache(scheduler: &Scheduler, prefix: Option<&Path>) -> Result<()> {
    if scheduler.store().is_none() {
        eprintln!("Cache disabled, nothing to clear");
        return Ok(());
    }

    let removed = match prefix {
        Some(prefix) => scheduler
            .clear_cache(prefix)
            .with_context(|| format!("Failed to clear cache for {}", prefix.display()))?,
        None => scheduler.clear_all_cache().context("Failed to clear cache")?,
    };
    println!("Removed {removed} cached size(s)");
    Ok(())
}

/// Delete each path and forget its cached sizes. Failures are reported per
/// item and do not stop the rest.
fn run_delete(scheduler: &Scheduler, paths: &[PathBuf], yes: bool) -> Result<()> {
    let mut keys = Vec::with_capacity(paths.len());
    for path in paths {
        let key = PathKey::normalize(path)
            .with_context(|| format!("Invalid path {}", path.display()))?;
        keys.push(key);
    }

    if !yes {
        println!("About to delete {} item(s):", keys.len());
        for key in &keys {
            println!("   {key}");
        }
        if !confirm("Proceed?")? {
            println!("Nothing deleted");
            return Ok(());
        }
    }

    let mut failed = 0;
    for key in &keys {
        match remove_entry(key.as_path()) {
            Ok(()) => {
                if let Err(e) = scheduler.forget_removed(key.as_path()) {
                    tracing::warn!(path = %key, error = %e, "failed to forget cached size");
                }
                println!("Deleted {key}");
            }
            Err(e) => {
                failed += 1;
                eprintln!("Failed to delete {key}: {e}");
            }
        }
    }

    if failed > 0 {
        return Err(eyre!("{failed} of {} item(s) could not be deleted", keys.len()));
    }
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Create a simple ASCII bar.
fn make_bar(ratio: f64, width: usize) -> String {
    let filled = (ratio * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 1).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 3), "éé…");
    }

    #[test]
    fn test_scan_summary_reports_rate_and_cache_hits() {
        let progress = ScanProgress {
            files_scanned: 500,
            cache_hits: 2,
            elapsed: Duration::from_secs(2),
            ..ScanProgress::default()
        };
        assert_eq!(
            scan_summary(&progress, Duration::from_secs(2)),
            " Scanned in 2.00s (250 files/s), 2 subtree(s) from cache"
        );
        assert_eq!(
            scan_summary(&ScanProgress::default(), Duration::ZERO),
            " Scanned in 0.00s"
        );
    }

    #[test]
    fn test_make_bar() {
        assert_eq!(make_bar(0.5, 4), "[██░░]");
        assert_eq!(make_bar(0.0, 2), "[░░]");
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["dustpan", "ls", "/tmp", "--no-cache", "-vv"]).unwrap();
        assert!(cli.no_cache);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Ls { .. }));
    }

    #[test]
    fn test_delete_requires_a_path() {
        assert!(Cli::try_parse_from(["dustpan", "delete"]).is_err());
    }
}
