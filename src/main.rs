//! strata - Resumable disk usage indexer.
//!
//! Usage:
//!   strata scan [PATH...]       Index the configured roots in the foreground
//!   strata status               Show the current or last session
//!   strata tree [ID]            List the largest children of a folder
//!   strata files [FILTERS]      Search indexed entries
//!   strata duplicates           Show groups of identical files
//!   strata delete ID            Delete an indexed file
//!   strata --help               Show help

mod logging;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, eyre};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use strata_analyze::DuplicateReport;
use strata_core::{ChildListing, EntryFilter, EntryId, EntryPage, SessionStatus, SortKey};
use strata_scan::{ScanOrchestrator, ScanOutcome, ScanProgress, ScanStatusReport};

use crate::settings::AppConfig;

/// Minimum interval between redraws of the progress line.
const PROGRESS_REDRAW: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Resumable disk usage indexer",
    long_about = "strata walks large storage trees into a persistent index of \
                  directory sizes and content hashes.\n\n\
                  Run `strata scan` to index, then browse the result with \
                  `strata tree` or `strata duplicates`."
)]
struct Cli {
    /// Settings file (defaults to <config dir>/strata/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Index database (overrides the settings file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Shorthand for `--format json`
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index the configured roots and wait for the session to end
    Scan {
        /// Roots to scan (replaces the configured roots)
        paths: Vec<PathBuf>,

        /// Walk excluded directories too
        #[arg(long)]
        no_exclude: bool,

        /// Stop the session after this many seconds (0 disables the limit)
        #[arg(long)]
        max_duration: Option<u64>,

        /// Stop after this many top-level directories of the roots
        #[arg(long)]
        max_top_level_dirs: Option<usize>,
    },

    /// Show the running session or the most recent one
    Status,

    /// List completed and stopped sessions
    History {
        /// Page number, starting at 1
        #[arg(short, long, default_value = "1")]
        page: u32,

        /// Sessions per page
        #[arg(short = 'n', long, default_value = "20")]
        page_size: u32,
    },

    /// Show the largest children of a folder (the roots when no ID is given)
    Tree {
        /// Entry id of the folder
        id: Option<i64>,
    },

    /// Search indexed files and folders
    Files {
        /// Only entries under this path
        #[arg(long)]
        path: Option<PathBuf>,

        /// Name contains this text (case-insensitive)
        #[arg(short, long)]
        search: Option<String>,

        /// File extension (e.g., mkv)
        #[arg(short, long)]
        ext: Option<String>,

        /// Minimum size (e.g., 1MB, 500K)
        #[arg(long)]
        min_size: Option<String>,

        /// Maximum size (e.g., 4GB)
        #[arg(long)]
        max_size: Option<String>,

        /// Sort by size, name or modified
        #[arg(long, default_value = "size")]
        sort: SortKey,

        /// Sort ascending instead of descending
        #[arg(long)]
        asc: bool,

        /// Page number, starting at 1
        #[arg(short, long, default_value = "1")]
        page: u32,

        /// Entries per page
        #[arg(short = 'n', long, default_value = "50")]
        page_size: u32,
    },

    /// Show groups of files with identical content
    Duplicates {
        /// Maximum number of groups to show
        #[arg(short = 'n', long, default_value = "20")]
        top: usize,
    },

    /// Delete an indexed file from disk and from the index
    Delete {
        /// Entry id of the file
        id: i64,
    },

    /// Mark every running session as failed
    ForceReset,

    /// Drop all indexed entries and history
    ResetDb,

    /// Show the daily size of the indexed tree
    StorageHistory {
        /// Number of days to show
        #[arg(short, long, default_value = "30")]
        days: u32,
    },

    /// Show size per file extension
    Extensions {
        /// Maximum number of extensions to show
        #[arg(short = 'n', long, default_value = "20")]
        top: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let app = AppConfig::load(cli.config.as_deref())?;
    let db_path = cli.db.clone().unwrap_or_else(|| app.database_path());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut scan_config = app.scan_config(Vec::new());
    if let Command::Scan {
        paths,
        no_exclude,
        max_duration,
        max_top_level_dirs,
    } = &cli.command
    {
        scan_config = app.scan_config(paths.clone());
        if *no_exclude {
            scan_config.skip_excluded_dirs = false;
        }
        if let Some(secs) = max_duration {
            scan_config.max_duration_secs = (*secs > 0).then_some(*secs);
        }
        if let Some(limit) = max_top_level_dirs {
            scan_config.max_top_level_dirs = (*limit > 0).then_some(*limit);
        }
    }

    let orchestrator = Arc::new(ScanOrchestrator::open(&db_path, scan_config)?);
    let format = if cli.json { OutputFormat::Json } else { cli.format };

    match cli.command {
        Command::Scan { .. } => run_scan(orchestrator, format).await,
        Command::Status => print_status(&orchestrator.status()?, format),
        Command::History { page, page_size } => {
            let history = orchestrator.scan_history(page, page_size)?;
            if format == OutputFormat::Json {
                let page_count = history.page_count();
                return print_json(&serde_json::json!({
                    "sessions": history.sessions,
                    "total": history.total,
                    "page": history.page,
                    "page_size": history.page_size,
                    "page_count": page_count,
                }));
            }
            println!(
                "{:>6}  {:<10} {:<20} {:>10} {:>10} {:>10}",
                "ID", "STATUS", "STARTED", "DURATION", "FILES", "SIZE"
            );
            for session in &history.sessions {
                println!(
                    "{:>6}  {:<10} {:<20} {:>10} {:>10} {:>10}",
                    session.id,
                    session.status,
                    session.started_at.format("%Y-%m-%d %H:%M:%S"),
                    session
                        .duration()
                        .map_or_else(|| "-".to_string(), format_duration),
                    session.counters.files_seen,
                    format_size(session.counters.bytes_seen),
                );
            }
            println!(
                "\nPage {} of {} ({} sessions)",
                history.page,
                history.page_count().max(1),
                history.total
            );
            Ok(())
        }
        Command::Tree { id } => {
            let listing = match id {
                Some(id) => orchestrator.tree_children(EntryId(id))?,
                None => orchestrator.tree_root()?,
            };
            if format == OutputFormat::Json {
                return print_json(&listing);
            }
            let title = match id {
                Some(id) => orchestrator.entry(EntryId(id))?.path.display().to_string(),
                None => "Scan roots".to_string(),
            };
            print_listing(&title, &listing);
            Ok(())
        }
        Command::Files {
            path,
            search,
            ext,
            min_size,
            max_size,
            sort,
            asc,
            page,
            page_size,
        } => {
            let filter = EntryFilter {
                path_prefix: path,
                name_contains: search,
                extension: ext,
                min_size: min_size.as_deref().map(parse_size).transpose()?,
                max_size: max_size.as_deref().map(parse_size).transpose()?,
                sort,
                descending: !asc,
            };
            let found = orchestrator.search_entries(&filter, page, page_size)?;
            if format == OutputFormat::Json {
                let page_count = found.page_count();
                return print_json(&serde_json::json!({
                    "entries": found.entries,
                    "total": found.total,
                    "page": found.page,
                    "page_size": found.page_size,
                    "page_count": page_count,
                }));
            }
            print_entries(&found);
            Ok(())
        }
        Command::Duplicates { top } => {
            let groups = orchestrator.duplicate_groups()?;
            let report = DuplicateReport::from_groups(groups);
            if format == OutputFormat::Json {
                return print_json(&report);
            }
            print_duplicates(&report, top);
            Ok(())
        }
        Command::Delete { id } => {
            let deleted = orchestrator.delete_entry(EntryId(id))?;
            if format == OutputFormat::Json {
                return print_json(&deleted);
            }
            if deleted.file_removed {
                println!(
                    "Deleted {} ({})",
                    deleted.entry.path.display(),
                    format_size(deleted.entry.size)
                );
            } else {
                println!(
                    "{} was already gone; removed it from the index",
                    deleted.entry.path.display()
                );
            }
            Ok(())
        }
        Command::ForceReset => {
            let reset = orchestrator.force_reset_scan()?;
            if format == OutputFormat::Json {
                return print_json(&serde_json::json!({ "reset": reset }));
            }
            println!("Reset {reset} running session(s)");
            Ok(())
        }
        Command::ResetDb => {
            orchestrator.reset_database()?;
            if format == OutputFormat::Json {
                return print_json(&serde_json::json!({ "reset": true }));
            }
            println!("Index cleared");
            Ok(())
        }
        Command::StorageHistory { days } => {
            let snapshots = orchestrator.storage_history(days)?;
            if format == OutputFormat::Json {
                return print_json(&snapshots);
            }
            if snapshots.is_empty() {
                println!("No completed scans recorded yet.");
                return Ok(());
            }
            let max = snapshots.iter().map(|s| s.total_size).max().unwrap_or(1).max(1);
            for snapshot in &snapshots {
                println!(
                    "{}  {} {:>10}  {} files, {} dirs",
                    snapshot.day,
                    make_bar(snapshot.total_size as f64 / max as f64, 20),
                    format_size(snapshot.total_size),
                    snapshot.file_count,
                    snapshot.dir_count,
                );
            }
            Ok(())
        }
        Command::Extensions { top } => {
            let stats = orchestrator.extension_summary(top)?;
            if format == OutputFormat::Json {
                return print_json(&stats);
            }
            let total: u64 = stats.iter().map(|s| s.total_size).sum();
            for stat in &stats {
                let ratio = if total > 0 {
                    stat.total_size as f64 / total as f64
                } else {
                    0.0
                };
                println!(
                    "{:<12} {} {:>10} {:>8} files",
                    truncate(&stat.extension, 12),
                    make_bar(ratio, 20),
                    format_size(stat.total_size),
                    stat.count,
                );
            }
            Ok(())
        }
    }
}

/// Run a session in the foreground, redrawing progress until it ends.
///
/// Ctrl-C requests a cooperative stop; the session then ends as stopped.
async fn run_scan(orchestrator: Arc<ScanOrchestrator>, format: OutputFormat) -> Result<()> {
    let mut progress_rx = orchestrator.subscribe();
    let session = orchestrator.start_scan()?;
    tracing::info!(%session, "Scan started");

    let waiter = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::task::spawn_blocking(move || orchestrator.wait())
    };
    tokio::pin!(waiter);

    let interactive = format == OutputFormat::Text;
    let mut stopping = false;
    let mut last_draw: Option<Instant> = None;

    let outcome = loop {
        tokio::select! {
            outcome = &mut waiter => break outcome?,
            signal = tokio::signal::ctrl_c(), if !stopping => {
                signal?;
                stopping = true;
                if interactive {
                    eprintln!("\nStopping scan...");
                }
                if let Err(e) = orchestrator.stop_scan() {
                    tracing::debug!("Stop ignored: {e}");
                }
            }
            event = progress_rx.recv() => match event {
                Ok(progress) => {
                    if interactive && last_draw.is_none_or(|t| t.elapsed() >= PROGRESS_REDRAW) {
                        draw_progress(&orchestrator, &progress);
                        last_draw = Some(Instant::now());
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    break (&mut waiter).await?;
                }
            }
        }
    };

    if interactive {
        eprintln!();
    }
    let outcome = outcome.ok_or_else(|| eyre!("Scan worker exited without reporting"))?;

    if format == OutputFormat::Json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }

    match outcome.status {
        SessionStatus::Failed => Err(eyre!(
            "Scan failed: {}",
            outcome.error_message.as_deref().unwrap_or("unknown error")
        )),
        _ => Ok(()),
    }
}

fn draw_progress(orchestrator: &ScanOrchestrator, progress: &ScanProgress) {
    let estimate = orchestrator.status().ok().and_then(|report| report.progress);
    let percent = estimate
        .as_ref()
        .and_then(|e| e.percent)
        .map_or_else(|| "--".to_string(), |p| format!("{p:.0}%"));
    let eta = estimate
        .as_ref()
        .and_then(|e| e.eta_secs)
        .map_or_else(String::new, |secs| {
            format!(" eta {}", format_duration(Duration::from_secs(secs)))
        });

    eprint!(
        "\r\x1b[2K{:>4} {:>9} files {:>10} {:>7.0} files/s{}  {}",
        percent,
        progress.counters.files_seen,
        format_size(progress.counters.bytes_seen),
        progress.files_per_second(),
        eta,
        truncate(&progress.current_path.display().to_string(), 48),
    );
}

fn print_outcome(outcome: &ScanOutcome) {
    let counters = &outcome.counters;
    println!("Session {} {}", outcome.session, outcome.status);
    if let Some(message) = &outcome.error_message {
        println!("  {message}");
    }
    println!();
    println!(
        "  {} files, {} directories, {}",
        counters.files_seen,
        counters.dirs_seen,
        format_size(counters.bytes_seen)
    );
    println!(
        "  {} hashed ({}), {} reused, {} hash failures",
        counters.files_hashed,
        format_size(counters.bytes_hashed),
        counters.hash_cache_hits,
        counters.hash_failures
    );
    println!("  {} skipped", counters.skipped);
    if outcome.swept > 0 {
        println!("  {} vanished entries removed", outcome.swept);
    }
}

fn print_status(report: &ScanStatusReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }

    println!("Status: {}", report.status);
    let Some(session) = &report.session else {
        println!("No scans recorded yet.");
        return Ok(());
    };

    println!("Session: {}", session.id);
    println!(
        "Started: {}",
        session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ended) = session.ended_at {
        println!("Ended:   {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "Indexed: {} files, {} directories, {}",
        session.counters.files_seen,
        session.counters.dirs_seen,
        format_size(session.counters.bytes_seen)
    );
    if let Some(path) = &session.current_path {
        println!("Current: {}", path.display());
    }
    if let Some(message) = &session.error_message {
        println!("Message: {message}");
    }
    if let Some(progress) = &report.progress {
        if let Some(percent) = progress.percent {
            println!("Progress: {} {percent:.1}%", make_bar(percent / 100.0, 30));
        }
        if let Some(eta) = progress.eta_secs {
            println!("ETA:     {}", format_duration(Duration::from_secs(eta)));
        }
    }
    if session.status == SessionStatus::Running && !report.worker_active {
        println!("\nNo worker owns this session. Run `strata force-reset` to clear it.");
    }
    Ok(())
}

fn print_listing(title: &str, listing: &ChildListing) {
    println!("{title}");
    println!("{}", "─".repeat(72));

    let total: u64 = listing.entries.iter().map(|e| e.size).sum::<u64>()
        + listing.remainder.map_or(0, |r| r.total_size);

    for entry in &listing.entries {
        let ratio = if total > 0 {
            entry.size as f64 / total as f64
        } else {
            0.0
        };
        let name = if entry.is_dir() {
            format!("{}/", entry.name)
        } else {
            entry.name.to_string()
        };
        println!(
            "{:>8}  {} {:>10}  {}",
            entry.id,
            make_bar(ratio, 16),
            format_size(entry.size),
            truncate(&name, 36),
        );
    }

    if let Some(remainder) = listing.remainder {
        println!(
            "{:>8}  {:>18} {:>10}  ({} more)",
            "",
            "",
            format_size(remainder.total_size),
            remainder.count
        );
    }
    println!("\n{} children, {}", listing.total_children(), format_size(total));
}

fn print_entries(found: &EntryPage) {
    if found.entries.is_empty() {
        println!("No matching entries.");
        return;
    }
    println!("{:>8}  {:>10}  {:<16}  PATH", "ID", "SIZE", "MODIFIED");
    for entry in &found.entries {
        let modified: chrono::DateTime<chrono::Local> = entry.modified.into();
        let path = entry.path.display().to_string();
        let path = if entry.is_dir() { format!("{path}/") } else { path };
        println!(
            "{:>8}  {:>10}  {:<16}  {}",
            entry.id,
            format_size(entry.size),
            modified.format("%Y-%m-%d %H:%M"),
            path,
        );
    }
    println!(
        "\nPage {} of {} ({} entries)",
        found.page,
        found.page_count().max(1),
        found.total
    );
}

fn print_duplicates(report: &DuplicateReport, top: usize) {
    if !report.has_duplicates() {
        println!("No duplicate files found.");
        return;
    }

    println!(
        "{} duplicate groups, {} files, {} reclaimable",
        report.group_count,
        report.files_with_duplicates,
        format_size(report.total_wasted_space)
    );
    println!("{}", "─".repeat(72));

    for group in report.groups.iter().take(top) {
        println!(
            "\n{} x {} ({} wasted)  {}",
            group.count(),
            format_size(group.size),
            format_size(group.wasted_bytes()),
            &group.hash.to_hex()[..12]
        );
        for member in &group.members {
            let marker = if member.primary { "keep" } else { "    " };
            println!("  {marker} {:>8}  {}", member.id, member.path.display());
        }
    }

    if report.groups.len() > top {
        println!("\n... and {} more groups", report.groups.len() - top);
    }
}

/// Parse a size string (e.g., "1MB", "500K", "1G").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let number = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
    let multiplier: u64 = match &s[number.len()..] {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        unit => return Err(eyre!("Unknown size unit: {unit}")),
    };
    let num: f64 = number.parse()?;
    Ok((num * multiplier as f64) as u64)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Create a visual bar for size comparison.
fn make_bar(ratio: f64, width: usize) -> String {
    let filled = (ratio.clamp(0.0, 1.0) * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// Truncate a string to max length in characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}
