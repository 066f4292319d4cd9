//! # hardsnap CLI - Hardlinked snapshot rotation
//!
//! Command-line front end for the hardsnap library.
//!
//! ## Features
//! - Refresh a backup root from its host and rotate the snapshot cycles
//! - Rotate an already refreshed "current" snapshot
//! - Re-link byte-identical files across snapshot trees
//! - Inspect the effective cycle table
//!
//! ## Usage
//! ```bash
//! # Mirror, stamp and rotate (run from cron every 20 minutes)
//! hardsnap snapshot --root /backup/web1 --source backup@web1:/srv
//!
//! # Rotate only
//! hardsnap rotate --root /backup/web1
//!
//! # See how much space reconciling two generations would reclaim
//! hardsnap reconcile --dry-run --scope different-top /backup/web1
//!
//! # Reconcile paths streamed from another tool
//! find /backup -maxdepth 1 -name 'day_*' | hardsnap reconcile -
//! ```

use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use hardsnap::utils::format_bytes;
use hardsnap::{
    install_signal_cleanup, CycleDecision, CycleTable, HardsnapError, PermissionMerge, ReconcileOptions,
    ReconcileProgress, ReconcileReport, Reconciler, Result, RollReason, RotationEngine, RotationEngineBuilder,
    RotationReport, RsyncMirror, ScopePolicy, SnapshotRecord, DEFAULT_SIZE_FLOOR,
};
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::cell::RefCell;
use std::ffi::OsString;
use std::io::{self, BufRead};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// hardsnap CLI - hardlinked snapshot rotation and duplicate reconciliation
#[derive(Parser)]
#[command(name = "hardsnap")]
#[command(author = "Mufeed VH <mufeed@asterisk.so>")]
#[command(version)]
#[command(about = "Rotate hardlinked backup snapshots and re-link duplicate files")]
#[command(long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that rotate a backup root
#[derive(clap::Args)]
struct RootArgs {
    /// Backup root holding "current" and the generations
    #[arg(short, long)]
    root: PathBuf,

    /// JSON cycle table (defaults to hour/day/week/month)
    #[arg(long)]
    cycles: Option<PathBuf>,

    /// Name of the current snapshot directory
    #[arg(long, default_value = "current")]
    current: String,

    /// Reconcile "current" with the newest generation before rotating
    #[arg(long)]
    reconcile: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh snapshot record into a directory
    Stamp {
        /// Snapshot root to stamp
        dir: PathBuf,

        /// Creation time in epoch seconds (defaults to now)
        #[arg(long)]
        epoch: Option<i64>,
    },

    /// Rotate the cycles of a backup root
    Rotate {
        #[command(flatten)]
        root: RootArgs,
    },

    /// Mirror the source into "current", stamp it and rotate
    Snapshot {
        #[command(flatten)]
        root: RootArgs,

        /// rsync source, e.g. user@host:/path
        #[arg(short, long)]
        source: String,

        /// Remote shell for rsync ("none" for local sources)
        #[arg(long, default_value = "ssh")]
        rsh: String,

        /// rsync binary
        #[arg(long, default_value = "rsync")]
        rsync: PathBuf,

        /// Extra rsync exclude patterns
        #[arg(long)]
        exclude: Vec<String>,
    },

    /// Re-link byte-identical files under the given paths
    Reconcile {
        /// Report only, change nothing
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Ignore files smaller than this many bytes
        #[arg(long, default_value_t = DEFAULT_SIZE_FLOOR)]
        size_floor: u64,

        /// Which files may be merged with each other
        #[arg(long, value_enum, default_value = "any")]
        scope: ScopeArg,

        /// How merged files get their permission bits
        #[arg(long, value_enum, default_value = "newer-wins")]
        permission_merge: PermissionArg,

        /// Show a progress spinner
        #[arg(long, value_enum, default_value = "off")]
        progress_report: Switch,

        /// List every merge
        #[arg(long, value_enum, default_value = "on")]
        action_report: Switch,

        /// Glob patterns to skip
        #[arg(long)]
        exclude: Vec<String>,

        /// Files or directories; none or "-" reads paths from stdin
        paths: Vec<PathBuf>,
    },

    /// Print the effective cycle table
    Cycles {
        /// JSON cycle table (defaults to hour/day/week/month)
        #[arg(long)]
        cycles: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ScopeArg {
    Any,
    SameTop,
    DifferentTop,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PermissionArg {
    NewerWins,
    Union,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so that --json output stays parseable
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(e.exit_code());
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Stamp { dir, epoch } => cmd_stamp(&dir, epoch, json),
        Commands::Rotate { root } => cmd_rotate(root, json),
        Commands::Snapshot {
            root,
            source,
            rsh,
            rsync,
            exclude,
        } => cmd_snapshot(root, source, rsh, rsync, exclude, json),
        Commands::Reconcile {
            dry_run,
            size_floor,
            scope,
            permission_merge,
            progress_report,
            action_report,
            exclude,
            paths,
        } => {
            let options = ReconcileOptions {
                dry_run,
                size_floor,
                scope: match scope {
                    ScopeArg::Any => ScopePolicy::Any,
                    ScopeArg::SameTop => ScopePolicy::SameTop,
                    ScopeArg::DifferentTop => ScopePolicy::DifferentTop,
                },
                permission_merge: match permission_merge {
                    PermissionArg::NewerWins => PermissionMerge::NewerWins,
                    PermissionArg::Union => PermissionMerge::Union,
                },
                excludes: exclude,
            };
            cmd_reconcile(
                options,
                paths,
                progress_report == Switch::On,
                action_report == Switch::On,
                json,
            )
        }
        Commands::Cycles { cycles } => cmd_cycles(cycles.as_deref(), json),
    }
}

fn load_cycles(path: Option<&Path>) -> Result<CycleTable> {
    match path {
        Some(path) => CycleTable::load(path),
        None => Ok(CycleTable::reference()),
    }
}

fn build_engine(args: &RootArgs) -> Result<RotationEngine> {
    let mut builder = RotationEngineBuilder::new()
        .cycles(load_cycles(args.cycles.as_deref())?)
        .current_dir(args.current.clone());
    if args.reconcile {
        builder = builder.reconcile_before_rotate(ReconcileOptions::default());
    }
    let engine = builder.build(&args.root)?;
    install_signal_cleanup(&engine.runtime_handle(), engine.cleanup_registry());
    Ok(engine)
}

/// Write a snapshot record
fn cmd_stamp(dir: &Path, epoch: Option<i64>, json: bool) -> Result<()> {
    if !dir.is_dir() {
        return Err(HardsnapError::usage(format!("{} is not a directory", dir.display())));
    }
    let record = match epoch {
        Some(epoch) => SnapshotRecord::from_epoch(epoch)?,
        None => SnapshotRecord::now(),
    };
    record.write(dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("{} Stamped {} as {}", "✓".green().bold(), dir.display(), record.label.cyan());
    }
    Ok(())
}

/// Rotate an already refreshed backup root
fn cmd_rotate(args: RootArgs, json: bool) -> Result<()> {
    let mut engine = build_engine(&args)?;
    let report = engine.rotate()?;
    finish_rotation(&mut engine, &report, json)
}

/// Mirror, stamp and rotate
fn cmd_snapshot(
    args: RootArgs,
    source: String,
    rsh: String,
    rsync: PathBuf,
    exclude: Vec<String>,
    json: bool,
) -> Result<()> {
    let mut engine = build_engine(&args)?;

    let shell = if rsh == "none" { None } else { Some(rsh) };
    let mirror = exclude
        .into_iter()
        .fold(RsyncMirror::new(source).program(rsync).remote_shell(shell), |m, pattern| {
            m.exclude(pattern)
        });

    let report = engine.snapshot(&mirror, Local::now())?;
    finish_rotation(&mut engine, &report, json)
}

fn finish_rotation(engine: &mut RotationEngine, report: &RotationReport, json: bool) -> Result<()> {
    let drained = engine.wait_for_deletions();

    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{} {}", "Rotated snapshot".blue().bold(), report.current_label.yellow());
    for outcome in &report.cycles {
        let decision = match &outcome.decision {
            CycleDecision::Rolled { reason } => match reason {
                RollReason::Preference { value } => format!("rolled (preferred value {})", value).green(),
                RollReason::Forced { age } => format!("rolled (age {:.1})", age).green(),
                RollReason::NoGeneration => "rolled (first generation)".green(),
                RollReason::UnreadableRecord => "rolled (unreadable record)".yellow(),
            },
            CycleDecision::Kept { age } => format!("kept (age {:.1})", age).normal(),
            CycleDecision::Skipped => "skipped".dimmed(),
        };
        println!("  {:<8} {}", outcome.cycle.cyan(), decision);
    }

    if let Some(reconcile) = &report.reconcile {
        println!(
            "  Reconciled: {} merges, {} reclaimed",
            reconcile.merges.to_string().cyan(),
            format_bytes(reconcile.bytes_reclaimed).cyan()
        );
    }
    if !report.swept.is_empty() {
        println!("  Swept: {} directories left by interrupted runs", report.swept.len().to_string().cyan());
    }
    if drained.completed + drained.failed > 0 {
        println!("  Deleted: {} directories", drained.completed.to_string().cyan());
    }
    if drained.failed > 0 {
        println!("  {} {} deletions failed", "!".yellow().bold(), drained.failed);
    }
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
    );

    print_anomalies(&report.anomalies);
    Ok(())
}

/// Reconcile duplicate files
fn cmd_reconcile(
    options: ReconcileOptions,
    paths: Vec<PathBuf>,
    show_progress: bool,
    show_actions: bool,
    json: bool,
) -> Result<()> {
    let reconciler = Reconciler::new(options)?;

    let progress = if show_progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .map_err(|e| HardsnapError::internal(e.to_string()))?,
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    } else {
        None
    };
    let callback = progress.clone().map(|pb| {
        move |p: ReconcileProgress| {
            pb.set_message(format!(
                "{} files, {} merges, {} reclaimed",
                p.files_visited,
                p.merges,
                format_bytes(p.bytes_reclaimed)
            ))
        }
    });

    let from_stdin = paths.is_empty() || (paths.len() == 1 && paths[0] == Path::new("-"));
    let result = if from_stdin {
        let read_error = RefCell::new(None);
        let result = reconciler.run_with_progress(stdin_paths(io::stdin().lock(), &read_error), callback);
        match read_error.into_inner() {
            Some(e) => Err(HardsnapError::Io(e)),
            None => result,
        }
    } else {
        reconciler.run_with_progress(paths, callback)
    };

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let report = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_reconcile_report(&report, show_actions);
    }
    Ok(())
}

fn print_reconcile_report(report: &ReconcileReport, show_actions: bool) {
    if show_actions && !report.actions.is_empty() {
        let verb = if report.dry_run { "would link" } else { "linked" };
        for action in &report.actions {
            for path in &action.relinked {
                println!("{} {} -> {}", verb.green(), path.display(), action.kept.display());
            }
        }
        println!();
    }

    let title = if report.dry_run {
        "Reconciliation (dry run)"
    } else {
        "Reconciliation"
    };
    println!("{}", title.blue().bold());
    println!("  Files visited: {}", report.files_visited.to_string().cyan());
    println!("  Below size floor: {}", report.files_below_floor);
    println!("  Excluded: {}", report.files_excluded);
    println!("  Already linked: {}", report.already_linked);
    println!("  Comparisons: {}", report.comparisons);
    println!("  Merges: {}", report.merges.to_string().cyan());
    println!("  Links created: {}", report.links_created.to_string().cyan());
    println!(
        "  {}: {}",
        if report.dry_run { "Would reclaim" } else { "Reclaimed" },
        format_bytes(report.bytes_reclaimed).green().bold()
    );
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
    );
    print_anomalies(&report.anomalies);
}

/// Print the cycle table
fn cmd_cycles(path: Option<&Path>, json: bool) -> Result<()> {
    let table = load_cycles(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    println!("{}", "Cycles (evaluated in order):".blue().bold());
    for cycle in &table {
        let preference = cycle
            .preference
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "  {:<8} keep {:>3}  {:<14} prefer {:<4} on {:?}, force after {} {:?}{}",
            cycle.name.cyan(),
            cycle.max_generations,
            cycle.dir_template.as_str(),
            preference,
            cycle.calendar_field,
            cycle.forced_interval,
            cycle.interval_unit,
            if cycle.gates_following { "  (gates following)".yellow().to_string() } else { String::new() }
        );
    }
    Ok(())
}

/// Newline-separated paths read from `reader`, as raw bytes
///
/// Blank lines are skipped. A read error ends the stream and is left in
/// `read_error` for the caller to report.
fn stdin_paths<'a, R: BufRead + 'a>(
    reader: R,
    read_error: &'a RefCell<Option<io::Error>>,
) -> impl Iterator<Item = PathBuf> + 'a {
    reader
        .split(b'\n')
        .map_while(move |line| match line {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                *read_error.borrow_mut() = Some(e);
                None
            }
        })
        .filter(|bytes| !bytes.iter().all(u8::is_ascii_whitespace))
        .map(|bytes| PathBuf::from(OsString::from_vec(bytes)))
}

fn print_anomalies(anomalies: &[String]) {
    if anomalies.is_empty() {
        return;
    }
    println!("\n{}", "Anomalies:".yellow().bold());
    for anomaly in anomalies {
        println!("  - {}", anomaly.yellow());
    }
}
