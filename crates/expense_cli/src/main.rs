//! Operator CLI for the expense lifecycle engine.
//!
//! # Responsibility
//! - Run retention sweeps and report soft-delete statistics from cron or a shell.
//! - Print a record's audit trail, including for purged records.
//!
//! # Invariants
//! - Machine-readable output goes to stdout as JSON; diagnostics go to stderr.
//! - Exit code is non-zero when any step fails or a sweep is interrupted.

use clap::{Args, Parser, Subcommand};
use expense_core::db::open_db_with_timeout;
use expense_core::{
    core_version, init_logging, AuditRepository, Clock, EngineConfig, RetentionSweeper,
    SqliteAuditRepository, SqliteRecordRepository, SystemClock,
};
use log::info;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "expense")]
#[command(about = "Expense record lifecycle maintenance")]
struct Cli {
    /// Log level override (`trace|debug|info|warn|error`).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory for rolling log files; logging stays off when unset.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Purge records soft-deleted longer than the retention window.
    Sweep(SweepArgs),
    /// Report soft-delete counts by age.
    Stats(StoreArgs),
    /// Print the audit trail of one record as JSON lines.
    Trail(TrailArgs),
    Version,
}

#[derive(Debug, Args)]
struct StoreArgs {
    #[arg(long)]
    db: PathBuf,

    /// JSON engine config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SweepArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Overrides `retention.retention_days` from the config.
    #[arg(long)]
    retention_days: Option<u32>,
}

#[derive(Debug, Args)]
struct TrailArgs {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(long)]
    record: Uuid,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, String> {
    match cli.command {
        Command::Version => {
            println!("expense_core version={}", core_version());
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep(args) => {
            let mut config = load_config(&args.store, &cli.log_level, &cli.log_dir)?;
            if let Some(days) = args.retention_days {
                config.retention.retention_days = days;
                config.validate().map_err(|err| err.to_string())?;
            }
            let conn = open_store(&args.store.db, &config)?;
            let records = SqliteRecordRepository::try_new(&conn).map_err(|err| err.to_string())?;
            let sweeper = RetentionSweeper::new(records, system_clock(), config.retention);

            let report = sweeper.run_retention_sweep().map_err(|err| err.to_string())?;
            print_json(&report)?;
            if report.interrupted {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats(args) => {
            let config = load_config(&args, &cli.log_level, &cli.log_dir)?;
            let conn = open_store(&args.db, &config)?;
            let records = SqliteRecordRepository::try_new(&conn).map_err(|err| err.to_string())?;
            let clock = system_clock();
            let sweeper = RetentionSweeper::new(records, clock.clone(), config.retention);

            let stats = sweeper
                .retention_stats(clock.now_ms())
                .map_err(|err| err.to_string())?;
            print_json(&stats)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Trail(args) => {
            let config = load_config(&args.store, &cli.log_level, &cli.log_dir)?;
            let conn = open_store(&args.store.db, &config)?;
            let audit = SqliteAuditRepository::try_new(&conn).map_err(|err| err.to_string())?;

            let events = audit
                .list_events_for_record(args.record)
                .map_err(|err| err.to_string())?;
            for event in &events {
                print_json(event)?;
            }
            info!(
                "event=audit_trail module=cli status=ok record_id={} events={}",
                args.record,
                events.len()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Loads config, applies CLI logging overrides and starts logging when a
/// directory is known.
fn load_config(
    args: &StoreArgs,
    log_level: &Option<String>,
    log_dir: &Option<PathBuf>,
) -> Result<EngineConfig, String> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|err| err.to_string())?,
        None => EngineConfig::default(),
    };
    if let Some(level) = log_level {
        config.logging.level = level.clone();
    }
    if let Some(dir) = log_dir {
        let absolute = std::path::absolute(dir)
            .map_err(|err| format!("invalid log directory `{}`: {err}", dir.display()))?;
        config.logging.log_dir = Some(absolute.display().to_string());
    }
    if config.logging.log_dir.is_some() {
        init_logging(&config.logging)?;
    }
    Ok(config)
}

fn open_store(path: &Path, config: &EngineConfig) -> Result<Connection, String> {
    open_db_with_timeout(path, Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| format!("failed to open `{}`: {err}", path.display()))
}

fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let line = serde_json::to_string(value).map_err(|err| err.to_string())?;
    println!("{line}");
    Ok(())
}
