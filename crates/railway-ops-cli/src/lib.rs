//! `railops` command surface for the railway-reservation document store.
//!
//! Host automation should embed behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for direct command execution against an open store.
//!
//! Each invocation opens the store once at process start and drops it at
//! process end; there is no shared module-level client.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use railway_ops_core::{collections, AlertRepair};
use railway_ops_store_sqlite::{ProvisionReport, SqliteDocumentStore};

/// Environment variable naming the database path, read when `--db` is
/// not given (the setup scripts configured the store the same way).
pub const DB_ENV_VAR: &str = "RAILWAY_OPS_DB";

const DEFAULT_DB_PATH: &str = "./railway_reservation.sqlite3";

#[derive(Debug, Parser)]
#[command(name = "railops")]
#[command(about = "Railway reservation operations CLI")]
pub struct Cli {
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install indexes and validation rules for the five core collections.
    Setup,
    /// Repair alerts whose train_number holds a legacy record handle.
    Reconcile(ReconcileArgs),
    /// Print sample alert and train documents.
    Inspect,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Emit the full report as JSON instead of per-record lines.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, serde::Serialize)]
struct SetupReport {
    indexes: ProvisionReport,
    validators: ProvisionReport,
}

/// Resolves the database path: `--db` flag first, then [`DB_ENV_VAR`],
/// then a local default.
#[must_use]
pub fn database_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(DB_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the store cannot be reached or the requested
/// command fails; provisioning conflicts surface here with guidance.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteDocumentStore::open(&database_path(cli.db))?;
    store.migrate()?;
    run_command(cli.command, &store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when provisioning, scanning, or reporting fails.
pub fn run_command(command: Command, store: &SqliteDocumentStore) -> Result<()> {
    match command {
        Command::Setup => run_setup(store),
        Command::Reconcile(args) => run_reconcile(&args, store),
        Command::Inspect => run_inspect(store),
    }
}

fn run_setup(store: &SqliteDocumentStore) -> Result<()> {
    let report = SetupReport {
        indexes: store.create_indexes()?,
        validators: store.create_validators()?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_reconcile(args: &ReconcileArgs, store: &SqliteDocumentStore) -> Result<()> {
    let report = store.reconcile_alerts()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for record in &report.records {
        let id = record.alert_id;
        match &record.repair {
            AlertRepair::Updated {
                previous,
                train_number,
                train_name,
            } => println!("updated alert {id}: {previous} -> {train_number} - {train_name}"),
            AlertRepair::TrainMissing { handle } => {
                println!("train not found for alert {id}: {handle}");
            }
            AlertRepair::AlreadyCanonical => {
                println!("alert {id} already has a canonical train_number");
            }
            AlertRepair::NeedsReview { value } => {
                println!("alert {id} needs manual review: {value:?}");
            }
            AlertRepair::Failed { message } => println!("error updating alert {id}: {message}"),
        }
    }

    println!(
        "scanned {} alerts: {} updated, {} missing, {} compliant, {} flagged, {} failed",
        report.scanned,
        report.updated,
        report.missing,
        report.compliant,
        report.flagged,
        report.failed
    );
    Ok(())
}

fn run_inspect(store: &SqliteDocumentStore) -> Result<()> {
    let alerts = store.find_limit(collections::ALERTS, 1)?;
    match alerts.first() {
        Some(alert) => {
            println!("alert {}:", alert.id);
            println!("{}", serde_json::to_string_pretty(&alert.body)?);
        }
        None => println!("no alerts found"),
    }

    let trains = store.find_limit(collections::TRAINS, 2)?;
    for train in &trains {
        println!("train {}:", train.id);
        println!("{}", serde_json::to_string_pretty(&train.body)?);
    }
    if trains.is_empty() {
        println!("no trains found");
    }

    Ok(())
}
