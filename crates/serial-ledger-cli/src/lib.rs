//! Operator command surface for the serial ledger.
//!
//! `check` and `extract` are pure and never touch the database. Every other
//! command opens the configured store and applies pending migrations first.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serial_ledger_core::{
    extract_serial_candidate, normalize_serial, sanitize_serial_input, validate_serial_number,
    NewQuery, SerialNumber,
};
use serial_ledger_store_sqlite::SqliteQueryStore;
use tracing::debug;

const CLI_CLIENT_IDENTITY: &str = "127.0.0.1";

#[derive(Debug, Parser)]
#[command(name = "sl")]
#[command(about = "Serial ledger operator CLI")]
pub struct Cli {
    #[arg(long, env = "SERIAL_LEDGER_DB_PATH", default_value = "./serial_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a serial and look it up in the winner list.
    Check(CheckArgs),
    /// Pull a serial candidate out of recognized text.
    Extract(ExtractArgs),
    /// Record a lookup and print the disclosure it produced.
    Log(LogArgs),
    /// Show earlier lookups of a serial.
    History(HistoryArgs),
    /// Print aggregate lookup statistics.
    Stats,
    /// Create or upgrade the database schema.
    Migrate,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    serial: String,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    text: String,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    serial: String,
    #[arg(long)]
    winner: bool,
    #[arg(long, default_value = CLI_CLIENT_IDENTITY)]
    client: String,
    #[arg(long, default_value = "")]
    user_agent: String,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    serial: String,
    #[arg(long, default_value = CLI_CLIENT_IDENTITY)]
    client: String,
    #[arg(long, default_value = "")]
    user_agent: String,
    /// Print every stored event instead of the disclosure summary.
    #[arg(long, conflicts_with = "earliest")]
    events: bool,
    /// Print only the earliest stored lookup.
    #[arg(long)]
    earliest: bool,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    input: String,
    serial_number: String,
    valid: bool,
    is_winner: bool,
}

#[derive(Debug, Serialize)]
struct MigrateReport {
    schema_version: Option<i64>,
}

/// Executes a parsed command line.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, a serial is
/// malformed, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        command @ (Command::Check(_) | Command::Extract(_)) => run_offline(command),
        command => {
            let mut store = SqliteQueryStore::open(&cli.db)?;
            store.migrate()?;
            run_command(command, &mut store)
        }
    }
}

/// Executes a store-backed command against an open store.
///
/// # Errors
/// Returns an error when a serial is malformed or a store operation fails.
pub fn run_command(command: Command, store: &mut SqliteQueryStore) -> Result<()> {
    match command {
        command @ (Command::Check(_) | Command::Extract(_)) => run_offline(command),
        Command::Log(args) => {
            let query = NewQuery {
                serial_number: parse_serial(&args.serial)?,
                is_winner: args.winner,
                client_identity: args.client,
                user_agent: args.user_agent,
            };
            let recorded = store.record_query(&query)?;
            debug!(event_id = recorded.event_id, "logged query from cli");
            print_json(&recorded)
        }
        Command::History(args) => {
            let serial = parse_serial(&args.serial)?;
            if args.events {
                print_json(&store.list_events(&serial)?)
            } else if args.earliest {
                print_json(&store.single_earliest_previous(&serial)?)
            } else {
                print_json(&store.previous_query_info(&serial, &args.client, &args.user_agent)?)
            }
        }
        Command::Stats => print_json(&store.stats()?),
        Command::Migrate => {
            store.migrate()?;
            print_json(&MigrateReport {
                schema_version: store.schema_version()?,
            })
        }
    }
}

fn run_offline(command: Command) -> Result<()> {
    match command {
        Command::Check(args) => print_json(&check(&args.serial)),
        Command::Extract(args) => {
            let candidate = extract_serial_candidate(&args.text)
                .ok_or_else(|| anyhow!("no serial number candidate found"))?;
            println!("{candidate}");
            Ok(())
        }
        other => Err(anyhow!("command {other:?} needs a database")),
    }
}

fn check(raw: &str) -> CheckReport {
    let serial_number = normalize_serial(&sanitize_serial_input(raw));
    let valid = validate_serial_number(&serial_number);
    let is_winner = SerialNumber::parse(&serial_number).is_ok_and(|serial| serial.is_winner());
    CheckReport {
        input: raw.to_string(),
        serial_number,
        valid,
        is_winner,
    }
}

fn parse_serial(raw: &str) -> Result<SerialNumber> {
    SerialNumber::parse(raw).with_context(|| format!("invalid serial number {raw:?}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
