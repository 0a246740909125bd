// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Job runner binary: loads the daily trade files for one date (or a date
//! range) across the requested exchanges, with idempotent resume and
//! cooperative shutdown.

mod logging;

use std::process;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use clap::Parser;
use core_types::config::AppConfig;
use core_types::shutdown::{ShutdownCoordinator, ShutdownFlag};
use core_types::types::Exchange;
use ingestion_service::JobRunner;
use lakehouse::{LakeStore, DEFAULT_BATCH_SIZE};
use ledger::{ProgressLedger, RemoteLedger};
use log::{error, info, warn};
use metrics::IngestMetrics;
use tokio::net::TcpListener;
use trth_source::TrthSource;

const METRICS_ADDR: &str = "127.0.0.1:9090";

#[derive(Debug, Parser)]
#[command(
    name = "load-exchange-data",
    about = "Load daily multi-exchange market data into the analytical store",
    after_help = "\
Examples:
  load-exchange-data --date 2025-01-15                     Load one date
  load-exchange-data --date 2025-01-15 --idempotent        Resume/skip existing data
  load-exchange-data --date 2025-01-15 --exchanges LSE CME Restrict exchanges

Parallel dates run as independent processes with disjoint store files:
  DUCKDB_DATABASE_PATH=./lake_0101.duckdb load-exchange-data --date 2025-01-01 --idempotent &
  DUCKDB_DATABASE_PATH=./lake_0102.duckdb load-exchange-data --date 2025-01-02 --idempotent &"
)]
struct Cli {
    /// Date to process (YYYY-MM-DD)
    #[arg(long)]
    date: Option<NaiveDate>,

    /// First date of a range to process (inclusive)
    #[arg(long, requires = "end_date", conflicts_with = "date")]
    start_date: Option<NaiveDate>,

    /// Last date of a range to process (inclusive)
    #[arg(long, requires = "start_date")]
    end_date: Option<NaiveDate>,

    /// Specific exchanges to process (default: LSE CME NYQ)
    #[arg(long, num_args = 1..)]
    exchanges: Vec<Exchange>,

    /// Skip already loaded data and retry failed attempts instead of
    /// conflicting (allows resuming interrupted loads)
    #[arg(long, visible_alias = "resume")]
    idempotent: bool,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Override the analytical store file
    #[arg(long)]
    database_path: Option<String>,

    /// Create the shutdown flag and exit
    #[arg(long)]
    create_shutdown_file: bool,

    /// Remove the shutdown flag and exit
    #[arg(long)]
    remove_shutdown_file: bool,

    /// Exit 0 if the shutdown flag is absent, 1 if present
    #[arg(long)]
    check_shutdown_file: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let flag = ShutdownFlag::at_default_path();

    // Flag utilities run without the logging stack; external schedulers
    // parse their plain output and exit codes.
    if cli.create_shutdown_file {
        if let Err(err) = flag.create() {
            eprintln!("failed to create shutdown file: {err}");
            process::exit(1);
        }
        println!("Shutdown file created: {}", flag.path().display());
        process::exit(0);
    }
    if cli.remove_shutdown_file {
        match flag.remove() {
            Ok(true) => println!("Shutdown file removed: {}", flag.path().display()),
            Ok(false) => println!("No shutdown file found"),
            Err(err) => {
                eprintln!("failed to remove shutdown file: {err}");
                process::exit(1);
            }
        }
        process::exit(0);
    }
    if cli.check_shutdown_file {
        process::exit(if flag.exists() { 1 } else { 0 });
    }

    let log_path = match logging::init(cli.verbose) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("failed to initialise logging: {err}");
            process::exit(1);
        }
    };
    info!("logging to {}", log_path.display());

    let code = run(cli, flag).await;
    process::exit(code);
}

async fn run(cli: Cli, flag: ShutdownFlag) -> i32 {
    let Some(dates) = requested_dates(&cli) else {
        error!("--date (or --start-date/--end-date) is required");
        return 2;
    };
    let exchanges: Vec<Exchange> = if cli.exchanges.is_empty() {
        Exchange::ALL.to_vec()
    } else {
        cli.exchanges.clone()
    };

    let mut config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return 2;
        }
    };
    if let Some(path) = &cli.database_path {
        config.lake.database_path = path.clone();
    }

    if cli.idempotent {
        info!("Running in IDEMPOTENT mode - completed dates are skipped, failed ones retried");
    }
    if flag.exists() {
        warn!(
            "shutdown flag {} is present; this run will stop immediately. \
             Remove it with --remove-shutdown-file to proceed.",
            flag.path().display()
        );
    }
    info!("To stop gracefully: load-exchange-data --create-shutdown-file");

    let store = match LakeStore::open(&config.lake).and_then(|store| {
        store.init()?;
        Ok(store)
    }) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(err) => {
            error!("failed to open analytical store: {err}");
            return 2;
        }
    };

    let remote = Arc::new(RemoteLedger::connect(config.remote.as_ref()).await);
    let ledger = Arc::new(ProgressLedger::new(
        Arc::clone(&store),
        remote,
        config.ledger.staleness_hours,
    ));
    let source = Arc::new(TrthSource::new(&config.object_store));
    let metrics = Arc::new(IngestMetrics::new());

    // Prometheus exposition for this process; the JSON dashboard is its own
    // binary.
    match TcpListener::bind(METRICS_ADDR).await {
        Ok(listener) => {
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                if let Err(err) = metrics.serve(listener).await {
                    warn!("metrics server stopped: {err}");
                }
            });
        }
        Err(err) => warn!("metrics port unavailable ({METRICS_ADDR}): {err}"),
    }

    let coordinator = ShutdownCoordinator::new(flag.clone());
    let token = coordinator.token();
    coordinator.spawn_watchers();

    let runner = JobRunner::new(source, Arc::clone(&ledger), metrics, token.clone(), DEFAULT_BATCH_SIZE);
    info!(
        "Loading data for {} date(s) for exchanges: {}",
        dates.len(),
        exchanges.iter().map(|e| e.code()).collect::<Vec<_>>().join(", ")
    );

    let summary = runner.run_dates(&dates, &exchanges, cli.idempotent).await;
    runner.print_summary(&summary);
    if summary.interrupted {
        info!(
            "To resume: load-exchange-data --date {} --idempotent (after --remove-shutdown-file)",
            dates[0]
        );
    } else {
        runner.print_statistics();
    }

    if summary.is_success() {
        0
    } else {
        1
    }
}

fn requested_dates(cli: &Cli) -> Option<Vec<NaiveDate>> {
    if let Some(date) = cli.date {
        return Some(vec![date]);
    }
    let (start, end) = (cli.start_date?, cli.end_date?);
    if end < start {
        return None;
    }
    let mut dates = Vec::new();
    let mut day = start;
    while day <= end {
        dates.push(day);
        day = day.succ_opt()?;
    }
    Some(dates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_the_operator_surface() {
        let cli = Cli::parse_from([
            "load-exchange-data",
            "--date",
            "2025-01-15",
            "--exchanges",
            "LSE",
            "CME",
            "--idempotent",
            "-v",
        ]);
        assert_eq!(cli.date, NaiveDate::from_ymd_opt(2025, 1, 15));
        assert_eq!(cli.exchanges, vec![Exchange::Lse, Exchange::Cme]);
        assert!(cli.idempotent);
        assert!(cli.verbose);
    }

    #[test]
    fn resume_is_an_alias_for_idempotent() {
        let cli = Cli::parse_from(["load-exchange-data", "--date", "2025-01-15", "--resume"]);
        assert!(cli.idempotent);
    }

    #[test]
    fn date_range_expands_inclusively() {
        let cli = Cli::parse_from([
            "load-exchange-data",
            "--start-date",
            "2025-01-14",
            "--end-date",
            "2025-01-16",
        ]);
        let dates = requested_dates(&cli).unwrap();
        assert_eq!(dates.len(), 3);
        assert_eq!(dates[0], NaiveDate::from_ymd_opt(2025, 1, 14).unwrap());
        assert_eq!(dates[2], NaiveDate::from_ymd_opt(2025, 1, 16).unwrap());
    }

    #[test]
    fn missing_date_yields_no_plan() {
        let cli = Cli::parse_from(["load-exchange-data"]);
        assert!(requested_dates(&cli).is_none());
    }
}
