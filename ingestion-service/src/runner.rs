// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use core_types::shutdown::ShutdownToken;
use core_types::types::{Exchange, LoadStatus, WorkerResult};
use ledger::{stats, ProgressLedger};
use log::{info, warn};
use metrics::IngestMetrics;
use trth_source::SourceTrait;

use crate::worker::IngestionWorker;

const SUMMARY_ROWS: usize = 30;

/// Outcome of one invocation across its exchanges and dates.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<WorkerResult>,
    pub interrupted: bool,
}

impl RunSummary {
    /// Exit code 0 iff every exchange ended `completed` or `skipped`.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(WorkerResult::is_success)
    }

    fn count(&self, status: LoadStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn total_records(&self) -> u64 {
        self.results.iter().map(|r| r.records_loaded).sum()
    }
}

/// Dispatches one worker per exchange in the deterministic order for each
/// requested date. Workers run sequentially; the analytical store is a
/// single-writer handle. Parallelism across dates is a matter of running
/// multiple processes with disjoint store files.
pub struct JobRunner {
    worker: IngestionWorker,
    ledger: Arc<ProgressLedger>,
    token: ShutdownToken,
}

impl JobRunner {
    pub fn new(
        source: Arc<dyn SourceTrait>,
        ledger: Arc<ProgressLedger>,
        metrics: Arc<IngestMetrics>,
        token: ShutdownToken,
        batch_size: usize,
    ) -> Self {
        Self {
            worker: IngestionWorker::new(source, Arc::clone(&ledger), metrics, batch_size),
            ledger,
            token,
        }
    }

    pub async fn run_dates(
        &self,
        dates: &[NaiveDate],
        exchanges: &[Exchange],
        idempotent: bool,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        for date in dates {
            let mut day = self.run_date(*date, exchanges, idempotent).await;
            summary.interrupted |= day.interrupted;
            summary.results.append(&mut day.results);
        }
        summary
    }

    pub async fn run_date(
        &self,
        data_date: NaiveDate,
        exchanges: &[Exchange],
        idempotent: bool,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        info!("{}", "=".repeat(60));
        info!("Processing date: {data_date}");
        info!(
            "Exchanges to process: {} ({} total)",
            exchanges
                .iter()
                .map(|e| e.code())
                .collect::<Vec<_>>()
                .join(", "),
            exchanges.len()
        );
        info!("{}", "=".repeat(60));

        for (index, exchange) in exchanges.iter().enumerate() {
            info!(
                "Processing {exchange} for {data_date} ({}/{})",
                index + 1,
                exchanges.len()
            );
            if self.token.is_cancelled() && !summary.interrupted {
                info!("Shutdown requested; remaining exchanges will be skipped");
                summary.interrupted = true;
            }

            let begun = Instant::now();
            let result = self
                .worker
                .run(*exchange, data_date, idempotent, &self.token)
                .await;
            let elapsed = begun.elapsed().as_secs_f64();

            match result.status {
                LoadStatus::Completed => info!(
                    "{exchange} completed in {elapsed:.1}s - {} new records loaded",
                    group_digits(result.records_loaded as i64)
                ),
                LoadStatus::Skipped => info!(
                    "{exchange} finished in {elapsed:.1}s - skipped ({})",
                    result.message.as_deref().unwrap_or("")
                ),
                LoadStatus::Failed => warn!(
                    "{exchange} failed after {elapsed:.1}s - {}",
                    result.message.as_deref().unwrap_or("unknown error")
                ),
                LoadStatus::Started => {}
            }
            summary.results.push(result);

            info!(
                "Running totals: {} records, {} successful, {} failed, {} skipped",
                group_digits(summary.total_records() as i64),
                summary.count(LoadStatus::Completed),
                summary.count(LoadStatus::Failed),
                summary.count(LoadStatus::Skipped)
            );

            if self.token.is_cancelled() {
                summary.interrupted = true;
            }
        }
        summary
    }

    /// Print the aggregate blocks the operator reads after a run, straight
    /// from the ledger's gold tables.
    pub fn print_statistics(&self) {
        let store = self.ledger.store();
        let store = store.lock().unwrap();

        match stats::daily_rows(&store, SUMMARY_ROWS) {
            Ok(rows) if !rows.is_empty() => {
                info!("{}", "=".repeat(80));
                info!("DAILY STATISTICS SUMMARY");
                info!("{}", "=".repeat(80));
                for row in rows {
                    info!("{} - {}:", row.exchange, row.stats_date);
                    info!(
                        "  Files: {} total, {} successful, {} failed",
                        row.total_files, row.successful_files, row.failed_files
                    );
                    info!(
                        "  Records: {} total, {} avg per file",
                        group_digits(row.total_records),
                        group_digits(row.avg_records_per_file.round() as i64)
                    );
                    info!(
                        "  Performance: {:.2}s total, {} bytes loaded",
                        row.total_processing_time_seconds,
                        group_digits(row.total_file_size_bytes)
                    );
                }
            }
            Ok(_) => {}
            Err(err) => warn!("failed to read daily statistics: {err}"),
        }

        match stats::weekly_rows(&store, SUMMARY_ROWS) {
            Ok(rows) if !rows.is_empty() => {
                info!("{}", "=".repeat(80));
                info!("WEEKLY ROLLING STATISTICS");
                info!("{}", "=".repeat(80));
                for row in rows {
                    info!("{} - Week ending {}:", row.exchange, row.week_ending);
                    info!(
                        "  Daily averages: {:.1} files, {} records",
                        row.avg_daily_files,
                        group_digits(row.avg_daily_records.round() as i64)
                    );
                    info!(
                        "  Weekly totals: {} files, {} records",
                        row.total_files,
                        group_digits(row.total_records)
                    );
                    info!(
                        "  Avg processing time: {:.2}s",
                        row.avg_processing_time_seconds
                    );
                }
            }
            Ok(_) => {}
            Err(err) => warn!("failed to read weekly statistics: {err}"),
        }
    }

    /// One terminal line per `(exchange, date)` plus the overall counts.
    pub fn print_summary(&self, summary: &RunSummary) {
        info!("{}", "=".repeat(60));
        info!("DETAILED RESULTS");
        info!("{}", "=".repeat(60));
        for result in &summary.results {
            match result.status {
                LoadStatus::Completed => {
                    let rate = if result.duration.as_secs_f64() > 0.0 {
                        result.records_loaded as f64 / result.duration.as_secs_f64()
                    } else {
                        0.0
                    };
                    info!(
                        "{} {}: {} records loaded in {:.2}s ({:.0} records/sec)",
                        result.exchange,
                        result.data_date,
                        group_digits(result.records_loaded as i64),
                        result.duration.as_secs_f64(),
                        rate
                    );
                }
                LoadStatus::Skipped => info!(
                    "{} {}: skipped ({})",
                    result.exchange,
                    result.data_date,
                    result.message.as_deref().unwrap_or("")
                ),
                _ => warn!(
                    "{} {}: {}",
                    result.exchange,
                    result.data_date,
                    result.message.as_deref().unwrap_or("unknown error")
                ),
            }
        }
        info!("PROCESSING SUMMARY:");
        info!("  Total files processed: {}", summary.results.len());
        info!("  Successful loads: {}", summary.count(LoadStatus::Completed));
        info!("  Skipped loads: {}", summary.count(LoadStatus::Skipped));
        info!("  Failed loads: {}", summary.count(LoadStatus::Failed));
        info!(
            "  Total records loaded: {}",
            group_digits(summary.total_records() as i64)
        );
        info!(
            "  Status: {}",
            if summary.interrupted {
                "INTERRUPTED"
            } else {
                "COMPLETED"
            }
        );
    }
}

/// Thousands separators for operator-facing counts.
fn group_digits(value: i64) -> String {
    let negative = value < 0;
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if negative {
        format!("-{grouped}")
    } else {
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::GzipEncoder;
    use core_types::error::ERROR_MESSAGE_LIMIT;
    use duckdb::params;
    use lakehouse::LakeStore;
    use ledger::RemoteLedger;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use trth_source::{object_key, FileKind, LocalSource};

    fn mid_january() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    async fn write_fixture(
        root: &std::path::Path,
        exchange: Exchange,
        date: NaiveDate,
        body: &str,
    ) {
        let path = root.join(object_key(exchange, date, FileKind::Data));
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(body.as_bytes()).await.unwrap();
        encoder.shutdown().await.unwrap();
        tokio::fs::write(&path, encoder.into_inner()).await.unwrap();
    }

    fn sample_body(rows: usize) -> String {
        let mut body = String::from("#RIC,Price,Volume\n");
        for i in 0..rows {
            body.push_str(&format!("VOD.L,68.{:02},{}\n", i % 100, 100 + i));
        }
        body
    }

    struct Harness {
        runner: JobRunner,
        ledger: Arc<ProgressLedger>,
        token: ShutdownToken,
        _dir: tempfile::TempDir,
    }

    fn harness(dir: tempfile::TempDir) -> Harness {
        let store = LakeStore::open_path(dir.path().join("lake.duckdb")).unwrap();
        store.init().unwrap();
        let ledger = Arc::new(ProgressLedger::new(
            Arc::new(Mutex::new(store)),
            Arc::new(RemoteLedger::disabled()),
            2,
        ));
        let token = ShutdownToken::new();
        let runner = JobRunner::new(
            Arc::new(LocalSource::new(dir.path())),
            Arc::clone(&ledger),
            Arc::new(IngestMetrics::new()),
            token.clone(),
            8,
        );
        Harness {
            runner,
            ledger,
            token,
            _dir: dir,
        }
    }

    fn all_exchanges() -> [Exchange; 3] {
        Exchange::ALL
    }

    #[tokio::test]
    async fn clean_single_date_completes_every_exchange() {
        let dir = tempdir().unwrap();
        for exchange in all_exchanges() {
            write_fixture(dir.path(), exchange, mid_january(), &sample_body(20)).await;
        }
        let h = harness(dir);

        let summary = h
            .runner
            .run_date(mid_january(), &all_exchanges(), true)
            .await;
        assert!(summary.is_success());
        assert!(!summary.interrupted);
        assert_eq!(summary.results.len(), 3);
        assert!(summary
            .results
            .iter()
            .all(|r| r.status == LoadStatus::Completed && r.records_loaded == 20));

        // Row conservation: the ledger count equals the bronze slice.
        let store = h.ledger.store();
        let store = store.lock().unwrap();
        for exchange in all_exchanges() {
            assert_eq!(store.bronze_row_count(exchange, mid_january()).unwrap(), 20);
        }
        let daily = stats::daily_rows(&store, 10).unwrap();
        assert_eq!(daily.len(), 3);
        assert!(daily
            .iter()
            .all(|d| d.successful_files == 1 && d.failed_files == 0 && d.total_records == 20));
        let weekly = stats::weekly_rows(&store, 10).unwrap();
        assert_eq!(weekly.len(), 3);
        assert!(weekly
            .iter()
            .all(|w| w.week_ending == NaiveDate::from_ymd_opt(2025, 1, 19).unwrap()));
    }

    #[tokio::test]
    async fn missing_blob_skips_that_exchange_only() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), Exchange::Lse, mid_january(), &sample_body(5)).await;
        write_fixture(dir.path(), Exchange::Nyq, mid_january(), &sample_body(7)).await;
        let h = harness(dir);

        let summary = h
            .runner
            .run_date(mid_january(), &all_exchanges(), true)
            .await;
        assert!(summary.is_success(), "NotFound is not an operator error");
        let cme = summary
            .results
            .iter()
            .find(|r| r.exchange == Exchange::Cme)
            .unwrap();
        assert_eq!(cme.status, LoadStatus::Skipped);
        assert_eq!(cme.message.as_deref(), Some("no source file"));

        let store = h.ledger.store();
        let store = store.lock().unwrap();
        assert_eq!(store.bronze_row_count(Exchange::Cme, mid_january()).unwrap(), 0);
        let daily = stats::daily_rows(&store, 10).unwrap();
        let cme_daily = daily.iter().find(|d| d.exchange == "CME").unwrap();
        assert_eq!(cme_daily.successful_files, 0);
        assert_eq!(cme_daily.total_records, 0);
    }

    #[tokio::test]
    async fn second_idempotent_run_skips_and_preserves_counts() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), Exchange::Lse, mid_january(), &sample_body(12)).await;
        let h = harness(dir);
        let exchanges = [Exchange::Lse];

        let first = h.runner.run_date(mid_january(), &exchanges, true).await;
        assert!(first.is_success());
        let second = h.runner.run_date(mid_january(), &exchanges, true).await;
        assert!(second.is_success());
        assert_eq!(second.results[0].status, LoadStatus::Skipped);
        assert_eq!(
            second.results[0].message.as_deref(),
            Some("idempotent: already completed")
        );
        assert_eq!(second.results[0].records_loaded, 12);

        let store = h.ledger.store();
        let store = store.lock().unwrap();
        assert_eq!(store.bronze_row_count(Exchange::Lse, mid_january()).unwrap(), 12);
    }

    #[tokio::test]
    async fn malformed_file_fails_without_partial_rows() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), Exchange::Lse, mid_january(), &sample_body(4)).await;
        // CME: valid rows, then a malformed one past the first batches.
        let mut bad = sample_body(20);
        bad.push_str("CME1,not-a-price,broken,extra-field\n");
        write_fixture(dir.path(), Exchange::Cme, mid_january(), &bad).await;
        write_fixture(dir.path(), Exchange::Nyq, mid_january(), &sample_body(6)).await;
        let h = harness(dir);

        let summary = h
            .runner
            .run_date(mid_january(), &all_exchanges(), true)
            .await;
        assert!(!summary.is_success());
        let cme = summary
            .results
            .iter()
            .find(|r| r.exchange == Exchange::Cme)
            .unwrap();
        assert_eq!(cme.status, LoadStatus::Failed);

        let store = h.ledger.store();
        let store = store.lock().unwrap();
        // The transaction rolled back: no partial CME rows.
        assert_eq!(store.bronze_row_count(Exchange::Cme, mid_january()).unwrap(), 0);
        assert_eq!(store.bronze_row_count(Exchange::Lse, mid_january()).unwrap(), 4);
        assert_eq!(store.bronze_row_count(Exchange::Nyq, mid_january()).unwrap(), 6);

        let failures = stats::failed_progress(&store, 10).unwrap();
        assert_eq!(failures.len(), 1);
        let message = failures[0].error_message.as_deref().unwrap();
        assert!(
            message.contains("record") || message.contains("row"),
            "message references the offending record: {message}"
        );
        assert!(message.len() <= ERROR_MESSAGE_LIMIT + 4);
    }

    #[tokio::test]
    async fn shutdown_before_run_skips_everything() {
        let dir = tempdir().unwrap();
        for exchange in all_exchanges() {
            write_fixture(dir.path(), exchange, mid_january(), &sample_body(9)).await;
        }
        let h = harness(dir);
        h.token.cancel();

        let summary = h
            .runner
            .run_date(mid_january(), &all_exchanges(), true)
            .await;
        assert!(summary.interrupted);
        assert!(summary.is_success(), "shutdown skips are not failures");
        assert!(summary
            .results
            .iter()
            .all(|r| r.status == LoadStatus::Skipped
                && r.message.as_deref() == Some("shutdown")));

        let store = h.ledger.store();
        let store = store.lock().unwrap();
        for exchange in all_exchanges() {
            assert_eq!(store.bronze_row_count(exchange, mid_january()).unwrap(), 0);
        }
        // Re-running after resume completes the skipped days.
        drop(store);
        let token = ShutdownToken::new();
        let runner = JobRunner::new(
            Arc::new(LocalSource::new(h._dir.path())),
            Arc::clone(&h.ledger),
            Arc::new(IngestMetrics::new()),
            token,
            8,
        );
        let resumed = runner.run_date(mid_january(), &all_exchanges(), true).await;
        assert!(resumed.is_success());
        assert!(resumed
            .results
            .iter()
            .all(|r| r.status == LoadStatus::Completed));
    }

    #[tokio::test]
    async fn stale_started_record_is_reclaimed_on_resume() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), Exchange::Cme, mid_january(), &sample_body(15)).await;
        let h = harness(dir);

        // A crashed run left a stale `started` record behind.
        {
            let store = h.ledger.store();
            let store = store.lock().unwrap();
            store
                .connection()
                .execute(
                    "INSERT INTO bronze.load_progress
                         (exchange, data_date, file_path, start_time, status)
                     VALUES ('CME', CAST(? AS DATE), 'stale', now() - INTERVAL 3 HOUR, 'started')",
                    params![mid_january().format("%Y-%m-%d").to_string()],
                )
                .unwrap();
        }

        let summary = h.runner.run_date(mid_january(), &[Exchange::Cme], true).await;
        assert!(summary.is_success());
        assert_eq!(summary.results[0].status, LoadStatus::Completed);
        assert_eq!(summary.results[0].records_loaded, 15);
    }

    #[test]
    fn group_digits_formats_counts() {
        assert_eq!(group_digits(0), "0");
        assert_eq!(group_digits(999), "999");
        assert_eq!(group_digits(1000), "1,000");
        assert_eq!(group_digits(1234567), "1,234,567");
        assert_eq!(group_digits(-4500), "-4,500");
    }
}
