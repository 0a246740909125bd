// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use core_types::error::{abbreviate, Classify, FailureKind};
use core_types::shutdown::ShutdownToken;
use core_types::types::{Exchange, LoadStatus, WorkerResult};
use lakehouse::{bulk_load, RowMeta};
use ledger::{ClaimOutcome, ProgressLedger};
use log::{error, info, warn};
use metrics::IngestMetrics;
use trth_source::{object_key, FileKind, SourceError, SourceTrait};

const HEARTBEAT: Duration = Duration::from_secs(30);

/// Executes one `(exchange, date)` ingestion job: consult the ledger,
/// stream-load the file under a transaction, commit the ledger.
///
/// The cancellation token is observed only at transaction boundaries; an
/// open bulk load always runs to commit or rollback, so shutdown can never
/// tear a partial day.
pub struct IngestionWorker {
    source: Arc<dyn SourceTrait>,
    ledger: Arc<ProgressLedger>,
    metrics: Arc<IngestMetrics>,
    batch_size: usize,
}

impl IngestionWorker {
    pub fn new(
        source: Arc<dyn SourceTrait>,
        ledger: Arc<ProgressLedger>,
        metrics: Arc<IngestMetrics>,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            ledger,
            metrics,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        idempotent: bool,
        token: &ShutdownToken,
    ) -> WorkerResult {
        let started = Instant::now();
        let result = self.run_inner(exchange, data_date, idempotent, token, started).await;
        self.metrics.record_result(&result);
        result
    }

    async fn run_inner(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        idempotent: bool,
        token: &ShutdownToken,
        started: Instant,
    ) -> WorkerResult {
        let fallback_path = object_key(exchange, data_date, FileKind::Data);

        if token.is_cancelled() {
            info!("{exchange} {data_date}: shutdown requested, skipping");
            if let Err(err) = self
                .ledger
                .skip(exchange, data_date, &fallback_path, "shutdown")
                .await
            {
                error!("{exchange} {data_date}: failed to record shutdown skip: {err}");
            }
            return self.skipped(exchange, data_date, started, "shutdown");
        }

        info!("Loading {exchange} data for date: {data_date}");
        let meta = match self.source.head(exchange, data_date).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == FailureKind::NotFound => {
                info!("{exchange} {data_date}: no source file, skipping");
                if let Err(ledger_err) = self
                    .ledger
                    .skip(exchange, data_date, &fallback_path, "no source file")
                    .await
                {
                    error!("{exchange} {data_date}: failed to record skip: {ledger_err}");
                }
                return self.skipped(exchange, data_date, started, "no source file");
            }
            Err(err) => {
                // The job never claimed, so there is no record to fail; the
                // operator re-runs with --idempotent once the store is back.
                error!("{exchange} {data_date}: source lookup failed: {err}");
                return self.failed(exchange, data_date, started, err.to_string());
            }
        };

        // Shutdown observed up to this point skips cleanly; once the claim
        // succeeds the attempt runs to a terminal state.
        if token.is_cancelled() {
            info!("{exchange} {data_date}: shutdown requested before claim, skipping");
            if let Err(err) = self.ledger.skip(exchange, data_date, &meta.uri, "shutdown").await {
                error!("{exchange} {data_date}: failed to record shutdown skip: {err}");
            }
            return self.skipped(exchange, data_date, started, "shutdown");
        }

        let claim = self
            .ledger
            .claim(
                exchange,
                data_date,
                &meta.uri,
                Some(meta.size_bytes as i64),
                idempotent,
            )
            .await;
        match claim {
            Ok(ClaimOutcome::Proceed) => {}
            Ok(ClaimOutcome::AlreadyDone { records_loaded }) => {
                info!(
                    "{exchange} {data_date}: data already exists ({records_loaded} records), skipping"
                );
                let mut result =
                    self.skipped(exchange, data_date, started, "idempotent: already completed");
                result.records_loaded = records_loaded.max(0) as u64;
                return result;
            }
            Ok(ClaimOutcome::Conflict { reason }) => {
                warn!("{exchange} {data_date}: claim conflict: {reason}");
                return self.failed(exchange, data_date, started, reason);
            }
            Err(err) => {
                error!("{exchange} {data_date}: claim failed: {err}");
                return self.failed(exchange, data_date, started, err.to_string());
            }
        }

        match self.load_claimed(exchange, data_date, &meta.uri).await {
            Ok(records_loaded) => {
                let duration = started.elapsed();
                info!(
                    "Successfully loaded {records_loaded} records for {exchange} {data_date} in {:.2}s",
                    duration.as_secs_f64()
                );
                WorkerResult {
                    exchange,
                    data_date,
                    status: LoadStatus::Completed,
                    records_loaded: records_loaded.max(0) as u64,
                    duration,
                    message: None,
                }
            }
            Err(message) => {
                error!("Failed to load {exchange} {data_date}: {message}");
                if let Err(err) = self.ledger.fail(exchange, data_date, &message).await {
                    error!("{exchange} {data_date}: failed to record failure: {err}");
                }
                self.failed(exchange, data_date, started, message)
            }
        }
    }

    /// The claimed section: transaction open through commit plus the
    /// post-commit count. Any error rolls back and is reported back as the
    /// ledger failure message.
    async fn load_claimed(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        uri: &str,
    ) -> Result<i64, String> {
        let file = self
            .source
            .open(exchange, data_date)
            .await
            .map_err(|err: SourceError| abbreviate(&err.to_string()))?;

        let store = self.ledger.store();
        {
            let store = store.lock().unwrap();
            store.begin().map_err(|err| err.to_string())?;
        }
        self.metrics.file_started();
        let heartbeat = spawn_heartbeat(exchange, data_date);

        let meta = RowMeta::new(exchange, data_date, uri);
        let load = bulk_load(&store, exchange, file, meta, self.batch_size).await;
        heartbeat.abort();
        self.metrics.file_finished();

        match load {
            Ok(outcome) => {
                let store = store.lock().unwrap();
                store.commit().map_err(|err| err.to_string())?;
                info!(
                    "{exchange} {data_date}: committed {} rows in {} batches",
                    outcome.rows, outcome.batches
                );
                store
                    .count_source_rows(exchange, data_date, uri)
                    .map_err(|err| err.to_string())
            }
            Err(err) => {
                let store = store.lock().unwrap();
                if let Err(rollback_err) = store.rollback() {
                    error!("{exchange} {data_date}: rollback failed: {rollback_err}");
                }
                Err(abbreviate(&err.to_string()))
            }
        }
    }

    fn skipped(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        started: Instant,
        reason: &str,
    ) -> WorkerResult {
        WorkerResult {
            exchange,
            data_date,
            status: LoadStatus::Skipped,
            records_loaded: 0,
            duration: started.elapsed(),
            message: Some(reason.to_string()),
        }
    }

    fn failed(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        started: Instant,
        message: String,
    ) -> WorkerResult {
        WorkerResult {
            exchange,
            data_date,
            status: LoadStatus::Failed,
            records_loaded: 0,
            duration: started.elapsed(),
            message: Some(message),
        }
    }
}

/// Logs an elapsed-time line every 30s while a load is in flight, so long
/// transfers stay visible in the operator log. Aborted on completion.
fn spawn_heartbeat(exchange: Exchange, data_date: NaiveDate) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let begun = Instant::now();
        loop {
            tokio::time::sleep(HEARTBEAT).await;
            info!(
                "Data loading for {exchange} {data_date} - {:.0}s elapsed, still processing...",
                begun.elapsed().as_secs_f64()
            );
        }
    })
}
