// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! The progress ledger: sole writer of `bronze.load_progress` and the gold
//! aggregates. Every transition runs in one local transaction together with
//! its statistics refresh, then mirrors to the remote store best-effort.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use core_types::error::abbreviate;
use core_types::types::{week_ending, Exchange};
use duckdb::params;
use lakehouse::{LakeStore, StoreError};
use log::{debug, info};
use thiserror::Error;

use crate::remote::RemoteLedger;
use crate::stats;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ledger query failed: {0}")]
    Duckdb(#[from] duckdb::Error),
}

/// Answer to a `claim` request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller owns the `(exchange, date)` attempt and must finish it
    /// with `complete`, `fail` or `skip`.
    Proceed,
    /// A completed record exists and the caller runs idempotent; nothing to
    /// do.
    AlreadyDone { records_loaded: i64 },
    /// Another actor owns the attempt, or a completed record exists outside
    /// idempotent mode.
    Conflict { reason: String },
}

struct ExistingAttempt {
    status: String,
    start_time: NaiveDateTime,
    records_loaded: Option<i64>,
}

pub struct ProgressLedger {
    store: Arc<Mutex<LakeStore>>,
    remote: Arc<RemoteLedger>,
    staleness: ChronoDuration,
    active: Mutex<HashSet<(Exchange, NaiveDate)>>,
}

impl ProgressLedger {
    pub fn new(
        store: Arc<Mutex<LakeStore>>,
        remote: Arc<RemoteLedger>,
        staleness_hours: i64,
    ) -> Self {
        Self {
            store,
            remote,
            staleness: ChronoDuration::hours(staleness_hours.max(0)),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> Arc<Mutex<LakeStore>> {
        Arc::clone(&self.store)
    }

    pub fn remote(&self) -> Arc<RemoteLedger> {
        Arc::clone(&self.remote)
    }

    /// Claim the `(exchange, date)` attempt.
    ///
    /// No record: insert `started`. Completed: `AlreadyDone` under
    /// idempotent mode, otherwise a conflict pointing the operator at
    /// `--idempotent`. Failed or skipped: the attempt is retried. Started:
    /// owned by this process or fresh elsewhere is a conflict; stale beyond
    /// the threshold is reclaimed.
    pub async fn claim(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        file_path: &str,
        file_size_bytes: Option<i64>,
        idempotent: bool,
    ) -> Result<ClaimOutcome, LedgerError> {
        if self.active.lock().unwrap().contains(&(exchange, data_date)) {
            return Ok(ClaimOutcome::Conflict {
                reason: "already in progress elsewhere".to_string(),
            });
        }

        let staleness = self.staleness;
        let outcome = {
            let store = self.store.lock().unwrap();
            store.with_transaction(|tx| {
                let existing = current_attempt(tx, exchange, data_date)?;
                let Some(existing) = existing else {
                    insert_started(tx, exchange, data_date, file_path, file_size_bytes)?;
                    return Ok(ClaimOutcome::Proceed);
                };
                match existing.status.as_str() {
                    "completed" if idempotent => Ok(ClaimOutcome::AlreadyDone {
                        records_loaded: existing.records_loaded.unwrap_or(0),
                    }),
                    "completed" => Ok(ClaimOutcome::Conflict {
                        reason: format!(
                            "data already exists for {exchange} {data_date}; re-run with --idempotent to skip"
                        ),
                    }),
                    "failed" | "skipped" => {
                        reset_started(tx, exchange, data_date, file_path, file_size_bytes)?;
                        Ok(ClaimOutcome::Proceed)
                    }
                    "started" => {
                        let age = Utc::now().naive_utc() - existing.start_time;
                        if age > staleness {
                            info!(
                                "reclaiming stale started record for {exchange} {data_date} (age {}m)",
                                age.num_minutes()
                            );
                            reset_started(tx, exchange, data_date, file_path, file_size_bytes)?;
                            Ok(ClaimOutcome::Proceed)
                        } else {
                            Ok(ClaimOutcome::Conflict {
                                reason: "already in progress elsewhere".to_string(),
                            })
                        }
                    }
                    other => Ok(ClaimOutcome::Conflict {
                        reason: format!("unexpected ledger status {other:?}"),
                    }),
                }
            })?
        };

        if matches!(outcome, ClaimOutcome::Proceed) {
            self.active.lock().unwrap().insert((exchange, data_date));
            self.remote
                .insert_progress(exchange, data_date, file_path, file_size_bytes)
                .await;
        }
        Ok(outcome)
    }

    /// Transition to `completed` and refresh both aggregates.
    pub async fn complete(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        records_loaded: i64,
    ) -> Result<(), LedgerError> {
        {
            let store = self.store.lock().unwrap();
            store.with_transaction(|tx| {
                tx.connection()
                    .execute(
                        "UPDATE bronze.load_progress
                         SET end_time = now(), status = 'completed',
                             records_loaded = ?, error_message = NULL
                         WHERE exchange = ? AND data_date = CAST(? AS DATE)",
                        params![
                            records_loaded,
                            exchange.code(),
                            data_date.format("%Y-%m-%d").to_string()
                        ],
                    )
                    .map_err(StoreError::from)?;
                stats::refresh_daily(tx, exchange.code(), data_date)?;
                stats::refresh_weekly(tx, exchange.code(), data_date)?;
                Ok(())
            })?;
        }
        self.release(exchange, data_date);
        self.remote
            .progress_completed(exchange, data_date, records_loaded)
            .await;
        self.mirror_stats(exchange, data_date).await;
        Ok(())
    }

    /// Transition to `failed` with a truncated error message.
    pub async fn fail(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        error: &str,
    ) -> Result<(), LedgerError> {
        let message = abbreviate(error);
        {
            let store = self.store.lock().unwrap();
            store.with_transaction(|tx| {
                tx.connection()
                    .execute(
                        "UPDATE bronze.load_progress
                         SET end_time = now(), status = 'failed',
                             records_loaded = NULL, error_message = ?
                         WHERE exchange = ? AND data_date = CAST(? AS DATE)",
                        params![
                            message,
                            exchange.code(),
                            data_date.format("%Y-%m-%d").to_string()
                        ],
                    )
                    .map_err(StoreError::from)?;
                stats::refresh_daily(tx, exchange.code(), data_date)?;
                stats::refresh_weekly(tx, exchange.code(), data_date)?;
                Ok(())
            })?;
        }
        self.release(exchange, data_date);
        self.remote.progress_failed(exchange, data_date, &message).await;
        self.mirror_stats(exchange, data_date).await;
        Ok(())
    }

    /// Transition to `skipped`. The reason stays in the log and the worker
    /// result; `error_message` is reserved for failures. A skip may arrive
    /// before any claim (missing source file, shutdown), in which case a
    /// terminal record is inserted directly.
    pub async fn skip(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        file_path: &str,
        reason: &str,
    ) -> Result<(), LedgerError> {
        debug!("skipping {exchange} {data_date}: {reason}");
        {
            let store = self.store.lock().unwrap();
            store.with_transaction(|tx| {
                let updated = tx
                    .connection()
                    .execute(
                        "UPDATE bronze.load_progress
                         SET end_time = now(), status = 'skipped',
                             records_loaded = NULL, error_message = NULL
                         WHERE exchange = ? AND data_date = CAST(? AS DATE)",
                        params![
                            exchange.code(),
                            data_date.format("%Y-%m-%d").to_string()
                        ],
                    )
                    .map_err(StoreError::from)?;
                if updated == 0 {
                    tx.connection()
                        .execute(
                            "INSERT INTO bronze.load_progress
                                 (exchange, data_date, file_path, start_time, end_time, status)
                             VALUES (?, CAST(? AS DATE), ?, now(), now(), 'skipped')",
                            params![
                                exchange.code(),
                                data_date.format("%Y-%m-%d").to_string(),
                                file_path
                            ],
                        )
                        .map_err(StoreError::from)?;
                }
                stats::refresh_daily(tx, exchange.code(), data_date)?;
                stats::refresh_weekly(tx, exchange.code(), data_date)?;
                Ok(())
            })?;
        }
        self.release(exchange, data_date);
        self.remote
            .progress_skipped(exchange, data_date, file_path)
            .await;
        self.mirror_stats(exchange, data_date).await;
        Ok(())
    }

    async fn mirror_stats(&self, exchange: Exchange, data_date: NaiveDate) {
        self.remote.upsert_daily_stats(exchange, data_date).await;
        self.remote
            .upsert_weekly_stats(exchange, week_ending(data_date))
            .await;
    }

    fn release(&self, exchange: Exchange, data_date: NaiveDate) {
        if !self.active.lock().unwrap().remove(&(exchange, data_date)) {
            debug!("released {exchange} {data_date} without an active claim");
        }
    }
}

fn current_attempt(
    store: &LakeStore,
    exchange: Exchange,
    data_date: NaiveDate,
) -> Result<Option<ExistingAttempt>, StoreError> {
    let mut stmt = store.connection().prepare(
        "SELECT status, start_time, records_loaded FROM bronze.load_progress
         WHERE exchange = ? AND data_date = CAST(? AS DATE)",
    )?;
    let mut rows = stmt.query_map(
        params![exchange.code(), data_date.format("%Y-%m-%d").to_string()],
        |row| {
            Ok(ExistingAttempt {
                status: row.get(0)?,
                start_time: row.get(1)?,
                records_loaded: row.get(2)?,
            })
        },
    )?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

fn insert_started(
    store: &LakeStore,
    exchange: Exchange,
    data_date: NaiveDate,
    file_path: &str,
    file_size_bytes: Option<i64>,
) -> Result<(), StoreError> {
    store.connection().execute(
        "INSERT INTO bronze.load_progress
             (exchange, data_date, file_path, file_size_bytes, start_time, status)
         VALUES (?, CAST(? AS DATE), ?, ?, now(), 'started')",
        params![
            exchange.code(),
            data_date.format("%Y-%m-%d").to_string(),
            file_path,
            file_size_bytes
        ],
    )?;
    Ok(())
}

fn reset_started(
    store: &LakeStore,
    exchange: Exchange,
    data_date: NaiveDate,
    file_path: &str,
    file_size_bytes: Option<i64>,
) -> Result<(), StoreError> {
    store.connection().execute(
        "UPDATE bronze.load_progress
         SET file_path = ?, file_size_bytes = ?, start_time = now(),
             end_time = NULL, status = 'started', records_loaded = NULL,
             error_message = NULL
         WHERE exchange = ? AND data_date = CAST(? AS DATE)",
        params![
            file_path,
            file_size_bytes,
            exchange.code(),
            data_date.format("%Y-%m-%d").to_string()
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch_ledger(dir: &tempfile::TempDir) -> ProgressLedger {
        let store = LakeStore::open_path(dir.path().join("lake.duckdb")).unwrap();
        store.init().unwrap();
        ProgressLedger::new(
            Arc::new(Mutex::new(store)),
            Arc::new(RemoteLedger::disabled()),
            2,
        )
    }

    fn mid_january() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    async fn claim(ledger: &ProgressLedger, idempotent: bool) -> ClaimOutcome {
        ledger
            .claim(Exchange::Lse, mid_january(), "s3://bucket/a.csv.gz", Some(64), idempotent)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_claim_proceeds_and_records_started() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);

        let store = ledger.store();
        let store = store.lock().unwrap();
        let rows = stats::recent_progress(&store, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "started");
        assert_eq!(rows[0].file_size_bytes, Some(64));
    }

    #[tokio::test]
    async fn second_claim_in_process_conflicts() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);
        match claim(&ledger, true).await {
            ClaimOutcome::Conflict { reason } => {
                assert!(reason.contains("already in progress"))
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_record_resolves_by_mode() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);
        ledger.complete(Exchange::Lse, mid_january(), 1200).await.unwrap();

        // Idempotent: already done, with the original count.
        assert_eq!(
            claim(&ledger, true).await,
            ClaimOutcome::AlreadyDone { records_loaded: 1200 }
        );
        // Non-idempotent: conflict pointing at --idempotent.
        match claim(&ledger, false).await {
            ClaimOutcome::Conflict { reason } => assert!(reason.contains("--idempotent")),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_record_is_retried() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);
        ledger
            .fail(Exchange::Lse, mid_january(), "transient object store outage")
            .await
            .unwrap();

        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);
        let store = ledger.store();
        let store = store.lock().unwrap();
        let rows = stats::recent_progress(&store, 10).unwrap();
        assert_eq!(rows.len(), 1, "retry overwrites the single attempt row");
        assert_eq!(rows[0].status, "started");
        assert!(rows[0].error_message.is_none());
    }

    #[tokio::test]
    async fn foreign_started_record_conflicts_until_stale() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);

        // A second ledger over the same file stands in for another process.
        let other = ProgressLedger::new(ledger.store(), Arc::new(RemoteLedger::disabled()), 2);
        match other
            .claim(Exchange::Lse, mid_january(), "s3://bucket/a.csv.gz", None, true)
            .await
            .unwrap()
        {
            ClaimOutcome::Conflict { reason } => {
                assert!(reason.contains("already in progress"))
            }
            outcome => panic!("expected conflict, got {outcome:?}"),
        }

        // Age the attempt past the staleness threshold and reclaim it.
        {
            let store = ledger.store();
            let store = store.lock().unwrap();
            store
                .connection()
                .execute(
                    "UPDATE bronze.load_progress
                     SET start_time = now() - INTERVAL 3 HOUR WHERE exchange = 'LSE'",
                    [],
                )
                .unwrap();
        }
        assert_eq!(
            other
                .claim(Exchange::Lse, mid_january(), "s3://bucket/a.csv.gz", None, true)
                .await
                .unwrap(),
            ClaimOutcome::Proceed
        );
    }

    #[tokio::test]
    async fn complete_projects_daily_and_weekly_stats() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);
        ledger.complete(Exchange::Lse, mid_january(), 5000).await.unwrap();

        let store = ledger.store();
        let store = store.lock().unwrap();
        let daily = stats::daily_rows(&store, 10).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].stats_date, mid_january());
        assert_eq!(daily[0].exchange, "LSE");
        assert_eq!(daily[0].total_files, 1);
        assert_eq!(daily[0].successful_files, 1);
        assert_eq!(daily[0].failed_files, 0);
        assert_eq!(daily[0].total_records, 5000);
        assert_eq!(daily[0].avg_records_per_file, 5000.0);
        assert_eq!(daily[0].total_file_size_bytes, 64);

        let weekly = stats::weekly_rows(&store, 10).unwrap();
        assert_eq!(weekly.len(), 1);
        // 2025-01-15 is a Wednesday; the bounding Sunday is the 19th.
        assert_eq!(
            weekly[0].week_ending,
            NaiveDate::from_ymd_opt(2025, 1, 19).unwrap()
        );
        assert_eq!(weekly[0].total_files, 1);
        assert_eq!(weekly[0].total_records, 5000);
        assert_eq!(weekly[0].avg_daily_records, 5000.0);
    }

    #[tokio::test]
    async fn skip_without_claim_inserts_a_terminal_record() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        ledger
            .skip(Exchange::Cme, mid_january(), "s3://bucket/missing.csv.gz", "no source file")
            .await
            .unwrap();

        let store = ledger.store();
        let store = store.lock().unwrap();
        let rows = stats::recent_progress(&store, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "skipped");
        assert!(rows[0].end_time.is_some());
        assert!(rows[0].error_message.is_none());

        // Daily row exists with zero successes.
        let daily = stats::daily_rows(&store, 10).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].total_files, 1);
        assert_eq!(daily[0].successful_files, 0);
        assert_eq!(daily[0].total_records, 0);
        assert_eq!(daily[0].avg_records_per_file, 0.0);
    }

    #[tokio::test]
    async fn fail_truncates_oversized_messages() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);
        let noisy = "x".repeat(5000);
        ledger.fail(Exchange::Lse, mid_january(), &noisy).await.unwrap();

        let store = ledger.store();
        let store = store.lock().unwrap();
        let rows = stats::failed_progress(&store, 10).unwrap();
        assert_eq!(rows.len(), 1);
        let message = rows[0].error_message.as_deref().unwrap();
        assert!(message.chars().count() <= 1001);
    }

    #[tokio::test]
    async fn overview_counts_by_status() {
        let dir = tempdir().unwrap();
        let ledger = scratch_ledger(&dir);
        assert_eq!(claim(&ledger, true).await, ClaimOutcome::Proceed);
        ledger.complete(Exchange::Lse, mid_january(), 10).await.unwrap();
        ledger
            .skip(Exchange::Cme, mid_january(), "path", "no source file")
            .await
            .unwrap();

        let store = ledger.store();
        let store = store.lock().unwrap();
        let overview = stats::overview(&store).unwrap();
        assert_eq!(overview.len(), 2);
        let lse = overview.iter().find(|r| r.exchange == "LSE").unwrap();
        assert_eq!(lse.completed_files, 1);
        assert_eq!(lse.total_records, 10);
        let cme = overview.iter().find(|r| r.exchange == "CME").unwrap();
        assert_eq!(cme.skipped_files, 1);
        assert!(!stats::is_running(&store, 2).unwrap());
    }
}
