// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Best-effort mirror of the progress ledger and aggregates into the remote
//! Postgres store (Supabase). The local DuckDB write is authoritative; any
//! remote failure degrades the mirror for the rest of the process and never
//! fails the local transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDate;
use core_types::config::RemoteConfig;
use core_types::types::{DailyStatsRow, Exchange, ProgressRecord, WeeklyStatsRow};
use log::{error, info, warn};
use thiserror::Error;
use tokio_postgres::{Client, NoTls};

use crate::stats::OverviewRow;

const REMOTE_SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS bronze;
CREATE SCHEMA IF NOT EXISTS gold;

CREATE TABLE IF NOT EXISTS bronze.load_progress (
    id BIGSERIAL PRIMARY KEY,
    exchange VARCHAR(50) NOT NULL,
    data_date DATE NOT NULL,
    file_path TEXT NOT NULL,
    file_size_bytes BIGINT,
    start_time TIMESTAMP DEFAULT NOW(),
    end_time TIMESTAMP,
    status VARCHAR(20) DEFAULT 'started',
    records_loaded BIGINT,
    error_message TEXT,
    created_at TIMESTAMP DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_load_progress_date_exchange
    ON bronze.load_progress (data_date, exchange);

CREATE TABLE IF NOT EXISTS gold.daily_load_stats (
    id BIGSERIAL PRIMARY KEY,
    stats_date DATE NOT NULL,
    exchange VARCHAR(50) NOT NULL,
    total_files INTEGER DEFAULT 0,
    successful_files INTEGER DEFAULT 0,
    failed_files INTEGER DEFAULT 0,
    total_records BIGINT DEFAULT 0,
    avg_records_per_file NUMERIC(20,2),
    total_processing_time_seconds NUMERIC(10,2),
    total_file_size_bytes BIGINT DEFAULT 0,
    avg_file_size_bytes NUMERIC(20,2),
    created_at TIMESTAMP DEFAULT NOW(),
    UNIQUE (stats_date, exchange)
);
CREATE INDEX IF NOT EXISTS idx_daily_stats_date ON gold.daily_load_stats (stats_date);
CREATE INDEX IF NOT EXISTS idx_daily_stats_exchange ON gold.daily_load_stats (exchange);

CREATE TABLE IF NOT EXISTS gold.weekly_load_stats (
    id BIGSERIAL PRIMARY KEY,
    week_ending DATE NOT NULL,
    exchange VARCHAR(50) NOT NULL,
    avg_daily_files NUMERIC(10,2),
    avg_daily_records NUMERIC(20,2),
    total_files INTEGER DEFAULT 0,
    total_records BIGINT DEFAULT 0,
    avg_processing_time_seconds NUMERIC(10,2),
    created_at TIMESTAMP DEFAULT NOW(),
    UNIQUE (week_ending, exchange)
);
CREATE INDEX IF NOT EXISTS idx_weekly_stats_week_exchange
    ON gold.weekly_load_stats (week_ending, exchange);
"#;

/// Mirror health, surfaced on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Disabled,
    Ok,
    Degraded,
}

impl RemoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Disabled => "disabled",
            RemoteStatus::Ok => "ok",
            RemoteStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote ledger is not configured")]
    Unavailable,
    #[error("remote ledger query failed: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

pub struct RemoteLedger {
    inner: Option<RemoteInner>,
}

struct RemoteInner {
    client: Client,
    degraded: AtomicBool,
    progress_ids: Mutex<HashMap<(Exchange, NaiveDate), i64>>,
}

impl RemoteLedger {
    /// Connect at startup. Missing credentials or an unreachable host log
    /// once and leave the mirror disabled; ingestion proceeds regardless.
    pub async fn connect(config: Option<&RemoteConfig>) -> Self {
        let Some(config) = config else {
            info!("remote ledger disabled: SUPABASE_* credentials not configured");
            return Self { inner: None };
        };
        match Self::try_connect(config).await {
            Ok(client) => {
                if let Err(err) = client.batch_execute(REMOTE_SCHEMA_SQL).await {
                    warn!("remote ledger schema init failed, mirror disabled: {err}");
                    return Self { inner: None };
                }
                info!("remote ledger connected to {}:{}", config.host, config.port);
                Self {
                    inner: Some(RemoteInner {
                        client,
                        degraded: AtomicBool::new(false),
                        progress_ids: Mutex::new(HashMap::new()),
                    }),
                }
            }
            Err(err) => {
                warn!("remote ledger unreachable, statistics tracked locally only: {err}");
                Self { inner: None }
            }
        }
    }

    /// A mirror that is off for the process lifetime. Test suites and
    /// offline runs use this.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    async fn try_connect(config: &RemoteConfig) -> Result<Client, RemoteError> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .user(&config.user)
            .password(&config.password)
            .dbname(&config.database)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        let (client, connection) = pg.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("remote ledger connection task ended: {err}");
            }
        });
        Ok(client)
    }

    pub fn status(&self) -> RemoteStatus {
        match &self.inner {
            None => RemoteStatus::Disabled,
            Some(inner) if inner.degraded.load(Ordering::Relaxed) => RemoteStatus::Degraded,
            Some(_) => RemoteStatus::Ok,
        }
    }

    fn usable(&self) -> Option<&RemoteInner> {
        let inner = self.inner.as_ref()?;
        if inner.degraded.load(Ordering::Relaxed) {
            None
        } else {
            Some(inner)
        }
    }

    fn mark_degraded(inner: &RemoteInner, op: &str, err: tokio_postgres::Error) {
        if !inner.degraded.swap(true, Ordering::Relaxed) {
            error!("remote ledger {op} failed; mirror degraded for the rest of this run: {err}");
        }
    }

    /// Mirror a `started` record. Always inserts a fresh row so the remote
    /// keeps per-attempt history; terminal updates address the returned id.
    pub async fn insert_progress(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        file_path: &str,
        file_size_bytes: Option<i64>,
    ) {
        let Some(inner) = self.usable() else { return };
        let result = inner
            .client
            .query_one(
                "INSERT INTO bronze.load_progress
                     (exchange, data_date, file_path, file_size_bytes, start_time, status)
                 VALUES ($1, $2, $3, $4, NOW(), 'started')
                 RETURNING id",
                &[&exchange.code(), &data_date, &file_path, &file_size_bytes],
            )
            .await;
        match result {
            Ok(row) => {
                let id: i64 = row.get(0);
                inner
                    .progress_ids
                    .lock()
                    .unwrap()
                    .insert((exchange, data_date), id);
            }
            Err(err) => Self::mark_degraded(inner, "progress insert", err),
        }
    }

    pub async fn progress_completed(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        records_loaded: i64,
    ) {
        let Some(inner) = self.usable() else { return };
        let result = match self.cached_id(inner, exchange, data_date) {
            Some(id) => {
                inner
                    .client
                    .execute(
                        "UPDATE bronze.load_progress
                         SET end_time = NOW(), status = 'completed', records_loaded = $1
                         WHERE id = $2",
                        &[&records_loaded, &id],
                    )
                    .await
            }
            None => {
                inner
                    .client
                    .execute(
                        "UPDATE bronze.load_progress
                         SET end_time = NOW(), status = 'completed', records_loaded = $1
                         WHERE id = (SELECT max(id) FROM bronze.load_progress
                                     WHERE exchange = $2 AND data_date = $3)",
                        &[&records_loaded, &exchange.code(), &data_date],
                    )
                    .await
            }
        };
        if let Err(err) = result {
            Self::mark_degraded(inner, "progress completion", err);
        }
    }

    pub async fn progress_failed(&self, exchange: Exchange, data_date: NaiveDate, error: &str) {
        let Some(inner) = self.usable() else { return };
        let result = match self.cached_id(inner, exchange, data_date) {
            Some(id) => {
                inner
                    .client
                    .execute(
                        "UPDATE bronze.load_progress
                         SET end_time = NOW(), status = 'failed', error_message = $1
                         WHERE id = $2",
                        &[&error, &id],
                    )
                    .await
            }
            None => {
                inner
                    .client
                    .execute(
                        "UPDATE bronze.load_progress
                         SET end_time = NOW(), status = 'failed', error_message = $1
                         WHERE id = (SELECT max(id) FROM bronze.load_progress
                                     WHERE exchange = $2 AND data_date = $3)",
                        &[&error, &exchange.code(), &data_date],
                    )
                    .await
            }
        };
        if let Err(err) = result {
            Self::mark_degraded(inner, "progress failure", err);
        }
    }

    /// Mirror a skip. A worker can skip a day it never claimed, so this
    /// inserts a terminal row when no attempt exists yet.
    pub async fn progress_skipped(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        file_path: &str,
    ) {
        let Some(inner) = self.usable() else { return };
        let updated = match self.cached_id(inner, exchange, data_date) {
            Some(id) => {
                inner
                    .client
                    .execute(
                        "UPDATE bronze.load_progress
                         SET end_time = NOW(), status = 'skipped'
                         WHERE id = $1",
                        &[&id],
                    )
                    .await
            }
            None => Ok(0),
        };
        let result = match updated {
            Ok(0) => {
                inner
                    .client
                    .execute(
                        "INSERT INTO bronze.load_progress
                             (exchange, data_date, file_path, start_time, end_time, status)
                         VALUES ($1, $2, $3, NOW(), NOW(), 'skipped')",
                        &[&exchange.code(), &data_date, &file_path],
                    )
                    .await
                    .map(|_| 1)
            }
            other => other,
        };
        if let Err(err) = result {
            Self::mark_degraded(inner, "progress skip", err);
        }
    }

    /// Recompute the remote daily row server-side from the latest attempt
    /// per `(exchange, data_date)`, so retries in the history never double
    /// count.
    pub async fn upsert_daily_stats(&self, exchange: Exchange, stats_date: NaiveDate) {
        let Some(inner) = self.usable() else { return };
        let result = inner
            .client
            .execute(
                "INSERT INTO gold.daily_load_stats (
                     stats_date, exchange, total_files, successful_files, failed_files,
                     total_records, avg_records_per_file, total_processing_time_seconds,
                     total_file_size_bytes, avg_file_size_bytes
                 )
                 SELECT
                     $1, $2,
                     count(*),
                     count(*) FILTER (WHERE status = 'completed'),
                     count(*) FILTER (WHERE status = 'failed'),
                     COALESCE(sum(records_loaded) FILTER (WHERE status = 'completed'), 0),
                     COALESCE(sum(records_loaded) FILTER (WHERE status = 'completed'), 0)::numeric
                         / GREATEST(count(*) FILTER (WHERE status = 'completed'), 1),
                     COALESCE(sum(EXTRACT(EPOCH FROM (end_time - start_time)))
                         FILTER (WHERE status = 'completed'), 0),
                     COALESCE(sum(file_size_bytes) FILTER (WHERE status = 'completed'), 0),
                     COALESCE(avg(file_size_bytes) FILTER (WHERE status = 'completed'), 0)
                 FROM (
                     SELECT DISTINCT ON (exchange, data_date) *
                     FROM bronze.load_progress
                     WHERE exchange = $2 AND data_date = $1
                     ORDER BY exchange, data_date, id DESC
                 ) latest
                 ON CONFLICT (stats_date, exchange) DO UPDATE SET
                     total_files = EXCLUDED.total_files,
                     successful_files = EXCLUDED.successful_files,
                     failed_files = EXCLUDED.failed_files,
                     total_records = EXCLUDED.total_records,
                     avg_records_per_file = EXCLUDED.avg_records_per_file,
                     total_processing_time_seconds = EXCLUDED.total_processing_time_seconds,
                     total_file_size_bytes = EXCLUDED.total_file_size_bytes,
                     avg_file_size_bytes = EXCLUDED.avg_file_size_bytes,
                     created_at = NOW()",
                &[&stats_date, &exchange.code()],
            )
            .await;
        if let Err(err) = result {
            Self::mark_degraded(inner, "daily stats upsert", err);
        }
    }

    pub async fn upsert_weekly_stats(&self, exchange: Exchange, week_ending: NaiveDate) {
        let Some(inner) = self.usable() else { return };
        let result = inner
            .client
            .execute(
                "INSERT INTO gold.weekly_load_stats (
                     week_ending, exchange, avg_daily_files, avg_daily_records,
                     total_files, total_records, avg_processing_time_seconds
                 )
                 SELECT
                     $1, $2,
                     COALESCE(avg(total_files) FILTER (WHERE successful_files > 0), 0),
                     COALESCE(avg(total_records) FILTER (WHERE successful_files > 0), 0),
                     COALESCE(sum(total_files), 0),
                     COALESCE(sum(total_records), 0),
                     COALESCE(avg(total_processing_time_seconds)
                         FILTER (WHERE successful_files > 0), 0)
                 FROM gold.daily_load_stats
                 WHERE exchange = $2
                   AND stats_date BETWEEN $1 - INTERVAL '6 days' AND $1
                 ON CONFLICT (week_ending, exchange) DO UPDATE SET
                     avg_daily_files = EXCLUDED.avg_daily_files,
                     avg_daily_records = EXCLUDED.avg_daily_records,
                     total_files = EXCLUDED.total_files,
                     total_records = EXCLUDED.total_records,
                     avg_processing_time_seconds = EXCLUDED.avg_processing_time_seconds,
                     created_at = NOW()",
                &[&week_ending, &exchange.code()],
            )
            .await;
        if let Err(err) = result {
            Self::mark_degraded(inner, "weekly stats upsert", err);
        }
    }

    fn cached_id(&self, inner: &RemoteInner, exchange: Exchange, date: NaiveDate) -> Option<i64> {
        inner.progress_ids.lock().unwrap().get(&(exchange, date)).copied()
    }

    fn client(&self) -> Result<&Client, RemoteError> {
        match &self.inner {
            Some(inner) => Ok(&inner.client),
            None => Err(RemoteError::Unavailable),
        }
    }

    // Read side: the dashboard falls back to these when the store file is
    // exclusively locked by a running job.

    pub async fn overview(&self) -> Result<Vec<OverviewRow>, RemoteError> {
        let rows = self
            .client()?
            .query(
                "SELECT exchange,
                        count(*),
                        count(*) FILTER (WHERE status = 'completed'),
                        count(*) FILTER (WHERE status = 'failed'),
                        count(*) FILTER (WHERE status = 'skipped'),
                        count(*) FILTER (WHERE status = 'started'),
                        COALESCE(sum(records_loaded) FILTER (WHERE status = 'completed'), 0)
                 FROM (
                     SELECT DISTINCT ON (exchange, data_date) *
                     FROM bronze.load_progress
                     ORDER BY exchange, data_date, id DESC
                 ) latest
                 GROUP BY exchange
                 ORDER BY exchange",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| OverviewRow {
                exchange: row.get(0),
                total_files: row.get(1),
                completed_files: row.get(2),
                failed_files: row.get(3),
                skipped_files: row.get(4),
                running_files: row.get(5),
                total_records: row.get(6),
            })
            .collect())
    }

    pub async fn recent_progress(&self, limit: i64) -> Result<Vec<ProgressRecord>, RemoteError> {
        self.progress_rows(
            "SELECT exchange, data_date, file_path, file_size_bytes, start_time,
                    end_time, status, records_loaded, error_message
             FROM bronze.load_progress
             ORDER BY start_time DESC
             LIMIT $1",
            limit,
        )
        .await
    }

    pub async fn failed_progress(&self, limit: i64) -> Result<Vec<ProgressRecord>, RemoteError> {
        self.progress_rows(
            "SELECT exchange, data_date, file_path, file_size_bytes, start_time,
                    end_time, status, records_loaded, error_message
             FROM bronze.load_progress
             WHERE status = 'failed'
             ORDER BY start_time DESC
             LIMIT $1",
            limit,
        )
        .await
    }

    async fn progress_rows(&self, sql: &str, limit: i64) -> Result<Vec<ProgressRecord>, RemoteError> {
        let rows = self.client()?.query(sql, &[&limit]).await?;
        Ok(rows
            .iter()
            .map(|row| ProgressRecord {
                exchange: row.get(0),
                data_date: row.get(1),
                file_path: row.get(2),
                file_size_bytes: row.get(3),
                start_time: row.get(4),
                end_time: row.get(5),
                status: row.get(6),
                records_loaded: row.get(7),
                error_message: row.get(8),
            })
            .collect())
    }

    pub async fn daily_rows(&self, limit: i64) -> Result<Vec<DailyStatsRow>, RemoteError> {
        let rows = self
            .client()?
            .query(
                "SELECT stats_date, exchange, total_files, successful_files, failed_files,
                        total_records, avg_records_per_file::float8,
                        total_processing_time_seconds::float8,
                        total_file_size_bytes, avg_file_size_bytes::float8
                 FROM gold.daily_load_stats
                 ORDER BY stats_date DESC, exchange
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| DailyStatsRow {
                stats_date: row.get(0),
                exchange: row.get(1),
                total_files: i64::from(row.get::<_, i32>(2)),
                successful_files: i64::from(row.get::<_, i32>(3)),
                failed_files: i64::from(row.get::<_, i32>(4)),
                total_records: row.get(5),
                avg_records_per_file: row.get::<_, Option<f64>>(6).unwrap_or(0.0),
                total_processing_time_seconds: row.get::<_, Option<f64>>(7).unwrap_or(0.0),
                total_file_size_bytes: row.get::<_, Option<i64>>(8).unwrap_or(0),
                avg_file_size_bytes: row.get::<_, Option<f64>>(9).unwrap_or(0.0),
            })
            .collect())
    }

    pub async fn weekly_rows(&self, limit: i64) -> Result<Vec<WeeklyStatsRow>, RemoteError> {
        let rows = self
            .client()?
            .query(
                "SELECT week_ending, exchange, avg_daily_files::float8,
                        avg_daily_records::float8, total_files, total_records,
                        avg_processing_time_seconds::float8
                 FROM gold.weekly_load_stats
                 ORDER BY week_ending DESC, exchange
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| WeeklyStatsRow {
                week_ending: row.get(0),
                exchange: row.get(1),
                avg_daily_files: row.get::<_, Option<f64>>(2).unwrap_or(0.0),
                avg_daily_records: row.get::<_, Option<f64>>(3).unwrap_or(0.0),
                total_files: i64::from(row.get::<_, i32>(4)),
                total_records: row.get(5),
                avg_processing_time_seconds: row.get::<_, Option<f64>>(6).unwrap_or(0.0),
            })
            .collect())
    }

    pub async fn is_running(&self, within_minutes: i32) -> Result<bool, RemoteError> {
        let row = self
            .client()?
            .query_one(
                "SELECT count(*) FROM bronze.load_progress
                 WHERE status = 'started'
                   AND start_time >= NOW() - ($1::int * INTERVAL '1 minute')",
                &[&within_minutes],
            )
            .await?;
        Ok(row.get::<_, i64>(0) > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_mirror_is_a_no_op() {
        let remote = RemoteLedger::disabled();
        assert_eq!(remote.status(), RemoteStatus::Disabled);
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        // None of these may error or panic without a backing connection.
        remote.insert_progress(Exchange::Lse, date, "path", Some(10)).await;
        remote.progress_completed(Exchange::Lse, date, 100).await;
        remote.progress_failed(Exchange::Lse, date, "boom").await;
        remote.progress_skipped(Exchange::Lse, date, "path").await;
        remote.upsert_daily_stats(Exchange::Lse, date).await;
        remote.upsert_weekly_stats(Exchange::Lse, date).await;
        assert!(matches!(
            remote.overview().await,
            Err(RemoteError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn missing_credentials_disable_the_mirror() {
        let remote = RemoteLedger::connect(None).await;
        assert_eq!(remote.status(), RemoteStatus::Disabled);
    }
}
