// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Daily and weekly statistics projection over the progress table.
//!
//! Both aggregates are recomputed as full scans of their tiny inputs after
//! every progress transition, inside the same local transaction, so readers
//! never observe a transition without its projection.

use chrono::NaiveDate;
use core_types::types::{week_ending, DailyStatsRow, ProgressRecord, WeeklyStatsRow};
use duckdb::params;
use lakehouse::{LakeStore, StoreError};
use serde::{Deserialize, Serialize};

/// Per-exchange progress rollup for the dashboard overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewRow {
    pub exchange: String,
    pub total_files: i64,
    pub completed_files: i64,
    pub failed_files: i64,
    pub skipped_files: i64,
    pub running_files: i64,
    pub total_records: i64,
}

/// Recompute `gold.daily_load_stats` for `(stats_date, exchange)` from the
/// progress records of that pair.
pub fn refresh_daily(
    store: &LakeStore,
    exchange: &str,
    stats_date: NaiveDate,
) -> Result<(), StoreError> {
    let date = stats_date.format("%Y-%m-%d").to_string();
    store.connection().execute(
        "INSERT INTO gold.daily_load_stats (
            stats_date, exchange, total_files, successful_files, failed_files,
            total_records, avg_records_per_file, total_processing_time_seconds,
            total_file_size_bytes, avg_file_size_bytes
        )
        SELECT
            CAST(? AS DATE),
            ?,
            count(*),
            count(*) FILTER (WHERE status = 'completed'),
            count(*) FILTER (WHERE status = 'failed'),
            COALESCE(sum(records_loaded) FILTER (WHERE status = 'completed'), 0),
            COALESCE(sum(records_loaded) FILTER (WHERE status = 'completed'), 0)
                / GREATEST(count(*) FILTER (WHERE status = 'completed'), 1),
            COALESCE(sum(EXTRACT(EPOCH FROM (end_time - start_time)))
                FILTER (WHERE status = 'completed'), 0),
            COALESCE(sum(file_size_bytes) FILTER (WHERE status = 'completed'), 0),
            COALESCE(avg(file_size_bytes) FILTER (WHERE status = 'completed'), 0)
        FROM bronze.load_progress
        WHERE exchange = ? AND data_date = CAST(? AS DATE)
        ON CONFLICT (stats_date, exchange) DO UPDATE SET
            total_files = EXCLUDED.total_files,
            successful_files = EXCLUDED.successful_files,
            failed_files = EXCLUDED.failed_files,
            total_records = EXCLUDED.total_records,
            avg_records_per_file = EXCLUDED.avg_records_per_file,
            total_processing_time_seconds = EXCLUDED.total_processing_time_seconds,
            total_file_size_bytes = EXCLUDED.total_file_size_bytes,
            avg_file_size_bytes = EXCLUDED.avg_file_size_bytes,
            created_at = now()",
        params![date, exchange, exchange, date],
    )?;
    Ok(())
}

/// Recompute `gold.weekly_load_stats` for the Sunday-bounded window holding
/// `stats_date`. Days with zero completed files contribute 0 to sums and are
/// excluded from the per-day means.
pub fn refresh_weekly(
    store: &LakeStore,
    exchange: &str,
    stats_date: NaiveDate,
) -> Result<NaiveDate, StoreError> {
    let sunday = week_ending(stats_date);
    let week = sunday.format("%Y-%m-%d").to_string();
    store.connection().execute(
        "INSERT INTO gold.weekly_load_stats (
            week_ending, exchange, avg_daily_files, avg_daily_records,
            total_files, total_records, avg_processing_time_seconds
        )
        SELECT
            CAST(? AS DATE),
            ?,
            COALESCE(avg(total_files) FILTER (WHERE successful_files > 0), 0),
            COALESCE(avg(total_records) FILTER (WHERE successful_files > 0), 0),
            COALESCE(sum(total_files), 0),
            COALESCE(sum(total_records), 0),
            COALESCE(avg(total_processing_time_seconds)
                FILTER (WHERE successful_files > 0), 0)
        FROM gold.daily_load_stats
        WHERE exchange = ?
          AND stats_date BETWEEN CAST(? AS DATE) - INTERVAL 6 DAY AND CAST(? AS DATE)
        ON CONFLICT (week_ending, exchange) DO UPDATE SET
            avg_daily_files = EXCLUDED.avg_daily_files,
            avg_daily_records = EXCLUDED.avg_daily_records,
            total_files = EXCLUDED.total_files,
            total_records = EXCLUDED.total_records,
            avg_processing_time_seconds = EXCLUDED.avg_processing_time_seconds,
            created_at = now()",
        params![week, exchange, exchange, week, week],
    )?;
    Ok(sunday)
}

pub fn daily_rows(store: &LakeStore, limit: usize) -> Result<Vec<DailyStatsRow>, StoreError> {
    let mut stmt = store.connection().prepare(
        "SELECT stats_date, exchange, total_files, successful_files, failed_files,
                total_records, CAST(avg_records_per_file AS DOUBLE),
                CAST(total_processing_time_seconds AS DOUBLE),
                total_file_size_bytes, CAST(avg_file_size_bytes AS DOUBLE)
         FROM gold.daily_load_stats
         ORDER BY stats_date DESC, exchange
         LIMIT ?",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(DailyStatsRow {
            stats_date: row.get(0)?,
            exchange: row.get(1)?,
            total_files: row.get(2)?,
            successful_files: row.get(3)?,
            failed_files: row.get(4)?,
            total_records: row.get(5)?,
            avg_records_per_file: row.get(6)?,
            total_processing_time_seconds: row.get(7)?,
            total_file_size_bytes: row.get(8)?,
            avg_file_size_bytes: row.get(9)?,
        })
    })?;
    collect(rows)
}

pub fn weekly_rows(store: &LakeStore, limit: usize) -> Result<Vec<WeeklyStatsRow>, StoreError> {
    let mut stmt = store.connection().prepare(
        "SELECT week_ending, exchange, CAST(avg_daily_files AS DOUBLE),
                CAST(avg_daily_records AS DOUBLE), total_files, total_records,
                CAST(avg_processing_time_seconds AS DOUBLE)
         FROM gold.weekly_load_stats
         ORDER BY week_ending DESC, exchange
         LIMIT ?",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(WeeklyStatsRow {
            week_ending: row.get(0)?,
            exchange: row.get(1)?,
            avg_daily_files: row.get(2)?,
            avg_daily_records: row.get(3)?,
            total_files: row.get(4)?,
            total_records: row.get(5)?,
            avg_processing_time_seconds: row.get(6)?,
        })
    })?;
    collect(rows)
}

pub fn recent_progress(store: &LakeStore, limit: usize) -> Result<Vec<ProgressRecord>, StoreError> {
    progress_query(
        store,
        "SELECT exchange, data_date, file_path, file_size_bytes, start_time,
                end_time, status, records_loaded, error_message
         FROM bronze.load_progress
         ORDER BY start_time DESC
         LIMIT ?",
        limit,
    )
}

pub fn failed_progress(store: &LakeStore, limit: usize) -> Result<Vec<ProgressRecord>, StoreError> {
    progress_query(
        store,
        "SELECT exchange, data_date, file_path, file_size_bytes, start_time,
                end_time, status, records_loaded, error_message
         FROM bronze.load_progress
         WHERE status = 'failed'
         ORDER BY start_time DESC
         LIMIT ?",
        limit,
    )
}

fn progress_query(
    store: &LakeStore,
    sql: &str,
    limit: usize,
) -> Result<Vec<ProgressRecord>, StoreError> {
    let mut stmt = store.connection().prepare(sql)?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(ProgressRecord {
            exchange: row.get(0)?,
            data_date: row.get(1)?,
            file_path: row.get(2)?,
            file_size_bytes: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            status: row.get(6)?,
            records_loaded: row.get(7)?,
            error_message: row.get(8)?,
        })
    })?;
    collect(rows)
}

pub fn overview(store: &LakeStore) -> Result<Vec<OverviewRow>, StoreError> {
    let mut stmt = store.connection().prepare(
        "SELECT exchange,
                count(*),
                count(*) FILTER (WHERE status = 'completed'),
                count(*) FILTER (WHERE status = 'failed'),
                count(*) FILTER (WHERE status = 'skipped'),
                count(*) FILTER (WHERE status = 'started'),
                COALESCE(sum(records_loaded) FILTER (WHERE status = 'completed'), 0)
         FROM bronze.load_progress
         GROUP BY exchange
         ORDER BY exchange",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(OverviewRow {
            exchange: row.get(0)?,
            total_files: row.get(1)?,
            completed_files: row.get(2)?,
            failed_files: row.get(3)?,
            skipped_files: row.get(4)?,
            running_files: row.get(5)?,
            total_records: row.get(6)?,
        })
    })?;
    collect(rows)
}

/// Whether any load is in flight: a `started` record younger than
/// `within_minutes`.
pub fn is_running(store: &LakeStore, within_minutes: i64) -> Result<bool, StoreError> {
    let count: i64 = store.connection().query_row(
        "SELECT count(*) FROM bronze.load_progress
         WHERE status = 'started' AND start_time >= now() - ? * INTERVAL 1 MINUTE",
        params![within_minutes],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn collect<T>(
    rows: impl Iterator<Item = Result<T, duckdb::Error>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
