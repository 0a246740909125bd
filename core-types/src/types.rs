// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Exchanges served by the pipeline, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Lse,
    Cme,
    Nyq,
}

impl Exchange {
    /// All exchanges in the deterministic dispatch order (LSE, CME, NYQ).
    pub const ALL: [Exchange; 3] = [Exchange::Lse, Exchange::Cme, Exchange::Nyq];

    pub fn code(&self) -> &'static str {
        match self {
            Exchange::Lse => "LSE",
            Exchange::Cme => "CME",
            Exchange::Nyq => "NYQ",
        }
    }

    /// Unqualified bronze table name for this exchange.
    pub fn bronze_table(&self) -> String {
        format!("{}_market_data_raw", self.code().to_lowercase())
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LSE" => Ok(Exchange::Lse),
            "CME" => Ok(Exchange::Cme),
            "NYQ" => Ok(Exchange::Nyq),
            other => Err(format!("unknown exchange {other:?} (expected LSE, CME or NYQ)")),
        }
    }
}

/// Terminal and in-flight states of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Started => "started",
            LoadStatus::Completed => "completed",
            LoadStatus::Failed => "failed",
            LoadStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadStatus::Started)
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `(exchange, date)` ingestion job.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub exchange: Exchange,
    pub data_date: NaiveDate,
    pub status: LoadStatus,
    pub records_loaded: u64,
    pub duration: Duration,
    pub message: Option<String>,
}

impl WorkerResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, LoadStatus::Completed | LoadStatus::Skipped)
    }
}

/// One row of `bronze.load_progress`, as read back for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub exchange: String,
    pub data_date: NaiveDate,
    pub file_path: String,
    pub file_size_bytes: Option<i64>,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub status: String,
    pub records_loaded: Option<i64>,
    pub error_message: Option<String>,
}

impl ProgressRecord {
    pub fn processing_seconds(&self) -> Option<f64> {
        let end = self.end_time?;
        Some((end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }
}

/// One row of `gold.daily_load_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStatsRow {
    pub stats_date: NaiveDate,
    pub exchange: String,
    pub total_files: i64,
    pub successful_files: i64,
    pub failed_files: i64,
    pub total_records: i64,
    pub avg_records_per_file: f64,
    pub total_processing_time_seconds: f64,
    pub total_file_size_bytes: i64,
    pub avg_file_size_bytes: f64,
}

/// One row of `gold.weekly_load_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyStatsRow {
    pub week_ending: NaiveDate,
    pub exchange: String,
    pub avg_daily_files: f64,
    pub avg_daily_records: f64,
    pub total_files: i64,
    pub total_records: i64,
    pub avg_processing_time_seconds: f64,
}

/// The Sunday bounding the rolling week `[week_ending - 6, week_ending]`
/// that contains `date`. A Sunday is its own week ending.
pub fn week_ending(date: NaiveDate) -> NaiveDate {
    let ahead = (7 - date.weekday().num_days_from_sunday()) % 7;
    date.checked_add_days(Days::new(u64::from(ahead)))
        .unwrap_or(date)
}
