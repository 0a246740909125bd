// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Embedded DuckDB store holding bronze fact tables, the progress ledger and
//! the gold aggregates. One read-write connection per process; the monitor
//! opens read-only handles.

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use core_types::config::LakeConfig;
use core_types::error::{Classify, FailureKind};
use core_types::types::Exchange;
use csv_async::StringRecord;
use duckdb::types::Value;
use duckdb::{params, params_from_iter, AccessMode, Config, Connection};
use log::{debug, info};
use thiserror::Error;
use trth_source::SourceError;

use crate::schema::{convert_cell, quote_ident, ColumnDescriptor, ColumnType, TableSchema};

/// Metadata columns stamped onto every bronze row.
pub const META_COLUMNS: [&str; 4] = ["data_date", "exchange", "source_file", "ingestion_timestamp"];

const INIT_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS bronze;
CREATE SCHEMA IF NOT EXISTS gold;

CREATE SEQUENCE IF NOT EXISTS bronze.load_progress_id_seq;
CREATE SEQUENCE IF NOT EXISTS gold.daily_load_stats_id_seq;
CREATE SEQUENCE IF NOT EXISTS gold.weekly_load_stats_id_seq;

CREATE TABLE IF NOT EXISTS bronze.load_progress (
    id BIGINT PRIMARY KEY DEFAULT nextval('bronze.load_progress_id_seq'),
    exchange VARCHAR NOT NULL,
    data_date DATE NOT NULL,
    file_path VARCHAR NOT NULL,
    file_size_bytes BIGINT,
    start_time TIMESTAMP DEFAULT now(),
    end_time TIMESTAMP,
    status VARCHAR DEFAULT 'started',
    records_loaded BIGINT,
    error_message VARCHAR,
    created_at TIMESTAMP DEFAULT now(),
    UNIQUE (exchange, data_date)
);
CREATE INDEX IF NOT EXISTS idx_load_progress_date_exchange
    ON bronze.load_progress (data_date, exchange);

CREATE TABLE IF NOT EXISTS gold.daily_load_stats (
    id BIGINT PRIMARY KEY DEFAULT nextval('gold.daily_load_stats_id_seq'),
    stats_date DATE NOT NULL,
    exchange VARCHAR NOT NULL,
    total_files INTEGER DEFAULT 0,
    successful_files INTEGER DEFAULT 0,
    failed_files INTEGER DEFAULT 0,
    total_records BIGINT DEFAULT 0,
    avg_records_per_file DECIMAL(20,2),
    total_processing_time_seconds DECIMAL(10,2),
    total_file_size_bytes BIGINT DEFAULT 0,
    avg_file_size_bytes DECIMAL(20,2),
    created_at TIMESTAMP DEFAULT now(),
    UNIQUE (stats_date, exchange)
);

CREATE TABLE IF NOT EXISTS gold.weekly_load_stats (
    id BIGINT PRIMARY KEY DEFAULT nextval('gold.weekly_load_stats_id_seq'),
    week_ending DATE NOT NULL,
    exchange VARCHAR NOT NULL,
    avg_daily_files DECIMAL(10,2),
    avg_daily_records DECIMAL(20,2),
    total_files INTEGER DEFAULT 0,
    total_records BIGINT DEFAULT 0,
    avg_processing_time_seconds DECIMAL(10,2),
    created_at TIMESTAMP DEFAULT now(),
    UNIQUE (week_ending, exchange)
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duckdb: {0}")]
    Duckdb(#[from] duckdb::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("bulk load rejected {context}")]
    DataMalformed { context: String },
}

impl Classify for StoreError {
    fn kind(&self) -> FailureKind {
        match self {
            // Constraint and cast violations surface through duckdb::Error;
            // both mean the loader rejected the data.
            StoreError::Duckdb(_) => FailureKind::DataMalformed,
            StoreError::Source(err) => err.kind(),
            StoreError::DataMalformed { .. } => FailureKind::DataMalformed,
        }
    }
}

/// Literal augmentation values appended to every row of one bulk load.
#[derive(Debug, Clone)]
pub struct RowMeta {
    pub data_date: NaiveDate,
    pub exchange: Exchange,
    pub source_file: String,
    pub ingestion_timestamp: NaiveDateTime,
}

impl RowMeta {
    pub fn new(exchange: Exchange, data_date: NaiveDate, source_file: impl Into<String>) -> Self {
        Self {
            data_date,
            exchange,
            source_file: source_file.into(),
            ingestion_timestamp: Utc::now().naive_utc(),
        }
    }
}

pub struct LakeStore {
    conn: Connection,
}

impl LakeStore {
    /// Open (or create) the process-exclusive store and apply the session
    /// settings.
    pub fn open(config: &LakeConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(&config.database_path)?;
        conn.execute_batch(&format!(
            "SET memory_limit = '{}'; SET threads = {};",
            config.memory_limit, config.threads
        ))?;
        info!("opened analytical store at {}", config.database_path);
        Ok(Self { conn })
    }

    /// Open with default session settings. Used by tests and tooling.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Connection::open(path.as_ref())?,
        })
    }

    /// Read-only handle for the monitoring service. Fails if another process
    /// holds the file exclusively.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let config = Config::default().access_mode(AccessMode::ReadOnly)?;
        Ok(Self {
            conn: Connection::open_with_flags(path.as_ref(), config)?,
        })
    }

    /// Idempotent schema initialisation: schemas, ledger tables, sequences
    /// and indexes.
    pub fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(INIT_SQL)?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn begin(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Scoped transaction helper: commits on success, rolls back on any error
    /// path and returns the original error.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Self) -> Result<T, StoreError>,
    {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    debug!("rollback after failure also failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    /// Current bronze columns for an exchange as `(name, data_type)` pairs in
    /// ordinal order, or an empty vec when the table does not exist yet.
    pub fn bronze_columns(&self, exchange: Exchange) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = 'bronze' AND table_name = ? \
             ORDER BY ordinal_position",
        )?;
        let rows = stmt.query_map(params![exchange.bronze_table()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row?);
        }
        Ok(columns)
    }

    /// Pin or widen the bronze table for one source file and return the
    /// effective insert schema in the file's header order.
    ///
    /// First file of an exchange: the sniffed schema becomes the table.
    /// Later files: existing columns keep their pinned types; columns new to
    /// this file are added nullable (union by name).
    pub fn resolve_bronze_schema(
        &self,
        exchange: Exchange,
        headers: &StringRecord,
        sample: &[StringRecord],
    ) -> Result<TableSchema, StoreError> {
        let sniffed = TableSchema::infer(headers, sample);
        let table = exchange.bronze_table();
        let existing = self.bronze_columns(exchange)?;

        if existing.is_empty() {
            let mut columns_sql: Vec<String> = sniffed
                .columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql()))
                .collect();
            columns_sql.extend([
                "data_date DATE".to_string(),
                "exchange VARCHAR".to_string(),
                "source_file VARCHAR".to_string(),
                "ingestion_timestamp TIMESTAMP".to_string(),
            ]);
            self.conn.execute_batch(&format!(
                "CREATE TABLE bronze.{table} ({})",
                columns_sql.join(", ")
            ))?;
            info!(
                "pinned bronze.{table} with {} data columns",
                sniffed.columns.len()
            );
            return Ok(sniffed);
        }

        let mut effective = Vec::with_capacity(sniffed.columns.len());
        for descriptor in &sniffed.columns {
            let pinned = existing
                .iter()
                .find(|(name, _)| name == &descriptor.name)
                .map(|(_, data_type)| ColumnType::from_sql(data_type));
            match pinned {
                Some(column_type) => effective.push(ColumnDescriptor {
                    name: descriptor.name.clone(),
                    column_type,
                }),
                None => {
                    self.conn.execute_batch(&format!(
                        "ALTER TABLE bronze.{table} ADD COLUMN {} {}",
                        quote_ident(&descriptor.name),
                        descriptor.column_type.sql()
                    ))?;
                    info!(
                        "widened bronze.{table} with new column {:?}",
                        descriptor.name
                    );
                    effective.push(descriptor.clone());
                }
            }
        }
        Ok(TableSchema { columns: effective })
    }

    /// Insert one batch of decoded records with the metadata augmentation.
    /// `first_row_number` is the 1-based position of `rows[0]` in the source
    /// file, used for rejection context.
    pub fn insert_batch(
        &self,
        exchange: Exchange,
        schema: &TableSchema,
        rows: &[StringRecord],
        meta: &RowMeta,
        first_row_number: u64,
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = exchange.bronze_table();
        let mut column_list: Vec<String> = schema
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();
        column_list.extend(META_COLUMNS.iter().map(|c| c.to_string()));

        let mut placeholders: Vec<&str> = vec!["?"; schema.columns.len()];
        placeholders.extend(["CAST(? AS DATE)", "?", "?", "CAST(? AS TIMESTAMP)"]);

        let sql = format!(
            "INSERT INTO bronze.{table} ({}) VALUES ({})",
            column_list.join(", "),
            placeholders.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;

        for (offset, row) in rows.iter().enumerate() {
            let mut values = Vec::with_capacity(schema.columns.len() + META_COLUMNS.len());
            for (index, descriptor) in schema.columns.iter().enumerate() {
                let cell = row.get(index).unwrap_or("");
                let value = convert_cell(cell, descriptor).map_err(|context| {
                    StoreError::DataMalformed {
                        context: format!("row {}: {context}", first_row_number + offset as u64),
                    }
                })?;
                values.push(value);
            }
            values.push(Value::Text(meta.data_date.format("%Y-%m-%d").to_string()));
            values.push(Value::Text(meta.exchange.code().to_string()));
            values.push(Value::Text(meta.source_file.clone()));
            values.push(Value::Text(
                meta.ingestion_timestamp
                    .format("%Y-%m-%d %H:%M:%S%.6f")
                    .to_string(),
            ));
            stmt.execute(params_from_iter(values)).map_err(|err| {
                StoreError::DataMalformed {
                    context: format!(
                        "row {}: {err}",
                        first_row_number + offset as u64
                    ),
                }
            })?;
        }
        Ok(rows.len() as u64)
    }

    /// Rows loaded from one source file, the cheap post-commit count.
    pub fn count_source_rows(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
        source_file: &str,
    ) -> Result<i64, StoreError> {
        if self.bronze_columns(exchange)?.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT count(*) FROM bronze.{} \
             WHERE data_date = CAST(? AS DATE) AND exchange = ? AND source_file = ?",
            exchange.bronze_table()
        );
        let count = self.conn.query_row(
            &sql,
            params![
                data_date.format("%Y-%m-%d").to_string(),
                exchange.code(),
                source_file
            ],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count)
    }

    /// Total bronze rows for `(exchange, date)`, any source file.
    pub fn bronze_row_count(
        &self,
        exchange: Exchange,
        data_date: NaiveDate,
    ) -> Result<i64, StoreError> {
        if self.bronze_columns(exchange)?.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT count(*) FROM bronze.{} WHERE data_date = CAST(? AS DATE)",
            exchange.bronze_table()
        );
        let count = self.conn.query_row(
            &sql,
            params![data_date.format("%Y-%m-%d").to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count)
    }
}
