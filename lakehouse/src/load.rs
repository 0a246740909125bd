// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Streaming bulk load: drains a decoded source file into a bronze table in
//! batches, holding the store lock only for the synchronous insert of each
//! batch. Runs inside the caller's transaction; the caller owns commit and
//! rollback.

use std::sync::{Arc, Mutex};

use core_types::types::Exchange;
use csv_async::StringRecord;
use futures::StreamExt;
use log::debug;
use trth_source::CsvFile;

use crate::store::{LakeStore, RowMeta, StoreError};

pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Rows sampled from the head of the file for schema inference before any
/// insert happens.
pub const SCHEMA_SAMPLE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOutcome {
    pub rows: u64,
    pub batches: u64,
}

/// Stream every record of `file` into the exchange's bronze table with the
/// `meta` augmentation columns. Constant memory: at most one batch plus the
/// inference sample is resident at a time.
pub async fn bulk_load(
    store: &Arc<Mutex<LakeStore>>,
    exchange: Exchange,
    mut file: CsvFile,
    meta: RowMeta,
    batch_size: usize,
) -> Result<LoadOutcome, StoreError> {
    let batch_size = batch_size.max(1);
    let mut sample: Vec<StringRecord> = Vec::with_capacity(SCHEMA_SAMPLE_SIZE.min(1024));
    while sample.len() < SCHEMA_SAMPLE_SIZE {
        match file.records.next().await {
            Some(record) => sample.push(record?),
            None => break,
        }
    }

    let schema = {
        let store = store.lock().unwrap();
        store.resolve_bronze_schema(exchange, &file.headers, &sample)?
    };

    let mut outcome = LoadOutcome::default();
    let mut next_row_number: u64 = 1;

    for chunk in sample.chunks(batch_size) {
        let inserted = {
            let store = store.lock().unwrap();
            store.insert_batch(exchange, &schema, chunk, &meta, next_row_number)?
        };
        next_row_number += inserted;
        outcome.rows += inserted;
        outcome.batches += 1;
    }
    drop(sample);

    let mut batch: Vec<StringRecord> = Vec::with_capacity(batch_size);
    let mut finished = false;
    while !finished {
        match file.records.next().await {
            Some(record) => {
                batch.push(record?);
                if batch.len() < batch_size {
                    continue;
                }
            }
            None => finished = true,
        }
        if batch.is_empty() {
            break;
        }
        let inserted = {
            let store = store.lock().unwrap();
            store.insert_batch(exchange, &schema, &batch, &meta, next_row_number)?
        };
        next_row_number += inserted;
        outcome.rows += inserted;
        outcome.batches += 1;
        if outcome.batches % 64 == 0 {
            debug!(
                "{} {}: {} rows in {} batches so far",
                exchange, meta.data_date, outcome.rows, outcome.batches
            );
        }
        batch.clear();
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::GzipEncoder;
    use chrono::NaiveDate;
    use core_types::error::{Classify, FailureKind};
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use trth_source::{object_key, FileKind, LocalSource, SourceTrait};

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

    fn mid_january() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    fn scratch_store(dir: &tempfile::TempDir) -> Arc<Mutex<LakeStore>> {
        let store = LakeStore::open_path(dir.path().join("lake.duckdb")).unwrap();
        store.init().unwrap();
        Arc::new(Mutex::new(store))
    }

    #[tokio::test]
    async fn loads_every_row_across_batches() {
        let dir = tempdir().unwrap();
        let mut body = String::from("#RIC,Price,Volume\n");
        for i in 0..25 {
            body.push_str(&format!("VOD.L,68.{i:02},{}\n", 100 + i));
        }
        write_fixture(dir.path(), Exchange::Lse, mid_january(), &body).await;

        let source = LocalSource::new(dir.path());
        let file = source.open(Exchange::Lse, mid_january()).await.unwrap();
        let store = scratch_store(&dir);
        let meta = RowMeta::new(Exchange::Lse, mid_january(), file.uri.clone());
        let source_file = meta.source_file.clone();

        let outcome = bulk_load(&store, Exchange::Lse, file, meta, 10).await.unwrap();
        assert_eq!(outcome.rows, 25);
        assert!(outcome.batches >= 3);

        let store = store.lock().unwrap();
        assert_eq!(
            store
                .count_source_rows(Exchange::Lse, mid_january(), &source_file)
                .unwrap(),
            25
        );
    }

    #[tokio::test]
    async fn header_only_file_loads_zero_rows() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), Exchange::Cme, mid_january(), "#RIC,Price,Volume\n").await;

        let source = LocalSource::new(dir.path());
        let file = source.open(Exchange::Cme, mid_january()).await.unwrap();
        let store = scratch_store(&dir);
        let meta = RowMeta::new(Exchange::Cme, mid_january(), file.uri.clone());

        let outcome = bulk_load(&store, Exchange::Cme, file, meta, DEFAULT_BATCH_SIZE)
            .await
            .unwrap();
        assert_eq!(outcome.rows, 0);
        // The table is still pinned so the exchange counts as initialised.
        let store = store.lock().unwrap();
        assert!(!store.bronze_columns(Exchange::Cme).unwrap().is_empty());
    }

    #[tokio::test]
    async fn ragged_row_fails_the_load_with_context() {
        let dir = tempdir().unwrap();
        let body = "#RIC,Price,Volume\nVOD.L,68.42,1200\nBARC.L,2.61\n";
        write_fixture(dir.path(), Exchange::Nyq, mid_january(), body).await;

        let source = LocalSource::new(dir.path());
        let file = source.open(Exchange::Nyq, mid_january()).await.unwrap();
        let store = scratch_store(&dir);
        let meta = RowMeta::new(Exchange::Nyq, mid_january(), file.uri.clone());

        let err = bulk_load(&store, Exchange::Nyq, file, meta, DEFAULT_BATCH_SIZE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::DataMalformed);
    }
}
