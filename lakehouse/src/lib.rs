// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Embedded analytical store: bronze fact tables, ledger tables and gold
//! aggregates in one DuckDB file, plus the streaming bulk loader.

pub mod load;
pub mod schema;
pub mod store;

pub use load::{bulk_load, LoadOutcome, DEFAULT_BATCH_SIZE, SCHEMA_SAMPLE_SIZE};
pub use schema::{ColumnDescriptor, ColumnType, TableSchema};
pub use store::{LakeStore, RowMeta, StoreError, META_COLUMNS};
