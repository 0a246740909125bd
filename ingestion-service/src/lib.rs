// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Per-date, per-exchange ingestion: the worker that loads one source file
//! atomically and the runner that walks the exchange list for a date.

pub mod runner;
pub mod worker;

pub use runner::{JobRunner, RunSummary};
pub use worker::IngestionWorker;
