// Copyright (c) James Kassemi, SC, US. All rights reserved.
//! Prometheus counters for the ingestion process. hyper v1.+

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use core_types::types::{LoadStatus, WorkerResult};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;

pub struct IngestMetrics {
    registry: Registry,
    files_completed: IntCounter,
    files_failed: IntCounter,
    files_skipped: IntCounter,
    rows_loaded: IntCounter,
    active_files: IntGauge,
    uptime_seconds: IntGauge,
    start_time: Instant,
}

impl IngestMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let files_completed = IntCounter::with_opts(Opts::new(
            "ingest_files_completed_total",
            "Source files loaded to completion",
        ))
        .unwrap();
        let files_failed = IntCounter::with_opts(Opts::new(
            "ingest_files_failed_total",
            "Source files that ended in a failed progress record",
        ))
        .unwrap();
        let files_skipped = IntCounter::with_opts(Opts::new(
            "ingest_files_skipped_total",
            "Source files skipped (missing, idempotent or shutdown)",
        ))
        .unwrap();
        let rows_loaded = IntCounter::with_opts(Opts::new(
            "ingest_rows_total",
            "Rows inserted into bronze tables",
        ))
        .unwrap();
        let active_files = IntGauge::with_opts(Opts::new(
            "ingest_active_files",
            "Bulk loads currently in flight",
        ))
        .unwrap();
        let uptime_seconds = IntGauge::with_opts(Opts::new(
            "process_uptime_seconds",
            "Wall-clock seconds since the job runner started",
        ))
        .unwrap();
        for collector in [
            Box::new(files_completed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(files_failed.clone()),
            Box::new(files_skipped.clone()),
            Box::new(rows_loaded.clone()),
            Box::new(active_files.clone()),
            Box::new(uptime_seconds.clone()),
        ] {
            registry.register(collector).unwrap();
        }
        Self {
            registry,
            files_completed,
            files_failed,
            files_skipped,
            rows_loaded,
            active_files,
            uptime_seconds,
            start_time: Instant::now(),
        }
    }

    pub fn file_started(&self) {
        self.active_files.inc();
    }

    pub fn file_finished(&self) {
        self.active_files.dec();
    }

    pub fn record_result(&self, result: &WorkerResult) {
        match result.status {
            LoadStatus::Completed => {
                self.files_completed.inc();
                self.rows_loaded.inc_by(result.records_loaded);
            }
            LoadStatus::Failed => self.files_failed.inc(),
            LoadStatus::Skipped => self.files_skipped.inc(),
            LoadStatus::Started => {}
        }
    }

    pub fn files_completed(&self) -> u64 {
        self.files_completed.get()
    }

    pub fn files_failed(&self) -> u64 {
        self.files_failed.get()
    }

    pub fn files_skipped(&self) -> u64 {
        self.files_skipped.get()
    }

    pub fn rows_loaded(&self) -> u64 {
        self.rows_loaded.get()
    }

    /// Prometheus text exposition of this process's registry.
    pub fn render(&self) -> String {
        self.uptime_seconds
            .set(self.start_time.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            log::error!("metrics encoding failed: {err}");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    async fn handle(
        &self,
        _req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let body = self.render();
        let response = Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        Ok(response)
    }

    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        loop {
            let (socket, _) = listener.accept().await?;
            let io = TokioIo::new(socket);
            let metrics = self.clone();
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { metrics.handle(req).await }
            });
            tokio::spawn(async move {
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    log::debug!("metrics connection ended: {err:?}");
                }
            });
        }
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use core_types::types::Exchange;
    use std::time::Duration;

    fn result(status: LoadStatus, records: u64) -> WorkerResult {
        WorkerResult {
            exchange: Exchange::Lse,
            data_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            status,
            records_loaded: records,
            duration: Duration::from_secs(1),
            message: None,
        }
    }

    #[test]
    fn record_result_routes_by_status() {
        let metrics = IngestMetrics::new();
        metrics.record_result(&result(LoadStatus::Completed, 100));
        metrics.record_result(&result(LoadStatus::Skipped, 0));
        metrics.record_result(&result(LoadStatus::Failed, 0));
        assert_eq!(metrics.files_completed(), 1);
        assert_eq!(metrics.files_skipped(), 1);
        assert_eq!(metrics.files_failed(), 1);
        assert_eq!(metrics.rows_loaded(), 100);
    }

    #[test]
    fn render_emits_registered_series() {
        let metrics = IngestMetrics::new();
        metrics.record_result(&result(LoadStatus::Completed, 42));
        let text = metrics.render();
        assert!(text.contains("ingest_files_completed_total 1"));
        assert!(text.contains("ingest_rows_total 42"));
        assert!(text.contains("process_uptime_seconds"));
    }
}
