// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Read-mostly monitoring surface over the ledger and aggregates, plus the
//! two shutdown controls. hyper v1.+
//!
//! The store file admits one read-write process or multiple read-only ones;
//! while a job runner holds it, every read falls back to the remote ledger
//! so dashboards never block ingestion.

use std::path::PathBuf;
use std::sync::Arc;

use core_types::shutdown::ShutdownFlag;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lakehouse::LakeStore;
use ledger::{stats, RemoteLedger, RemoteStatus};
use log::{debug, error, info};
use metrics::IngestMetrics;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const DEFAULT_ERROR_LIMIT: usize = 50;
const PROGRESS_LIMIT: usize = 50;
const STATS_LIMIT: usize = 30;
const RUNNING_WINDOW_MINUTES: i64 = 2;

pub struct MonitorService {
    lake_path: PathBuf,
    flag: ShutdownFlag,
    remote: Arc<RemoteLedger>,
    metrics: Arc<IngestMetrics>,
}

impl MonitorService {
    pub fn new(
        lake_path: impl Into<PathBuf>,
        flag: ShutdownFlag,
        remote: Arc<RemoteLedger>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            lake_path: lake_path.into(),
            flag,
            remote,
            metrics,
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            "monitoring service listening on {}",
            listener.local_addr()?
        );
        loop {
            let (socket, _) = listener.accept().await?;
            let io = TokioIo::new(socket);
            let service = self.clone();
            let handler = service_fn(move |req| {
                let service = service.clone();
                async move { service.route(req).await }
            });
            tokio::spawn(async move {
                if let Err(err) = http1::Builder::new().serve_connection(io, handler).await {
                    debug!("dashboard connection ended: {err:?}");
                }
            });
        }
    }

    async fn route(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let limit = query_limit(req.uri().query());

        let response = match (&method, path.as_str()) {
            (&Method::GET, "/api/overview") => json_response(StatusCode::OK, self.overview().await),
            (&Method::GET, "/api/progress_detail") => {
                json_response(StatusCode::OK, self.progress_detail().await)
            }
            (&Method::GET, "/api/errors") => json_response(
                StatusCode::OK,
                self.errors(limit.unwrap_or(DEFAULT_ERROR_LIMIT)).await,
            ),
            (&Method::GET, "/api/statistics") => {
                json_response(StatusCode::OK, self.statistics().await)
            }
            (&Method::GET, "/metrics") => text_response(self.metrics.render()),
            (&Method::POST, "/control/shutdown") => {
                json_response(StatusCode::OK, self.control_shutdown())
            }
            (&Method::POST, "/control/resume") => {
                json_response(StatusCode::OK, self.control_resume())
            }
            _ => json_response(
                StatusCode::NOT_FOUND,
                json!({"error": format!("no route for {method} {path}")}),
            ),
        };
        Ok(response)
    }

    /// Read-only handle on the store; unavailable while a writer process
    /// holds the file.
    fn open_lake(&self) -> Option<LakeStore> {
        match LakeStore::open_read_only(&self.lake_path) {
            Ok(store) => Some(store),
            Err(err) => {
                debug!("store unavailable for reads, using remote ledger: {err}");
                None
            }
        }
    }

    async fn overview(&self) -> Value {
        let shutdown_requested = self.flag.exists();
        let remote_status = self.remote.status();

        if let Some(store) = self.open_lake() {
            let overview = stats::overview(&store).unwrap_or_default();
            let recent = stats::daily_rows(&store, 10).unwrap_or_default();
            let is_running =
                stats::is_running(&store, RUNNING_WINDOW_MINUTES).unwrap_or(false);
            return json!({
                "overview": overview,
                "recent_stats": recent,
                "is_running": is_running,
                "shutdown_requested": shutdown_requested,
                "remote_status": remote_status.as_str(),
                "source": "lake",
                "last_updated": now_iso(),
            });
        }

        match self.remote.overview().await {
            Ok(overview) => {
                let recent = self.remote.daily_rows(10).await.unwrap_or_default();
                let is_running = self
                    .remote
                    .is_running(RUNNING_WINDOW_MINUTES as i32)
                    .await
                    .unwrap_or(false);
                json!({
                    "overview": overview,
                    "recent_stats": recent,
                    "is_running": is_running,
                    "shutdown_requested": shutdown_requested,
                    "remote_status": remote_status.as_str(),
                    "source": "remote",
                    "last_updated": now_iso(),
                })
            }
            Err(err) => unavailable(shutdown_requested, remote_status, err.to_string()),
        }
    }

    async fn progress_detail(&self) -> Value {
        if let Some(store) = self.open_lake() {
            let recent = stats::recent_progress(&store, PROGRESS_LIMIT).unwrap_or_default();
            let chart = stats::daily_rows(&store, 366).unwrap_or_default();
            return json!({
                "recent_progress": with_processing_seconds(recent),
                "daily_chart_data": chart,
                "source": "lake",
                "last_updated": now_iso(),
            });
        }
        match self.remote.recent_progress(PROGRESS_LIMIT as i64).await {
            Ok(recent) => {
                let chart = self.remote.daily_rows(366).await.unwrap_or_default();
                json!({
                    "recent_progress": with_processing_seconds(recent),
                    "daily_chart_data": chart,
                    "source": "remote",
                    "last_updated": now_iso(),
                })
            }
            Err(err) => json!({
                "recent_progress": [],
                "daily_chart_data": [],
                "error": err.to_string(),
                "last_updated": now_iso(),
            }),
        }
    }

    async fn errors(&self, limit: usize) -> Value {
        let failed = if let Some(store) = self.open_lake() {
            stats::failed_progress(&store, limit).unwrap_or_default()
        } else {
            match self.remote.failed_progress(limit as i64).await {
                Ok(rows) => rows,
                Err(err) => {
                    return json!({
                        "total_errors": 0,
                        "recent_errors": [],
                        "error": err.to_string(),
                        "last_updated": now_iso(),
                    })
                }
            }
        };
        json!({
            "total_errors": failed.len(),
            "recent_errors": failed,
            "last_updated": now_iso(),
        })
    }

    async fn statistics(&self) -> Value {
        if let Some(store) = self.open_lake() {
            let daily = stats::daily_rows(&store, STATS_LIMIT).unwrap_or_default();
            let weekly = stats::weekly_rows(&store, STATS_LIMIT).unwrap_or_default();
            return json!({
                "daily": daily,
                "weekly": weekly,
                "source": "lake",
                "last_updated": now_iso(),
            });
        }
        let daily = self.remote.daily_rows(STATS_LIMIT as i64).await.unwrap_or_default();
        let weekly = self
            .remote
            .weekly_rows(STATS_LIMIT as i64)
            .await
            .unwrap_or_default();
        json!({
            "daily": daily,
            "weekly": weekly,
            "source": "remote",
            "last_updated": now_iso(),
        })
    }

    /// Idempotently create the rendezvous file; the running job stops at its
    /// next transaction boundary.
    fn control_shutdown(&self) -> Value {
        if let Err(err) = self.flag.create() {
            error!("failed to create shutdown flag: {err}");
            return json!({
                "shutdown_requested": self.flag.exists(),
                "error": err.to_string(),
            });
        }
        info!("shutdown flag created via dashboard");
        json!({
            "shutdown_requested": true,
            "flag": self.flag.path().display().to_string(),
        })
    }

    /// Idempotently remove the rendezvous file so later invocations run.
    fn control_resume(&self) -> Value {
        match self.flag.remove() {
            Ok(removed) => {
                if removed {
                    info!("shutdown flag removed via dashboard");
                }
                json!({
                    "shutdown_requested": false,
                    "removed": removed,
                })
            }
            Err(err) => {
                error!("failed to remove shutdown flag: {err}");
                json!({
                    "shutdown_requested": self.flag.exists(),
                    "error": err.to_string(),
                })
            }
        }
    }
}

fn with_processing_seconds(rows: Vec<core_types::types::ProgressRecord>) -> Vec<Value> {
    rows.into_iter()
        .map(|row| {
            let seconds = row.processing_seconds();
            let mut value = serde_json::to_value(&row).unwrap_or_else(|_| json!({}));
            if let Some(object) = value.as_object_mut() {
                object.insert("processing_time_seconds".to_string(), json!(seconds));
            }
            value
        })
        .collect()
}

fn unavailable(shutdown_requested: bool, remote_status: RemoteStatus, error: String) -> Value {
    json!({
        "overview": [],
        "recent_stats": [],
        "is_running": false,
        "shutdown_requested": shutdown_requested,
        "remote_status": remote_status.as_str(),
        "error": error,
        "last_updated": now_iso(),
    })
}

fn query_limit(query: Option<&str>) -> Option<usize> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("limit="))
        .and_then(|raw| raw.parse().ok())
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn json_response(status: StatusCode, value: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn text_response(body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
