// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Monitoring dashboard binary: serves the JSON API and shutdown controls
//! over the analytical store, falling back to the remote ledger while a job
//! runner holds the store file.

use std::process;
use std::sync::Arc;

use core_types::config::AppConfig;
use core_types::shutdown::ShutdownFlag;
use ledger::RemoteLedger;
use log::{error, info};
use metrics::IngestMetrics;
use monitor_service::MonitorService;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            process::exit(2);
        }
    };

    let remote = Arc::new(RemoteLedger::connect(config.remote.as_ref()).await);
    let service = Arc::new(MonitorService::new(
        config.lake.database_path.clone(),
        ShutdownFlag::at_default_path(),
        remote,
        Arc::new(IngestMetrics::new()),
    ));

    let addr = format!("{}:{}", config.dashboard.bind, config.dashboard.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind dashboard on {addr}: {err}");
            process::exit(1);
        }
    };
    info!("Dashboard available at http://{addr} (poll interval ~5s)");

    if let Err(err) = service.serve(listener).await {
        error!("dashboard stopped: {err}");
        process::exit(1);
    }
}
