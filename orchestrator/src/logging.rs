// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise logging to stdout plus a per-run file under `./logs/`.
/// Library crates log through the `log` facade; the subscriber's bridge
/// carries those records too. Returns the log file path for the banner.
pub fn init(verbose: bool) -> std::io::Result<PathBuf> {
    let logs_dir = PathBuf::from("logs");
    fs::create_dir_all(&logs_dir)?;
    let path = logs_dir.join(format!(
        "january_load_simple_{}.log",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    let file = fs::File::create(&path)?;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .init();

    Ok(path)
}
