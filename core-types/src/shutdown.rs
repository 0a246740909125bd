// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Cooperative shutdown across processes: a rendezvous file plus in-process
//! signal handling, both funnelled into one cancellation token.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Rendezvous flag shared with every other actor on the same host.
pub const DEFAULT_FLAG_PATH: &str = "./shutdown_load_january.flag";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The rendezvous file. Existence means "stop at the next safe point".
///
/// The file is never removed by a running job; it persists until an explicit
/// resume (CLI `--remove-shutdown-file` or the dashboard's resume control) so
/// that later invocations also observe it.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    path: PathBuf,
}

impl ShutdownFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn at_default_path() -> Self {
        Self::new(DEFAULT_FLAG_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn create(&self) -> io::Result<()> {
        std::fs::write(
            &self.path,
            format!("Shutdown requested at {}\n", Utc::now().to_rfc3339()),
        )
    }

    /// Remove the flag. Returns whether a file was actually deleted.
    pub fn remove(&self) -> io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::at_default_path()
    }
}

/// Cancellation token observed at worker transaction boundaries.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Wires the rendezvous file and process signals to a shared token.
pub struct ShutdownCoordinator {
    flag: ShutdownFlag,
    token: ShutdownToken,
}

impl ShutdownCoordinator {
    pub fn new(flag: ShutdownFlag) -> Self {
        Self {
            flag,
            token: ShutdownToken::new(),
        }
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    pub fn flag(&self) -> &ShutdownFlag {
        &self.flag
    }

    /// Spawn the file watcher and signal handlers. Watcher tasks only set the
    /// token; the process never exits from inside a handler.
    pub fn spawn_watchers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.spawn_file_watch()];
        handles.push(self.spawn_signal_watch());
        handles
    }

    fn spawn_file_watch(&self) -> JoinHandle<()> {
        let flag = self.flag.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    return;
                }
                if flag.exists() {
                    info!(
                        "shutdown requested via rendezvous file {}",
                        flag.path().display()
                    );
                    token.cancel();
                    return;
                }
                sleep(POLL_INTERVAL).await;
            }
        })
    }

    fn spawn_signal_watch(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(err) = wait_for_signal().await {
                warn!("signal handler unavailable: {err}");
                return;
            }
            info!("shutdown requested via signal; finishing the current transaction first");
            token.cancel();
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn flag_creates_and_removes_idempotently() {
        let dir = tempdir().unwrap();
        let flag = ShutdownFlag::new(dir.path().join("stop.flag"));
        assert!(!flag.exists());
        assert!(!flag.remove().unwrap());

        flag.create().unwrap();
        assert!(flag.exists());
        // Creating again overwrites rather than failing.
        flag.create().unwrap();

        assert!(flag.remove().unwrap());
        assert!(!flag.exists());
    }

    #[test]
    fn token_latches() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn file_watch_fires_once_and_leaves_the_flag() {
        let dir = tempdir().unwrap();
        let flag = ShutdownFlag::new(dir.path().join("stop.flag"));
        let coordinator = ShutdownCoordinator::new(flag.clone());
        let token = coordinator.token();

        let watcher = coordinator.spawn_file_watch();
        flag.create().unwrap();
        watcher.await.unwrap();

        assert!(token.is_cancelled());
        // The watcher must not consume the rendezvous file.
        assert!(flag.exists());
    }
}
