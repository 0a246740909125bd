// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Progress ledger with dual-write: the local analytical store is
//! authoritative, the remote relational store mirrors best-effort for
//! dashboards.

pub mod progress;
pub mod remote;
pub mod stats;

pub use progress::{ClaimOutcome, LedgerError, ProgressLedger};
pub use remote::{RemoteLedger, RemoteStatus};
pub use stats::OverviewRow;
