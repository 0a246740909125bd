// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Failure taxonomy shared by every component of the pipeline.

use serde::{Deserialize, Serialize};

/// Classification of a failure, independent of the component that raised it.
///
/// Workers map component errors onto these kinds to decide the terminal
/// progress state: `NotFound` and `Cancelled` become `skipped`, everything
/// else that reaches the worker becomes `failed`. `RemoteDegraded` never
/// reaches a worker result; it is logged and surfaced on the dashboard only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    NotFound,
    TransientIo,
    DataMalformed,
    LedgerConflict,
    Cancelled,
    RemoteDegraded,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::TransientIo)
    }
}

/// Implemented by component error types so callers can classify without
/// matching on the concrete enum.
pub trait Classify {
    fn kind(&self) -> FailureKind;
}

/// Cap applied to error messages before they are persisted to the ledger.
pub const ERROR_MESSAGE_LIMIT: usize = 1000;

/// Truncate an error message for ledger storage.
pub fn abbreviate(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_LIMIT {
        return message.to_string();
    }
    let mut cut = ERROR_MESSAGE_LIMIT;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &message[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbreviate_caps_long_messages() {
        let long = "x".repeat(4096);
        let out = abbreviate(&long);
        assert!(out.chars().count() <= ERROR_MESSAGE_LIMIT + 1);
        assert!(out.ends_with('…'));
        assert_eq!(abbreviate("short"), "short");
    }

    #[test]
    fn abbreviate_respects_char_boundaries() {
        let long = "é".repeat(ERROR_MESSAGE_LIMIT);
        let out = abbreviate(&long);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn only_transient_io_retries() {
        assert!(FailureKind::TransientIo.is_retryable());
        assert!(!FailureKind::NotFound.is_retryable());
        assert!(!FailureKind::DataMalformed.is_retryable());
    }
}
