// Telepress Server - Ingest service, HTTP export and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Server error type.

use telepress::{ConfigError, StoreError, TelepressError};

/// Errors raised by the ingest service, CSV ingest and CLI.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Telepress error: {0}")]
    Telepress(#[from] TelepressError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format at line {line}: {reason}")]
    InvalidFormat { line: u64, reason: String },

    #[error("Empty dataset")]
    EmptyDataset,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A device mailbox or the write queue was closed early
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServerError::Task(err.to_string())
    }
}
