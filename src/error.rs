// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Telepress
//!
//! Per-window failures (invalid samples, an empty dictionary) are recovered
//! locally by the compressor. Anything that indicates a broken invariant
//! (length mismatch, dangling template reference) is surfaced.

use thiserror::Error;

use crate::sample::{DeviceId, TemplateId};

/// Result type alias for Telepress operations
pub type Result<T> = std::result::Result<T, TelepressError>;

/// Main error type for Telepress operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelepressError {
    /// Rejected input sample
    #[error("Sample error: {0}")]
    Sample(#[from] SampleError),

    /// Distance evaluation error
    #[error("Distance error: {0}")]
    Distance(#[from] DistanceError),

    /// Template dictionary error
    #[error("Dictionary error: {0}")]
    Dictionary(#[from] DictionaryError),

    /// Reconstruction error
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),

    /// Persistence error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Failure while writing exported samples
    #[error("Export error: {0}")]
    Export(String),
}

/// Errors raised for malformed input samples
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    /// Value is NaN/infinite or the timestamp goes backwards
    #[error("Invalid sample for device {device} at {timestamp}: {reason}")]
    InvalidSample {
        device: DeviceId,
        timestamp: u64,
        reason: String,
    },
}

/// Errors raised by the distance evaluator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistanceError {
    /// The two windows do not have the same length
    #[error("Length mismatch: {left} vs {right} values")]
    LengthMismatch { left: usize, right: usize },
}

/// Errors raised by the template dictionary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DictionaryError {
    /// No template exists yet for this device
    #[error("Empty dictionary for device {device}")]
    EmptyDictionary { device: DeviceId },

    /// Template id is not active in the dictionary
    #[error("Unknown template {template_id} for device {device}")]
    UnknownTemplate {
        device: DeviceId,
        template_id: TemplateId,
    },

    /// Window length differs from the dictionary's window length
    #[error("Window length {actual} does not match dictionary window length {expected}")]
    WindowLength { expected: usize, actual: usize },
}

/// Errors raised while reconstructing a stream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// A record cites a template that storage does not know about
    #[error("Dangling reference: device {device} template {template_id}")]
    DanglingReference {
        device: DeviceId,
        template_id: TemplateId,
    },

    /// A record is internally inconsistent
    #[error("Malformed record {seq}: {reason}")]
    MalformedRecord { seq: u64, reason: String },
}

/// Errors raised by persistence adapters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The backend cannot accept writes right now
    #[error("Persistence unavailable: {reason}")]
    PersistenceUnavailable { reason: String },

    /// Snapshot or stored data failed validation
    #[error("Corrupt store data: {reason}")]
    Corrupt { reason: String },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// Whether retrying the same write may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::PersistenceUnavailable { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Errors related to configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A parameter is out of its valid range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
