// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Core stream types: samples, device identifiers, time spans and windows

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SampleError;

/// Identifier of a template, unique and never reused within one device
pub type TemplateId = u32;

/// Identifier of a device (one independent telemetry stream)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new device identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single scalar reading from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Device that produced the reading
    pub device_id: DeviceId,
    /// Timestamp in milliseconds
    pub timestamp: u64,
    /// The measured value
    pub value: f64,
}

impl Sample {
    /// Create a new sample
    pub fn new(device_id: impl Into<DeviceId>, timestamp: u64, value: f64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            value,
        }
    }

    /// Reject non-finite values and timestamps that go backwards
    pub fn validate(&self, last_timestamp: Option<u64>) -> Result<(), SampleError> {
        if !self.value.is_finite() {
            return Err(self.invalid(format!("non-finite value {}", self.value)));
        }
        if let Some(last) = last_timestamp {
            if self.timestamp < last {
                return Err(self.invalid(format!(
                    "timestamp {} precedes previous {}",
                    self.timestamp, last
                )));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> SampleError {
        SampleError::InvalidSample {
            device: self.device_id.clone(),
            timestamp: self.timestamp,
            reason,
        }
    }
}

/// Inclusive range of timestamps covered by a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    /// First timestamp
    pub start: u64,
    /// Last timestamp
    pub end: u64,
}

impl TimeSpan {
    /// Create a span; `end` is raised to `start` if smaller
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Span covering a single instant
    pub fn at(timestamp: u64) -> Self {
        Self::new(timestamp, timestamp)
    }

    /// Span with no upper bound
    pub fn since(start: u64) -> Self {
        Self::new(start, u64::MAX)
    }

    /// Whether `timestamp` lies within the span
    pub fn contains(&self, timestamp: u64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    /// Whether the two spans share at least one instant
    pub fn overlaps(&self, other: &TimeSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Timestamp of position `index` when `len` samples are spread evenly
    pub fn spread(&self, index: usize, len: usize) -> u64 {
        if len <= 1 {
            return self.start;
        }
        let width = (self.end - self.start) as u128;
        self.start + (width * index as u128 / (len - 1) as u128) as u64
    }
}

/// Fixed-length run of consecutive values, the unit of comparison
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Window(Vec<f64>);

impl Window {
    /// Wrap values into a window
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the window holds no values
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the values
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    /// Extend a short window to `len` by repeating its last value
    pub fn padded(mut self, len: usize) -> Self {
        if let Some(&last) = self.0.last() {
            self.0.resize(len.max(self.0.len()), last);
        }
        self
    }
}

impl From<Vec<f64>> for Window {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}
