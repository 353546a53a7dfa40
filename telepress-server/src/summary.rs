// Telepress Server - Ingest service, HTTP export and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-device archive statistics, computed from the store.

use serde::Serialize;
use telepress::{DeviceId, Store, StoreError};

/// What the store holds for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    /// Templates ever admitted, evicted ones included
    pub templates: usize,
    /// Templates still in the active dictionary
    pub active_templates: usize,
    pub records: usize,
    pub matched: usize,
    pub samples: usize,
    /// Persisted similarity threshold
    pub threshold: Option<f64>,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    pub raw_bytes: u64,
    pub encoded_bytes: u64,
}

impl DeviceSummary {
    /// Read a device's summary from the store.
    pub fn from_store<S: Store + ?Sized>(store: &S, device: &DeviceId) -> Result<Self, StoreError> {
        let records = store.records(device, None)?;
        Ok(Self {
            device_id: device.clone(),
            templates: store.templates(device, false)?.len(),
            active_templates: store.templates(device, true)?.len(),
            records: records.len(),
            matched: records.iter().filter(|r| r.is_match()).count(),
            samples: records.iter().map(|r| r.len).sum(),
            threshold: store.threshold(device)?,
            first_timestamp: records.first().map(|r| r.span.start),
            last_timestamp: records.last().map(|r| r.span.end),
            raw_bytes: records.iter().map(|r| r.raw_size() as u64).sum(),
            encoded_bytes: records.iter().map(|r| r.encoded_size() as u64).sum(),
        })
    }

    /// Raw size over encoded size.
    pub fn compression_ratio(&self) -> f64 {
        if self.encoded_bytes == 0 {
            return 1.0;
        }
        self.raw_bytes as f64 / self.encoded_bytes as f64
    }

    /// Fraction of records that reference an existing template.
    pub fn match_rate(&self) -> f64 {
        if self.records == 0 {
            return 0.0;
        }
        self.matched as f64 / self.records as f64
    }
}

/// Summaries of every device in the store.
pub fn summarize<S: Store + ?Sized>(store: &S) -> Result<Vec<DeviceSummary>, StoreError> {
    store
        .devices()?
        .iter()
        .map(|device| DeviceSummary::from_store(store, device))
        .collect()
}
