// Telepress Server - Ingest service, HTTP export and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the ingest service.
//!
//! All metrics live in the default registry and are rendered by
//! [`encode_metrics`] for the `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Encoder, Gauge, GaugeVec, TextEncoder,
};
use telepress::{DeviceId, Emission};

use crate::error::ServerError;

lazy_static! {
    // ============================================================
    // Compression
    // ============================================================

    /// Windows turned into records, by kind (`new_template`, `matched`).
    pub static ref WINDOWS_TOTAL: CounterVec = register_counter_vec!(
        "telepress_windows_total",
        "Windows compressed, by record kind",
        &["kind"]
    ).unwrap();

    /// Templates removed from active dictionaries, by reason (`capacity`, `idle`).
    pub static ref EVICTIONS_TOTAL: CounterVec = register_counter_vec!(
        "telepress_evictions_total",
        "Templates evicted from a device dictionary",
        &["device", "reason"]
    ).unwrap();

    /// Samples rejected as invalid.
    pub static ref INVALID_SAMPLES_TOTAL: CounterVec = register_counter_vec!(
        "telepress_invalid_samples_total",
        "Samples dropped as invalid",
        &["device"]
    ).unwrap();

    /// Bytes the raw samples would take.
    pub static ref RAW_BYTES_TOTAL: Counter = register_counter!(
        "telepress_raw_bytes_total",
        "Estimated size of the raw samples"
    ).unwrap();

    /// Bytes of the emitted records.
    pub static ref ENCODED_BYTES_TOTAL: Counter = register_counter!(
        "telepress_encoded_bytes_total",
        "Estimated size of the emitted records"
    ).unwrap();

    // ============================================================
    // Per-device controller state
    // ============================================================

    /// Current similarity threshold τ.
    pub static ref THRESHOLD: GaugeVec = register_gauge_vec!(
        "telepress_threshold",
        "Current similarity threshold per device",
        &["device"]
    ).unwrap();

    /// Recent match rate (0-1).
    pub static ref MATCH_RATE: GaugeVec = register_gauge_vec!(
        "telepress_match_rate",
        "Recent match rate per device (0-1)",
        &["device"]
    ).unwrap();

    // ============================================================
    // Service
    // ============================================================

    /// Devices with a running compression task.
    pub static ref ACTIVE_DEVICES: Gauge = register_gauge!(
        "telepress_active_devices",
        "Devices with a running compression task"
    ).unwrap();

    /// Store writes retried after a transient failure.
    pub static ref PERSIST_RETRIES_TOTAL: Counter = register_counter!(
        "telepress_persist_retries_total",
        "Store writes retried after a transient failure"
    ).unwrap();

    /// Op batches written to the store.
    pub static ref PERSISTED_BATCHES_TOTAL: Counter = register_counter!(
        "telepress_persisted_batches_total",
        "Op batches written to the store"
    ).unwrap();
}

/// Record kind label for an emission.
pub fn kind_label(emission: &Emission) -> &'static str {
    if emission.record.is_match() {
        "matched"
    } else {
        "new_template"
    }
}

/// Update metrics from one emission.
pub fn record_emission(emission: &Emission, match_rate: f64) {
    let device = emission.record.device_id.as_str();
    WINDOWS_TOTAL.with_label_values(&[kind_label(emission)]).inc();
    if emission.evicted.is_some() {
        EVICTIONS_TOTAL
            .with_label_values(&[device, "capacity"])
            .inc();
    }
    if !emission.expired.is_empty() {
        EVICTIONS_TOTAL
            .with_label_values(&[device, "idle"])
            .inc_by(emission.expired.len() as f64);
    }
    RAW_BYTES_TOTAL.inc_by(emission.record.raw_size() as f64);
    ENCODED_BYTES_TOTAL.inc_by(emission.record.encoded_size() as f64);
    THRESHOLD
        .with_label_values(&[device])
        .set(emission.updated_threshold);
    MATCH_RATE.with_label_values(&[device]).set(match_rate);
}

/// Count a rejected sample.
pub fn record_invalid(device: &DeviceId) {
    INVALID_SAMPLES_TOTAL
        .with_label_values(&[device.as_str()])
        .inc();
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> Result<String, ServerError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| ServerError::Task(e.to_string()))
}
