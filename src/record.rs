// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Templates, compact records and reconstructed samples
//!
//! Exactly one [`CompactRecord`] is emitted per processed window. A record
//! either carries the window verbatim (it becomes a new template) or
//! references an existing template plus an optional quantized residual.

use serde::{Deserialize, Serialize};

use crate::sample::{DeviceId, TemplateId, TimeSpan, Window};

/// Bytes per raw sample (timestamp + f64 value)
pub const RAW_SAMPLE_SIZE: usize = 16;

/// Fixed bytes per record (kind, seq, span, len, template id)
pub const RECORD_HEADER_SIZE: usize = 1 + 8 + 16 + 2 + 4;

/// A representative window stored in a device's dictionary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Template identifier
    pub id: TemplateId,
    /// Owning device
    pub device_id: DeviceId,
    /// Stored values
    pub window: Window,
    /// Timestamp of the window that created it
    pub created_at: u64,
    /// Number of windows matched against it
    pub match_count: u64,
    /// Timestamp of the most recent match (creation time until matched)
    pub last_matched_at: u64,
}

impl Template {
    /// Create a template that has never been matched
    pub fn new(id: TemplateId, device_id: DeviceId, window: Window, created_at: u64) -> Self {
        Self {
            id,
            device_id,
            window,
            created_at,
            match_count: 0,
            last_matched_at: created_at,
        }
    }
}

/// Quantized per-sample correction added to a template on reconstruction
///
/// Each step is worth `1 / scale`; steps are clamped to the i16 range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Residual {
    /// Quantization factor (100 = two decimal places)
    pub scale: u32,
    /// Signed correction steps, one per window position
    pub steps: Vec<i16>,
}

impl Residual {
    /// Quantize `window - template`
    ///
    /// Returns `None` when residuals are disabled (`scale == 0`) or when
    /// every step rounds to zero.
    pub fn quantize(window: &[f64], template: &[f64], scale: u32) -> Option<Self> {
        if scale == 0 {
            return None;
        }
        let factor = scale as f64;
        let steps: Vec<i16> = window
            .iter()
            .zip(template)
            .map(|(w, t)| {
                let scaled = ((w - t) * factor).round();
                scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
            })
            .collect();

        if steps.iter().all(|&s| s == 0) {
            None
        } else {
            Some(Self { scale, steps })
        }
    }

    /// Correction value at each position
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        let factor = self.scale.max(1) as f64;
        self.steps.iter().map(move |&s| s as f64 / factor)
    }

    /// Template values with the correction applied
    pub fn apply(&self, template: &[f64]) -> Vec<f64> {
        template
            .iter()
            .zip(self.values().chain(std::iter::repeat(0.0)))
            .map(|(t, r)| t + r)
            .collect()
    }
}

/// The payload of a compact record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    /// Window stored verbatim; it becomes template `template_id`
    NewTemplate {
        template_id: TemplateId,
        window: Window,
    },
    /// Window resolved as a reference to an existing template
    MatchedReference {
        template_id: TemplateId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        residual: Option<Residual>,
    },
}

/// Durable compressed unit: one per processed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactRecord {
    /// Device the window belongs to
    pub device_id: DeviceId,
    /// Per-device sequence number, starting at 0
    pub seq: u64,
    /// First and last sample timestamps of the window
    pub span: TimeSpan,
    /// True number of samples (short trailing windows are padded)
    pub len: usize,
    /// Payload
    pub kind: RecordKind,
}

impl CompactRecord {
    /// Template created or referenced by this record
    pub fn template_id(&self) -> TemplateId {
        match self.kind {
            RecordKind::NewTemplate { template_id, .. }
            | RecordKind::MatchedReference { template_id, .. } => template_id,
        }
    }

    /// Whether the record references an existing template
    pub fn is_match(&self) -> bool {
        matches!(self.kind, RecordKind::MatchedReference { .. })
    }

    /// Estimated stored size in bytes
    pub fn encoded_size(&self) -> usize {
        let body = match &self.kind {
            RecordKind::NewTemplate { window, .. } => window.len() * 8,
            RecordKind::MatchedReference { residual, .. } => residual
                .as_ref()
                .map(|r| 4 + r.steps.len() * 2)
                .unwrap_or(0),
        };
        RECORD_HEADER_SIZE + body
    }

    /// Size of the raw samples this record stands for
    pub fn raw_size(&self) -> usize {
        self.len * RAW_SAMPLE_SIZE
    }
}

/// One sample of the approximated stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedSample {
    /// Device the sample belongs to
    pub device_id: DeviceId,
    /// Reconstructed timestamp
    pub timestamp: u64,
    /// Reconstructed value
    pub value: f64,
}
