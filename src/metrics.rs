// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metrics collection for Telepress compression analysis
//!
//! Tracks window outcomes, estimated storage sizes and match distances, and
//! scores the ratio/error trade-off with a weighted cost.

use crate::compressor::Emission;

/// Weights of the compression cost function
///
/// `cost = error * min(1, err / max_error) - ratio * (1 - min(1, 1 / compression_ratio))`
///
/// Lower is better: error raises the cost, compression lowers it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostWeights {
    /// Weight of the reconstruction error term (w1)
    pub error: f64,
    /// Weight of the compression term (w2)
    pub ratio: f64,
    /// Error at which the error term saturates
    pub max_error: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            error: 0.6,
            ratio: 0.4,
            max_error: 0.15,
        }
    }
}

/// Compression statistics collector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressionMetrics {
    /// Windows turned into records
    pub windows: u64,
    /// Samples covered by those records
    pub samples: u64,
    /// Windows resolved as references to an existing template
    pub matched: u64,
    /// Windows admitted as new templates
    pub new_templates: u64,
    /// Templates evicted from active matching under capacity pressure
    pub evictions: u64,
    /// Templates expired for idleness
    pub expirations: u64,
    /// Samples dropped as invalid
    pub invalid_samples: u64,
    /// Total raw bytes (before compression)
    pub raw_bytes: u64,
    /// Total encoded bytes (estimated record sizes)
    pub encoded_bytes: u64,
    /// Sum of match distances, for the mean
    pub match_distance_sum: f64,
}

impl CompressionMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one compressor emission
    pub fn record_emission(&mut self, emission: &Emission) {
        let record = &emission.record;
        self.windows += 1;
        self.samples += record.len as u64;
        self.raw_bytes += record.raw_size() as u64;
        self.encoded_bytes += record.encoded_size() as u64;
        if record.is_match() {
            self.matched += 1;
            self.match_distance_sum += emission.distance.unwrap_or(0.0);
        } else {
            self.new_templates += 1;
        }
        if emission.evicted.is_some() {
            self.evictions += 1;
        }
        self.expirations += emission.expired.len() as u64;
    }

    /// Record a dropped sample
    pub fn record_invalid(&mut self) {
        self.invalid_samples += 1;
    }

    /// Add another collector's counts to this one
    pub fn merge(&mut self, other: &CompressionMetrics) {
        self.windows += other.windows;
        self.samples += other.samples;
        self.matched += other.matched;
        self.new_templates += other.new_templates;
        self.evictions += other.evictions;
        self.expirations += other.expirations;
        self.invalid_samples += other.invalid_samples;
        self.raw_bytes += other.raw_bytes;
        self.encoded_bytes += other.encoded_bytes;
        self.match_distance_sum += other.match_distance_sum;
    }

    /// Calculate compression ratio (higher = better)
    /// Returns raw_size / encoded_size
    pub fn compression_ratio(&self) -> f64 {
        if self.encoded_bytes == 0 {
            return 1.0;
        }
        self.raw_bytes as f64 / self.encoded_bytes as f64
    }

    /// Calculate space savings percentage
    pub fn space_savings_percent(&self) -> f64 {
        if self.raw_bytes == 0 {
            return 0.0;
        }
        (1.0 - (self.encoded_bytes as f64 / self.raw_bytes as f64)) * 100.0
    }

    /// Fraction of windows resolved as references (0.0 - 1.0)
    pub fn match_rate(&self) -> f64 {
        if self.windows == 0 {
            return 0.0;
        }
        self.matched as f64 / self.windows as f64
    }

    /// Mean distance of matched windows
    pub fn mean_match_distance(&self) -> f64 {
        if self.matched == 0 {
            return 0.0;
        }
        self.match_distance_sum / self.matched as f64
    }

    /// Weighted cost of the current trade-off (lower = better)
    pub fn cost(&self, weights: &CostWeights) -> f64 {
        let error_term = if weights.max_error > 0.0 {
            (self.mean_match_distance() / weights.max_error).min(1.0)
        } else {
            0.0
        };
        let ratio_term = (1.0 / self.compression_ratio()).min(1.0);
        weights.error * error_term - weights.ratio * (1.0 - ratio_term)
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Generate a human-readable report
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Telepress Compression Metrics ===\n\n");

        report.push_str(&format!("Windows processed: {}\n", self.windows));
        report.push_str(&format!("Samples covered: {}\n", self.samples));
        report.push_str(&format!("Raw bytes: {} bytes\n", self.raw_bytes));
        report.push_str(&format!("Encoded bytes: {} bytes\n", self.encoded_bytes));
        report.push_str(&format!(
            "Compression ratio: {:.2}x\n",
            self.compression_ratio()
        ));
        report.push_str(&format!(
            "Space savings: {:.1}%\n\n",
            self.space_savings_percent()
        ));

        report.push_str(&format!(
            "Matched: {} ({:.1}%)\n",
            self.matched,
            self.match_rate() * 100.0
        ));
        report.push_str(&format!("New templates: {}\n", self.new_templates));
        report.push_str(&format!("Evictions: {}\n", self.evictions));
        if self.expirations > 0 {
            report.push_str(&format!("Expired templates: {}\n", self.expirations));
        }
        report.push_str(&format!(
            "Mean match distance: {:.4}\n",
            self.mean_match_distance()
        ));
        if self.invalid_samples > 0 {
            report.push_str(&format!("Invalid samples: {}\n", self.invalid_samples));
        }
        report.push_str(&format!(
            "\nCost: {:.4}\n",
            self.cost(&CostWeights::default())
        ));

        report
    }
}
