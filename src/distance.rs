// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Distance evaluator
//!
//! Dissimilarity between a candidate window and a reference (template)
//! window. Differences are divided by a scale taken from the reference so
//! that scores are comparable across devices with different units:
//!
//! - the reference's peak-to-peak range, when it is not flat
//! - otherwise its mean absolute value
//! - otherwise 1.0 (absolute units around zero)

use serde::{Deserialize, Serialize};

use crate::error::DistanceError;

/// Below this a range or magnitude is treated as zero
const FLAT_EPSILON: f64 = 1e-9;

/// Distance formula applied between two equal-length windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Root mean square difference divided by the reference scale
    #[default]
    RangeScaledRms,
    /// Mean absolute difference divided by the reference scale
    RangeScaledMae,
}

impl DistanceMetric {
    /// Distance between `candidate` and `reference`
    ///
    /// Pure and deterministic. Fails with `LengthMismatch` when the two
    /// windows differ in length.
    pub fn distance(&self, candidate: &[f64], reference: &[f64]) -> Result<f64, DistanceError> {
        if candidate.len() != reference.len() {
            return Err(DistanceError::LengthMismatch {
                left: candidate.len(),
                right: reference.len(),
            });
        }
        if candidate.is_empty() {
            return Ok(0.0);
        }

        let n = candidate.len() as f64;
        let diffs = candidate.iter().zip(reference).map(|(a, b)| a - b);
        let raw = match self {
            DistanceMetric::RangeScaledRms => (diffs.map(|d| d * d).sum::<f64>() / n).sqrt(),
            DistanceMetric::RangeScaledMae => diffs.map(f64::abs).sum::<f64>() / n,
        };

        Ok(raw / reference_scale(reference))
    }
}

/// Normalization scale derived from the reference window
pub fn reference_scale(reference: &[f64]) -> f64 {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    let mut abs_sum = 0.0;
    for &v in reference {
        lo = lo.min(v);
        hi = hi.max(v);
        abs_sum += v.abs();
    }

    let range = hi - lo;
    if range > FLAT_EPSILON {
        return range;
    }
    let magnitude = abs_sum / reference.len().max(1) as f64;
    if magnitude > FLAT_EPSILON {
        magnitude
    } else {
        1.0
    }
}

/// Distance with the default metric
pub fn distance(candidate: &[f64], reference: &[f64]) -> Result<f64, DistanceError> {
    DistanceMetric::default().distance(candidate, reference)
}
