// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for Telepress
//!
//! Every parameter can be set globally and overridden per device through
//! [`ConfigSet`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dictionary::EvictionPolicy;
use crate::distance::DistanceMetric;
use crate::error::ConfigError;
use crate::sample::DeviceId;

/// Default window length (W)
pub const DEFAULT_WINDOW_LEN: usize = 16;

/// Default dictionary capacity per device (K)
pub const DEFAULT_CAPACITY: usize = 32;

/// Default residual quantization (100 = 2 decimal places)
pub const DEFAULT_RESIDUAL_SCALE: u32 = 100;

/// Threshold controller parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Initial threshold τ₀
    pub initial: f64,
    /// Lower clamp τ_min
    pub min: f64,
    /// Upper clamp τ_max
    pub max: f64,
    /// Lower edge of the target match-rate band
    pub target_low: f64,
    /// Upper edge of the target match-rate band
    pub target_high: f64,
    /// Largest relative change per update (0.05 = ±5%)
    pub max_step: f64,
    /// Mean match distance above which τ is tightened
    pub error_budget: f64,
    /// Number of recent decisions the match rate is computed over
    pub history_len: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            initial: 0.1,
            min: 0.01,
            max: 1.0,
            target_low: 0.60,
            target_high: 0.85,
            max_step: 0.05,
            error_budget: 0.15,
            history_len: 10,
        }
    }
}

impl ThresholdConfig {
    /// Check ranges and ordering of the parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min > 0.0 && self.min <= self.max && self.max.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "threshold bounds must satisfy 0 < min <= max, got [{}, {}]",
                self.min, self.max
            )));
        }
        if !(self.min..=self.max).contains(&self.initial) {
            return Err(ConfigError::Invalid(format!(
                "initial threshold {} outside [{}, {}]",
                self.initial, self.min, self.max
            )));
        }
        if !(0.0 <= self.target_low && self.target_low <= self.target_high && self.target_high <= 1.0)
        {
            return Err(ConfigError::Invalid(format!(
                "target band [{}, {}] must lie within [0, 1]",
                self.target_low, self.target_high
            )));
        }
        if !(self.max_step > 0.0 && self.max_step < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "max_step {} must be in (0, 1)",
                self.max_step
            )));
        }
        if self.error_budget.is_nan() || self.error_budget <= 0.0 {
            return Err(ConfigError::Invalid("error_budget must be positive".to_string()));
        }
        if self.history_len == 0 {
            return Err(ConfigError::Invalid("history_len must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Per-stream codec configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Window length W
    pub window_len: usize,
    /// Dictionary capacity K
    pub capacity: usize,
    /// Distance formula
    pub metric: DistanceMetric,
    /// Eviction policy used when the dictionary is full
    pub eviction: EvictionPolicy,
    /// Threshold controller parameters
    pub threshold: ThresholdConfig,
    /// Residual quantization factor; 0 disables residuals
    pub residual_scale: u32,
    /// A timestamp jump larger than this closes the current window early
    pub max_gap_ms: Option<u64>,
    /// Templates not matched for longer than this expire on the next
    /// admission, even below capacity
    pub max_idle_ms: Option<u64>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            window_len: DEFAULT_WINDOW_LEN,
            capacity: DEFAULT_CAPACITY,
            metric: DistanceMetric::default(),
            eviction: EvictionPolicy::default(),
            threshold: ThresholdConfig::default(),
            residual_scale: DEFAULT_RESIDUAL_SCALE,
            max_gap_ms: None,
            max_idle_ms: None,
        }
    }
}

impl CodecConfig {
    /// Configuration with a specific window length and capacity
    pub fn with_window(window_len: usize, capacity: usize) -> Self {
        Self {
            window_len,
            capacity,
            ..Default::default()
        }
    }

    /// Set the initial threshold, widening the clamp range if needed
    pub fn initial_threshold(mut self, tau: f64) -> Self {
        self.threshold.initial = tau;
        self.threshold.min = self.threshold.min.min(tau);
        self.threshold.max = self.threshold.max.max(tau);
        self
    }

    /// Check all parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_len == 0 || self.window_len > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "window_len {} must be in 1..={}",
                self.window_len,
                u16::MAX
            )));
        }
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be at least 1".to_string()));
        }
        if self.max_idle_ms == Some(0) {
            return Err(ConfigError::Invalid("max_idle_ms must be positive".to_string()));
        }
        self.threshold.validate()
    }
}

/// Global configuration plus per-device overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSet {
    /// Applies to every device without an override
    pub global: CodecConfig,
    /// Full replacement configuration per device
    pub devices: HashMap<DeviceId, CodecConfig>,
}

impl ConfigSet {
    /// Create a set with only a global configuration
    pub fn new(global: CodecConfig) -> Self {
        Self {
            global,
            devices: HashMap::new(),
        }
    }

    /// Override the configuration of one device
    pub fn with_device(mut self, device: impl Into<DeviceId>, config: CodecConfig) -> Self {
        self.devices.insert(device.into(), config);
        self
    }

    /// Resolve the configuration for a device
    pub fn for_device(&self, device: &DeviceId) -> &CodecConfig {
        self.devices.get(device).unwrap_or(&self.global)
    }

    /// Validate the global configuration and every override
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.global.validate()?;
        for (device, config) in &self.devices {
            config
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("device {}: {}", device, e)))?;
        }
        Ok(())
    }

    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let set: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }
}
