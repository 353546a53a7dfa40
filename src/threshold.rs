// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Threshold controller
//!
//! Keeps each device's match rate inside a target band by nudging the
//! similarity threshold τ multiplicatively after every decision:
//!
//! - recent match distances above the error budget: tighten
//! - match rate below the band: loosen (more matches, more error)
//! - match rate above the band: tighten (fewer matches, less error)
//!
//! τ always stays within `[min, max]` and moves by at most `max_step`
//! (relative) per update.

use std::collections::VecDeque;

use crate::config::ThresholdConfig;

/// Next threshold from the current one and recent behavior
///
/// `recent_error` is the mean distance of recently matched windows, or
/// `None` if none matched.
pub fn adjust(
    tau: f64,
    match_rate: f64,
    recent_error: Option<f64>,
    config: &ThresholdConfig,
) -> f64 {
    let step = config.max_step.clamp(0.0, 1.0);
    let over_budget = recent_error.map_or(false, |e| e > config.error_budget);

    let factor = if over_budget || match_rate > config.target_high {
        1.0 - step
    } else if match_rate < config.target_low {
        1.0 + step
    } else {
        1.0
    };

    (tau * factor).clamp(config.min, config.max)
}

/// Result of one compressor decision, as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    /// Window resolved as a reference to an existing template
    pub matched: bool,
    /// Distance to the nearest template
    pub distance: f64,
}

/// Per-device threshold plus a rolling history of decisions
#[derive(Debug, Clone)]
pub struct ThresholdState {
    tau: f64,
    history: VecDeque<Outcome>,
    config: ThresholdConfig,
}

impl ThresholdState {
    /// Start at the configured initial threshold
    pub fn new(config: &ThresholdConfig) -> Self {
        Self::with_tau(config, config.initial)
    }

    /// Start at a given threshold (e.g. restored from storage)
    pub fn with_tau(config: &ThresholdConfig, tau: f64) -> Self {
        let tau = if tau.is_finite() { tau } else { config.initial };
        Self {
            tau: tau.clamp(config.min, config.max),
            history: VecDeque::with_capacity(config.history_len),
            config: config.clone(),
        }
    }

    /// Current threshold τ
    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Fraction of recent decisions that matched
    pub fn match_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let matched = self.history.iter().filter(|o| o.matched).count();
        matched as f64 / self.history.len() as f64
    }

    /// Mean distance of recent matched decisions
    pub fn recent_error(&self) -> Option<f64> {
        let (sum, count) = self
            .history
            .iter()
            .filter(|o| o.matched)
            .fold((0.0, 0usize), |(s, c), o| (s + o.distance, c + 1));
        (count > 0).then(|| sum / count as f64)
    }

    /// Record a decision and update τ; returns the new τ
    pub fn observe(&mut self, outcome: Outcome) -> f64 {
        if self.history.len() >= self.config.history_len.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(outcome);

        let next = adjust(
            self.tau,
            self.match_rate(),
            self.recent_error(),
            &self.config,
        );
        if next != self.tau {
            log::trace!("threshold {:.5} -> {:.5}", self.tau, next);
        }
        self.tau = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> ThresholdConfig {
        ThresholdConfig::default()
    }

    #[test]
    fn test_adjust_loosens_when_rate_low() {
        let tau = adjust(0.1, 0.2, None, &config());
        assert_relative_eq!(tau, 0.105, epsilon = 1e-12);
    }

    #[test]
    fn test_adjust_tightens_when_rate_high() {
        let tau = adjust(0.1, 0.95, Some(0.01), &config());
        assert_relative_eq!(tau, 0.095, epsilon = 1e-12);
    }

    #[test]
    fn test_adjust_holds_inside_band() {
        assert_eq!(adjust(0.1, 0.7, Some(0.05), &config()), 0.1);
    }

    #[test]
    fn test_adjust_tightens_over_error_budget() {
        // Low match rate would loosen, but the error budget wins
        let tau = adjust(0.3, 0.1, Some(0.2), &config());
        assert_relative_eq!(tau, 0.285, epsilon = 1e-12);
    }

    #[test]
    fn test_adjust_clamps() {
        let c = config();
        assert_eq!(adjust(c.max, 0.0, None, &c), c.max);
        assert_eq!(adjust(c.min, 1.0, None, &c), c.min);
    }

    #[test]
    fn test_tau_stays_bounded_over_long_histories() {
        let c = config();
        let mut state = ThresholdState::new(&c);
        for i in 0..10_000 {
            let matched = (i / 500) % 2 == 0;
            state.observe(Outcome {
                matched,
                distance: (i % 7) as f64 * 0.05,
            });
            assert!(state.tau() >= c.min && state.tau() <= c.max);
        }
    }

    #[test]
    fn test_step_is_bounded() {
        let c = config();
        let mut state = ThresholdState::new(&c);
        let mut prev = state.tau();
        for i in 0..200 {
            let tau = state.observe(Outcome {
                matched: i % 3 == 0,
                distance: 0.01,
            });
            assert!(tau <= prev * (1.0 + c.max_step) + 1e-12);
            assert!(tau >= prev * (1.0 - c.max_step) - 1e-12);
            prev = tau;
        }
    }

    #[test]
    fn test_rolling_history() {
        let c = ThresholdConfig {
            history_len: 4,
            ..config()
        };
        let mut state = ThresholdState::new(&c);
        for _ in 0..4 {
            state.observe(Outcome {
                matched: false,
                distance: 1.0,
            });
        }
        assert_eq!(state.match_rate(), 0.0);
        assert_eq!(state.recent_error(), None);

        for _ in 0..2 {
            state.observe(Outcome {
                matched: true,
                distance: 0.02,
            });
        }
        assert_eq!(state.match_rate(), 0.5);
        assert_relative_eq!(state.recent_error().unwrap(), 0.02, epsilon = 1e-12);
    }

    #[test]
    fn test_restored_tau_is_clamped() {
        let c = config();
        assert_eq!(ThresholdState::with_tau(&c, 50.0).tau(), c.max);
        assert_eq!(ThresholdState::with_tau(&c, f64::NAN).tau(), c.initial);
    }
}
