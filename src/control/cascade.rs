//! Two-loop cascade controller
//!
//! ```text
//!  target FE ──►┌───────┐ entropy  ┌───────┐ raw   ┌──────┐
//!               │ outer │─────────►│ inner │──────►│ tanh │──► rate
//!  current FE ─►└───────┘ setpoint └───────┘       └──────┘
//!                          current entropy ─┘
//! ```
//!
//! The outer loop follows slow network-wide drift (free energy), the inner
//! loop follows this client's short-term disagreement with its peers
//! (entropy). Both loops are [`FeedbackController`]s; the inner loop's
//! multiplier is centred on zero before the `tanh` shaping.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::control::pid::{FeedbackController, Gains, RateBounds};
use crate::constants::{CASCADE_TANH_SCALE, ENTROPY_RANGE, FREE_ENERGY_RANGE};

/// Gain sets for both loops, swapped in as a whole
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlParameters {
    pub inner_loop: Gains,
    pub outer_loop: Gains,
}

impl Default for ControlParameters {
    fn default() -> Self {
        Self {
            inner_loop: Gains::new(1.0, 0.1, 0.05),
            outer_loop: Gains::new(0.5, 0.05, 0.01),
        }
    }
}

/// Snapshot of one cascade computation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeMetrics {
    pub entropy_error: f64,
    pub free_energy_error: f64,
    pub entropy_output: f64,
    pub free_energy_output: f64,
    pub entropy_integral: f64,
    pub free_energy_integral: f64,
    pub entropy_derivative: f64,
    pub free_energy_derivative: f64,
}

/// Result of [`CascadeController::compute`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeOutput {
    pub rate: f64,
    pub metrics: CascadeMetrics,
}

/// Outer free-energy loop driving an inner entropy loop
#[derive(Debug, Clone)]
pub struct CascadeController {
    params: ControlParameters,
    outer: FeedbackController,
    inner: FeedbackController,
    scale: f64,
    metrics: CascadeMetrics,
}

impl CascadeController {
    pub fn new(params: ControlParameters) -> Self {
        Self {
            params,
            outer: FeedbackController::new(params.outer_loop),
            inner: FeedbackController::new(params.inner_loop),
            scale: CASCADE_TANH_SCALE,
            metrics: CascadeMetrics::default(),
        }
    }

    /// Override the `tanh` input scale
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn compute(
        &mut self,
        target_free_energy: f64,
        current_free_energy: f64,
        current_entropy: f64,
    ) -> CascadeOutput {
        self.compute_at(
            target_free_energy,
            current_free_energy,
            current_entropy,
            Instant::now(),
        )
    }

    /// Run both loops as of `now`
    ///
    /// Inputs outside their ranges are clamped. The returned rate is always
    /// within the default rate bounds.
    pub fn compute_at(
        &mut self,
        target_free_energy: f64,
        current_free_energy: f64,
        current_entropy: f64,
        now: Instant,
    ) -> CascadeOutput {
        let target = clamp_input(target_free_energy, FREE_ENERGY_RANGE);
        let free_energy = clamp_input(current_free_energy, FREE_ENERGY_RANGE);
        let entropy = clamp_input(current_entropy, ENTROPY_RANGE);

        let outer_rate = self.outer.compute_at(target, free_energy, now);
        let entropy_setpoint = clamp_input(outer_rate, ENTROPY_RANGE);

        let inner_rate = self.inner.compute_at(entropy_setpoint, entropy, now);
        let raw_adjustment = inner_rate - 1.0;

        let rate = RateBounds::DEFAULT.clamp(1.0 + (raw_adjustment * self.scale).tanh());

        let outer_terms = self.outer.terms();
        let inner_terms = self.inner.terms();
        self.metrics = CascadeMetrics {
            entropy_error: entropy_setpoint - entropy,
            free_energy_error: target - free_energy,
            entropy_output: inner_rate,
            free_energy_output: outer_rate,
            entropy_integral: inner_terms.integral,
            free_energy_integral: outer_terms.integral,
            entropy_derivative: inner_terms.derivative,
            free_energy_derivative: outer_terms.derivative,
        };

        CascadeOutput {
            rate,
            metrics: self.metrics,
        }
    }

    /// Metrics from the last compute
    pub fn metrics(&self) -> CascadeMetrics {
        self.metrics
    }

    pub fn params(&self) -> ControlParameters {
        self.params
    }

    /// Reset both loops and clear cached metrics
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.outer.reset_at(now);
        self.inner.reset_at(now);
        self.metrics = CascadeMetrics::default();
    }
}

impl Default for CascadeController {
    fn default() -> Self {
        Self::new(ControlParameters::default())
    }
}

/// Clamp into `(lo, hi)`, sending NaN to the lower edge
fn clamp_input(value: f64, (lo, hi): (f64, f64)) -> f64 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_balanced_network_holds_rate() {
        let start = Instant::now();
        let mut cascade = CascadeController::default();
        cascade.reset();

        // Outer loop at rest yields multiplier 1.0 → entropy setpoint 1.0.
        let out = cascade.compute_at(0.0, 0.0, 1.0, start + Duration::from_millis(100));
        assert!((out.rate - 1.0).abs() < 1e-9);
        assert_eq!(out.metrics.free_energy_error, 0.0);
        assert_eq!(out.metrics.entropy_error, 0.0);
    }

    #[test]
    fn test_low_entropy_speeds_up() {
        let mut cascade = CascadeController::default();
        let out = cascade.compute(0.0, 0.0, 0.0);
        assert!(out.rate > 1.0);
        assert!(out.rate <= 2.0);
        assert!(out.metrics.entropy_error > 0.0);
    }

    #[test]
    fn test_inputs_are_clamped() {
        let mut a = CascadeController::default();
        let mut b = CascadeController::default();
        let now = Instant::now() + Duration::from_millis(50);
        a.reset_for_test(now - Duration::from_millis(50));
        b.reset_for_test(now - Duration::from_millis(50));

        let wild = a.compute_at(100.0, -100.0, 7.0, now);
        let tame = b.compute_at(2.0, -2.0, 1.0, now);
        assert_eq!(wild, tame);
    }

    #[test]
    fn test_reset_clears_metrics() {
        let mut cascade = CascadeController::default();
        cascade.compute(1.0, -1.0, 0.2);
        cascade.reset();
        cascade.reset();
        assert_eq!(cascade.metrics(), CascadeMetrics::default());
        assert_eq!(cascade.outer.terms().integral, 0.0);
        assert_eq!(cascade.inner.previous_error(), 0.0);
    }

    impl CascadeController {
        fn reset_for_test(&mut self, at: Instant) {
            self.outer.reset_at(at);
            self.inner.reset_at(at);
            self.metrics = CascadeMetrics::default();
        }
    }

    proptest! {
        #[test]
        fn prop_rate_always_in_bounds(
            target in prop::num::f64::ANY,
            fe in prop::num::f64::ANY,
            entropy in prop::num::f64::ANY,
            steps in 1usize..20,
        ) {
            let start = Instant::now();
            let mut cascade = CascadeController::default();
            cascade.reset_for_test(start);
            for i in 1..=steps {
                let now = start + Duration::from_millis(10 * i as u64);
                let out = cascade.compute_at(target, fe, entropy, now);
                prop_assert!(out.rate >= 0.5 && out.rate <= 2.0, "rate {}", out.rate);
            }
        }
    }
}
