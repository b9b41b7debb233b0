//! Discrete-time PID feedback controller
//!
//! The controller turns a setpoint/measurement pair into a playback rate
//! multiplier around 1.0. Elapsed time is measured on the monotonic clock
//! between successive calls; tests drive it through [`FeedbackController::compute_at`]
//! with explicit instants.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::constants::{DEFAULT_MAX_RATE, DEFAULT_MIN_RATE};

/// Proportional, integral and derivative gains
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Gains {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

impl Default for Gains {
    fn default() -> Self {
        Self::new(1.0, 0.1, 0.05)
    }
}

/// Closed rate interval `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBounds {
    pub min: f64,
    pub max: f64,
}

impl RateBounds {
    /// The authoritative playback rate range
    pub const DEFAULT: RateBounds = RateBounds {
        min: DEFAULT_MIN_RATE,
        max: DEFAULT_MAX_RATE,
    };

    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Clamp a rate into range. NaN maps to 1.0.
    pub fn clamp(&self, rate: f64) -> f64 {
        if rate.is_nan() {
            return 1.0_f64.clamp(self.min, self.max);
        }
        rate.clamp(self.min, self.max)
    }

    /// Bounds must be finite, strictly positive and ordered
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min > 0.0 && self.min <= self.max
    }

    pub fn contains(&self, rate: f64) -> bool {
        rate >= self.min && rate <= self.max
    }
}

impl Default for RateBounds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Read-only view of the controller's accumulated terms
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FeedbackTerms {
    pub integral: f64,
    pub derivative: f64,
}

/// Single PID loop producing a bounded rate multiplier
#[derive(Debug, Clone)]
pub struct FeedbackController {
    gains: Gains,
    bounds: RateBounds,
    previous_error: f64,
    integral: f64,
    derivative: f64,
    last_output: f64,
    last_sample: Instant,
    /// False until the first sample after a reset; the derivative has no basis before that
    primed: bool,
}

impl FeedbackController {
    /// Create a controller clamped to the default bounds
    pub fn new(gains: Gains) -> Self {
        Self::with_bounds(gains, RateBounds::DEFAULT)
    }

    pub fn with_bounds(gains: Gains, bounds: RateBounds) -> Self {
        Self {
            gains,
            bounds,
            previous_error: 0.0,
            integral: 0.0,
            derivative: 0.0,
            last_output: 0.0,
            last_sample: Instant::now(),
            primed: false,
        }
    }

    /// Compute a rate multiplier using the current time
    pub fn compute(&mut self, setpoint: f64, measured: f64) -> f64 {
        self.compute_at(setpoint, measured, Instant::now())
    }

    /// Compute a rate multiplier as of `now`
    ///
    /// Returns `clamp(1 + output, min, max)` where
    /// `output = kp*error + ki*integral + kd*derivative`.
    pub fn compute_at(&mut self, setpoint: f64, measured: f64, now: Instant) -> f64 {
        let dt = now
            .checked_duration_since(self.last_sample)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let error = setpoint - measured;
        self.integral += error * dt;

        self.derivative = if self.primed && dt > 0.0 {
            (error - self.previous_error) / dt
        } else {
            0.0
        };

        let output = self.gains.kp * error
            + self.gains.ki * self.integral
            + self.gains.kd * self.derivative;

        self.previous_error = error;
        self.last_sample = now;
        self.primed = true;
        self.last_output = output;

        self.bounds.clamp(1.0 + output)
    }

    /// Current integral and derivative terms
    pub fn terms(&self) -> FeedbackTerms {
        FeedbackTerms {
            integral: self.integral,
            derivative: self.derivative,
        }
    }

    /// Raw (unclamped) output of the last compute
    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    pub fn previous_error(&self) -> f64 {
        self.previous_error
    }

    pub fn gains(&self) -> Gains {
        self.gains
    }

    pub fn bounds(&self) -> RateBounds {
        self.bounds
    }

    /// Zero the accumulated state and restart the clock
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&mut self, now: Instant) {
        self.previous_error = 0.0;
        self.integral = 0.0;
        self.derivative = 0.0;
        self.last_output = 0.0;
        self.last_sample = now;
        self.primed = false;
    }
}

impl Default for FeedbackController {
    fn default() -> Self {
        Self::new(Gains::default())
    }
}
