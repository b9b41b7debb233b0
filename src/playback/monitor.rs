//! Playback quality monitor
//!
//! Sits between the rate controllers and the engine: clamps and applies
//! rates, falls back to 1.0 when the engine refuses one, and samples
//! buffer health, dropouts and position jitter while sync is enabled.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::control::RateBounds;
use crate::error::PlaybackError;
use crate::playback::engine::PlaybackEngine;

/// Jitter at which stability reaches zero
const STABILITY_JITTER_MS: f64 = 100.0;

/// Smoothing divisor for the jitter estimate
const JITTER_SMOOTHING: f64 = 8.0;

/// Snapshot of local playback quality
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackMetrics {
    /// 0.0 (empty) to 1.0 (full)
    pub buffer_health: f64,
    /// 0.0 (erratic) to 1.0 (steady)
    pub playback_stability: f64,
    /// Dropouts since the last reset
    pub dropout_count: u64,
    pub jitter_ms: f64,
}

impl Default for PlaybackMetrics {
    fn default() -> Self {
        Self {
            buffer_health: 1.0,
            playback_stability: 1.0,
            dropout_count: 0,
            jitter_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    position_ms: f64,
    rate: f64,
    playing: bool,
    underruns: u64,
}

pub struct PlaybackQualityMonitor {
    engine: Arc<dyn PlaybackEngine>,
    bounds: RateBounds,
    sample_interval: Duration,
    sampling: bool,
    last_sample: Option<Sample>,
    /// Engine underrun counter at the last reset
    underrun_base: u64,
    metrics: PlaybackMetrics,
    applied_rate: f64,
}

impl PlaybackQualityMonitor {
    pub fn new(engine: Arc<dyn PlaybackEngine>, bounds: RateBounds, sample_interval: Duration) -> Self {
        let underrun_base = engine.telemetry().underruns;
        Self {
            engine,
            bounds,
            sample_interval,
            sampling: false,
            last_sample: None,
            underrun_base,
            metrics: PlaybackMetrics::default(),
            applied_rate: 1.0,
        }
    }

    pub fn engine(&self) -> &Arc<dyn PlaybackEngine> {
        &self.engine
    }

    pub fn bounds(&self) -> RateBounds {
        self.bounds
    }

    /// Rate most recently applied to the engine
    pub fn applied_rate(&self) -> f64 {
        self.applied_rate
    }

    /// Clamp and apply a rate
    ///
    /// If the engine refuses it, playback falls back to 1.0 and the
    /// rejection is returned for the caller to recover from.
    pub fn adjust_playback_rate(&mut self, rate: f64) -> Result<f64, PlaybackError> {
        let clamped = self.bounds.clamp(rate);
        match self.engine.set_rate(clamped) {
            Ok(()) => {
                self.applied_rate = clamped;
                Ok(clamped)
            }
            Err(e) => {
                tracing::warn!("Engine rejected rate {:.3}: {}; falling back to 1.0", clamped, e);
                if let Err(fallback) = self.engine.set_rate(1.0) {
                    tracing::error!("Engine rejected fallback rate: {}", fallback);
                }
                self.applied_rate = 1.0;
                Err(e)
            }
        }
    }

    /// Start or stop metric sampling
    pub fn set_sampling(&mut self, enabled: bool) {
        self.sampling = enabled;
        if !enabled {
            self.last_sample = None;
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.sampling
    }

    /// True when sampling is on and the interval has passed
    pub fn sample_due(&self, now: Instant) -> bool {
        self.sampling
            && self
                .last_sample
                .map_or(true, |s| now.saturating_duration_since(s.at) >= self.sample_interval)
    }

    /// Refresh metrics from engine telemetry; no-op while sampling is off
    pub fn sample(&mut self, now: Instant) -> PlaybackMetrics {
        if !self.sampling {
            return self.metrics;
        }

        let telemetry = self.engine.telemetry();
        if telemetry.underruns < self.underrun_base {
            // Engine counter restarted underneath us.
            self.underrun_base = telemetry.underruns.saturating_sub(self.metrics.dropout_count);
        }
        let dropout_count = telemetry.underruns - self.underrun_base;

        let mut jitter_ms = self.metrics.jitter_ms;
        let mut new_dropouts = 0;
        if let Some(prev) = self.last_sample {
            let elapsed_ms = now.saturating_duration_since(prev.at).as_secs_f64() * 1000.0;
            let expected = if prev.playing { elapsed_ms * prev.rate } else { 0.0 };
            let actual = telemetry.position_ms - prev.position_ms;
            let deviation = (actual - expected).abs();
            if deviation.is_finite() {
                jitter_ms += (deviation - jitter_ms) / JITTER_SMOOTHING;
            }
            new_dropouts = telemetry.underruns.saturating_sub(prev.underruns);
        }

        let steadiness = (1.0 - jitter_ms / STABILITY_JITTER_MS).clamp(0.0, 1.0);
        let dropout_penalty = 1.0 / (1.0 + new_dropouts as f64);

        self.metrics = PlaybackMetrics {
            buffer_health: telemetry.buffer_fill.clamp(0.0, 1.0),
            playback_stability: (steadiness * dropout_penalty).clamp(0.0, 1.0),
            dropout_count: dropout_count.max(self.metrics.dropout_count),
            jitter_ms,
        };
        self.last_sample = Some(Sample {
            at: now,
            position_ms: telemetry.position_ms,
            rate: telemetry.rate,
            playing: telemetry.playing,
            underruns: telemetry.underruns,
        });
        self.metrics
    }

    pub fn metrics(&self) -> PlaybackMetrics {
        self.metrics
    }

    /// Clear metrics and restart dropout counting
    pub fn reset(&mut self) {
        self.underrun_base = self.engine.telemetry().underruns;
        self.metrics = PlaybackMetrics::default();
        self.last_sample = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::engine::SimulatedEngine;

    fn monitor(engine: Arc<SimulatedEngine>) -> PlaybackQualityMonitor {
        PlaybackQualityMonitor::new(engine, RateBounds::DEFAULT, Duration::from_secs(1))
    }

    #[test]
    fn test_rate_is_clamped_before_applying() {
        let engine = Arc::new(SimulatedEngine::new());
        let mut monitor = monitor(engine.clone());

        assert_eq!(monitor.adjust_playback_rate(3.5), Ok(2.0));
        assert_eq!(engine.rate(), 2.0);
        assert_eq!(monitor.adjust_playback_rate(-1.0), Ok(0.5));
        assert_eq!(monitor.adjust_playback_rate(0.0), Ok(0.5));
    }

    #[test]
    fn test_rejection_falls_back_to_unity() {
        let engine = Arc::new(SimulatedEngine::with_supported_rates(RateBounds::new(0.9, 1.1)));
        let mut monitor = monitor(engine.clone());
        monitor.adjust_playback_rate(1.05).unwrap();

        let err = monitor.adjust_playback_rate(1.8).unwrap_err();
        assert!(matches!(err, PlaybackError::RateRejected { .. }));
        assert_eq!(engine.rate(), 1.0);
        assert_eq!(monitor.applied_rate(), 1.0);
    }

    #[test]
    fn test_sampling_only_while_enabled() {
        let engine = Arc::new(SimulatedEngine::new());
        let mut monitor = monitor(engine.clone());
        let now = Instant::now();

        assert!(!monitor.sample_due(now));
        engine.inject_underrun();
        assert_eq!(monitor.sample(now).dropout_count, 0);

        monitor.set_sampling(true);
        assert!(monitor.sample_due(now));
        assert_eq!(monitor.sample(now).dropout_count, 1);
        assert!(!monitor.sample_due(now + Duration::from_millis(500)));
        assert!(monitor.sample_due(now + Duration::from_secs(1)));

        monitor.set_sampling(false);
        assert!(!monitor.sample_due(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_dropouts_monotonic_until_reset() {
        let engine = Arc::new(SimulatedEngine::new());
        engine.set_buffer_fill(0.4);
        let mut monitor = monitor(engine.clone());
        monitor.set_sampling(true);

        let start = Instant::now();
        engine.inject_underrun();
        engine.inject_underrun();
        let first = monitor.sample(start);
        assert_eq!(first.dropout_count, 2);
        assert_eq!(first.buffer_health, 0.4);

        engine.inject_underrun();
        let second = monitor.sample(start + Duration::from_secs(1));
        assert_eq!(second.dropout_count, 3);
        assert!(second.playback_stability < 1.0);

        monitor.reset();
        assert_eq!(monitor.metrics().dropout_count, 0);
        monitor.set_sampling(true);
        assert_eq!(monitor.sample(start + Duration::from_secs(2)).dropout_count, 0);
    }

    #[test]
    fn test_metrics_normalized() {
        let engine = Arc::new(SimulatedEngine::new());
        engine.load_track(1).unwrap();
        engine.seek(0.0);
        let mut monitor = monitor(engine.clone());
        monitor.set_sampling(true);

        let start = Instant::now();
        monitor.sample(start);
        // Position jumps far from what the elapsed time predicts.
        engine.seek(60_000.0);
        let metrics = monitor.sample(start + Duration::from_secs(1));

        assert!(metrics.jitter_ms > 0.0);
        assert!((0.0..=1.0).contains(&metrics.playback_stability));
        assert!((0.0..=1.0).contains(&metrics.buffer_health));
    }
}
