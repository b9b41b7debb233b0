//! Playback engine abstraction
//!
//! The session never touches audio samples; it only reads the engine's
//! position and telemetry and asks it to change rate or play state.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;

use crate::control::RateBounds;
use crate::error::PlaybackError;

/// Engine-side counters read by the quality monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineTelemetry {
    pub position_ms: f64,
    pub rate: f64,
    /// Output buffer fill, 0.0 to 1.0
    pub buffer_fill: f64,
    /// Total buffer underruns since the engine started
    pub underruns: u64,
    pub playing: bool,
}

/// Something that plays audio at an adjustable rate
pub trait PlaybackEngine: Send + Sync {
    /// Apply a playback rate; engines may reject rates they cannot render
    fn set_rate(&self, rate: f64) -> Result<(), PlaybackError>;

    fn rate(&self) -> f64;

    fn position_ms(&self) -> f64;

    fn is_playing(&self) -> bool;

    fn set_playing(&self, playing: bool) -> Result<(), PlaybackError>;

    fn current_track(&self) -> Option<u64>;

    /// Select a track and rewind to its start
    fn load_track(&self, song_id: u64) -> Result<(), PlaybackError>;

    fn telemetry(&self) -> EngineTelemetry;
}

struct SimState {
    track: Option<u64>,
    playing: bool,
    rate: f64,
    /// Position at `anchor_at`
    anchor_ms: f64,
    anchor_at: Instant,
    buffer_fill: f64,
    underruns: u64,
}

impl SimState {
    fn position_at(&self, now: Instant) -> f64 {
        if !self.playing {
            return self.anchor_ms;
        }
        let elapsed = now.saturating_duration_since(self.anchor_at).as_secs_f64();
        self.anchor_ms + elapsed * 1000.0 * self.rate
    }

    fn reanchor(&mut self, now: Instant) {
        self.anchor_ms = self.position_at(now);
        self.anchor_at = now;
    }
}

/// Clock-driven engine: position advances at `rate` in real time
pub struct SimulatedEngine {
    state: Mutex<SimState>,
    supported: RateBounds,
}

impl SimulatedEngine {
    /// Engine accepting rates in `0.25..=4.0`
    pub fn new() -> Self {
        Self::with_supported_rates(RateBounds::new(0.25, 4.0))
    }

    pub fn with_supported_rates(supported: RateBounds) -> Self {
        Self {
            state: Mutex::new(SimState {
                track: None,
                playing: false,
                rate: 1.0,
                anchor_ms: 0.0,
                anchor_at: Instant::now(),
                buffer_fill: 1.0,
                underruns: 0,
            }),
            supported,
        }
    }

    /// Jump to a position
    pub fn seek(&self, position_ms: f64) {
        let mut state = self.state.lock();
        state.anchor_ms = position_ms.max(0.0);
        state.anchor_at = Instant::now();
    }

    pub fn set_buffer_fill(&self, fill: f64) {
        self.state.lock().buffer_fill = fill.clamp(0.0, 1.0);
    }

    /// Record an output underrun
    pub fn inject_underrun(&self) {
        self.state.lock().underruns += 1;
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackEngine for SimulatedEngine {
    fn set_rate(&self, rate: f64) -> Result<(), PlaybackError> {
        if !rate.is_finite() || !self.supported.contains(rate) {
            return Err(PlaybackError::RateRejected {
                rate,
                min: self.supported.min,
                max: self.supported.max,
            });
        }
        let mut state = self.state.lock();
        state.reanchor(Instant::now());
        state.rate = rate;
        Ok(())
    }

    fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn position_ms(&self) -> f64 {
        self.state.lock().position_at(Instant::now())
    }

    fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    fn set_playing(&self, playing: bool) -> Result<(), PlaybackError> {
        let mut state = self.state.lock();
        if state.track.is_none() {
            return Err(PlaybackError::NoTrack);
        }
        state.reanchor(Instant::now());
        state.playing = playing;
        Ok(())
    }

    fn current_track(&self) -> Option<u64> {
        self.state.lock().track
    }

    fn load_track(&self, song_id: u64) -> Result<(), PlaybackError> {
        let mut state = self.state.lock();
        state.track = Some(song_id);
        state.anchor_ms = 0.0;
        state.anchor_at = Instant::now();
        Ok(())
    }

    fn telemetry(&self) -> EngineTelemetry {
        let state = self.state.lock();
        EngineTelemetry {
            position_ms: state.position_at(Instant::now()),
            rate: state.rate,
            buffer_fill: state.buffer_fill,
            underruns: state.underruns,
            playing: state.playing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsupported_rates() {
        let engine = SimulatedEngine::new();
        assert!(engine.set_rate(2.0).is_ok());
        assert!(matches!(engine.set_rate(8.0), Err(PlaybackError::RateRejected { .. })));
        assert!(engine.set_rate(f64::NAN).is_err());
        assert_eq!(engine.rate(), 2.0);
    }

    #[test]
    fn test_paused_position_is_frozen() {
        let engine = SimulatedEngine::new();
        assert_eq!(engine.set_playing(true), Err(PlaybackError::NoTrack));

        engine.load_track(3).unwrap();
        engine.seek(9000.0);
        assert_eq!(engine.position_ms(), 9000.0);
        assert_eq!(engine.current_track(), Some(3));
    }

    #[test]
    fn test_position_advances_while_playing() {
        let engine = SimulatedEngine::new();
        engine.load_track(1).unwrap();
        engine.set_playing(true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(engine.position_ms() >= 20.0);
    }
}
