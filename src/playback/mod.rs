//! Local playback: the engine seam and the quality monitor in front of it

pub mod engine;
pub mod monitor;

pub use engine::{EngineTelemetry, PlaybackEngine, SimulatedEngine};
pub use monitor::{PlaybackMetrics, PlaybackQualityMonitor};
