//! # playsync
//!
//! Leader/follower playback-rate synchronization for audio clients that
//! share a network relay but no hardware clock.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── LEADER CLIENT ────────────────────────────┐
//! │  Playback engine ──position──► Sync coordinator ──sync every tick──┐  │
//! │                                  ▲ node reports                    │  │
//! └──────────────────────────────────┼─────────────────────────────────┼──┘
//!                                    │                                 │
//!                                    │        TCP, JSON lines          ▼
//! ┌──────────────────────────────────┴─────── RELAY ────────────────────────┐
//! │  Room ─ leader election ─ per-peer bounded queues (drop oldest)        │
//! │  UDP proximity responder                                                │
//! └──────────────────────────────────┬──────────────────────────────────────┘
//!                                    │ sync, leader_update, stats_update
//!                                    ▼
//! ┌──────────────────────────── FOLLOWER CLIENT ──────────────────────────┐
//! │  Connection lifecycle (auth, heartbeat, quality, backoff)              │
//! │         │                                                              │
//! │         ▼                                                              │
//! │  Sync coordinator                                                      │
//! │   ├─ network entropy / free energy from the node list                  │
//! │   ├─ Cascade controller (outer: free energy, inner: entropy)           │
//! │   ├─ position trim loop against the leader position                    │
//! │   └─ Playback quality monitor ──clamped rate──► Playback engine        │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod network;
pub mod playback;
pub mod protocol;
pub mod sync;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Lower edge of the authoritative playback rate range
    pub const DEFAULT_MIN_RATE: f64 = 0.5;

    /// Upper edge of the authoritative playback rate range
    pub const DEFAULT_MAX_RATE: f64 = 2.0;

    /// Free energy inputs to the cascade are clamped to this range
    pub const FREE_ENERGY_RANGE: (f64, f64) = (-2.0, 2.0);

    /// Entropy inputs to the cascade are clamped to this range
    pub const ENTROPY_RANGE: (f64, f64) = (0.0, 1.0);

    /// Input scale of the cascade's `tanh` shaping
    pub const CASCADE_TANH_SCALE: f64 = 0.5;

    /// Free energy setpoint: every peer at rate 1.0
    pub const DEFAULT_TARGET_FREE_ENERGY: f64 = 0.0;

    /// Default TCP port of the relay
    pub const DEFAULT_RELAY_PORT: u16 = 7878;

    /// Default UDP port for proximity discovery
    pub const DEFAULT_DISCOVERY_PORT: u16 = 7879;

    /// Default HTTP port for the status API
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Default room joined by clients
    pub const DEFAULT_ROOM: &str = "lobby";

    /// Ping cadence
    pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

    /// Close the connection when a ping stays unanswered this long
    pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

    /// RTT at which connection quality reaches zero
    pub const QUALITY_ZERO_RTT_MS: f64 = 1_000.0;

    /// First reconnection delay
    pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;

    /// Reconnection delay ceiling
    pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 10_000;

    /// Attempts before the session gives up
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 8;

    /// Scheduler tick; leaders broadcast once per tick
    pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 100;

    /// Playback metric sampling interval
    pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1_000;

    /// Leaders forget node reports older than this
    pub const DEFAULT_NODE_REPORT_TTL_MS: u64 = 5_000;

    /// Relay outbound queue depth per peer
    pub const DEFAULT_PEER_QUEUE_CAPACITY: usize = 32;

    /// In-flight frames buffered on each side of a link
    pub const LINK_CHANNEL_CAPACITY: usize = 256;

    /// Maximum accepted frame length in bytes
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;
}
