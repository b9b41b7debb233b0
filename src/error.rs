//! Error types for the playback synchronization engine

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport and connection errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Outbound queue to {0} is full")]
    QueueFull(String),

    #[error("Heartbeat timed out after {0} ms")]
    HeartbeatTimeout(u64),

    #[error("Reconnection attempts exhausted after {attempts} tries")]
    RetriesExhausted { attempts: u32 },

    #[error("Timeout")]
    Timeout,
}

/// Control-plane message errors; always dropped, never fatal
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Duplicate node id in broadcast: {0}")]
    DuplicateNode(String),

    #[error("Broadcast for track {got}, playing {expected:?}")]
    WrongTrack { expected: Option<u64>, got: u64 },

    #[error("Stale broadcast: position {got} ms older than {recorded} ms")]
    Stale { recorded: f64, got: f64 },
}

/// Playback engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Engine rejected rate {rate} (supported {min}..={max})")]
    RateRejected { rate: f64, min: f64, max: f64 },

    #[error("No track loaded")]
    NoTrack,
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("No transport selected")]
    TransportNotSelected,

    #[error("Session is closed")]
    Closed,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
