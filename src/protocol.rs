//! Control-plane messages
//!
//! Every message is a JSON object tagged by `type`. Frames on the wire are
//! newline-delimited (see [`crate::network::link`]).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ProtocolError;

/// Transport a peer is using
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[serde(alias = "websocket")]
    Relay,
    #[serde(alias = "bluetooth")]
    Proximity,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Relay => write!(f, "relay"),
            ConnectionType::Proximity => write!(f, "proximity"),
            ConnectionType::Unknown => write!(f, "unknown"),
        }
    }
}

/// A peer's self-reported sync state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkNode {
    pub id: String,
    /// Round-trip latency to the relay in milliseconds
    pub latency: f64,
    /// Position error against the leader in seconds
    pub sync_error: f64,
    pub playback_rate: f64,
    #[serde(default)]
    pub connection_type: ConnectionType,
}

/// Leader broadcast payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBroadcast {
    pub song_id: u64,
    /// Leader playback position in milliseconds
    pub timestamp: f64,
    pub playing: bool,
    pub nodes: Vec<NetworkNode>,
}

impl SyncBroadcast {
    /// Reject broadcasts that deserialized but are not usable
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(ProtocolError::Malformed(format!(
                "invalid timestamp {}",
                self.timestamp
            )));
        }

        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ProtocolError::DuplicateNode(node.id.clone()));
            }
        }
        Ok(())
    }
}

/// Geographic position, consumed only by analytics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Messages exchanged over the duplex connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Auth {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },

    Sync(SyncBroadcast),

    NodeReport(NetworkNode),

    LocationUpdate {
        coordinates: Coordinates,
        #[serde(rename = "countryCode")]
        country_code: String,
    },

    LeaderUpdate {
        #[serde(rename = "isLeader")]
        is_leader: bool,
    },

    StatsUpdate {
        #[serde(rename = "activeListeners")]
        active_listeners: u32,
    },

    #[serde(alias = "sync_ping")]
    Ping { timestamp: i64 },

    #[serde(alias = "sync_pong")]
    Pong { timestamp: i64 },

    Error { message: String },
}

impl ControlMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Auth { .. } => "auth",
            ControlMessage::Sync(_) => "sync",
            ControlMessage::NodeReport(_) => "node_report",
            ControlMessage::LocationUpdate { .. } => "location_update",
            ControlMessage::LeaderUpdate { .. } => "leader_update",
            ControlMessage::StatsUpdate { .. } => "stats_update",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON frame
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse and validate a JSON frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let message: ControlMessage = serde_json::from_slice(frame)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if let ControlMessage::Sync(ref broadcast) = message {
            broadcast.validate()?;
        }
        Ok(message)
    }
}

/// LAN discovery datagrams for the proximity transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    ProximityProbe { client: String },
    ProximityOffer { addr: String },
}

impl DiscoveryMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(datagram).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
