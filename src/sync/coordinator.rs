//! Leader/follower protocol state
//!
//! The coordinator holds everything the session decides with: the active
//! controller pair, the quality monitor, the role, the last accepted
//! broadcast and the node list. It performs no I/O, so the async session
//! loop stays a thin shell around it.
//!
//! Followers turn each accepted broadcast into a rate:
//!
//! ```text
//! nodes ─► entropy, free energy ─► cascade ─┐
//!                                           ├─► × ─► monitor ─► engine
//! leader position vs local ─► position loop ┘
//! ```
//!
//! With an empty node list only the position loop runs.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::control::{CascadeController, CascadeMetrics, ControlParameters, FeedbackController, Gains};
use crate::error::{PlaybackError, ProtocolError};
use crate::playback::{PlaybackEngine, PlaybackMetrics, PlaybackQualityMonitor};
use crate::protocol::{ConnectionType, NetworkNode, SyncBroadcast};
use crate::sync::metrics::{network_entropy, network_free_energy};

/// Gains of the direct position loop (seconds of error in, multiplier out)
pub const POSITION_LOOP_GAINS: Gains = Gains::new(0.1, 0.005, 0.0);

/// The last broadcast accepted from the leader
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSync {
    pub song_id: u64,
    pub timestamp: f64,
    pub playing: bool,
}

/// What happened to an inbound broadcast
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// A corrective rate reached the engine
    Applied { rate: f64 },
    /// The engine refused the rate; playback is back at 1.0
    Degraded { error: PlaybackError },
    /// Accepted while the leader is paused; no rate work
    Recorded,
    /// Not for this client in its current role or mode
    Ignored(&'static str),
    /// Wrong track or stale
    Dropped(ProtocolError),
}

/// Synchronous leader/follower state machine
pub struct SyncCoordinator {
    node_id: String,
    connection_type: ConnectionType,
    cascade: CascadeController,
    position_loop: FeedbackController,
    monitor: PlaybackQualityMonitor,
    target_free_energy: f64,
    report_ttl: Duration,
    is_leader: bool,
    sync_enabled: bool,
    last_sync: Option<LastSync>,
    nodes: Arc<Vec<NetworkNode>>,
    peer_reports: HashMap<String, (NetworkNode, Instant)>,
    metrics: Arc<CascadeMetrics>,
    /// Leader position minus local position, seconds
    last_error_secs: f64,
    latency_ms: f64,
}

impl SyncCoordinator {
    pub fn new(node_id: impl Into<String>, engine: Arc<dyn PlaybackEngine>, config: &AppConfig) -> Self {
        let mut monitor = PlaybackQualityMonitor::new(
            engine,
            config.playback.rate_bounds,
            Duration::from_millis(config.sync.sample_interval_ms),
        );
        monitor.set_sampling(config.sync.enabled);

        Self {
            node_id: node_id.into(),
            connection_type: ConnectionType::Unknown,
            cascade: CascadeController::new(config.control),
            position_loop: FeedbackController::new(POSITION_LOOP_GAINS),
            monitor,
            target_free_energy: config.sync.target_free_energy,
            report_ttl: Duration::from_millis(config.sync.node_report_ttl_ms),
            is_leader: false,
            sync_enabled: config.sync.enabled,
            last_sync: None,
            nodes: Arc::new(Vec::new()),
            peer_reports: HashMap::new(),
            metrics: Arc::new(CascadeMetrics::default()),
            last_error_secs: 0.0,
            latency_ms: 0.0,
        }
    }

    pub fn handle_sync(&mut self, broadcast: SyncBroadcast) -> SyncOutcome {
        self.handle_sync_at(broadcast, Instant::now())
    }

    /// Follow one leader broadcast
    pub fn handle_sync_at(&mut self, broadcast: SyncBroadcast, now: Instant) -> SyncOutcome {
        if self.is_leader {
            return SyncOutcome::Ignored("leader does not follow broadcasts");
        }
        if !self.sync_enabled {
            return SyncOutcome::Ignored("sync disabled");
        }

        let engine = self.monitor.engine().clone();
        let current = engine.current_track();
        if current != Some(broadcast.song_id) {
            return SyncOutcome::Dropped(ProtocolError::WrongTrack {
                expected: current,
                got: broadcast.song_id,
            });
        }
        if let Some(last) = self.last_sync {
            if last.song_id == broadcast.song_id && broadcast.timestamp < last.timestamp {
                return SyncOutcome::Dropped(ProtocolError::Stale {
                    recorded: last.timestamp,
                    got: broadcast.timestamp,
                });
            }
        }

        let SyncBroadcast {
            song_id,
            timestamp,
            playing,
            nodes,
        } = broadcast;

        self.nodes = Arc::new(nodes);
        self.last_sync = Some(LastSync {
            song_id,
            timestamp,
            playing,
        });

        if engine.is_playing() != playing {
            tracing::debug!("Leader playing={}, following", playing);
            if let Err(e) = engine.set_playing(playing) {
                tracing::warn!("Failed to toggle playback: {}", e);
            }
        }
        if !playing {
            return SyncOutcome::Recorded;
        }

        // Leader position when this message arrives, assuming symmetric latency.
        let leader_ms = timestamp + self.latency_ms / 2.0;
        let local_ms = engine.position_ms();
        self.last_error_secs = (leader_ms - local_ms) / 1000.0;
        let trim = self
            .position_loop
            .compute_at(leader_ms / 1000.0, local_ms / 1000.0, now);

        let rate = if self.nodes.is_empty() {
            trim
        } else {
            let entropy = network_entropy(&self.nodes);
            let free_energy = network_free_energy(&self.nodes);
            let output = self
                .cascade
                .compute_at(self.target_free_energy, free_energy, entropy, now);
            self.metrics = Arc::new(output.metrics);
            output.rate * trim
        };

        match self.monitor.adjust_playback_rate(rate) {
            Ok(applied) => SyncOutcome::Applied { rate: applied },
            Err(error) => {
                self.reset_controllers();
                SyncOutcome::Degraded { error }
            }
        }
    }

    /// Build the next broadcast; `None` unless leading with a track loaded
    pub fn leader_broadcast_at(&mut self, now: Instant) -> Option<SyncBroadcast> {
        if !self.is_leader || !self.sync_enabled {
            return None;
        }
        let engine = self.monitor.engine().clone();
        let song_id = engine.current_track()?;

        let ttl = self.report_ttl;
        self.peer_reports
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < ttl);

        let mut nodes = Vec::with_capacity(self.peer_reports.len() + 1);
        nodes.push(self.own_node());
        let mut peers: Vec<NetworkNode> = self.peer_reports.values().map(|(n, _)| n.clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        nodes.extend(peers);

        self.nodes = Arc::new(nodes.clone());

        Some(SyncBroadcast {
            song_id,
            timestamp: engine.position_ms(),
            playing: engine.is_playing(),
            nodes,
        })
    }

    /// Remember a follower's report; only leaders keep them
    pub fn handle_node_report(&mut self, node: NetworkNode, now: Instant) -> bool {
        if !self.is_leader || node.id == self.node_id {
            return false;
        }
        self.peer_reports.insert(node.id.clone(), (node, now));
        true
    }

    /// This client's report to the leader; followers only
    pub fn node_report(&self) -> Option<NetworkNode> {
        if self.is_leader || !self.sync_enabled {
            None
        } else {
            Some(self.own_node())
        }
    }

    fn own_node(&self) -> NetworkNode {
        NetworkNode {
            id: self.node_id.clone(),
            latency: self.latency_ms,
            sync_error: if self.is_leader { 0.0 } else { self.last_error_secs },
            playback_rate: self.monitor.applied_rate(),
            connection_type: self.connection_type,
        }
    }

    /// Apply a role verbatim; returns true when it changed
    pub fn set_leader(&mut self, is_leader: bool) -> bool {
        if self.is_leader == is_leader {
            return false;
        }
        tracing::info!("Role changed: {}", if is_leader { "leader" } else { "follower" });
        self.is_leader = is_leader;
        self.peer_reports.clear();
        self.reset();
        if is_leader {
            // The leader is the reference clock.
            if let Err(e) = self.monitor.adjust_playback_rate(1.0) {
                // Monitor already fell back to 1.0 as far as the engine allows.
                tracing::debug!("Leader could not restore unity rate: {}", e);
            }
            self.last_error_secs = 0.0;
        }
        true
    }

    pub fn set_sync_enabled(&mut self, enabled: bool) {
        if self.sync_enabled == enabled {
            return;
        }
        self.sync_enabled = enabled;
        self.monitor.set_sampling(enabled);
        if !enabled {
            if let Err(e) = self.monitor.adjust_playback_rate(1.0) {
                tracing::debug!("Unity rate refused while disabling sync: {}", e);
            }
            self.reset();
        }
        tracing::info!("Sync {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Flip sync on or off and return the new setting
    pub fn toggle_sync(&mut self) -> bool {
        self.set_sync_enabled(!self.sync_enabled);
        self.sync_enabled
    }

    /// Swap in a fresh cascade built from new gains
    pub fn update_control_parameters(&mut self, params: ControlParameters) {
        self.cascade = CascadeController::new(params);
        self.metrics = Arc::new(CascadeMetrics::default());
    }

    /// Load a track; the leader's reference series restarts
    pub fn select_track(&mut self, song_id: u64) -> Result<(), PlaybackError> {
        self.monitor.engine().load_track(song_id)?;
        self.reset();
        Ok(())
    }

    /// Sample playback metrics if due
    pub fn sample_playback(&mut self, now: Instant) -> Option<PlaybackMetrics> {
        if self.monitor.sample_due(now) {
            Some(self.monitor.sample(now))
        } else {
            None
        }
    }

    pub fn set_latency(&mut self, latency_ms: f64) {
        if latency_ms.is_finite() && latency_ms >= 0.0 {
            self.latency_ms = latency_ms;
        }
    }

    pub fn set_connection_type(&mut self, connection_type: ConnectionType) {
        self.connection_type = connection_type;
    }

    /// Forget history after a discontinuity (reconnect, track change, role change)
    ///
    /// Playback metrics restart too, so the dropout count covers the
    /// current connection and track only.
    pub fn reset(&mut self) {
        self.reset_controllers();
        self.monitor.reset();
        self.last_sync = None;
    }

    fn reset_controllers(&mut self) {
        self.cascade.reset();
        self.position_loop.reset();
        self.metrics = Arc::new(CascadeMetrics::default());
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    pub fn last_sync(&self) -> Option<LastSync> {
        self.last_sync
    }

    pub fn nodes(&self) -> Arc<Vec<NetworkNode>> {
        self.nodes.clone()
    }

    pub fn metrics(&self) -> Arc<CascadeMetrics> {
        self.metrics.clone()
    }

    pub fn control_parameters(&self) -> ControlParameters {
        self.cascade.params()
    }

    pub fn playback_metrics(&self) -> PlaybackMetrics {
        self.monitor.metrics()
    }

    pub fn applied_rate(&self) -> f64 {
        self.monitor.applied_rate()
    }
}
