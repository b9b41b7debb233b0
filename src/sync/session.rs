//! Synchronization session task
//!
//! One task per client owns the connection lifecycle, the transport
//! manager and the [`SyncCoordinator`]. A single interval drives heartbeat,
//! leader broadcasts and metric sampling; closing the session ends the task
//! and with it every pending timer and reconnection.
//!
//! ```text
//!   Disconnected ──► Connecting ──► Authenticated ──► Synchronizing
//!        ▲               ▲                │                 │
//!        │               └── backoff ─────┴─────────────────┘
//!        └── retries exhausted (waits for reconnect()) / close()
//! ```

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::AppConfig;
use crate::control::{CascadeMetrics, ControlParameters};
use crate::error::{NetworkError, PlaybackError, SessionError};
use crate::network::lifecycle::{wall_clock_ms, CloseReason, ConnectionQuality, Heartbeat, ReconnectDecision};
use crate::network::{ConnectionLifecycle, ConnectionManager, Dialer};
use crate::playback::{PlaybackEngine, PlaybackMetrics};
use crate::protocol::{ConnectionType, ControlMessage, Coordinates, NetworkNode};
use crate::sync::coordinator::{LastSync, SyncCoordinator, SyncOutcome};

/// Session state as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Synchronizing,
}

/// Notifications for observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    LeaderChanged(bool),
    ActiveListeners(u32),
    RateApplied(f64),
    /// Terminal: carries `NetworkError::RetriesExhausted`; waits for `reconnect()`
    RetriesExhausted(NetworkError),
    ServerError(String),
}

/// Scalar status published after every step
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_leader: bool,
    pub sync_enabled: bool,
    pub connection: ConnectionQuality,
    pub connection_type: ConnectionType,
    pub applied_rate: f64,
    pub active_listeners: u32,
    pub playback: PlaybackMetrics,
    pub last_sync: Option<LastSync>,
    pub retries_exhausted: bool,
}

struct Shared {
    status: RwLock<SessionStatus>,
    nodes: RwLock<Arc<Vec<NetworkNode>>>,
    metrics: RwLock<Arc<CascadeMetrics>>,
    last_error: RwLock<Option<NetworkError>>,
}

enum SessionCommand {
    ToggleSync(oneshot::Sender<bool>),
    UpdateControl(ControlParameters),
    SwitchToProximity(oneshot::Sender<bool>),
    SelectTrack(u64, oneshot::Sender<Result<(), PlaybackError>>),
    ReportLocation(Coordinates, String),
    Reconnect,
    Close,
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        *self.shared.status.read()
    }

    pub fn state(&self) -> SessionState {
        self.shared.status.read().state
    }

    pub fn is_leader(&self) -> bool {
        self.shared.status.read().is_leader
    }

    pub fn sync_enabled(&self) -> bool {
        self.shared.status.read().sync_enabled
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        self.shared.status.read().connection
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.shared.status.read().connection_type
    }

    /// Latest node list; replaced wholesale on every update
    pub fn nodes(&self) -> Arc<Vec<NetworkNode>> {
        self.shared.nodes.read().clone()
    }

    /// Latest cascade metrics snapshot
    pub fn cascade_metrics(&self) -> Arc<CascadeMetrics> {
        self.shared.metrics.read().clone()
    }

    /// Most recent connection failure; cleared by a successful open
    pub fn last_error(&self) -> Option<NetworkError> {
        self.shared.last_error.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Flip sync and return the new setting
    pub async fn toggle_sync(&self) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ToggleSync(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Replace both loops' gains
    pub async fn update_control_parameters(&self, params: ControlParameters) -> Result<(), SessionError> {
        self.send(SessionCommand::UpdateControl(params)).await
    }

    /// Try the LAN proximity transport; false keeps the relay
    pub async fn switch_to_proximity_transport(&self) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::SwitchToProximity(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn select_track(&self, song_id: u64) -> Result<(), crate::Error> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::SelectTrack(song_id, tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)??;
        Ok(())
    }

    /// Forward a location for the relay's analytics
    pub async fn report_location(&self, coordinates: Coordinates, country_code: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::ReportLocation(coordinates, country_code.into()))
            .await
    }

    /// Start a fresh round of connection attempts
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Reconnect).await
    }

    /// Close the session and wait for the task to finish
    pub async fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Session task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::Closed)
    }
}

/// Builder for a session
pub struct SyncSession {
    config: AppConfig,
    engine: Arc<dyn PlaybackEngine>,
    relay: Arc<dyn Dialer>,
    address: Option<String>,
}

impl SyncSession {
    pub fn new(config: AppConfig, engine: Arc<dyn PlaybackEngine>, relay: Arc<dyn Dialer>) -> Self {
        let address = config.sync.client_address.clone();
        Self {
            config,
            engine,
            relay,
            address,
        }
    }

    /// Override the caller identifier
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Select a transport and start the session task
    pub fn spawn(self) -> Result<SessionHandle, SessionError> {
        let address = self
            .address
            .unwrap_or_else(|| format!("anon-{}", uuid::Uuid::new_v4()));

        let mut transport = ConnectionManager::new(self.relay, &self.config.network, address.clone());
        let connection_type = transport.select_transport();
        let dialer = match (transport.is_valid_connection(), transport.dialer()) {
            (true, Some(dialer)) => dialer,
            _ => return Err(SessionError::TransportNotSelected),
        };

        let lifecycle = ConnectionLifecycle::new(dialer, &self.config.network)
            .with_identity(Some(address.clone()), Some(self.config.sync.room.clone()));

        let mut coordinator = SyncCoordinator::new(address, self.engine, &self.config);
        coordinator.set_connection_type(connection_type);

        let shared = Arc::new(Shared {
            status: RwLock::new(SessionStatus {
                state: SessionState::Disconnected,
                is_leader: false,
                sync_enabled: coordinator.sync_enabled(),
                connection: ConnectionQuality::default(),
                connection_type,
                applied_rate: coordinator.applied_rate(),
                active_listeners: 0,
                playback: coordinator.playback_metrics(),
                last_sync: None,
                retries_exhausted: false,
            }),
            nodes: RwLock::new(coordinator.nodes()),
            metrics: RwLock::new(coordinator.metrics()),
            last_error: RwLock::new(None),
        });

        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(64);

        let task = SessionTask {
            coordinator,
            lifecycle,
            transport,
            shared: shared.clone(),
            events: events.clone(),
            commands: commands_rx,
            tick: Duration::from_millis(self.config.sync.broadcast_interval_ms),
            state: SessionState::Disconnected,
            active_listeners: 0,
            retries_exhausted: false,
            last_error: None,
        };
        let join = tokio::spawn(task.run());

        Ok(SessionHandle {
            shared,
            commands: commands_tx,
            events,
            task: Arc::new(Mutex::new(Some(join))),
        })
    }
}

/// How the connected phase ended
enum DriveExit {
    Closed(CloseReason),
    Redial,
}

/// Outcome of handling a command
enum Flow {
    Continue,
    Redial,
    Reconnect,
    Close,
}

struct SessionTask {
    coordinator: SyncCoordinator,
    lifecycle: ConnectionLifecycle,
    transport: ConnectionManager,
    shared: Arc<Shared>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    tick: Duration,
    state: SessionState,
    active_listeners: u32,
    retries_exhausted: bool,
    last_error: Option<NetworkError>,
}

impl SessionTask {
    async fn run(mut self) {
        'session: loop {
            self.set_state(SessionState::Connecting);

            let opened = tokio::select! {
                result = self.lifecycle.open() => Some(result),
                command = self.commands.recv() => {
                    match command {
                        Some(command) => match self.on_command(command).await {
                            Flow::Close => break 'session,
                            _ => None,
                        },
                        None => break 'session,
                    }
                }
            };

            let reason = match opened {
                // A command interrupted the dial; start over.
                None => continue 'session,
                Some(Ok(())) => {
                    self.retries_exhausted = false;
                    self.last_error = None;
                    self.coordinator.set_leader(false);
                    self.coordinator.reset();
                    self.set_state(SessionState::Authenticated);

                    match self.drive().await {
                        DriveExit::Closed(CloseReason::Explicit) => break 'session,
                        DriveExit::Closed(reason) => reason,
                        DriveExit::Redial => {
                            self.lifecycle.close();
                            self.lifecycle.reset_attempts();
                            continue 'session;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Connection failed: {}", e);
                    self.last_error = Some(e);
                    CloseReason::Error
                }
            };

            self.set_state(SessionState::Connecting);
            match self.lifecycle.handle_close(reason) {
                ReconnectDecision::Retry(delay) => {
                    if !self.wait(delay).await {
                        break 'session;
                    }
                }
                ReconnectDecision::Exhausted { attempts } => {
                    let error = NetworkError::RetriesExhausted { attempts };
                    self.retries_exhausted = true;
                    self.last_error = Some(error.clone());
                    self.set_state(SessionState::Disconnected);
                    let _ = self.events.send(SessionEvent::RetriesExhausted(error));
                    if !self.wait_for_reconnect().await {
                        break 'session;
                    }
                }
                ReconnectDecision::Stop => break 'session,
            }
        }

        self.lifecycle.close();
        self.set_state(SessionState::Disconnected);
        tracing::info!("Session closed");
    }

    /// Connected phase: one ticker, inbound frames and commands
    async fn drive(&mut self) -> DriveExit {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(reason) = self.on_tick() {
                        return DriveExit::Closed(reason);
                    }
                }
                frame = self.lifecycle.recv() => match frame {
                    Some(frame) => {
                        if let Err(reason) = self.on_frame(&frame) {
                            return DriveExit::Closed(reason);
                        }
                    }
                    None => {
                        tracing::info!("Relay closed the connection");
                        self.last_error = Some(NetworkError::Closed);
                        return DriveExit::Closed(CloseReason::Remote);
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => match self.on_command(command).await {
                        Flow::Continue | Flow::Reconnect => {}
                        Flow::Redial => return DriveExit::Redial,
                        Flow::Close => return DriveExit::Closed(CloseReason::Explicit),
                    },
                    None => return DriveExit::Closed(CloseReason::Explicit),
                },
            }
        }
    }

    /// Scheduler step. Never waits on the link: a peer that stops reading
    /// is found dead here instead of stalling the task.
    fn on_tick(&mut self) -> Result<(), CloseReason> {
        let now = Instant::now();

        match self.lifecycle.poll_heartbeat(now, wall_clock_ms()) {
            Heartbeat::Ping(ping) => {
                match self.lifecycle.try_send(&ping) {
                    Ok(()) => {}
                    Err(e @ NetworkError::QueueFull(_)) => {
                        tracing::warn!("Peer stopped reading ({}), closing connection", e);
                        self.last_error = Some(e);
                        return Err(CloseReason::HeartbeatTimeout);
                    }
                    Err(e) => return Err(self.send_failed(&ping, e)),
                }
                if let Some(report) = self.coordinator.node_report() {
                    self.send_superseded(&ControlMessage::NodeReport(report))?;
                }
            }
            Heartbeat::Dead { waited } => {
                let error = NetworkError::HeartbeatTimeout(waited.as_millis() as u64);
                tracing::warn!("{}, closing connection", error);
                self.last_error = Some(error);
                return Err(CloseReason::HeartbeatTimeout);
            }
            Heartbeat::Idle => {}
        }

        if let Some(broadcast) = self.coordinator.leader_broadcast_at(now) {
            self.send_superseded(&ControlMessage::Sync(broadcast))?;
            self.set_state(SessionState::Synchronizing);
        }

        self.coordinator.sample_playback(now);
        self.publish();
        Ok(())
    }

    fn on_frame(&mut self, frame: &[u8]) -> Result<(), CloseReason> {
        let message = match ControlMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Dropping inbound frame: {}", e);
                return Ok(());
            }
        };

        match message {
            ControlMessage::Sync(broadcast) => {
                match self.coordinator.handle_sync(broadcast) {
                    SyncOutcome::Applied { rate } => {
                        self.set_state(SessionState::Synchronizing);
                        let _ = self.events.send(SessionEvent::RateApplied(rate));
                    }
                    SyncOutcome::Degraded { error } => {
                        tracing::warn!("Rate rejected, running at 1.0: {}", error);
                        let _ = self.events.send(SessionEvent::RateApplied(1.0));
                    }
                    SyncOutcome::Recorded => self.set_state(SessionState::Synchronizing),
                    SyncOutcome::Ignored(why) => tracing::trace!("Sync ignored: {}", why),
                    SyncOutcome::Dropped(e) => tracing::debug!("Sync dropped: {}", e),
                }
            }
            ControlMessage::NodeReport(node) => {
                self.coordinator.handle_node_report(node, Instant::now());
            }
            ControlMessage::LeaderUpdate { is_leader } => {
                if self.coordinator.set_leader(is_leader) {
                    let _ = self.events.send(SessionEvent::LeaderChanged(is_leader));
                }
            }
            ControlMessage::StatsUpdate { active_listeners } => {
                self.active_listeners = active_listeners;
                let _ = self.events.send(SessionEvent::ActiveListeners(active_listeners));
            }
            ControlMessage::Ping { timestamp } => {
                // The relay pings again; a pong that does not fit is dropped.
                self.send_superseded(&ControlMessage::Pong { timestamp })?;
            }
            ControlMessage::Pong { timestamp } => {
                let quality = self.lifecycle.on_pong(timestamp, wall_clock_ms());
                self.coordinator.set_latency(quality.latency_ms);
            }
            ControlMessage::Error { message } => {
                tracing::warn!("Relay error: {}", message);
                let _ = self.events.send(SessionEvent::ServerError(message));
            }
            other => tracing::debug!("Ignoring unexpected {} message", other.kind()),
        }

        self.publish();
        Ok(())
    }

    async fn on_command(&mut self, command: SessionCommand) -> Flow {
        let flow = match command {
            SessionCommand::ToggleSync(reply) => {
                let _ = reply.send(self.coordinator.toggle_sync());
                Flow::Continue
            }
            SessionCommand::UpdateControl(params) => {
                tracing::info!("Updating control parameters: {:?}", params);
                self.coordinator.update_control_parameters(params);
                Flow::Continue
            }
            SessionCommand::SwitchToProximity(reply) => {
                if self.transport.connect_proximity().await {
                    match self.transport.dialer() {
                        Some(dialer) => {
                            self.lifecycle.set_dialer(dialer);
                            self.coordinator.set_connection_type(self.transport.connection_type());
                            let _ = reply.send(true);
                            Flow::Redial
                        }
                        None => {
                            self.transport.use_relay();
                            let _ = reply.send(false);
                            Flow::Continue
                        }
                    }
                } else {
                    let _ = reply.send(false);
                    Flow::Continue
                }
            }
            SessionCommand::SelectTrack(song_id, reply) => {
                let _ = reply.send(self.coordinator.select_track(song_id));
                Flow::Continue
            }
            SessionCommand::ReportLocation(coordinates, country_code) => {
                let message = ControlMessage::LocationUpdate {
                    coordinates,
                    country_code,
                };
                if let Err(e) = self.lifecycle.try_send(&message) {
                    tracing::debug!("Location update not sent: {}", e);
                }
                Flow::Continue
            }
            SessionCommand::Reconnect => {
                self.lifecycle.reset_attempts();
                Flow::Reconnect
            }
            SessionCommand::Close => Flow::Close,
        };
        self.publish();
        flow
    }

    /// Sleep through a backoff delay; false if the session should end
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => match self.on_command(command).await {
                        Flow::Close => return false,
                        Flow::Reconnect | Flow::Redial => return true,
                        Flow::Continue => {}
                    },
                    None => return false,
                },
            }
        }
    }

    /// Idle after exhausting retries until the caller asks again
    async fn wait_for_reconnect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(command) => match self.on_command(command).await {
                    Flow::Close => return false,
                    Flow::Reconnect | Flow::Redial => return true,
                    Flow::Continue => {}
                },
                None => return false,
            }
        }
    }

    /// Queue a frame that a later one replaces; dropped if the peer lags
    fn send_superseded(&mut self, message: &ControlMessage) -> Result<(), CloseReason> {
        match self.lifecycle.try_send(message) {
            Ok(()) => Ok(()),
            Err(NetworkError::QueueFull(peer)) => {
                tracing::debug!("{} is lagging, dropping {}", peer, message.kind());
                Ok(())
            }
            Err(e) => Err(self.send_failed(message, e)),
        }
    }

    fn send_failed(&mut self, message: &ControlMessage, error: NetworkError) -> CloseReason {
        tracing::debug!("Send of {} failed: {}", message.kind(), error);
        self.last_error = Some(error);
        CloseReason::Error
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!("Session {:?} -> {:?}", self.state, state);
            self.state = state;
            let _ = self.events.send(SessionEvent::StateChanged(state));
            self.publish();
        }
    }

    fn publish(&self) {
        *self.shared.status.write() = SessionStatus {
            state: self.state,
            is_leader: self.coordinator.is_leader(),
            sync_enabled: self.coordinator.sync_enabled(),
            connection: self.lifecycle.quality(),
            connection_type: self.transport.connection_type(),
            applied_rate: self.coordinator.applied_rate(),
            active_listeners: self.active_listeners,
            playback: self.coordinator.playback_metrics(),
            last_sync: self.coordinator.last_sync(),
            retries_exhausted: self.retries_exhausted,
        };
        *self.shared.nodes.write() = self.coordinator.nodes();
        *self.shared.metrics.write() = self.coordinator.metrics();
        *self.shared.last_error.write() = self.last_error.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::relay::{RelayConfig, RelayHub};
    use crate::network::Link;
    use crate::playback::SimulatedEngine;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.sync.broadcast_interval_ms = 20;
        config.sync.sample_interval_ms = 100;
        config.network.heartbeat_interval_ms = 100;
        config.network.heartbeat_timeout_ms = 1_000;
        config.network.reconnect_base_ms = 10;
        config.network.reconnect_max_delay_ms = 40;
        config.network.max_reconnect_attempts = 2;
        config
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Refuses every dial and counts attempts
    #[derive(Default)]
    struct RefusingDialer {
        dials: AtomicUsize,
    }

    impl Dialer for RefusingDialer {
        fn dial(&self) -> BoxFuture<'_, Result<Link, NetworkError>> {
            async move {
                self.dials.fetch_add(1, Ordering::SeqCst);
                Err(NetworkError::ConnectionFailed("refused".into()))
            }
            .boxed()
        }

        fn target(&self) -> String {
            "refusing".into()
        }
    }

    /// Hands out links whose far end never reads
    #[derive(Default)]
    struct DeafDialer {
        dials: AtomicUsize,
        held: Mutex<Vec<Link>>,
    }

    impl Dialer for DeafDialer {
        fn dial(&self) -> BoxFuture<'_, Result<Link, NetworkError>> {
            async move {
                self.dials.fetch_add(1, Ordering::SeqCst);
                let (local, remote) = Link::pair(1);
                self.held.lock().push(remote);
                Ok(local)
            }
            .boxed()
        }

        fn target(&self) -> String {
            "deaf".into()
        }
    }

    /// Reads everything, answers nothing
    #[derive(Default)]
    struct SilentDialer {
        dials: AtomicUsize,
    }

    impl Dialer for SilentDialer {
        fn dial(&self) -> BoxFuture<'_, Result<Link, NetworkError>> {
            async move {
                self.dials.fetch_add(1, Ordering::SeqCst);
                let (local, mut remote) = Link::pair(64);
                tokio::spawn(async move { while remote.recv().await.is_some() {} });
                Ok(local)
            }
            .boxed()
        }

        fn target(&self) -> String {
            "silent".into()
        }
    }

    /// Gives the far end of every link to the test
    struct ScriptedDialer {
        remotes: mpsc::UnboundedSender<Link>,
    }

    impl ScriptedDialer {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Link>) {
            let (remotes, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { remotes }), rx)
        }
    }

    impl Dialer for ScriptedDialer {
        fn dial(&self) -> BoxFuture<'_, Result<Link, NetworkError>> {
            async move {
                let (local, remote) = Link::pair(64);
                self.remotes
                    .send(remote)
                    .map_err(|_| NetworkError::ConnectionFailed("script ended".into()))?;
                Ok(local)
            }
            .boxed()
        }

        fn target(&self) -> String {
            "scripted".into()
        }
    }

    async fn next_message(link: &mut Link) -> ControlMessage {
        let frame = tokio::time::timeout(Duration::from_secs(2), link.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed");
        ControlMessage::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_follower_converges_toward_leader() {
        let hub = RelayHub::new(RelayConfig::default());

        let leader_engine = Arc::new(SimulatedEngine::new());
        leader_engine.load_track(1).unwrap();
        leader_engine.seek(10_000.0);
        leader_engine.set_playing(true).unwrap();

        let leader = SyncSession::new(fast_config(), leader_engine.clone(), hub.dialer())
            .with_address("leader")
            .spawn()
            .unwrap();
        wait_until("leadership", || leader.is_leader()).await;

        let follower_engine = Arc::new(SimulatedEngine::new());
        follower_engine.load_track(1).unwrap();
        follower_engine.seek(9_000.0);

        let follower = SyncSession::new(fast_config(), follower_engine.clone(), hub.dialer())
            .with_address("follower")
            .spawn()
            .unwrap();

        wait_until("follower playback", || follower_engine.is_playing()).await;
        wait_until("speed-up", || follower_engine.rate() > 1.0).await;
        assert!(follower_engine.rate() <= 2.0);
        assert!(!follower.is_leader());
        assert_eq!(follower.state(), SessionState::Synchronizing);
        assert!(follower.status().last_sync.is_some());
        assert!(!follower.nodes().is_empty());

        // The leader eventually lists the follower's report.
        wait_until("follower report", || leader.nodes().iter().any(|n| n.id == "follower")).await;
        assert_eq!(leader_engine.rate(), 1.0);

        follower.close().await;
        leader.close().await;
        assert_eq!(follower.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_follower_on_other_track_ignores_leader() {
        let hub = RelayHub::new(RelayConfig::default());

        let leader_engine = Arc::new(SimulatedEngine::new());
        leader_engine.load_track(1).unwrap();
        leader_engine.set_playing(true).unwrap();
        let leader = SyncSession::new(fast_config(), leader_engine, hub.dialer())
            .with_address("leader")
            .spawn()
            .unwrap();
        wait_until("leadership", || leader.is_leader()).await;

        let follower_engine = Arc::new(SimulatedEngine::new());
        follower_engine.load_track(2).unwrap();
        let follower = SyncSession::new(fast_config(), follower_engine.clone(), hub.dialer())
            .with_address("follower")
            .spawn()
            .unwrap();

        wait_until("listeners", || follower.status().active_listeners == 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(follower.status().last_sync.is_none());
        assert!(!follower_engine.is_playing());
        assert_eq!(follower_engine.rate(), 1.0);

        follower.close().await;
        leader.close().await;
    }

    #[tokio::test]
    async fn test_retries_exhaust_then_caller_reconnects() {
        let dialer = Arc::new(RefusingDialer::default());
        let engine = Arc::new(SimulatedEngine::new());
        let session = SyncSession::new(fast_config(), engine, dialer.clone())
            .spawn()
            .unwrap();
        let mut events = session.subscribe();

        wait_until("exhaustion", || session.status().retries_exhausted).await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.last_error(), Some(NetworkError::RetriesExhausted { attempts: 2 }));
        let terminal = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(SessionEvent::RetriesExhausted(error)) = events.recv().await {
                    return error;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(terminal, NetworkError::RetriesExhausted { attempts: 2 });
        // One initial dial plus two retries.
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);

        session.reconnect().await.unwrap();
        wait_until("fresh attempts", || dialer.dials.load(Ordering::SeqCst) >= 4).await;

        session.close().await;
    }

    #[tokio::test]
    async fn test_close_cancels_pending_reconnect() {
        let dialer = Arc::new(RefusingDialer::default());
        let mut config = fast_config();
        config.network.reconnect_base_ms = 200;
        config.network.reconnect_max_delay_ms = 200;
        let session = SyncSession::new(config, Arc::new(SimulatedEngine::new()), dialer.clone())
            .spawn()
            .unwrap();

        wait_until("first dial", || dialer.dials.load(Ordering::SeqCst) == 1).await;
        session.close().await;
        let after_close = dialer.dials.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), after_close);
        assert!(session.is_closed());
        assert!(session.toggle_sync().await.is_err());
    }

    #[tokio::test]
    async fn test_toggle_and_parameter_updates() {
        let hub = RelayHub::new(RelayConfig::default());
        let engine = Arc::new(SimulatedEngine::new());
        let session = SyncSession::new(fast_config(), engine, hub.dialer())
            .with_address("solo")
            .spawn()
            .unwrap();

        assert!(!session.toggle_sync().await.unwrap());
        assert!(!session.sync_enabled());
        assert!(session.toggle_sync().await.unwrap());

        let params = ControlParameters::default();
        session.update_control_parameters(params).await.unwrap();
        session.select_track(9).await.unwrap();

        wait_until("leadership", || session.is_leader()).await;
        assert_eq!(session.connection_type(), ConnectionType::Relay);
        session.close().await;
    }

    #[tokio::test]
    async fn test_deaf_peer_is_dropped_and_close_completes() {
        let dialer = Arc::new(DeafDialer::default());
        let mut config = fast_config();
        config.network.heartbeat_timeout_ms = 300;
        config.network.max_reconnect_attempts = 8;
        let session = SyncSession::new(config, Arc::new(SimulatedEngine::new()), dialer.clone())
            .with_address("deaf-client")
            .spawn()
            .unwrap();

        // The auth frame fills the one-slot queue; the first ping finds it full.
        wait_until("redial after a stuck peer", || dialer.dials.load(Ordering::SeqCst) >= 2).await;

        tokio::time::timeout(Duration::from_secs(2), session.close())
            .await
            .expect("close hung on a peer that stopped reading");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_unanswered_pings_force_redial() {
        let dialer = Arc::new(SilentDialer::default());
        let mut config = fast_config();
        config.network.heartbeat_timeout_ms = 300;
        let session = SyncSession::new(config, Arc::new(SimulatedEngine::new()), dialer.clone())
            .with_address("lonely")
            .spawn()
            .unwrap();

        wait_until("first dial", || dialer.dials.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        wait_until("heartbeat redial", || dialer.dials.load(Ordering::SeqCst) >= 2).await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_demoted_leader_stops_broadcasting() {
        let (dialer, mut remotes) = ScriptedDialer::new();
        let engine = Arc::new(SimulatedEngine::new());
        engine.load_track(1).unwrap();
        engine.set_playing(true).unwrap();

        let mut config = fast_config();
        config.network.heartbeat_timeout_ms = 10_000;
        let session = SyncSession::new(config, engine, dialer)
            .with_address("was-leader")
            .spawn()
            .unwrap();

        let mut relay = remotes.recv().await.unwrap();
        assert!(matches!(next_message(&mut relay).await, ControlMessage::Auth { .. }));

        relay
            .send_message(&ControlMessage::LeaderUpdate { is_leader: true })
            .await
            .unwrap();
        while !matches!(next_message(&mut relay).await, ControlMessage::Sync(_)) {}
        wait_until("leadership", || session.is_leader()).await;

        relay
            .send_message(&ControlMessage::LeaderUpdate { is_leader: false })
            .await
            .unwrap();
        wait_until("demotion", || !session.is_leader()).await;

        // Everything queued before the demotion was applied.
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(50), relay.recv()).await {}

        let mut kinds = Vec::new();
        let until = tokio::time::Instant::now() + Duration::from_millis(300);
        while let Ok(Some(frame)) = tokio::time::timeout_at(until, relay.recv()).await {
            kinds.push(ControlMessage::decode(&frame).unwrap().kind());
        }
        assert!(!kinds.contains(&"sync"), "demoted client still broadcasts: {kinds:?}");
        assert!(kinds.contains(&"node_report"), "follower should report: {kinds:?}");

        session.close().await;
    }
}
