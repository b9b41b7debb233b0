//! Relay hub and TCP relay server
//!
//! Each connected peer gets one reader task and one writer task. Peers join
//! a room with `auth`; the first peer in a room leads. Outbound traffic to a
//! peer is split in two classes:
//!
//! - control frames (`leader_update`, `stats_update`, `pong`, `error`) go
//!   through a bounded channel and are never reordered or dropped silently;
//! - sync frames go through a bounded ring that drops the oldest frame on
//!   overflow, so a slow peer never blocks a broadcast;
//! - node reports bound for a leader keep one pending slot per follower, so
//!   a newer report replaces the same follower's older one and never
//!   another follower's.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::constants::{DEFAULT_ROOM, LINK_CHANNEL_CAPACITY};
use crate::error::NetworkError;
use crate::network::link::{Dialer, Link};
use crate::protocol::ControlMessage;

/// Control frames buffered per peer
const CONTROL_QUEUE_CAPACITY: usize = 64;

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for RelayConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            queue_capacity: config.peer_queue_capacity,
            idle_timeout: Duration::from_millis(config.peer_idle_timeout_ms),
        }
    }
}

/// Outbound queues for one peer
pub struct PeerQueue {
    control: mpsc::Sender<Bytes>,
    sync: ArrayQueue<Bytes>,
    reports: DashMap<Uuid, Bytes>,
    notify: Notify,
    dropped: AtomicUsize,
}

impl PeerQueue {
    fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (control, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let queue = Arc::new(Self {
            control,
            sync: ArrayQueue::new(capacity),
            reports: DashMap::new(),
            notify: Notify::new(),
            dropped: AtomicUsize::new(0),
        });
        (queue, control_rx)
    }

    /// Queue a superseding frame, evicting the oldest when full
    pub fn push_sync(&self, frame: Bytes) {
        if self.sync.force_push(frame).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Hold the latest report from `from`, replacing its previous one
    pub fn push_report(&self, from: Uuid, frame: Bytes) {
        if self.reports.insert(from, frame).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Take every pending report
    pub fn take_reports(&self) -> Vec<Bytes> {
        let senders: Vec<Uuid> = self.reports.iter().map(|entry| *entry.key()).collect();
        senders
            .into_iter()
            .filter_map(|id| self.reports.remove(&id).map(|(_, frame)| frame))
            .collect()
    }

    /// Queue a control frame; returns false if the peer is not draining
    pub fn push_control(&self, frame: Bytes) -> bool {
        self.control.try_send(frame).is_ok()
    }

    pub fn pop_sync(&self) -> Option<Bytes> {
        self.sync.pop()
    }

    /// Frames evicted or superseded so far
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.sync.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sync.is_empty()
    }
}

struct RoomPeer {
    id: Uuid,
    address: String,
    queue: Arc<PeerQueue>,
}

#[derive(Default)]
struct Room {
    /// Join order; the head is the longest-connected peer
    peers: Vec<RoomPeer>,
    leader: Option<Uuid>,
}

impl Room {
    fn send_control(&self, id: Uuid, message: &ControlMessage) {
        if let (Some(peer), Ok(frame)) = (self.peers.iter().find(|p| p.id == id), message.encode()) {
            if !peer.queue.push_control(frame) {
                tracing::warn!("Control queue full for {}, dropping {}", peer.address, message.kind());
            }
        }
    }

    fn broadcast_stats(&self) {
        let message = ControlMessage::StatsUpdate {
            active_listeners: self.peers.len() as u32,
        };
        if let Ok(frame) = message.encode() {
            for peer in &self.peers {
                peer.queue.push_control(frame.clone());
            }
        }
    }
}

/// Relay statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RelayStats {
    pub peers: u64,
    pub rooms: usize,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub invalid_frames: u64,
}

/// Rooms, leadership and fan-out
pub struct RelayHub {
    rooms: DashMap<String, Room>,
    config: RelayConfig,
    peers: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
    invalid_frames: AtomicU64,
}

impl RelayHub {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            config,
            peers: AtomicU64::new(0),
            frames_forwarded: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            invalid_frames: AtomicU64::new(0),
        })
    }

    /// In-process dialer that attaches each link straight to this hub
    pub fn dialer(self: &Arc<Self>) -> Arc<dyn Dialer> {
        Arc::new(MemoryDialer { hub: self.clone() })
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.peers.len()).unwrap_or(0)
    }

    /// Address of the room's leader
    pub fn leader_of(&self, room: &str) -> Option<String> {
        let room = self.rooms.get(room)?;
        let leader = room.leader?;
        room.peers
            .iter()
            .find(|p| p.id == leader)
            .map(|p| p.address.clone())
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            peers: self.peers.load(Ordering::Relaxed),
            rooms: self.rooms.len(),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
        }
    }

    /// Serve one peer until it disconnects or goes idle
    pub async fn serve_peer(self: Arc<Self>, mut link: Link) {
        let id = Uuid::new_v4();
        let (queue, control_rx) = PeerQueue::new(self.config.queue_capacity);
        let writer = tokio::spawn(write_peer(queue.clone(), control_rx, link.sender()));

        self.peers.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Peer {} connected from {}", id, link.peer());

        let mut joined: Option<String> = None;
        loop {
            let frame = match tokio::time::timeout(self.config.idle_timeout, link.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => {
                    tracing::info!("Peer {} idle for {:?}, dropping", id, self.config.idle_timeout);
                    break;
                }
            };

            let message = match ControlMessage::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    self.invalid_frames.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Dropping frame from {}: {}", id, e);
                    continue;
                }
            };

            match message {
                ControlMessage::Auth { address, room } => {
                    if joined.is_some() {
                        tracing::debug!("Peer {} re-sent auth, ignoring", id);
                        continue;
                    }
                    let room = room.unwrap_or_else(|| DEFAULT_ROOM.to_string());
                    self.join(&room, id, address, queue.clone());
                    joined = Some(room);
                }
                ControlMessage::Sync(_) => match &joined {
                    Some(room) => self.fan_out(room, id, frame),
                    None => tracing::debug!("Sync from unauthenticated peer {}", id),
                },
                ControlMessage::NodeReport(_) => {
                    if let Some(room) = &joined {
                        self.forward_to_leader(room, id, frame);
                    }
                }
                ControlMessage::Ping { timestamp } => {
                    if let Ok(pong) = (ControlMessage::Pong { timestamp }).encode() {
                        queue.push_control(pong);
                    }
                }
                ControlMessage::LocationUpdate { country_code, .. } => {
                    tracing::debug!("Location update from {} ({})", id, country_code);
                }
                ControlMessage::Error { message } => {
                    tracing::warn!("Peer {} reported error: {}", id, message);
                }
                ControlMessage::Pong { .. }
                | ControlMessage::LeaderUpdate { .. }
                | ControlMessage::StatsUpdate { .. } => {}
            }
        }

        if let Some(room) = joined {
            self.leave(&room, id);
        }
        self.peers.fetch_sub(1, Ordering::Relaxed);
        writer.abort();
        tracing::debug!("Peer {} disconnected", id);
    }

    fn join(&self, room_name: &str, id: Uuid, address: String, queue: Arc<PeerQueue>) {
        let mut room = self.rooms.entry(room_name.to_string()).or_default();
        room.peers.push(RoomPeer {
            id,
            address: address.clone(),
            queue,
        });

        let is_leader = room.leader.is_none();
        if is_leader {
            room.leader = Some(id);
        }
        tracing::info!(
            "{} joined room '{}' ({} peers){}",
            address,
            room_name,
            room.peers.len(),
            if is_leader { " as leader" } else { "" }
        );

        room.send_control(id, &ControlMessage::LeaderUpdate { is_leader });
        room.broadcast_stats();
    }

    fn leave(&self, room_name: &str, id: Uuid) {
        let now_empty = {
            let Some(mut room) = self.rooms.get_mut(room_name) else {
                return;
            };
            room.peers.retain(|p| p.id != id);

            if room.leader == Some(id) {
                room.leader = room.peers.first().map(|p| p.id);
                if let Some(next) = room.leader {
                    tracing::info!("Promoting {} to leader of '{}'", next, room_name);
                    room.send_control(next, &ControlMessage::LeaderUpdate { is_leader: true });
                }
            }
            room.broadcast_stats();
            room.peers.is_empty()
        };

        if now_empty {
            self.rooms.remove_if(room_name, |_, room| room.peers.is_empty());
        }
    }

    fn fan_out(&self, room_name: &str, from: Uuid, frame: Bytes) {
        let Some(room) = self.rooms.get(room_name) else {
            return;
        };
        if room.leader != Some(from) {
            tracing::warn!("Dropping sync from non-leader {}", from);
            return;
        }

        for peer in room.peers.iter().filter(|p| p.id != from) {
            let before = peer.queue.dropped();
            peer.queue.push_sync(frame.clone());
            if peer.queue.dropped() > before {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn forward_to_leader(&self, room_name: &str, from: Uuid, frame: Bytes) {
        let Some(room) = self.rooms.get(room_name) else {
            return;
        };
        match room.leader {
            Some(leader) if leader != from => {
                if let Some(peer) = room.peers.iter().find(|p| p.id == leader) {
                    let before = peer.queue.dropped();
                    peer.queue.push_report(from, frame);
                    if peer.queue.dropped() > before {
                        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }
}

async fn write_peer(queue: Arc<PeerQueue>, mut control_rx: mpsc::Receiver<Bytes>, out: mpsc::Sender<Bytes>) {
    loop {
        tokio::select! {
            biased;
            frame = control_rx.recv() => match frame {
                Some(frame) => {
                    if out.send(frame).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = queue.notify.notified() => {
                while let Some(frame) = queue.pop_sync() {
                    if out.send(frame).await.is_err() {
                        return;
                    }
                }
                for frame in queue.take_reports() {
                    if out.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Dialer attaching in-memory links to a hub
struct MemoryDialer {
    hub: Arc<RelayHub>,
}

impl Dialer for MemoryDialer {
    fn dial(&self) -> BoxFuture<'_, Result<Link, NetworkError>> {
        async move {
            let (local, remote) = Link::pair(LINK_CHANNEL_CAPACITY);
            tokio::spawn(self.hub.clone().serve_peer(remote));
            Ok(local)
        }
        .boxed()
    }

    fn target(&self) -> String {
        "memory://relay".to_string()
    }
}

/// Accepts TCP peers into a hub
pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<RelayHub>,
}

impl RelayServer {
    pub async fn bind(addr: &str, hub: Arc<RelayHub>) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        Ok(Self { listener, hub })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn hub(&self) -> Arc<RelayHub> {
        self.hub.clone()
    }

    /// Accept forever
    pub async fn run(self) -> Result<(), NetworkError> {
        tracing::info!("Relay listening on {}", self.local_addr()?);
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("Accepted {}", addr);
                    tokio::spawn(self.hub.clone().serve_peer(Link::from_tcp(stream)));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::link::TcpDialer;
    use crate::protocol::{NetworkNode, SyncBroadcast};

    async fn next(link: &mut Link) -> ControlMessage {
        let frame = tokio::time::timeout(Duration::from_secs(2), link.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed");
        ControlMessage::decode(&frame).unwrap()
    }

    async fn join(hub: &Arc<RelayHub>, address: &str) -> Link {
        let link = hub.dialer().dial().await.unwrap();
        link.send_message(&ControlMessage::Auth {
            address: address.into(),
            room: Some("room".into()),
        })
        .await
        .unwrap();
        link
    }

    fn sync(position: f64) -> ControlMessage {
        ControlMessage::Sync(SyncBroadcast {
            song_id: 1,
            timestamp: position,
            playing: true,
            nodes: vec![],
        })
    }

    #[test]
    fn test_peer_queue_drops_oldest() {
        let (queue, _control) = PeerQueue::new(2);
        queue.push_sync(Bytes::from("1"));
        queue.push_sync(Bytes::from("2"));
        queue.push_sync(Bytes::from("3"));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop_sync(), Some(Bytes::from("2")));
        assert_eq!(queue.pop_sync(), Some(Bytes::from("3")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reports_keep_one_slot_per_follower() {
        let (queue, _control) = PeerQueue::new(2);
        let (b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.push_report(b, Bytes::from("b1"));
        queue.push_report(c, Bytes::from("c1"));
        queue.push_report(d, Bytes::from("d1"));
        queue.push_report(b, Bytes::from("b2"));

        assert_eq!(queue.dropped(), 1);
        let mut pending = queue.take_reports();
        pending.sort();
        assert_eq!(pending, vec![Bytes::from("b2"), Bytes::from("c1"), Bytes::from("d1")]);
        assert!(queue.take_reports().is_empty());
    }

    fn report_from(id: &str) -> ControlMessage {
        ControlMessage::NodeReport(NetworkNode {
            id: id.into(),
            latency: 10.0,
            sync_error: 0.0,
            playback_rate: 1.0,
            connection_type: Default::default(),
        })
    }

    #[tokio::test]
    async fn test_stalled_leader_still_gets_every_follower_report() {
        let hub = RelayHub::new(RelayConfig {
            queue_capacity: 2,
            ..RelayConfig::default()
        });

        // One-slot link: the leader's writer stalls until the test reads.
        let (mut leader, remote) = Link::pair(1);
        tokio::spawn(hub.clone().serve_peer(remote));
        leader
            .send_message(&ControlMessage::Auth {
                address: "leader".into(),
                room: Some("room".into()),
            })
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while hub.leader_of("room").is_none() {
            assert!(tokio::time::Instant::now() < deadline, "leader never joined");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut followers = Vec::new();
        for id in ["b", "c", "d"] {
            let follower = join(&hub, id).await;
            follower.send_message(&report_from(id)).await.unwrap();
            followers.push(follower);
        }
        while hub.stats().frames_forwarded < 3 {
            assert!(tokio::time::Instant::now() < deadline, "reports never forwarded");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut reporters = Vec::new();
        while reporters.len() < 3 {
            if let ControlMessage::NodeReport(node) = next(&mut leader).await {
                reporters.push(node.id);
            }
        }
        reporters.sort();
        assert_eq!(reporters, vec!["b", "c", "d"]);
        assert_eq!(hub.stats().frames_dropped, 0);
    }

    #[tokio::test]
    async fn test_first_peer_leads() {
        let hub = RelayHub::new(RelayConfig::default());

        let mut a = join(&hub, "a").await;
        assert_eq!(next(&mut a).await, ControlMessage::LeaderUpdate { is_leader: true });
        assert_eq!(next(&mut a).await, ControlMessage::StatsUpdate { active_listeners: 1 });

        let mut b = join(&hub, "b").await;
        assert_eq!(next(&mut b).await, ControlMessage::LeaderUpdate { is_leader: false });
        assert_eq!(next(&mut b).await, ControlMessage::StatsUpdate { active_listeners: 2 });
        assert_eq!(next(&mut a).await, ControlMessage::StatsUpdate { active_listeners: 2 });

        assert_eq!(hub.leader_of("room").as_deref(), Some("a"));
        assert_eq!(hub.room_size("room"), 2);
    }

    #[tokio::test]
    async fn test_leader_sync_reaches_followers_only() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut a = join(&hub, "a").await;
        next(&mut a).await;
        next(&mut a).await;
        let mut b = join(&hub, "b").await;
        next(&mut b).await;
        next(&mut b).await;
        next(&mut a).await;

        // Non-leader sync is dropped, leader sync is fanned out.
        b.send_message(&sync(1.0)).await.unwrap();
        a.send_message(&sync(2.0)).await.unwrap();

        assert_eq!(next(&mut b).await, sync(2.0));

        a.send_message(&ControlMessage::Ping { timestamp: 9 }).await.unwrap();
        assert_eq!(next(&mut a).await, ControlMessage::Pong { timestamp: 9 });
    }

    #[tokio::test]
    async fn test_node_reports_go_to_leader() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut a = join(&hub, "a").await;
        next(&mut a).await;
        next(&mut a).await;
        let mut b = join(&hub, "b").await;
        next(&mut b).await;
        next(&mut b).await;
        next(&mut a).await;

        let report = ControlMessage::NodeReport(NetworkNode {
            id: "b".into(),
            latency: 20.0,
            sync_error: 0.05,
            playback_rate: 1.01,
            connection_type: Default::default(),
        });
        b.send_message(&report).await.unwrap();
        assert_eq!(next(&mut a).await, report);
    }

    #[tokio::test]
    async fn test_leader_departure_promotes_next() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut a = join(&hub, "a").await;
        assert_eq!(next(&mut a).await, ControlMessage::LeaderUpdate { is_leader: true });
        let mut b = join(&hub, "b").await;
        assert_eq!(next(&mut b).await, ControlMessage::LeaderUpdate { is_leader: false });
        let mut c = join(&hub, "c").await;
        assert_eq!(next(&mut c).await, ControlMessage::LeaderUpdate { is_leader: false });

        drop(a);

        let mut promoted = false;
        for _ in 0..6 {
            if next(&mut b).await == (ControlMessage::LeaderUpdate { is_leader: true }) {
                promoted = true;
                break;
            }
        }
        assert!(promoted);
        assert_eq!(hub.leader_of("room").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut a = join(&hub, "a").await;
        next(&mut a).await;
        next(&mut a).await;

        a.send(Bytes::from_static(b"{garbage")).await.unwrap();
        a.send_message(&ControlMessage::Ping { timestamp: 1 }).await.unwrap();
        assert_eq!(next(&mut a).await, ControlMessage::Pong { timestamp: 1 });
        assert_eq!(hub.stats().invalid_frames, 1);
    }

    #[tokio::test]
    async fn test_tcp_relay_round_trip() {
        let hub = RelayHub::new(RelayConfig::default());
        let server = RelayServer::bind("127.0.0.1:0", hub.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let mut link = TcpDialer::new(addr.to_string()).dial().await.unwrap();
        link.send_message(&ControlMessage::Auth { address: "t".into(), room: None })
            .await
            .unwrap();
        assert_eq!(next(&mut link).await, ControlMessage::LeaderUpdate { is_leader: true });
        assert_eq!(hub.room_size(DEFAULT_ROOM), 1);

        task.abort();
    }
}
