//! Connection lifecycle: open, authenticate, heartbeat, reconnect
//!
//! ```text
//!   Closed ──open()──► Opening ──dial ok──► Open
//!     ▲                   │                  │
//!     └────dial failed────┘                  │ close / error / heartbeat timeout
//!     └──────────────────────────────────────┘
//! ```
//!
//! The lifecycle does not own a timer. The session's scheduler calls
//! [`ConnectionLifecycle::poll_heartbeat`] on every tick and sleeps for the
//! delays returned by [`ConnectionLifecycle::handle_close`], so cancelling the
//! session cancels all of them at once.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::constants::QUALITY_ZERO_RTT_MS;
use crate::error::NetworkError;
use crate::network::link::{Dialer, Link};
use crate::protocol::ControlMessage;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Closed,
    Opening,
    Open,
}

/// Why a link went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Caller asked for it; never reconnects
    Explicit,
    /// Remote end closed the link
    Remote,
    /// A send or dial failed
    Error,
    /// A ping went unanswered past the timeout
    HeartbeatTimeout,
}

/// What to do after a close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry(Duration),
    Exhausted { attempts: u32 },
    Stop,
}

/// Result of a heartbeat poll
#[derive(Debug, Clone, PartialEq)]
pub enum Heartbeat {
    Idle,
    Ping(ControlMessage),
    Dead { waited: Duration },
}

/// Auxiliary link quality derived from ping round trips
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQuality {
    /// 1.0 for an instant round trip, 0.0 at one second or more
    pub quality: f64,
    pub latency_ms: f64,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            quality: 0.0,
            latency_ms: 0.0,
        }
    }
}

/// `clamp(1 - rtt / 1000ms, 0, 1)`
pub fn quality_from_rtt(rtt_ms: f64) -> f64 {
    if rtt_ms.is_nan() {
        return 0.0;
    }
    (1.0 - rtt_ms / QUALITY_ZERO_RTT_MS).clamp(0.0, 1.0)
}

/// Wall-clock milliseconds used as ping timestamps
pub fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Capped exponential backoff with a bounded attempt count
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.max_reconnect_attempts,
        )
    }

    /// `min(base * 2^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the next attempt, or `None` once attempts are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Owns one client's link to the relay
pub struct ConnectionLifecycle {
    dialer: Arc<dyn Dialer>,
    state: LinkState,
    link: Option<Link>,
    address: Option<String>,
    room: Option<String>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    last_ping_at: Option<Instant>,
    /// Oldest unanswered ping: (timestamp, sent at)
    outstanding: Option<(i64, Instant)>,
    quality: ConnectionQuality,
    policy: ReconnectPolicy,
    explicitly_closed: bool,
}

impl ConnectionLifecycle {
    pub fn new(dialer: Arc<dyn Dialer>, config: &NetworkConfig) -> Self {
        Self {
            dialer,
            state: LinkState::Closed,
            link: None,
            address: None,
            room: None,
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            last_ping_at: None,
            outstanding: None,
            quality: ConnectionQuality::default(),
            policy: ReconnectPolicy::from_config(config),
            explicitly_closed: false,
        }
    }

    /// Identity sent in the `auth` message on every open
    pub fn with_identity(mut self, address: Option<String>, room: Option<String>) -> Self {
        self.address = address;
        self.room = room;
        self
    }

    /// Dial somewhere else from the next open on
    pub fn set_dialer(&mut self, dialer: Arc<dyn Dialer>) {
        self.dialer = dialer;
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.quality
    }

    pub fn attempts(&self) -> u32 {
        self.policy.attempts()
    }

    /// Allow a fresh round of reconnection attempts
    pub fn reset_attempts(&mut self) {
        self.policy.reset();
    }

    /// Dial and authenticate
    pub async fn open(&mut self) -> Result<(), NetworkError> {
        self.explicitly_closed = false;
        self.state = LinkState::Opening;
        tracing::debug!("Dialing {}", self.dialer.target());

        let link = match self.dialer.dial().await {
            Ok(link) => link,
            Err(e) => {
                self.state = LinkState::Closed;
                return Err(e);
            }
        };

        if let Some(address) = &self.address {
            let auth = ControlMessage::Auth {
                address: address.clone(),
                room: self.room.clone(),
            };
            if let Err(e) = link.send_message(&auth).await {
                self.state = LinkState::Closed;
                return Err(e);
            }
        }

        tracing::info!("Connected to {} ({})", self.dialer.target(), link.peer());
        self.link = Some(link);
        self.state = LinkState::Open;
        self.last_ping_at = None;
        self.outstanding = None;
        self.policy.reset();
        Ok(())
    }

    /// Queue a message without waiting on a slow peer
    pub fn try_send(&self, message: &ControlMessage) -> Result<(), NetworkError> {
        match &self.link {
            Some(link) => link.try_send_message(message),
            None => Err(NetworkError::Closed),
        }
    }

    /// Next inbound frame. Pends forever while closed so it can sit in a `select!`.
    pub async fn recv(&mut self) -> Option<Bytes> {
        match self.link.as_mut() {
            Some(link) => link.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Decide whether a ping is due or the peer is dead
    pub fn poll_heartbeat(&mut self, now: Instant, wall_ms: i64) -> Heartbeat {
        if self.state != LinkState::Open {
            return Heartbeat::Idle;
        }

        if let Some((_, sent)) = self.outstanding {
            let waited = now.saturating_duration_since(sent);
            if waited >= self.heartbeat_timeout {
                return Heartbeat::Dead { waited };
            }
        }

        let due = self
            .last_ping_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.heartbeat_interval);
        if !due {
            return Heartbeat::Idle;
        }

        self.last_ping_at = Some(now);
        if self.outstanding.is_none() {
            self.outstanding = Some((wall_ms, now));
        }
        Heartbeat::Ping(ControlMessage::Ping { timestamp: wall_ms })
    }

    /// Record a pong and return the updated quality
    pub fn on_pong(&mut self, timestamp: i64, wall_ms: i64) -> ConnectionQuality {
        let rtt = (wall_ms - timestamp).max(0) as f64;
        self.quality = ConnectionQuality {
            quality: quality_from_rtt(rtt),
            latency_ms: rtt,
        };

        if matches!(self.outstanding, Some((sent_ts, _)) if sent_ts <= timestamp) {
            self.outstanding = None;
        }
        self.quality
    }

    /// Tear down the link and decide whether to reconnect
    pub fn handle_close(&mut self, reason: CloseReason) -> ReconnectDecision {
        self.drop_link();

        if reason == CloseReason::Explicit || self.explicitly_closed {
            return ReconnectDecision::Stop;
        }

        match self.policy.next_delay() {
            Some(delay) => {
                tracing::info!(
                    "Link closed ({:?}); reconnect attempt {}/{} in {:?}",
                    reason,
                    self.policy.attempts(),
                    self.policy.max_attempts(),
                    delay
                );
                ReconnectDecision::Retry(delay)
            }
            None => {
                tracing::warn!("Link closed ({:?}); reconnection attempts exhausted", reason);
                ReconnectDecision::Exhausted {
                    attempts: self.policy.attempts(),
                }
            }
        }
    }

    /// Intentional close; suppresses reconnection
    pub fn close(&mut self) {
        self.explicitly_closed = true;
        self.drop_link();
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.state = LinkState::Closed;
        self.outstanding = None;
        self.last_ping_at = None;
        self.quality = ConnectionQuality::default();
    }
}
