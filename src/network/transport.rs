//! Transport selection
//!
//! Clients reach their room through the shared relay by default. On a LAN
//! a relay can also be found directly: the client broadcasts a UDP probe
//! on the discovery port and a relay answers with its TCP address.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::link::{Dialer, TcpDialer};
use crate::protocol::{ConnectionType, DiscoveryMessage};

/// Tracks which transport the session uses
pub struct ConnectionManager {
    selected: Option<ConnectionType>,
    relay: Arc<dyn Dialer>,
    proximity_addr: Option<SocketAddr>,
    discovery_target: SocketAddr,
    probe_timeout: Duration,
    client_id: String,
}

impl ConnectionManager {
    pub fn new(relay: Arc<dyn Dialer>, config: &NetworkConfig, client_id: impl Into<String>) -> Self {
        Self {
            selected: None,
            relay,
            proximity_addr: None,
            discovery_target: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                config.discovery_port,
            )),
            probe_timeout: Duration::from_millis(config.proximity_probe_timeout_ms),
            client_id: client_id.into(),
        }
    }

    /// Send probes somewhere other than the LAN broadcast address
    pub fn with_discovery_target(mut self, target: SocketAddr) -> Self {
        self.discovery_target = target;
        self
    }

    /// Select the relay unless a transport is already active
    pub fn select_transport(&mut self) -> ConnectionType {
        *self.selected.get_or_insert(ConnectionType::Relay)
    }

    pub fn selected(&self) -> Option<ConnectionType> {
        self.selected
    }

    /// Reports the active transport, `Unknown` before selection
    pub fn connection_type(&self) -> ConnectionType {
        self.selected.unwrap_or(ConnectionType::Unknown)
    }

    /// False until a transport has been selected and is dialable
    pub fn is_valid_connection(&self) -> bool {
        match self.selected {
            Some(ConnectionType::Relay) => true,
            Some(ConnectionType::Proximity) => self.proximity_addr.is_some(),
            Some(ConnectionType::Unknown) | None => false,
        }
    }

    /// Try to negotiate the proximity transport; never fails loudly
    pub async fn connect_proximity(&mut self) -> bool {
        match probe(self.discovery_target, &self.client_id, self.probe_timeout).await {
            Ok(addr) => {
                tracing::info!("Proximity relay found at {}", addr);
                self.proximity_addr = Some(addr);
                self.selected = Some(ConnectionType::Proximity);
                true
            }
            Err(e) => {
                tracing::warn!("Proximity negotiation failed: {}", e);
                false
            }
        }
    }

    /// Return to the shared relay
    pub fn use_relay(&mut self) {
        self.selected = Some(ConnectionType::Relay);
        self.proximity_addr = None;
    }

    /// Dialer for the active transport
    pub fn dialer(&self) -> Option<Arc<dyn Dialer>> {
        match (self.selected?, self.proximity_addr) {
            (ConnectionType::Relay, _) => Some(self.relay.clone()),
            (ConnectionType::Proximity, Some(addr)) => {
                Some(Arc::new(TcpDialer::new(addr.to_string())) as Arc<dyn Dialer>)
            }
            _ => None,
        }
    }
}

/// Bind a UDP socket suitable for discovery traffic
pub fn bind_discovery_socket(port: u16) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    UdpSocket::from_std(socket.into()).map_err(|e| NetworkError::BindFailed(e.to_string()))
}

/// Broadcast a probe and wait for the first offer
async fn probe(
    target: SocketAddr,
    client_id: &str,
    timeout: Duration,
) -> Result<SocketAddr, NetworkError> {
    let socket = bind_discovery_socket(0)?;
    let probe = DiscoveryMessage::ProximityProbe {
        client: client_id.to_string(),
    }
    .encode()
    .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

    socket
        .send_to(&probe, target)
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        match DiscoveryMessage::decode(&buf[..len]) {
            Ok(DiscoveryMessage::ProximityOffer { addr }) => {
                let mut offered: SocketAddr = addr
                    .parse()
                    .map_err(|_| NetworkError::ConnectionFailed(format!("bad offer {}", addr)))?;
                if offered.ip().is_unspecified() {
                    offered.set_ip(from.ip());
                }
                return Ok(offered);
            }
            Ok(other) => tracing::debug!("Ignoring discovery message {:?} from {}", other, from),
            Err(e) => tracing::debug!("Bad discovery datagram from {}: {}", from, e),
        }
    }
}

/// Answer proximity probes with `advertised` until the task is cancelled
pub async fn serve_proximity(socket: UdpSocket, advertised: SocketAddr) -> Result<(), NetworkError> {
    let offer = DiscoveryMessage::ProximityOffer {
        addr: advertised.to_string(),
    }
    .encode()
    .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        match DiscoveryMessage::decode(&buf[..len]) {
            Ok(DiscoveryMessage::ProximityProbe { client }) => {
                tracing::debug!("Proximity probe from {} ({})", client, from);
                if let Err(e) = socket.send_to(&offer, from).await {
                    tracing::warn!("Failed to answer probe from {}: {}", from, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Bad discovery datagram from {}: {}", from, e),
        }
    }
}
