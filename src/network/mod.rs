//! Network subsystem: links, transport selection, connection lifecycle, relay

pub mod link;
pub mod transport;
pub mod lifecycle;
pub mod relay;

pub use link::{Dialer, Link, TcpDialer};
pub use transport::ConnectionManager;
pub use lifecycle::{ConnectionLifecycle, ConnectionQuality, LinkState, ReconnectPolicy};
pub use relay::{RelayHub, RelayServer};
