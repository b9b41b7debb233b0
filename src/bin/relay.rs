//! Relay Application
//!
//! Accepts client connections, elects a leader per room and fans its sync
//! broadcasts out to the followers. Also answers LAN proximity probes.

use anyhow::Result;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playsync::{
    config::AppConfig,
    network::{
        relay::{RelayConfig, RelayHub, RelayServer},
        transport::{bind_discovery_socket, serve_proximity},
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting playsync relay");

    let config = AppConfig::load()?;

    let hub = RelayHub::new(RelayConfig::from(&config.network));
    let server = RelayServer::bind(&config.network.relay_bind, hub.clone()).await?;
    let advertised = server.local_addr()?;

    // Proximity discovery is optional; the relay works without it.
    match bind_discovery_socket(config.network.discovery_port) {
        Ok(socket) => {
            tracing::info!("Answering proximity probes on UDP {}", config.network.discovery_port);
            tokio::spawn(async move {
                if let Err(e) = serve_proximity(socket, advertised).await {
                    tracing::warn!("Proximity responder stopped: {}", e);
                }
            });
        }
        Err(e) => tracing::warn!("Proximity discovery unavailable: {}", e),
    }

    let server_task = tokio::spawn(server.run());

    // Periodic stats
    let stats_hub = hub.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let stats = stats_hub.stats();
            tracing::info!(
                "Peers: {}, rooms: {}, forwarded: {}, dropped: {}, invalid: {}",
                stats.peers,
                stats.rooms,
                stats.frames_forwarded,
                stats.frames_dropped,
                stats.invalid_frames
            );
        }
    });

    tokio::select! {
        result = server_task => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down relay");
        }
    }

    Ok(())
}
