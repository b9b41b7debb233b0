//! Client Application
//!
//! Joins a relay room with a simulated playback engine, follows the room
//! leader (or leads it) and exposes the session over the status API.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playsync::{
    config::AppConfig,
    network::TcpDialer,
    playback::{PlaybackEngine, SimulatedEngine},
    sync::{SessionEvent, SyncSession},
    ui::WebServer,
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

    tracing::info!("Starting playsync client");

    let config = AppConfig::load()?;

    let engine = Arc::new(SimulatedEngine::new());
    if let Some(track) = config.sync.initial_track {
        engine.load_track(track)?;
        engine.set_playing(true)?;
        tracing::info!("Playing track {}", track);
    }

    let dialer = Arc::new(TcpDialer::new(config.network.relay_address.clone()));
    let session = SyncSession::new(config.clone(), engine.clone(), dialer).spawn()?;

    let web_server = WebServer::new(config.ui.clone(), session.clone());
    let _web_handle = web_server.start_background();

    // Log session events
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::LeaderChanged(true)) => tracing::info!("This client now leads the room"),
                Ok(SessionEvent::LeaderChanged(false)) => tracing::info!("Following the room leader"),
                Ok(SessionEvent::RetriesExhausted(error)) => {
                    tracing::error!("{}; POST /api/reconnect to try again", error)
                }
                Ok(SessionEvent::ServerError(message)) => tracing::warn!("Relay error: {}", message),
                Ok(event) => tracing::debug!("Session event: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} session events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Periodic stats
    let stats_session = session.clone();
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let status = stats_session.status();
            tracing::info!(
                "State: {:?}, leader: {}, rate: {:.3}, quality: {:.2}, peers: {}, dropouts: {}",
                status.state,
                status.is_leader,
                status.applied_rate,
                status.connection.quality,
                stats_session.nodes().len(),
                status.playback.dropout_count
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down client");
    stats_task.abort();
    session.close().await;

    Ok(())
}
