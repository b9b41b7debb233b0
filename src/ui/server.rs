//! Status API server

use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::config::UiConfig;
use crate::sync::SessionHandle;
use crate::ui::handlers;

/// Shared state for request handlers
pub struct AppState {
    pub session: SessionHandle,
    pub started: Instant,
}

/// HTTP front end over a running session
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, session: SessionHandle) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                session,
                started: Instant::now(),
            }),
        }
    }

    /// Build the router without binding
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/metrics", get(handlers::get_metrics))
            .route("/api/nodes", get(handlers::get_nodes))
            .route("/api/sync/toggle", post(handlers::toggle_sync))
            .route("/api/control", put(handlers::update_control))
            .route("/api/transport/proximity", post(handlers::switch_to_proximity))
            .route("/api/track", post(handlers::select_track))
            .route("/api/location", post(handlers::report_location))
            .route("/api/reconnect", post(handlers::reconnect))
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Serve until the listener fails
    pub async fn run(self) -> crate::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| crate::Error::Config(format!("Invalid UI address: {}", e)))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Status API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Spawn the server on the runtime; `None` when disabled
    pub fn start_background(self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("Status API disabled");
            return None;
        }
        Some(tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Status API stopped: {}", e);
            }
        }))
    }
}
