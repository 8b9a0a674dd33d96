/// API Server implementation

use super::handlers::*;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use hostlink_core::Runtime;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Loopback status server for operators
pub struct ApiServer {
    listen_addr: SocketAddr,
    runtime: Arc<Runtime>,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, runtime: Arc<Runtime>) -> Self {
        Self {
            listen_addr,
            runtime,
        }
    }

    /// Builds the router with all endpoints
    pub fn router(runtime: Arc<Runtime>) -> Router {
        let state = AppState { runtime };

        Router::new()
            .route("/health", get(health_check))
            .route("/api/status", get(get_status))
            .route("/api/policy", get(get_policy))
            .route("/api/routes", get(get_routes))
            .route("/api/sessions", get(get_sessions))
            .route("/api/sessions/:id/abort", post(abort_session))
            .route("/api/handoffs", get(get_handoffs))
            .route("/api/credentials", get(get_credentials))
            .route("/api/reload", post(reload))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the API server
    pub async fn start(self) -> Result<()> {
        if !self.listen_addr.ip().is_loopback() {
            anyhow::bail!(
                "API address {} is not a loopback address",
                self.listen_addr
            );
        }

        let app = Self::router(self.runtime.clone());

        info!("API server starting on {}", self.listen_addr);

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
