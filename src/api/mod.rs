//! HTTP control surface
//!
//! This module provides the REST API for:
//! - Submitting and managing reservation requests
//! - Venue autocomplete search
//! - System status, bookings and the activity log

use crate::{AgentApp, AgentError};
use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

mod reservations;
mod status;

pub use reservations::*;
pub use status::*;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The agent application
    pub app: AgentApp,
}

/// Build the API router
fn build_router(app: AgentApp) -> Router {
    let state = ApiState { app };

    Router::new()
        // Health check
        .route("/api/health", get(health_check))
        // Reservation endpoints
        .route("/api/reservations", post(create_reservation))
        .route("/api/reservations", get(list_reservations))
        .route("/api/reservations/search/venues", get(venue_search))
        .route("/api/reservations/:request_id", get(get_reservation))
        .route("/api/reservations/:request_id", delete(cancel_reservation))
        .route("/api/reservations/:request_id/retry", post(retry_reservation))
        // System status
        .route("/api/status", get(system_status))
        .route("/api/bookings", get(list_bookings))
        .route("/api/activity", get(list_activity))
        .with_state(state)
}

/// Start the HTTP API server; it drains and stops when the shutdown token
/// fires.
pub async fn serve_until(app: AgentApp, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = app.config.clone();

    let router = build_router(app);

    let router = if config.api.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    let addr: std::net::SocketAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Shutdown requested, stopping API server...");
        })
        .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (only present if success is true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (only present if success is false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Convert an AgentError to an HTTP status code
pub fn error_to_status_code(err: &AgentError) -> StatusCode {
    match err {
        AgentError::NotFound(_) => StatusCode::NOT_FOUND,
        AgentError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        AgentError::Platform(_) => StatusCode::BAD_GATEWAY,
        AgentError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AgentError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AgentError::Api(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
