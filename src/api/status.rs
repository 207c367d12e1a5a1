//! System status endpoints

use super::{error_to_status_code, ApiResponse, ApiState};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

use crate::db::{
    ActivityLogModel, ActivityLogQueries, BookingModel, BookingQueries, RequestQueries,
    RequestStatus,
};

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Total reservation requests
    pub total_requests: i64,
    /// Requests currently waiting or polling
    pub active_snipers: i64,
    /// Total bookings
    pub total_bookings: i64,
}

/// Activity listing parameters
#[derive(Debug, Deserialize)]
pub struct ActivityParams {
    /// Scope to one request
    pub request_id: Option<i64>,
    /// Maximum entries to return
    #[serde(default = "default_activity_limit")]
    pub limit: u32,
}

fn default_activity_limit() -> u32 {
    50
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
}

/// Health check endpoint
pub async fn health_check() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Aggregate system status
pub async fn system_status(State(state): State<ApiState>) -> impl IntoResponse {
    let requests = RequestQueries::new(&state.app.db);
    let bookings = BookingQueries::new(&state.app.db);

    let total_requests = requests.count().await;
    let active_snipers = requests
        .count_in_statuses(&[RequestStatus::Waiting, RequestStatus::Polling])
        .await;
    let total_bookings = bookings.count().await;

    match (total_requests, active_snipers, total_bookings) {
        (Ok(total_requests), Ok(active_snipers), Ok(total_bookings)) => (
            StatusCode::OK,
            Json(ApiResponse::success(StatusResponse {
                total_requests,
                active_snipers,
                total_bookings,
            })),
        ),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// All bookings, newest first
pub async fn list_bookings(State(state): State<ApiState>) -> impl IntoResponse {
    match BookingQueries::new(&state.app.db).list().await {
        Ok(bookings) => (
            StatusCode::OK,
            Json(ApiResponse::<Vec<BookingModel>>::success(bookings)),
        ),
        Err(e) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// Recent activity log entries
pub async fn list_activity(
    State(state): State<ApiState>,
    Query(params): Query<ActivityParams>,
) -> impl IntoResponse {
    match ActivityLogQueries::new(&state.app.db)
        .list(params.request_id, params.limit)
        .await
    {
        Ok(entries) => (
            StatusCode::OK,
            Json(ApiResponse::<Vec<ActivityLogModel>>::success(entries)),
        ),
        Err(e) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}
