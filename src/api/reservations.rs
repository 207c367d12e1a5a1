//! Reservation management endpoints

use super::{error_to_status_code, ApiResponse, ApiState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{
    ActivityLogModel, ActivityLogQueries, BookingModel, BookingQueries, NewRequest, RequestModel,
    RequestQueries, RequestStatus, SubscriptionModel, SubscriptionQueries,
};

/// Body for creating a reservation request
#[derive(Debug, Deserialize)]
pub struct ReservationCreate {
    /// Restaurant name
    pub restaurant_name: String,
    /// Requested date, YYYY-MM-DD
    pub date: String,
    /// Preferred time, HH:MM
    pub time: String,
    /// Party size
    pub party_size: u32,
    /// Contact email
    #[serde(default)]
    pub contact_email: String,
    /// Known platform venue id, from autocomplete
    pub venue_id: Option<String>,
    /// Inventory release instant, RFC 3339
    pub booking_open_time: Option<String>,
    /// Sniper poll budget override, seconds
    pub max_poll_duration_secs: Option<u32>,
}

/// Reservation detail: the request with its subscriptions, bookings and logs
#[derive(Debug, Serialize)]
pub struct ReservationDetail {
    /// The request row
    #[serde(flatten)]
    pub request: RequestModel,
    /// Notify subscriptions
    pub subscriptions: Vec<SubscriptionModel>,
    /// Bookings
    pub bookings: Vec<BookingModel>,
    /// Activity log entries
    pub logs: Vec<ActivityLogModel>,
}

/// Filter for listing reservations
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Status filter
    pub status: Option<String>,
}

/// Venue autocomplete query
#[derive(Debug, Deserialize)]
pub struct VenueSearchParams {
    /// Name fragment
    pub q: String,
}

/// Create a reservation request and spawn its acquisition task.
pub async fn create_reservation(
    State(state): State<ApiState>,
    Json(body): Json<ReservationCreate>,
) -> impl IntoResponse {
    if body.restaurant_name.trim().is_empty() || body.date.is_empty() || body.time.is_empty() {
        let response: ApiResponse<RequestModel> =
            ApiResponse::error("restaurant_name, date and time are required");
        return (StatusCode::BAD_REQUEST, Json(response));
    }
    if body.party_size == 0 {
        let response: ApiResponse<RequestModel> =
            ApiResponse::error("party_size must be at least 1");
        return (StatusCode::BAD_REQUEST, Json(response));
    }

    let booking_open_time = match &body.booking_open_time {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(_) => {
                let response: ApiResponse<RequestModel> =
                    ApiResponse::error("booking_open_time must be an RFC 3339 timestamp");
                return (StatusCode::BAD_REQUEST, Json(response));
            }
        },
        None => None,
    };

    let requests = RequestQueries::new(&state.app.db);
    let created = requests
        .create(&NewRequest {
            restaurant_name: body.restaurant_name.clone(),
            date: body.date.clone(),
            time: body.time.clone(),
            party_size: body.party_size,
            contact_email: body.contact_email.clone(),
            venue_id: body.venue_id.clone(),
            booking_open_time,
            max_poll_duration_secs: body.max_poll_duration_secs,
        })
        .await;

    let request_id = match created {
        Ok(id) => id,
        Err(e) => {
            return (
                error_to_status_code(&e),
                Json(ApiResponse::error(e.to_string())),
            )
        }
    };

    info!(
        "Reservation request {} created for {}",
        request_id, body.restaurant_name
    );

    // The handler returns as soon as the task is enqueued.
    state.app.orchestrator.spawn_submit(request_id);

    match requests.get_by_id(request_id).await {
        Ok(Some(request)) => (StatusCode::CREATED, Json(ApiResponse::success(request))),
        Ok(None) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error("request vanished after creation")),
        ),
        Err(e) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// List reservation requests, optionally filtered by status.
pub async fn list_reservations(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let status = match params.status.as_deref() {
        Some(raw) => match RequestStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                let response: ApiResponse<Vec<RequestModel>> =
                    ApiResponse::error(format!("unknown status '{raw}'"));
                return (StatusCode::BAD_REQUEST, Json(response));
            }
        },
        None => None,
    };

    match RequestQueries::new(&state.app.db).list(status).await {
        Ok(requests) => (StatusCode::OK, Json(ApiResponse::success(requests))),
        Err(e) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// Reservation detail with subscriptions, bookings and logs.
pub async fn get_reservation(
    State(state): State<ApiState>,
    Path(request_id): Path<i64>,
) -> impl IntoResponse {
    let requests = RequestQueries::new(&state.app.db);
    let request = match requests.get_by_id(request_id).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            let response: ApiResponse<ReservationDetail> =
                ApiResponse::error("Reservation not found");
            return (StatusCode::NOT_FOUND, Json(response));
        }
        Err(e) => {
            return (
                error_to_status_code(&e),
                Json(ApiResponse::error(e.to_string())),
            )
        }
    };

    let subscriptions = SubscriptionQueries::new(&state.app.db)
        .list_for_request(request_id)
        .await;
    let bookings = BookingQueries::new(&state.app.db)
        .list_for_request(request_id)
        .await;
    let logs = ActivityLogQueries::new(&state.app.db)
        .list_for_request(request_id)
        .await;

    match (subscriptions, bookings, logs) {
        (Ok(subscriptions), Ok(bookings), Ok(logs)) => (
            StatusCode::OK,
            Json(ApiResponse::success(ReservationDetail {
                request,
                subscriptions,
                bookings,
                logs,
            })),
        ),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// Cancel a reservation request.
pub async fn cancel_reservation(
    State(state): State<ApiState>,
    Path(request_id): Path<i64>,
) -> impl IntoResponse {
    match state.app.orchestrator.cancel(request_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "status": "cancelled"
            }))),
        ),
        Err(e) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// Force a request back to `pending` and re-enter the orchestrator.
/// Rejected with 400 when the request is already booked.
pub async fn retry_reservation(
    State(state): State<ApiState>,
    Path(request_id): Path<i64>,
) -> impl IntoResponse {
    match state.app.orchestrator.retry(request_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "status": "retrying"
            }))),
        ),
        Err(e @ crate::AgentError::InvalidTransition { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("Already booked: {e}"))),
        ),
        Err(e) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// Venue autocomplete backed by the primary platform's search.
pub async fn venue_search(
    State(state): State<ApiState>,
    Query(params): Query<VenueSearchParams>,
) -> impl IntoResponse {
    if params.q.len() < 2 {
        return (
            StatusCode::OK,
            Json(ApiResponse::success(Vec::new())),
        );
    }

    match state.app.resy.search_venues(&params.q).await {
        Ok(hits) => (StatusCode::OK, Json(ApiResponse::success(hits))),
        Err(e) => (
            error_to_status_code(&e),
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}
