//! HTTP API handlers for Tripguard.
//!
//! # Surfaces
//!
//! - **Trips**: create, read, edit, location pings, cancel, complete
//! - **Alerts**: manual SOS, per-user history, resolve/cancel, delivery ledger
//! - **Monitoring**: scheduler status, manual cycle, high-risk toggle
//!
//! Handlers log ids only. Contact phone numbers and email addresses never
//! appear in log output.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::alerts::AlertService;
use crate::error::MonitorError;
use crate::model::{
    Alert, CancelAlertRequest, ContactNotification, CreateTripRequest, HighRiskToggle,
    LocationUpdateRequest, ManualAlertResponse, ManualSosRequest, Trip, TripActionRequest,
    UpdateTripRequest,
};
use crate::scheduler::{CycleSummary, MonitorStatus, MonitoringScheduler, ScanScope};
use crate::trips::TripService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub trips: Arc<TripService>,
    pub alerts: Arc<AlertService>,
    pub scheduler: Arc<MonitoringScheduler>,
}

/// Every route the service exposes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/trips", post(create_trip))
        .route("/trips/:id", get(get_trip).patch(update_trip))
        .route("/trips/:id/location", post(post_trip_location))
        .route("/trips/:id/cancel", post(cancel_trip))
        .route("/trips/:id/complete", post(complete_trip))
        .route("/users/:id/sos", post(trigger_sos))
        .route("/users/:id/alerts", get(list_user_alerts))
        .route("/alerts/:id/resolve", post(resolve_alert))
        .route("/alerts/:id/cancel", post(cancel_alert))
        .route("/alerts/:id/notifications", get(list_alert_notifications))
        .route("/monitoring/status", get(monitoring_status))
        .route("/monitoring/run", post(run_monitoring))
        .route("/monitoring/high-risk", put(set_high_risk))
        .with_state(state)
}

/// HTTP status for a failed operation.
pub fn status_for(error: &MonitorError) -> StatusCode {
    match error {
        MonitorError::Validation(_) => StatusCode::BAD_REQUEST,
        MonitorError::NotFound { .. } => StatusCode::NOT_FOUND,
        MonitorError::InvalidTransition(_) | MonitorError::ConcurrencyConflict { .. } => {
            StatusCode::CONFLICT
        }
        MonitorError::DataIntegrity(_)
        | MonitorError::Precondition(_)
        | MonitorError::Storage(_)
        | MonitorError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: MonitorError, action: &'static str) -> StatusCode {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!(action, error = %error, "Request failed");
    } else {
        info!(action, status = status.as_u16(), error = %error, "Request rejected");
    }
    status
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Trips
// ============================================================================

/// POST /trips - Create a scheduled trip.
///
/// # Request Body
///
/// ```json
/// {
///     "user_id": "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
///     "title": "Drive home",
///     "start_time": "2024-06-01T17:00:00Z",
///     "end_time": "2024-06-01T18:30:00Z",
///     "destination": { "lat": 40.7128, "lon": -74.006, "name": "Home" },
///     "travel_mode": "driving",
///     "alert_thresholds": { "location_timeout_minutes": 20 }
/// }
/// ```
///
/// Returns `201 Created` with the stored trip, or `400` when the window,
/// destination or thresholds are invalid.
#[instrument(skip(state, request))]
pub async fn create_trip(
    State(state): State<AppState>,
    Json(request): Json<CreateTripRequest>,
) -> Result<(StatusCode, Json<Trip>), StatusCode> {
    match state.trips.create(request).await {
        Ok(trip) => Ok((StatusCode::CREATED, Json(trip))),
        Err(e) => Err(reject(e, "create_trip")),
    }
}

/// GET /trips/:id
#[instrument(skip(state))]
pub async fn get_trip(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Trip>, StatusCode> {
    state
        .trips
        .get(id)
        .await
        .map(Json)
        .map_err(|e| reject(e, "get_trip"))
}

/// PATCH /trips/:id - Edit a trip that is not yet completed or cancelled.
///
/// Send `expected_version` to have the edit rejected with `409` when the
/// trip changed since it was read.
#[instrument(skip(state, request))]
pub async fn update_trip(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateTripRequest>,
) -> Result<Json<Trip>, StatusCode> {
    state
        .trips
        .update(id, request)
        .await
        .map(Json)
        .map_err(|e| reject(e, "update_trip"))
}

/// POST /trips/:id/location - Location ping from the traveller's device.
#[instrument(skip(state, request))]
pub async fn post_trip_location(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<LocationUpdateRequest>,
) -> Result<Json<Trip>, StatusCode> {
    state
        .trips
        .patch_location(id, request)
        .await
        .map(Json)
        .map_err(|e| reject(e, "post_trip_location"))
}

/// POST /trips/:id/cancel - Body is optional.
#[instrument(skip(state, body))]
pub async fn cancel_trip(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<TripActionRequest>>,
) -> Result<Json<Trip>, StatusCode> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    state
        .trips
        .cancel(id, request)
        .await
        .map(Json)
        .map_err(|e| reject(e, "cancel_trip"))
}

/// POST /trips/:id/complete - Body is optional.
#[instrument(skip(state, body))]
pub async fn complete_trip(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<TripActionRequest>>,
) -> Result<Json<Trip>, StatusCode> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    state
        .trips
        .complete(id, request)
        .await
        .map(Json)
        .map_err(|e| reject(e, "complete_trip"))
}

// ============================================================================
// Alerts
// ============================================================================

/// POST /users/:id/sos - Manual SOS.
///
/// Answers `202 Accepted` as soon as the alert is stored:
///
/// ```json
/// { "alert_id": "...", "status": "triggered", "contacts": 2 }
/// ```
///
/// Contact notification continues in the background; check
/// `GET /alerts/:id/notifications` for per-contact outcomes.
#[instrument(skip(state, body))]
pub async fn trigger_sos(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    body: Option<Json<ManualSosRequest>>,
) -> Result<(StatusCode, Json<ManualAlertResponse>), StatusCode> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state.alerts.trigger_manual(user_id, request).await {
        Ok((response, _fanout)) => Ok((StatusCode::ACCEPTED, Json(response))),
        Err(e) => Err(reject(e, "trigger_sos")),
    }
}

/// GET /users/:id/alerts - Newest first.
#[instrument(skip(state))]
pub async fn list_user_alerts(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<Alert>>, StatusCode> {
    state
        .alerts
        .list_for_user(user_id)
        .await
        .map(Json)
        .map_err(|e| reject(e, "list_user_alerts"))
}

/// POST /alerts/:id/resolve
#[instrument(skip(state))]
pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alert>, StatusCode> {
    state
        .alerts
        .resolve(id)
        .await
        .map(Json)
        .map_err(|e| reject(e, "resolve_alert"))
}

/// POST /alerts/:id/cancel - False alarm, with an optional reason.
#[instrument(skip(state, body))]
pub async fn cancel_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelAlertRequest>>,
) -> Result<Json<Alert>, StatusCode> {
    let reason = body.and_then(|Json(r)| r.reason);
    state
        .alerts
        .cancel(id, reason)
        .await
        .map(Json)
        .map_err(|e| reject(e, "cancel_alert"))
}

/// GET /alerts/:id/notifications - Delivery ledger for one alert.
#[instrument(skip(state))]
pub async fn list_alert_notifications(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ContactNotification>>, StatusCode> {
    state
        .alerts
        .notifications(id)
        .await
        .map(Json)
        .map_err(|e| reject(e, "list_alert_notifications"))
}

// ============================================================================
// Monitoring control
// ============================================================================

/// GET /monitoring/status
pub async fn monitoring_status(State(state): State<AppState>) -> Json<MonitorStatus> {
    Json(state.scheduler.status())
}

/// POST /monitoring/run - Run one full cycle now.
///
/// Returns the cycle summary, or `409 Conflict` when a trip or safe-zone
/// cycle is already running.
#[instrument(skip(state))]
pub async fn run_monitoring(
    State(state): State<AppState>,
) -> Result<Json<CycleSummary>, StatusCode> {
    match state.scheduler.tick(ScanScope::All).await {
        Some(summary) => {
            info!(
                triggered = summary.triggered,
                errors = summary.errors,
                "Manual monitoring cycle finished"
            );
            Ok(Json(summary))
        }
        None => {
            warn!("Manual monitoring cycle skipped, another cycle is running");
            Err(StatusCode::CONFLICT)
        }
    }
}

/// PUT /monitoring/high-risk - `{"enabled": true}`
#[instrument(skip(state))]
pub async fn set_high_risk(
    State(state): State<AppState>,
    Json(toggle): Json<HighRiskToggle>,
) -> Json<MonitorStatus> {
    state.scheduler.set_high_risk(toggle.enabled);
    Json(state.scheduler.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_route() {
        let app = Router::new().route("/health", get(health_check));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&MonitorError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&MonitorError::not_found("trip", Uuid::nil())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&MonitorError::ConcurrencyConflict {
                trip_id: Uuid::nil(),
                expected: 3
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&MonitorError::DataIntegrity("corrupt".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
