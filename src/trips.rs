//! User-facing trip lifecycle operations.
//!
//! Every mutation re-reads the trip, optionally checks the caller's
//! `expected_version`, and saves through the versioned store write, so a
//! user action racing a scan cycle is detected instead of overwriting it.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::MonitorError;
use crate::geo::GeoPoint;
use crate::model::{
    CreateTripRequest, LocationUpdateRequest, Trip, TripActionRequest, UpdateTripRequest,
    validate_destination, validate_window,
};
use crate::store::Store;
use crate::trip_state::TripStateMachine;

pub struct TripService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl TripService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate and persist a new `scheduled` trip for an existing user.
    pub async fn create(&self, request: CreateTripRequest) -> Result<Trip, MonitorError> {
        let user_id = request.user_id;
        let trip = Trip::from_request(request, self.clock.now())?;
        if self.store.get_user(user_id).await?.is_none() {
            return Err(MonitorError::not_found("user", user_id));
        }

        self.store.insert_trip(&trip).await?;
        info!(trip_id = %trip.id, user_id = %user_id, "Trip created");
        Ok(trip)
    }

    pub async fn get(&self, id: Uuid) -> Result<Trip, MonitorError> {
        self.store
            .get_trip(id)
            .await?
            .ok_or_else(|| MonitorError::not_found("trip", id))
    }

    /// Apply the present fields of `request`. Rejected once the trip is
    /// completed or cancelled.
    pub async fn update(&self, id: Uuid, request: UpdateTripRequest) -> Result<Trip, MonitorError> {
        let mut trip = self.get(id).await?;
        check_version(&trip, request.expected_version)?;
        if trip.status.is_terminal() {
            return Err(MonitorError::InvalidTransition(format!(
                "trip {} is {} and can no longer be edited",
                id, trip.status
            )));
        }

        if let Some(title) = request.title {
            if title.trim().is_empty() {
                return Err(MonitorError::Validation("title must not be empty".into()));
            }
            trip.title = title;
        }
        let start = request.start_time.unwrap_or(trip.start_time);
        let end = request.end_time.unwrap_or(trip.end_time);
        validate_window(start, end)?;
        trip.start_time = start;
        trip.end_time = end;

        if let Some(destination) = request.destination {
            validate_destination(&destination)?;
            trip.destination = destination;
        }
        if let Some(thresholds) = request.alert_thresholds {
            thresholds.validate()?;
            trip.alert_thresholds = thresholds;
        }
        if let Some(mode) = request.travel_mode {
            trip.travel_mode = mode;
        }
        if request.notes.is_some() {
            trip.notes = request.notes;
        }

        trip.updated_at = self.clock.now();
        self.save(trip).await
    }

    /// Record a location ping for the trip and its owner.
    pub async fn patch_location(
        &self,
        id: Uuid,
        request: LocationUpdateRequest,
    ) -> Result<Trip, MonitorError> {
        let point = GeoPoint::new(request.lat, request.lon);
        if !point.is_valid() {
            return Err(MonitorError::Validation(format!(
                "coordinates out of range: ({}, {})",
                request.lat, request.lon
            )));
        }

        let mut trip = self.get(id).await?;
        check_version(&trip, request.expected_version)?;
        if trip.status.is_terminal() {
            return Err(MonitorError::InvalidTransition(format!(
                "trip {} is {} and no longer accepts locations",
                id, trip.status
            )));
        }

        let now = self.clock.now();
        trip.current_location = Some(point);
        trip.last_location_update = Some(now);
        trip.updated_at = now;
        let trip = self.save(trip).await?;

        if let Err(e) = self.store.record_user_location(trip.user_id, point, now).await {
            warn!(trip_id = %id, user_id = %trip.user_id, error = %e, "Failed to record user location");
        }
        Ok(trip)
    }

    pub async fn cancel(&self, id: Uuid, request: TripActionRequest) -> Result<Trip, MonitorError> {
        let mut trip = self.get(id).await?;
        check_version(&trip, request.expected_version)?;
        TripStateMachine::cancel(&mut trip, request.reason.as_deref(), self.clock.now())?;
        trip.is_active = false;

        let trip = self.save(trip).await?;
        info!(trip_id = %id, "Trip cancelled");
        Ok(trip)
    }

    pub async fn complete(&self, id: Uuid, request: TripActionRequest) -> Result<Trip, MonitorError> {
        let mut trip = self.get(id).await?;
        check_version(&trip, request.expected_version)?;
        TripStateMachine::complete(&mut trip, request.reason.as_deref(), self.clock.now())?;

        let trip = self.save(trip).await?;
        info!(trip_id = %id, "Trip completed");
        Ok(trip)
    }

    async fn save(&self, mut trip: Trip) -> Result<Trip, MonitorError> {
        trip.sync_version = self.store.save_trip(&trip).await?;
        Ok(trip)
    }
}

fn check_version(trip: &Trip, expected: Option<i64>) -> Result<(), MonitorError> {
    match expected {
        Some(version) if version != trip.sync_version => Err(MonitorError::ConcurrencyConflict {
            trip_id: trip.id,
            expected: version,
        }),
        _ => Ok(()),
    }
}
