//! Data models for Tripguard.
//!
//! Persisted records (trips, users, alerts, delivery ledger rows) and the
//! request/response bodies of the HTTP surface live here. Status enums map to
//! the lowercase snake_case strings stored in the database and sent over JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MonitorError;
use crate::geo::GeoPoint;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// string form is its serde name.
macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = MonitorError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(MonitorError::DataIntegrity(format!(
                        "unknown {} value '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

// ============================================================================
// Trips
// ============================================================================

/// How the user is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    Walking,
    Driving,
    PublicTransport,
    Cycling,
    #[default]
    Other,
}

string_enum!(TravelMode {
    Walking => "walking",
    Driving => "driving",
    PublicTransport => "public_transport",
    Cycling => "cycling",
    Other => "other",
});

/// Lifecycle state of a trip.
///
/// ```text
/// scheduled ──► active ──► alert_triggered ──► completed
///     │           │              │
///     ▼           ▼              ▼
///   missed    completed      cancelled
/// ```
///
/// `completed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Scheduled,
    Active,
    Completed,
    Missed,
    AlertTriggered,
    Cancelled,
}

string_enum!(TripStatus {
    Scheduled => "scheduled",
    Active => "active",
    Completed => "completed",
    Missed => "missed",
    AlertTriggered => "alert_triggered",
    Cancelled => "cancelled",
});

impl TripStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }

    /// States the scanner looks at.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            TripStatus::Scheduled | TripStatus::Active | TripStatus::AlertTriggered
        )
    }
}

/// Per-trip monitoring thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Minutes without a location ping before a timeout fires (5-180).
    #[serde(default = "default_location_timeout_minutes")]
    pub location_timeout_minutes: u32,

    /// Radius around the destination that counts as "arrived" (50-5000 m).
    #[serde(default = "default_destination_tolerance_meters")]
    pub destination_tolerance_meters: u32,
}

fn default_location_timeout_minutes() -> u32 {
    30
}

fn default_destination_tolerance_meters() -> u32 {
    500
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            location_timeout_minutes: default_location_timeout_minutes(),
            destination_tolerance_meters: default_destination_tolerance_meters(),
        }
    }
}

impl AlertThresholds {
    pub fn validate(&self) -> Result<(), MonitorError> {
        if !(5..=180).contains(&self.location_timeout_minutes) {
            return Err(MonitorError::Validation(format!(
                "location_timeout_minutes must be between 5 and 180, got {}",
                self.location_timeout_minutes
            )));
        }
        if !(50..=5000).contains(&self.destination_tolerance_meters) {
            return Err(MonitorError::Validation(format!(
                "destination_tolerance_meters must be between 50 and 5000, got {}",
                self.destination_tolerance_meters
            )));
        }
        Ok(())
    }
}

/// Where a trip is headed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Destination {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }

    /// Name, then address, then raw coordinates.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.address.clone())
            .unwrap_or_else(|| format!("{:.5}, {:.5}", self.lat, self.lon))
    }
}

/// What caused an entry in a trip's history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripEventKind {
    Activated,
    Missed,
    Arrived,
    LocationTimeout,
    Overdue,
    DestinationMismatch,
    /// An alert written to the history could not be stored.
    AlertNotRecorded,
    Cancelled,
    Completed,
}

/// One append-only entry in `Trip::alert_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertHistoryEntry {
    pub kind: TripEventKind,
    pub from_status: TripStatus,
    pub to_status: TripStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A scheduled, time-boxed journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub destination: Destination,
    pub notes: Option<String>,
    pub travel_mode: TravelMode,
    pub status: TripStatus,
    pub current_location: Option<GeoPoint>,
    pub last_location_update: Option<DateTime<Utc>>,
    pub alert_history: Vec<AlertHistoryEntry>,
    pub emergency_contacts_notified: bool,
    pub alert_thresholds: AlertThresholds,
    /// Soft-delete flag.
    pub is_active: bool,
    /// Incremented on every successful save.
    pub sync_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    /// Build a new trip in `scheduled` state after validating the request.
    pub fn from_request(request: CreateTripRequest, now: DateTime<Utc>) -> Result<Self, MonitorError> {
        validate_window(request.start_time, request.end_time)?;
        validate_destination(&request.destination)?;
        if request.title.trim().is_empty() {
            return Err(MonitorError::Validation("title must not be empty".into()));
        }
        let alert_thresholds = request.alert_thresholds.unwrap_or_default();
        alert_thresholds.validate()?;

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            title: request.title,
            start_time: request.start_time,
            end_time: request.end_time,
            destination: request.destination,
            notes: request.notes,
            travel_mode: request.travel_mode,
            status: TripStatus::Scheduled,
            current_location: None,
            last_location_update: None,
            alert_history: Vec::new(),
            emergency_contacts_notified: false,
            alert_thresholds,
            is_active: true,
            sync_version: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

pub(crate) fn validate_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(), MonitorError> {
    if end <= start {
        return Err(MonitorError::Validation(
            "end_time must be after start_time".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_destination(destination: &Destination) -> Result<(), MonitorError> {
    if !destination.point().is_valid() {
        return Err(MonitorError::Validation(format!(
            "destination coordinates out of range: ({}, {})",
            destination.lat, destination.lon
        )));
    }
    Ok(())
}

// ============================================================================
// Users and contacts
// ============================================================================

/// A user as far as monitoring is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub auto_sos_enabled: bool,
    pub deviation_threshold_meters: u32,
    pub inactivity_threshold_minutes: u32,
    /// The "safe" point deviation is measured from.
    pub default_location: Option<GeoPoint>,
    pub last_known_location: Option<GeoPoint>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            auto_sos_enabled: false,
            deviation_threshold_meters: 500,
            inactivity_threshold_minutes: 30,
            default_location: None,
            last_known_location: None,
            last_active_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The input to safe-zone evaluation for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredUserSnapshot {
    pub user_id: Uuid,
    pub name: String,
    pub auto_sos_enabled: bool,
    pub deviation_threshold_meters: u32,
    pub inactivity_threshold_minutes: u32,
    pub default_location: Option<GeoPoint>,
    pub last_known_location: Option<GeoPoint>,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl From<&User> for MonitoredUserSnapshot {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            name: user.name.clone(),
            auto_sos_enabled: user.auto_sos_enabled,
            deviation_threshold_meters: user.deviation_threshold_meters,
            inactivity_threshold_minutes: user.inactivity_threshold_minutes,
            default_location: user.default_location,
            last_known_location: user.last_known_location,
            last_active_at: user.last_active_at,
        }
    }
}

/// Someone to notify when a user is in trouble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Set when the contact is also an app user reachable by push.
    pub linked_user_id: Option<Uuid>,
    /// Lower values are notified first in reports.
    pub priority: i32,
}

// ============================================================================
// Alerts
// ============================================================================

/// What kind of condition produced an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Deviation,
    Inactivity,
    TripOverdue,
    TripLocationTimeout,
    TripDestinationMismatch,
    Manual,
}

string_enum!(AlertKind {
    Deviation => "deviation",
    Inactivity => "inactivity",
    TripOverdue => "trip_overdue",
    TripLocationTimeout => "trip_location_timeout",
    TripDestinationMismatch => "trip_destination_mismatch",
    Manual => "manual",
});

impl AlertKind {
    /// Human-readable reason used in notification text.
    pub fn label(&self) -> &'static str {
        match self {
            AlertKind::Deviation => "left their safe zone",
            AlertKind::Inactivity => "has been inactive",
            AlertKind::TripOverdue => "is overdue on a trip",
            AlertKind::TripLocationTimeout => "stopped sharing location during a trip",
            AlertKind::TripDestinationMismatch => "is not at their trip destination",
            AlertKind::Manual => "triggered an SOS",
        }
    }
}

/// One triggered notification episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub subject_user_id: Uuid,
    pub trip_id: Option<Uuid>,
    pub kind: AlertKind,
    pub location: Option<GeoPoint>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Alert {
    pub fn new(
        subject_user_id: Uuid,
        trip_id: Option<Uuid>,
        kind: AlertKind,
        location: Option<GeoPoint>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_user_id,
            trip_id,
            kind,
            location,
            message: message.into(),
            created_at: now,
            resolved: false,
            resolved_at: None,
            cancel_reason: None,
        }
    }

    /// The dedup subject: the trip for trip-derived alerts, the user otherwise.
    pub fn dedup_subject(&self) -> Uuid {
        self.trip_id.unwrap_or(self.subject_user_id)
    }
}

/// Delivery state of one (alert, contact) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

string_enum!(DeliveryStatus {
    Pending => "pending",
    Sent => "sent",
    Delivered => "delivered",
    Failed => "failed",
});

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

/// Ledger row for one (alert, contact) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactNotification {
    pub alert_id: Uuid,
    pub contact_id: Uuid,
    pub status: DeliveryStatus,
    /// Name of the channel that produced the final outcome.
    pub channel: Option<String>,
    pub provider_message_id: Option<String>,
    pub notified_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContactNotification {
    pub fn pending(alert_id: Uuid, contact_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            alert_id,
            contact_id,
            status: DeliveryStatus::Pending,
            channel: None,
            provider_message_id: None,
            notified_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// HTTP request / response bodies
// ============================================================================

/// Request body for `POST /trips`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTripRequest {
    pub user_id: Uuid,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub destination: Destination,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub travel_mode: TravelMode,
    #[serde(default)]
    pub alert_thresholds: Option<AlertThresholds>,
}

/// Request body for `PATCH /trips/:id`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTripRequest {
    pub title: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub destination: Option<Destination>,
    pub notes: Option<String>,
    pub travel_mode: Option<TravelMode>,
    pub alert_thresholds: Option<AlertThresholds>,
    /// When present, the update is rejected unless it matches the stored version.
    pub expected_version: Option<i64>,
}

/// Request body for `POST /trips/:id/location`.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationUpdateRequest {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

/// Request body for `POST /trips/:id/cancel` and `/complete`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TripActionRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

/// Request body for `POST /users/:id/sos`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualSosRequest {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Request body for `POST /alerts/:id/cancel`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelAlertRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request body for `PUT /monitoring/high-risk`.
#[derive(Debug, Clone, Deserialize)]
pub struct HighRiskToggle {
    pub enabled: bool,
}

/// Interim result of a manual SOS.
#[derive(Debug, Clone, Serialize)]
pub struct ManualAlertResponse {
    pub alert_id: Uuid,
    /// Always "triggered"; fanout continues in the background.
    pub status: &'static str,
    pub contacts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(start: DateTime<Utc>, end: DateTime<Utc>) -> CreateTripRequest {
        CreateTripRequest {
            user_id: Uuid::new_v4(),
            title: "Hike".into(),
            start_time: start,
            end_time: end,
            destination: Destination {
                lat: 46.5,
                lon: 7.9,
                address: None,
                name: Some("Summit hut".into()),
            },
            notes: None,
            travel_mode: TravelMode::Walking,
            alert_thresholds: None,
        }
    }

    #[test]
    fn test_trip_rejects_end_before_start() {
        let now = Utc::now();
        let req = request(now, now);
        let err = Trip::from_request(req, now).unwrap_err();
        assert!(matches!(err, MonitorError::Validation(_)));

        let req = request(now, now - Duration::minutes(5));
        assert!(Trip::from_request(req, now).is_err());
    }

    #[test]
    fn test_trip_defaults() {
        let now = Utc::now();
        let req = request(now, now + Duration::hours(2));
        let trip = Trip::from_request(req, now).unwrap();
        assert_eq!(trip.status, TripStatus::Scheduled);
        assert_eq!(trip.alert_thresholds.location_timeout_minutes, 30);
        assert_eq!(trip.alert_thresholds.destination_tolerance_meters, 500);
        assert_eq!(trip.sync_version, 0);
        assert!(trip.is_active);
    }

    #[test]
    fn test_threshold_ranges() {
        let mut t = AlertThresholds::default();
        assert!(t.validate().is_ok());
        t.location_timeout_minutes = 4;
        assert!(t.validate().is_err());
        t.location_timeout_minutes = 180;
        t.destination_tolerance_meters = 5001;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_status_strings_round_trip() {
        assert_eq!(TripStatus::AlertTriggered.as_str(), "alert_triggered");
        assert_eq!(
            "alert_triggered".parse::<TripStatus>().unwrap(),
            TripStatus::AlertTriggered
        );
        assert!("bogus".parse::<TripStatus>().is_err());
        assert_eq!(
            serde_json::to_value(AlertKind::TripLocationTimeout).unwrap(),
            "trip_location_timeout"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(TripStatus::Completed.is_terminal());
        assert!(TripStatus::Cancelled.is_terminal());
        assert!(!TripStatus::AlertTriggered.is_terminal());
        assert!(!TripStatus::Missed.is_monitored());
    }
}
