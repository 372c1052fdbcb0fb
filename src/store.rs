//! Persistence interfaces consumed by the monitoring core.
//!
//! [`crate::storage::Storage`] implements all of them on SQLite; the scheduler,
//! fanout and lifecycle services only ever see these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MonitorError;
use crate::geo::GeoPoint;
use crate::model::{Alert, ContactNotification, EmergencyContact, Trip, User};

pub type StoreResult<T> = Result<T, MonitorError>;

#[async_trait]
pub trait TripStore: Send + Sync {
    async fn insert_trip(&self, trip: &Trip) -> StoreResult<()>;

    async fn get_trip(&self, id: Uuid) -> StoreResult<Option<Trip>>;

    /// Persist `trip` if the stored version still equals `trip.sync_version`.
    ///
    /// Returns the new version, or [`MonitorError::ConcurrencyConflict`] when
    /// another writer got there first.
    async fn save_trip(&self, trip: &Trip) -> StoreResult<i64>;

    /// Every live trip in `scheduled`, `active` or `alert_triggered`.
    async fn find_monitorable_trips(&self) -> StoreResult<Vec<Trip>>;

    // The three queries below serve external collaborators (reporting, the
    // location ingestion side). The scheduler evaluates every monitorable trip
    // itself through `find_monitorable_trips`.

    /// Live trips in `active` state.
    async fn find_active_trips(&self) -> StoreResult<Vec<Trip>>;

    /// Live, unfinished trips whose end time has passed.
    async fn find_overdue_trips(&self, now: DateTime<Utc>) -> StoreResult<Vec<Trip>>;

    /// Active trips whose last ping (or start) is older than their timeout.
    async fn find_trips_needing_location_check(&self, now: DateTime<Utc>) -> StoreResult<Vec<Trip>>;

    /// Soft-delete finished trips that ended before `before`.
    async fn archive_finished_trips(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn upsert_user(&self, user: &User) -> StoreResult<()>;

    async fn get_user(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn list_auto_sos_enabled_users(&self) -> StoreResult<Vec<User>>;

    /// Active users with an unresolved alert created at or after `since`,
    /// whether or not automatic SOS is on.
    async fn list_high_risk_users(&self, since: DateTime<Utc>) -> StoreResult<Vec<User>>;

    /// Location ingestion hook: last known location and activity time.
    async fn record_user_location(
        &self,
        user_id: Uuid,
        location: GeoPoint,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn add_emergency_contact(&self, contact: &EmergencyContact) -> StoreResult<()>;

    /// Contacts ordered by priority.
    async fn get_emergency_contacts(&self, user_id: Uuid) -> StoreResult<Vec<EmergencyContact>>;

    async fn register_device_token(&self, user_id: Uuid, token: &str) -> StoreResult<()>;

    async fn get_device_tokens(&self, user_id: Uuid) -> StoreResult<Vec<String>>;

    async fn remove_device_token(&self, token: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()>;

    async fn get_alert(&self, id: Uuid) -> StoreResult<Option<Alert>>;

    async fn update_alert(&self, alert: &Alert) -> StoreResult<()>;

    async fn list_alerts_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Alert>>;

    /// Unresolved alerts created at or after `since`.
    async fn recent_unresolved_alerts(&self, since: DateTime<Utc>) -> StoreResult<Vec<Alert>>;

    async fn insert_contact_notifications(&self, rows: &[ContactNotification]) -> StoreResult<()>;

    async fn update_contact_notification(&self, row: &ContactNotification) -> StoreResult<()>;

    async fn list_contact_notifications(&self, alert_id: Uuid) -> StoreResult<Vec<ContactNotification>>;

    /// Delete resolved alerts older than `before` together with their ledger rows.
    async fn purge_resolved_alerts(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}

/// Everything the monitoring core needs from persistence.
pub trait Store: TripStore + UserStore + AlertStore {}

impl<T: TripStore + UserStore + AlertStore> Store for T {}
