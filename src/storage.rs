//! SQLite storage layer for Tripguard.
//!
//! Implements every store trait from [`crate::store`] over one connection
//! pool. Timestamps are stored as unix milliseconds, ids as UUID text and a
//! trip's history log as a JSON array.
//!
//! Trip writes are guarded by `sync_version`: an update only applies when the
//! stored version still matches the one the writer read.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use crate::error::MonitorError;
use crate::geo::GeoPoint;
use crate::model::{
    Alert, AlertThresholds, ContactNotification, Destination, EmergencyContact, Trip, User,
};
use crate::store::{AlertStore, StoreResult, TripStore, UserStore};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:tripguard.db?mode=rwc" or "sqlite::memory:")
    ///
    /// In-memory databases are private to a connection, so they get a pool of
    /// exactly one connection that is never recycled.
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> StoreResult<()> {
        const SCHEMA: &[&str] = &[
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                auto_sos_enabled INTEGER NOT NULL DEFAULT 0,
                deviation_threshold_meters INTEGER NOT NULL,
                inactivity_threshold_minutes INTEGER NOT NULL,
                default_lat REAL,
                default_lon REAL,
                last_lat REAL,
                last_lon REAL,
                last_active_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS emergency_contacts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                phone TEXT,
                email TEXT,
                linked_user_id TEXT,
                priority INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_emergency_contacts_user
            ON emergency_contacts(user_id, priority)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS device_tokens (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trips (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                dest_lat REAL NOT NULL,
                dest_lon REAL NOT NULL,
                dest_address TEXT,
                dest_name TEXT,
                notes TEXT,
                travel_mode TEXT NOT NULL,
                status TEXT NOT NULL,
                current_lat REAL,
                current_lon REAL,
                last_location_update INTEGER,
                alert_history TEXT NOT NULL DEFAULT '[]',
                contacts_notified INTEGER NOT NULL DEFAULT 0,
                location_timeout_minutes INTEGER NOT NULL,
                destination_tolerance_meters INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                sync_version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_trips_status
            ON trips(is_active, status, end_time)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                subject_user_id TEXT NOT NULL,
                trip_id TEXT,
                kind TEXT NOT NULL,
                lat REAL,
                lon REAL,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at INTEGER,
                cancel_reason TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_subject
            ON alerts(subject_user_id, resolved, created_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS contact_notifications (
                alert_id TEXT NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
                contact_id TEXT NOT NULL,
                status TEXT NOT NULL,
                channel TEXT,
                provider_message_id TEXT,
                notified_at INTEGER,
                failure_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (alert_id, contact_id)
            )
            "#,
        ];

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

// ============================================================================
// Row mapping helpers
// ============================================================================

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(value: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| MonitorError::DataIntegrity(format!("timestamp out of range: {value}")))
}

fn opt_from_ms(value: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    value.map(from_ms).transpose()
}

fn parse_uuid(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| MonitorError::DataIntegrity(format!("bad uuid '{value}': {e}")))
}

fn to_u32(value: i64, field: &str) -> StoreResult<u32> {
    u32::try_from(value)
        .map_err(|_| MonitorError::DataIntegrity(format!("{field} out of range: {value}")))
}

fn point(lat: Option<f64>, lon: Option<f64>) -> Option<GeoPoint> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
        _ => None,
    }
}

fn trip_from_row(row: &SqliteRow) -> StoreResult<Trip> {
    let history: String = row.try_get("alert_history")?;
    let status: String = row.try_get("status")?;
    let travel_mode: String = row.try_get("travel_mode")?;

    Ok(Trip {
        id: parse_uuid(row.try_get("id")?)?,
        user_id: parse_uuid(row.try_get("user_id")?)?,
        title: row.try_get("title")?,
        start_time: from_ms(row.try_get("start_time")?)?,
        end_time: from_ms(row.try_get("end_time")?)?,
        destination: Destination {
            lat: row.try_get("dest_lat")?,
            lon: row.try_get("dest_lon")?,
            address: row.try_get("dest_address")?,
            name: row.try_get("dest_name")?,
        },
        notes: row.try_get("notes")?,
        travel_mode: travel_mode.parse()?,
        status: status.parse()?,
        current_location: point(row.try_get("current_lat")?, row.try_get("current_lon")?),
        last_location_update: opt_from_ms(row.try_get("last_location_update")?)?,
        alert_history: serde_json::from_str(&history)?,
        emergency_contacts_notified: row.try_get("contacts_notified")?,
        alert_thresholds: AlertThresholds {
            location_timeout_minutes: to_u32(
                row.try_get("location_timeout_minutes")?,
                "location_timeout_minutes",
            )?,
            destination_tolerance_meters: to_u32(
                row.try_get("destination_tolerance_meters")?,
                "destination_tolerance_meters",
            )?,
        },
        is_active: row.try_get("is_active")?,
        sync_version: row.try_get("sync_version")?,
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    })
}

fn user_from_row(row: &SqliteRow) -> StoreResult<User> {
    Ok(User {
        id: parse_uuid(row.try_get("id")?)?,
        name: row.try_get("name")?,
        auto_sos_enabled: row.try_get("auto_sos_enabled")?,
        deviation_threshold_meters: to_u32(
            row.try_get("deviation_threshold_meters")?,
            "deviation_threshold_meters",
        )?,
        inactivity_threshold_minutes: to_u32(
            row.try_get("inactivity_threshold_minutes")?,
            "inactivity_threshold_minutes",
        )?,
        default_location: point(row.try_get("default_lat")?, row.try_get("default_lon")?),
        last_known_location: point(row.try_get("last_lat")?, row.try_get("last_lon")?),
        last_active_at: opt_from_ms(row.try_get("last_active_at")?)?,
        is_active: row.try_get("is_active")?,
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    })
}

fn contact_from_row(row: &SqliteRow) -> StoreResult<EmergencyContact> {
    let linked: Option<String> = row.try_get("linked_user_id")?;
    Ok(EmergencyContact {
        id: parse_uuid(row.try_get("id")?)?,
        user_id: parse_uuid(row.try_get("user_id")?)?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        linked_user_id: linked.as_deref().map(parse_uuid).transpose()?,
        priority: row.try_get("priority")?,
    })
}

fn alert_from_row(row: &SqliteRow) -> StoreResult<Alert> {
    let trip_id: Option<String> = row.try_get("trip_id")?;
    let kind: String = row.try_get("kind")?;
    Ok(Alert {
        id: parse_uuid(row.try_get("id")?)?,
        subject_user_id: parse_uuid(row.try_get("subject_user_id")?)?,
        trip_id: trip_id.as_deref().map(parse_uuid).transpose()?,
        kind: kind.parse()?,
        location: point(row.try_get("lat")?, row.try_get("lon")?),
        message: row.try_get("message")?,
        created_at: from_ms(row.try_get("created_at")?)?,
        resolved: row.try_get("resolved")?,
        resolved_at: opt_from_ms(row.try_get("resolved_at")?)?,
        cancel_reason: row.try_get("cancel_reason")?,
    })
}

fn notification_from_row(row: &SqliteRow) -> StoreResult<ContactNotification> {
    let status: String = row.try_get("status")?;
    Ok(ContactNotification {
        alert_id: parse_uuid(row.try_get("alert_id")?)?,
        contact_id: parse_uuid(row.try_get("contact_id")?)?,
        status: status.parse()?,
        channel: row.try_get("channel")?,
        provider_message_id: row.try_get("provider_message_id")?,
        notified_at: opt_from_ms(row.try_get("notified_at")?)?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    })
}

fn collect<T>(rows: &[SqliteRow], map: fn(&SqliteRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

// ============================================================================
// Trips
// ============================================================================

const MONITORED_STATUSES: &str = "('scheduled', 'active', 'alert_triggered')";

#[async_trait]
impl TripStore for Storage {
    async fn insert_trip(&self, trip: &Trip) -> StoreResult<()> {
        let history = serde_json::to_string(&trip.alert_history)?;

        sqlx::query(
            r#"
            INSERT INTO trips (
                id, user_id, title, start_time, end_time,
                dest_lat, dest_lon, dest_address, dest_name, notes,
                travel_mode, status, current_lat, current_lon, last_location_update,
                alert_history, contacts_notified, location_timeout_minutes,
                destination_tolerance_meters, is_active, sync_version, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trip.id.to_string())
        .bind(trip.user_id.to_string())
        .bind(&trip.title)
        .bind(ms(trip.start_time))
        .bind(ms(trip.end_time))
        .bind(trip.destination.lat)
        .bind(trip.destination.lon)
        .bind(&trip.destination.address)
        .bind(&trip.destination.name)
        .bind(&trip.notes)
        .bind(trip.travel_mode.as_str())
        .bind(trip.status.as_str())
        .bind(trip.current_location.map(|p| p.lat))
        .bind(trip.current_location.map(|p| p.lon))
        .bind(trip.last_location_update.map(ms))
        .bind(history)
        .bind(trip.emergency_contacts_notified)
        .bind(i64::from(trip.alert_thresholds.location_timeout_minutes))
        .bind(i64::from(trip.alert_thresholds.destination_tolerance_meters))
        .bind(trip.is_active)
        .bind(trip.sync_version)
        .bind(ms(trip.created_at))
        .bind(ms(trip.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_trip(&self, id: Uuid) -> StoreResult<Option<Trip>> {
        let row = sqlx::query("SELECT * FROM trips WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(trip_from_row).transpose()
    }

    async fn save_trip(&self, trip: &Trip) -> StoreResult<i64> {
        let history = serde_json::to_string(&trip.alert_history)?;

        let result = sqlx::query(
            r#"
            UPDATE trips SET
                title = ?, start_time = ?, end_time = ?,
                dest_lat = ?, dest_lon = ?, dest_address = ?, dest_name = ?, notes = ?,
                travel_mode = ?, status = ?, current_lat = ?, current_lon = ?,
                last_location_update = ?, alert_history = ?, contacts_notified = ?,
                location_timeout_minutes = ?, destination_tolerance_meters = ?,
                is_active = ?, updated_at = ?, sync_version = sync_version + 1
            WHERE id = ? AND sync_version = ?
            "#,
        )
        .bind(&trip.title)
        .bind(ms(trip.start_time))
        .bind(ms(trip.end_time))
        .bind(trip.destination.lat)
        .bind(trip.destination.lon)
        .bind(&trip.destination.address)
        .bind(&trip.destination.name)
        .bind(&trip.notes)
        .bind(trip.travel_mode.as_str())
        .bind(trip.status.as_str())
        .bind(trip.current_location.map(|p| p.lat))
        .bind(trip.current_location.map(|p| p.lon))
        .bind(trip.last_location_update.map(ms))
        .bind(history)
        .bind(trip.emergency_contacts_notified)
        .bind(i64::from(trip.alert_thresholds.location_timeout_minutes))
        .bind(i64::from(trip.alert_thresholds.destination_tolerance_meters))
        .bind(trip.is_active)
        .bind(ms(trip.updated_at))
        .bind(trip.id.to_string())
        .bind(trip.sync_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM trips WHERE id = ?")
                .bind(trip.id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            return Err(if exists {
                MonitorError::ConcurrencyConflict {
                    trip_id: trip.id,
                    expected: trip.sync_version,
                }
            } else {
                MonitorError::not_found("trip", trip.id)
            });
        }

        Ok(trip.sync_version + 1)
    }

    async fn find_monitorable_trips(&self) -> StoreResult<Vec<Trip>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM trips WHERE is_active = 1 AND status IN {MONITORED_STATUSES} ORDER BY end_time"
        ))
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, trip_from_row)
    }

    async fn find_active_trips(&self) -> StoreResult<Vec<Trip>> {
        let rows = sqlx::query(
            "SELECT * FROM trips WHERE is_active = 1 AND status = 'active' ORDER BY end_time",
        )
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, trip_from_row)
    }

    async fn find_overdue_trips(&self, now: DateTime<Utc>) -> StoreResult<Vec<Trip>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM trips WHERE is_active = 1 AND status IN {MONITORED_STATUSES} AND end_time < ? ORDER BY end_time"
        ))
        .bind(ms(now))
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, trip_from_row)
    }

    async fn find_trips_needing_location_check(&self, now: DateTime<Utc>) -> StoreResult<Vec<Trip>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM trips
            WHERE is_active = 1
              AND status = 'active'
              AND COALESCE(last_location_update, start_time) + location_timeout_minutes * 60000 < ?
            ORDER BY end_time
            "#,
        )
        .bind(ms(now))
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, trip_from_row)
    }

    async fn archive_finished_trips(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE trips SET is_active = 0, sync_version = sync_version + 1
            WHERE is_active = 1
              AND status IN ('completed', 'cancelled', 'missed')
              AND end_time < ?
            "#,
        )
        .bind(ms(before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Users, contacts, device tokens
// ============================================================================

#[async_trait]
impl UserStore for Storage {
    async fn upsert_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, name, auto_sos_enabled, deviation_threshold_meters,
                inactivity_threshold_minutes, default_lat, default_lon,
                last_lat, last_lon, last_active_at, is_active, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                auto_sos_enabled = excluded.auto_sos_enabled,
                deviation_threshold_meters = excluded.deviation_threshold_meters,
                inactivity_threshold_minutes = excluded.inactivity_threshold_minutes,
                default_lat = excluded.default_lat,
                default_lon = excluded.default_lon,
                last_lat = excluded.last_lat,
                last_lon = excluded.last_lon,
                last_active_at = excluded.last_active_at,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.name)
        .bind(user.auto_sos_enabled)
        .bind(i64::from(user.deviation_threshold_meters))
        .bind(i64::from(user.inactivity_threshold_minutes))
        .bind(user.default_location.map(|p| p.lat))
        .bind(user.default_location.map(|p| p.lon))
        .bind(user.last_known_location.map(|p| p.lat))
        .bind(user.last_known_location.map(|p| p.lon))
        .bind(user.last_active_at.map(ms))
        .bind(user.is_active)
        .bind(ms(user.created_at))
        .bind(ms(user.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_auto_sos_enabled_users(&self) -> StoreResult<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users WHERE is_active = 1 AND auto_sos_enabled = 1")
            .fetch_all(&self.pool)
            .await?;

        collect(&rows, user_from_row)
    }

    async fn list_high_risk_users(&self, since: DateTime<Utc>) -> StoreResult<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT u.* FROM users u
            WHERE u.is_active = 1
              AND EXISTS (
                  SELECT 1 FROM alerts a
                  WHERE a.subject_user_id = u.id AND a.resolved = 0 AND a.created_at >= ?
              )
            "#,
        )
        .bind(ms(since))
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, user_from_row)
    }

    async fn record_user_location(
        &self,
        user_id: Uuid,
        location: GeoPoint,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET last_lat = ?, last_lon = ?, last_active_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(location.lat)
        .bind(location.lon)
        .bind(ms(at))
        .bind(ms(at))
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MonitorError::not_found("user", user_id));
        }
        Ok(())
    }

    async fn add_emergency_contact(&self, contact: &EmergencyContact) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO emergency_contacts (id, user_id, name, phone, email, linked_user_id, priority)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(contact.id.to_string())
        .bind(contact.user_id.to_string())
        .bind(&contact.name)
        .bind(&contact.phone)
        .bind(&contact.email)
        .bind(contact.linked_user_id.map(|id| id.to_string()))
        .bind(contact.priority)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_emergency_contacts(&self, user_id: Uuid) -> StoreResult<Vec<EmergencyContact>> {
        let rows = sqlx::query(
            "SELECT * FROM emergency_contacts WHERE user_id = ? ORDER BY priority, name",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, contact_from_row)
    }

    async fn register_device_token(&self, user_id: Uuid, token: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_tokens (token, user_id, created_at) VALUES (?, ?, ?)
            ON CONFLICT(token) DO UPDATE SET user_id = excluded.user_id
            "#,
        )
        .bind(token)
        .bind(user_id.to_string())
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_device_tokens(&self, user_id: Uuid) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT token FROM device_tokens WHERE user_id = ? ORDER BY created_at")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| r.try_get("token").map_err(MonitorError::from))
            .collect()
    }

    async fn remove_device_token(&self, token: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM device_tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// ============================================================================
// Alerts and delivery ledger
// ============================================================================

#[async_trait]
impl AlertStore for Storage {
    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, subject_user_id, trip_id, kind, lat, lon, message,
                created_at, resolved, resolved_at, cancel_reason
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.id.to_string())
        .bind(alert.subject_user_id.to_string())
        .bind(alert.trip_id.map(|id| id.to_string()))
        .bind(alert.kind.as_str())
        .bind(alert.location.map(|p| p.lat))
        .bind(alert.location.map(|p| p.lon))
        .bind(&alert.message)
        .bind(ms(alert.created_at))
        .bind(alert.resolved)
        .bind(alert.resolved_at.map(ms))
        .bind(&alert.cancel_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> StoreResult<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn update_alert(&self, alert: &Alert) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE alerts SET message = ?, resolved = ?, resolved_at = ?, cancel_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(&alert.message)
        .bind(alert.resolved)
        .bind(alert.resolved_at.map(ms))
        .bind(&alert.cancel_reason)
        .bind(alert.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MonitorError::not_found("alert", alert.id));
        }
        Ok(())
    }

    async fn list_alerts_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM alerts WHERE subject_user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, alert_from_row)
    }

    async fn recent_unresolved_alerts(&self, since: DateTime<Utc>) -> StoreResult<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM alerts WHERE resolved = 0 AND created_at >= ? ORDER BY created_at",
        )
        .bind(ms(since))
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, alert_from_row)
    }

    async fn insert_contact_notifications(&self, rows: &[ContactNotification]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO contact_notifications (
                    alert_id, contact_id, status, channel, provider_message_id,
                    notified_at, failure_reason, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.alert_id.to_string())
            .bind(row.contact_id.to_string())
            .bind(row.status.as_str())
            .bind(&row.channel)
            .bind(&row.provider_message_id)
            .bind(row.notified_at.map(ms))
            .bind(&row.failure_reason)
            .bind(ms(row.created_at))
            .bind(ms(row.updated_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_contact_notification(&self, row: &ContactNotification) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE contact_notifications SET
                status = ?, channel = ?, provider_message_id = ?,
                notified_at = ?, failure_reason = ?, updated_at = ?
            WHERE alert_id = ? AND contact_id = ?
            "#,
        )
        .bind(row.status.as_str())
        .bind(&row.channel)
        .bind(&row.provider_message_id)
        .bind(row.notified_at.map(ms))
        .bind(&row.failure_reason)
        .bind(ms(row.updated_at))
        .bind(row.alert_id.to_string())
        .bind(row.contact_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MonitorError::not_found("contact notification", row.contact_id));
        }
        Ok(())
    }

    async fn list_contact_notifications(&self, alert_id: Uuid) -> StoreResult<Vec<ContactNotification>> {
        let rows = sqlx::query(
            "SELECT * FROM contact_notifications WHERE alert_id = ? ORDER BY created_at, contact_id",
        )
        .bind(alert_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        collect(&rows, notification_from_row)
    }

    async fn purge_resolved_alerts(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM alerts WHERE resolved = 1 AND created_at < ?")
            .bind(ms(before))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CreateTripRequest, DeliveryStatus, TravelMode, TripStatus};
    use chrono::Duration;

    async fn setup_test_storage() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    fn sample_trip(now: DateTime<Utc>) -> Trip {
        Trip::from_request(
            CreateTripRequest {
                user_id: Uuid::new_v4(),
                title: "Commute".into(),
                start_time: now - Duration::hours(1),
                end_time: now + Duration::hours(1),
                destination: Destination {
                    lat: 52.52,
                    lon: 13.405,
                    address: Some("Alexanderplatz".into()),
                    name: None,
                },
                notes: Some("via the park".into()),
                travel_mode: TravelMode::PublicTransport,
                alert_thresholds: None,
            },
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_trip_round_trip() {
        let storage = setup_test_storage().await;
        let now = Utc::now();
        let trip = sample_trip(now);

        storage.insert_trip(&trip).await.unwrap();
        let loaded = storage.get_trip(trip.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, trip.id);
        assert_eq!(loaded.travel_mode, TravelMode::PublicTransport);
        assert_eq!(loaded.destination.address.as_deref(), Some("Alexanderplatz"));
        assert_eq!(loaded.start_time.timestamp_millis(), trip.start_time.timestamp_millis());
        assert!(loaded.alert_history.is_empty());
    }

    #[tokio::test]
    async fn test_save_trip_detects_conflict() {
        let storage = setup_test_storage().await;
        let now = Utc::now();
        let mut trip = sample_trip(now);
        storage.insert_trip(&trip).await.unwrap();

        let stale = trip.clone();

        trip.status = TripStatus::Active;
        let version = storage.save_trip(&trip).await.unwrap();
        assert_eq!(version, 1);

        let err = storage.save_trip(&stale).await.unwrap_err();
        assert!(matches!(err, MonitorError::ConcurrencyConflict { .. }));

        let loaded = storage.get_trip(trip.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TripStatus::Active);
        assert_eq!(loaded.sync_version, 1);
    }

    #[tokio::test]
    async fn test_trip_queries() {
        let storage = setup_test_storage().await;
        let now = Utc::now();

        let silent = sample_trip(now);
        let mut overdue = sample_trip(now);
        overdue.end_time = now - Duration::minutes(5);
        overdue.status = TripStatus::Active;
        let mut done = sample_trip(now);
        done.status = TripStatus::Completed;
        let mut active = silent.clone();
        active.id = Uuid::new_v4();
        active.status = TripStatus::Active;

        for trip in [&silent, &overdue, &done, &active] {
            storage.insert_trip(trip).await.unwrap();
        }

        assert_eq!(storage.find_monitorable_trips().await.unwrap().len(), 3);
        assert_eq!(storage.find_active_trips().await.unwrap().len(), 2);

        let late = storage.find_overdue_trips(now).await.unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].id, overdue.id);

        // Both active trips started an hour ago with no pings.
        assert_eq!(
            storage.find_trips_needing_location_check(now).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_archive_finished_trips() {
        let storage = setup_test_storage().await;
        let now = Utc::now();
        let mut done = sample_trip(now);
        done.status = TripStatus::Cancelled;
        storage.insert_trip(&done).await.unwrap();

        assert_eq!(storage.archive_finished_trips(now).await.unwrap(), 0);
        assert_eq!(
            storage.archive_finished_trips(now + Duration::days(2)).await.unwrap(),
            1
        );
        assert!(!storage.get_trip(done.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_user_location_and_high_risk() {
        let storage = setup_test_storage().await;
        let now = Utc::now();
        let mut user = User::new("Robin", now);
        user.auto_sos_enabled = true;
        storage.upsert_user(&user).await.unwrap();

        storage
            .record_user_location(user.id, GeoPoint::new(1.0, 2.0), now)
            .await
            .unwrap();
        let loaded = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_known_location, Some(GeoPoint::new(1.0, 2.0)));

        assert!(storage.list_high_risk_users(now - Duration::hours(1)).await.unwrap().is_empty());
        let alert = Alert::new(user.id, None, crate::model::AlertKind::Inactivity, None, "idle", now);
        storage.insert_alert(&alert).await.unwrap();
        assert_eq!(
            storage.list_high_risk_users(now - Duration::hours(1)).await.unwrap().len(),
            1
        );

        let traveller = User::new("Casey", now);
        storage.upsert_user(&traveller).await.unwrap();
        let trip_alert = Alert::new(
            traveller.id,
            Some(Uuid::new_v4()),
            crate::model::AlertKind::TripOverdue,
            None,
            "late",
            now,
        );
        storage.insert_alert(&trip_alert).await.unwrap();
        assert_eq!(
            storage.list_high_risk_users(now - Duration::hours(1)).await.unwrap().len(),
            2
        );

        let missing = storage
            .record_user_location(Uuid::new_v4(), GeoPoint::new(0.0, 0.0), now)
            .await
            .unwrap_err();
        assert!(matches!(missing, MonitorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_device_tokens() {
        let storage = setup_test_storage().await;
        let user_id = Uuid::new_v4();
        storage.register_device_token(user_id, "tok-a").await.unwrap();
        storage.register_device_token(user_id, "tok-b").await.unwrap();
        storage.remove_device_token("tok-a").await.unwrap();

        assert_eq!(storage.get_device_tokens(user_id).await.unwrap(), vec!["tok-b"]);
    }

    #[tokio::test]
    async fn test_purge_cascades_to_notifications() {
        let storage = setup_test_storage().await;
        let now = Utc::now();
        let mut alert = Alert::new(Uuid::new_v4(), None, crate::model::AlertKind::Manual, None, "sos", now);
        storage.insert_alert(&alert).await.unwrap();

        let row = ContactNotification::pending(alert.id, Uuid::new_v4(), now);
        storage.insert_contact_notifications(&[row.clone()]).await.unwrap();

        let mut sent = row;
        sent.status = DeliveryStatus::Sent;
        storage.update_contact_notification(&sent).await.unwrap();
        let rows = storage.list_contact_notifications(alert.id).await.unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Sent);

        // Unresolved alerts survive the purge.
        assert_eq!(storage.purge_resolved_alerts(now + Duration::days(1)).await.unwrap(), 0);

        alert.resolved = true;
        alert.resolved_at = Some(now);
        storage.update_alert(&alert).await.unwrap();
        assert_eq!(storage.purge_resolved_alerts(now + Duration::days(1)).await.unwrap(), 1);
        assert!(storage.list_contact_notifications(alert.id).await.unwrap().is_empty());
    }
}
