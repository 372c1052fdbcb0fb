//! Manual SOS and alert resolution.
//!
//! A manual alert is recorded exactly like a scan-triggered one and goes
//! through the same fanout, but skips the dedup cool-down: a user pressing
//! the SOS button twice means it twice.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::MonitorError;
use crate::fanout::NotificationFanout;
use crate::geo::GeoPoint;
use crate::model::{
    Alert, AlertKind, ContactNotification, ManualAlertResponse, ManualSosRequest,
};
use crate::store::Store;

const DEFAULT_SOS_MESSAGE: &str = "SOS triggered from the app";

pub struct AlertService {
    store: Arc<dyn Store>,
    fanout: Arc<NotificationFanout>,
    clock: Arc<dyn Clock>,
}

impl AlertService {
    pub fn new(store: Arc<dyn Store>, fanout: Arc<NotificationFanout>, clock: Arc<dyn Clock>) -> Self {
        Self { store, fanout, clock }
    }

    /// Record a manual alert for `user_id` and start notifying contacts.
    ///
    /// Returns as soon as the alert is stored; the handle resolves when the
    /// background fanout finishes.
    pub async fn trigger_manual(
        &self,
        user_id: Uuid,
        request: ManualSosRequest,
    ) -> Result<(ManualAlertResponse, JoinHandle<()>), MonitorError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| MonitorError::not_found("user", user_id))?;

        let location = match (request.lat, request.lon) {
            (Some(lat), Some(lon)) => {
                let point = GeoPoint::new(lat, lon);
                if !point.is_valid() {
                    return Err(MonitorError::Validation(format!(
                        "coordinates out of range: ({}, {})",
                        lat, lon
                    )));
                }
                Some(point)
            }
            (None, None) => user.last_known_location,
            _ => {
                return Err(MonitorError::Validation(
                    "lat and lon must be given together".into(),
                ));
            }
        };
        let message = request
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SOS_MESSAGE.to_string());

        let alert = Alert::new(
            user.id,
            None,
            AlertKind::Manual,
            location,
            message,
            self.clock.now(),
        );
        self.store.insert_alert(&alert).await?;
        let contacts = self.store.get_emergency_contacts(user.id).await?;
        info!(alert_id = %alert.id, user_id = %user.id, contacts = contacts.len(), "Manual SOS triggered");

        let response = ManualAlertResponse {
            alert_id: alert.id,
            status: "triggered",
            contacts: contacts.len(),
        };

        let fanout = Arc::clone(&self.fanout);
        let handle = tokio::spawn(async move {
            if let Err(e) = fanout.notify(&alert, &user.name, &contacts).await {
                warn!(alert_id = %alert.id, error = %e, "Manual SOS fanout failed");
            }
        });

        Ok((response, handle))
    }

    pub async fn get(&self, id: Uuid) -> Result<Alert, MonitorError> {
        self.store
            .get_alert(id)
            .await?
            .ok_or_else(|| MonitorError::not_found("alert", id))
    }

    /// Mark an alert as handled.
    pub async fn resolve(&self, id: Uuid) -> Result<Alert, MonitorError> {
        self.close(id, None).await
    }

    /// Close an alert as a false alarm, keeping the reason.
    pub async fn cancel(&self, id: Uuid, reason: Option<String>) -> Result<Alert, MonitorError> {
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "cancelled by user".to_string());
        self.close(id, Some(reason)).await
    }

    async fn close(&self, id: Uuid, cancel_reason: Option<String>) -> Result<Alert, MonitorError> {
        let mut alert = self.get(id).await?;
        if alert.resolved {
            return Err(MonitorError::InvalidTransition(format!(
                "alert {} is already resolved",
                id
            )));
        }

        alert.resolved = true;
        alert.resolved_at = Some(self.clock.now());
        alert.cancel_reason = cancel_reason;
        self.store.update_alert(&alert).await?;

        info!(alert_id = %id, cancelled = alert.cancel_reason.is_some(), "Alert closed");
        Ok(alert)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Alert>, MonitorError> {
        self.store.list_alerts_for_user(user_id).await
    }

    /// Delivery ledger for one alert.
    pub async fn notifications(&self, id: Uuid) -> Result<Vec<ContactNotification>, MonitorError> {
        self.get(id).await?;
        self.store.list_contact_notifications(id).await
    }
}
