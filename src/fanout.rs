//! Notification fanout: one alert, many emergency contacts.
//!
//! Every contact gets a `pending` ledger row up front, then its own task that
//! walks the configured channels in order until one succeeds. Tasks share a
//! semaphore so the number of in-flight provider calls stays bounded no matter
//! how many alerts fire in one cycle. A failing or panicking task only ever
//! affects its own contact's row.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{AlertChannel, AlertMessage, DeliveryReceipt};
use crate::clock::Clock;
use crate::error::{ChannelError, MonitorError};
use crate::geo::map_link;
use crate::model::{Alert, ContactNotification, DeliveryStatus, EmergencyContact};
use crate::store::{AlertStore, UserStore};

/// Final outcome for one contact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub contact_id: Uuid,
    pub status: DeliveryStatus,
    pub channel: Option<String>,
    pub provider_message_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl DeliveryReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, DeliveryStatus::Sent | DeliveryStatus::Delivered)
    }
}

/// Result of walking the channel list for one contact.
enum Attempt {
    Success {
        channel: &'static str,
        receipt: DeliveryReceipt,
    },
    Failure {
        channel: Option<&'static str>,
        reason: String,
    },
}

pub struct NotificationFanout {
    store: Arc<dyn AlertStore>,
    channels: Arc<[Arc<dyn AlertChannel>]>,
    sends: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
}

impl NotificationFanout {
    pub fn new(
        store: Arc<dyn AlertStore>,
        channels: Vec<Arc<dyn AlertChannel>>,
        max_concurrent_sends: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            channels: channels.into(),
            sends: Arc::new(Semaphore::new(max_concurrent_sends.max(1))),
            clock,
        }
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Render the text every channel sends for `alert`.
    pub fn build_message(alert: &Alert, subject_name: &str) -> AlertMessage {
        let timestamp = format_timestamp(alert.created_at);

        let mut body = format!("{} {}. {}", subject_name, alert.kind.label(), alert.message);
        if let Some(location) = &alert.location {
            body.push_str(&format!("\nLast known location: {}", map_link(location)));
        }
        body.push_str(&format!("\nTime: {}", timestamp));

        let mut data = BTreeMap::new();
        data.insert("alert_id".to_string(), alert.id.to_string());
        data.insert("kind".to_string(), alert.kind.to_string());
        data.insert("subject_user_id".to_string(), alert.subject_user_id.to_string());
        data.insert("timestamp".to_string(), alert.created_at.to_rfc3339());
        if let Some(trip_id) = alert.trip_id {
            data.insert("trip_id".to_string(), trip_id.to_string());
        }
        if let Some(location) = &alert.location {
            data.insert("lat".to_string(), location.lat.to_string());
            data.insert("lon".to_string(), location.lon.to_string());
        }

        AlertMessage {
            title: format!("Emergency alert: {}", subject_name),
            body,
            data,
        }
    }

    /// Look up the subject's emergency contacts and notify them.
    pub async fn notify_subject(
        &self,
        users: &dyn UserStore,
        alert: &Alert,
        subject_name: &str,
    ) -> Result<Vec<DeliveryReport>, MonitorError> {
        let contacts = users.get_emergency_contacts(alert.subject_user_id).await?;
        self.notify(alert, subject_name, &contacts).await
    }

    /// Notify every contact of `alert` and record the outcome per contact.
    ///
    /// Per-contact delivery failures are reported, never returned as errors.
    /// Fails only when the alert itself is unusable or the pending ledger rows
    /// cannot be written.
    pub async fn notify(
        &self,
        alert: &Alert,
        subject_name: &str,
        contacts: &[EmergencyContact],
    ) -> Result<Vec<DeliveryReport>, MonitorError> {
        if alert.message.trim().is_empty() {
            return Err(MonitorError::Precondition(format!(
                "alert {} has no message",
                alert.id
            )));
        }
        if subject_name.trim().is_empty() {
            return Err(MonitorError::Precondition(format!(
                "alert {} has no subject name",
                alert.id
            )));
        }
        if contacts.is_empty() {
            info!(alert_id = %alert.id, "No emergency contacts to notify");
            return Ok(Vec::new());
        }

        let created = self.clock.now();
        let pending: Vec<ContactNotification> = contacts
            .iter()
            .map(|c| ContactNotification::pending(alert.id, c.id, created))
            .collect();
        self.store.insert_contact_notifications(&pending).await?;

        let message = Arc::new(Self::build_message(alert, subject_name));

        let handles: Vec<_> = contacts
            .iter()
            .cloned()
            .map(|contact| {
                let channels = Arc::clone(&self.channels);
                let sends = Arc::clone(&self.sends);
                let message = Arc::clone(&message);
                tokio::spawn(async move {
                    let _permit = match sends.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return Attempt::Failure {
                                channel: None,
                                reason: "send limiter closed".to_string(),
                            };
                        }
                    };
                    deliver(&channels, &contact, &message).await
                })
            })
            .collect();

        let outcomes = join_all(handles).await;

        let mut reports = Vec::with_capacity(contacts.len());
        for (mut row, outcome) in pending.into_iter().zip(outcomes) {
            let attempt = outcome.unwrap_or_else(|e| Attempt::Failure {
                channel: None,
                reason: format!("delivery task failed: {e}"),
            });

            let now = self.clock.now();
            row.updated_at = now;
            match attempt {
                Attempt::Success { channel, receipt } => {
                    row.status = if receipt.delivered {
                        DeliveryStatus::Delivered
                    } else {
                        DeliveryStatus::Sent
                    };
                    row.channel = Some(channel.to_string());
                    row.provider_message_id = receipt.provider_message_id;
                    row.notified_at = Some(now);
                }
                Attempt::Failure { channel, reason } => {
                    row.status = DeliveryStatus::Failed;
                    row.channel = channel.map(str::to_string);
                    row.failure_reason = Some(reason);
                }
            }

            if let Err(e) = self.store.update_contact_notification(&row).await {
                warn!(
                    alert_id = %row.alert_id,
                    contact_id = %row.contact_id,
                    error = %e,
                    "Failed to record delivery outcome"
                );
            }

            reports.push(DeliveryReport {
                contact_id: row.contact_id,
                status: row.status,
                channel: row.channel,
                provider_message_id: row.provider_message_id,
                failure_reason: row.failure_reason,
            });
        }

        let sent = reports.iter().filter(|r| r.succeeded()).count();
        info!(
            alert_id = %alert.id,
            kind = %alert.kind,
            contacts = reports.len(),
            sent,
            failed = reports.len() - sent,
            "Alert fanout complete"
        );

        Ok(reports)
    }
}

/// Try each channel in order; the first success wins.
async fn deliver(
    channels: &[Arc<dyn AlertChannel>],
    contact: &EmergencyContact,
    message: &AlertMessage,
) -> Attempt {
    let mut last_failure = Attempt::Failure {
        channel: None,
        reason: "no alert channels configured".to_string(),
    };

    for channel in channels {
        match channel.send(contact, message).await {
            Ok(receipt) => {
                debug!(contact_id = %contact.id, channel = channel.name(), "Delivered alert");
                return Attempt::Success {
                    channel: channel.name(),
                    receipt,
                };
            }
            Err(ChannelError::NoTarget(target)) => {
                debug!(contact_id = %contact.id, channel = channel.name(), missing = target, "Contact not reachable on channel");
                if matches!(last_failure, Attempt::Failure { channel: None, .. }) {
                    last_failure = Attempt::Failure {
                        channel: Some(channel.name()),
                        reason: format!("no {} target for contact", target),
                    };
                }
            }
            Err(e) => {
                warn!(contact_id = %contact.id, channel = channel.name(), error = %e, "Alert delivery attempt failed");
                last_failure = Attempt::Failure {
                    channel: Some(channel.name()),
                    reason: e.to_string(),
                };
            }
        }
    }

    last_failure
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}
