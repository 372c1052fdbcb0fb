//! Outbound alert channels.
//!
//! Each medium (SMS, push, email) implements [`AlertChannel`]. Fanout tries
//! the configured channels in order for every contact and stops at the first
//! one that reports success.
//!
//! # Channels
//!
//! - [`sms`]: text message through an HTTP SMS gateway
//! - [`push`]: push notification to the contact's registered devices
//! - [`email`]: email through an HTTP mail relay

pub mod email;
pub mod push;
pub mod sms;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{ChannelConfig, ChannelKind, MonitorConfig};
use crate::error::ChannelError;
use crate::model::EmergencyContact;
use crate::store::UserStore;

pub use email::EmailChannel;
pub use push::PushChannel;
pub use sms::SmsChannel;

/// Per-request timeout for provider calls.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Rendered alert content, shared by every channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    pub title: String,
    pub body: String,
    /// Structured payload for push (alert id, kind, coordinates).
    pub data: BTreeMap<String, String>,
}

/// A successful delivery attempt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
    /// The provider confirmed handset delivery, not just acceptance.
    pub delivered: bool,
}

/// One outbound notification medium.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Short name recorded in the delivery ledger ("sms", "push", ...).
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        contact: &EmergencyContact,
        message: &AlertMessage,
    ) -> Result<DeliveryReceipt, ChannelError>;
}

/// Build the configured channels in attempt order.
pub fn build_channels(
    config: &MonitorConfig,
    users: Arc<dyn UserStore>,
) -> Vec<Arc<dyn AlertChannel>> {
    config
        .channels
        .iter()
        .map(|channel: &ChannelConfig| -> Arc<dyn AlertChannel> {
            match channel.kind {
                ChannelKind::Sms => Arc::new(SmsChannel::new(
                    &channel.base_url,
                    channel.api_token.clone(),
                )),
                ChannelKind::Push => Arc::new(PushChannel::new(
                    &channel.base_url,
                    channel.api_token.clone(),
                    Arc::clone(&users),
                )),
                ChannelKind::Email => Arc::new(EmailChannel::new(
                    &channel.base_url,
                    channel.api_token.clone(),
                    &config.email_from,
                )),
            }
        })
        .collect()
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// POST `body` as JSON, with a bearer token when one is configured.
pub(crate) fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    api_token: Option<&str>,
    body: &T,
) -> reqwest::RequestBuilder {
    let req = client.post(url).json(body);
    if let Some(token) = api_token {
        req.header("Authorization", format!("Bearer {}", token))
    } else {
        req
    }
}

/// Turn a non-success provider status into a channel error.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(ChannelError::Transient(format!(
        "provider returned {}: {}",
        status, snippet
    )))
}
