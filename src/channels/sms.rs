//! SMS delivery through an HTTP gateway.
//!
//! The gateway accepts `POST {base}/messages` with `{"to", "body"}` and answers
//! with the provider's message id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AlertChannel, AlertMessage, DeliveryReceipt, check_status, http_client, post_json};
use crate::error::ChannelError;
use crate::model::EmergencyContact;

/// Longest SMS body we send; providers split or reject beyond this.
const MAX_SMS_CHARS: usize = 640;

#[derive(Clone)]
pub struct SmsChannel {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    body: String,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl SmsChannel {
    pub fn new(base_url: &str, api_token: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        }
    }

    fn render(message: &AlertMessage) -> String {
        let text = format!("{}\n{}", message.title, message.body);
        if text.chars().count() <= MAX_SMS_CHARS {
            return text;
        }
        let mut truncated: String = text.chars().take(MAX_SMS_CHARS - 3).collect();
        truncated.push_str("...");
        truncated
    }
}

#[async_trait]
impl AlertChannel for SmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    async fn send(
        &self,
        contact: &EmergencyContact,
        message: &AlertMessage,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let phone = contact
            .phone
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or(ChannelError::NoTarget("phone"))?;

        let request = SmsRequest {
            to: phone,
            body: Self::render(message),
        };
        let url = format!("{}/messages", self.base_url);

        let response = post_json(&self.client, &url, self.api_token.as_deref(), &request)
            .send()
            .await?;
        let data = check_status(response).await?.json::<SmsResponse>().await?;

        Ok(DeliveryReceipt {
            provider_message_id: data.message_id,
            delivered: data.status.as_deref() == Some("delivered"),
        })
    }
}
