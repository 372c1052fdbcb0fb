//! Email delivery through an HTTP mail relay (`POST {base}/send`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AlertChannel, AlertMessage, DeliveryReceipt, check_status, http_client, post_json};
use crate::error::ChannelError;
use crate::model::EmergencyContact;

#[derive(Clone)]
pub struct EmailChannel {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    from: String,
}

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    body: String,
}

#[derive(Debug, Deserialize)]
struct EmailResponse {
    #[serde(default)]
    id: Option<String>,
}

impl EmailChannel {
    pub fn new(base_url: &str, api_token: Option<String>, from: &str) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            from: from.to_string(),
        }
    }
}

fn render_body(contact: &EmergencyContact, message: &AlertMessage) -> String {
    format!(
        "Hello {},\n\n{}\n\nYou are receiving this because you are listed as an emergency contact.",
        contact.name, message.body
    )
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(
        &self,
        contact: &EmergencyContact,
        message: &AlertMessage,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let to = contact
            .email
            .as_deref()
            .filter(|e| e.contains('@'))
            .ok_or(ChannelError::NoTarget("email"))?;

        let request = EmailRequest {
            from: &self.from,
            to,
            subject: &message.title,
            body: render_body(contact, message),
        };
        let url = format!("{}/send", self.base_url);

        let response = post_json(&self.client, &url, self.api_token.as_deref(), &request)
            .send()
            .await?;
        let data = check_status(response).await?.json::<EmailResponse>().await?;

        Ok(DeliveryReceipt {
            provider_message_id: data.id,
            delivered: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn test_body_greets_contact() {
        let contact = EmergencyContact {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Sam".into(),
            phone: None,
            email: Some("sam@example.com".into()),
            linked_user_id: None,
            priority: 1,
        };
        let message = AlertMessage {
            title: "t".into(),
            body: "Alex is overdue".into(),
            data: BTreeMap::new(),
        };

        let body = render_body(&contact, &message);
        assert!(body.starts_with("Hello Sam,"));
        assert!(body.contains("Alex is overdue"));
    }
}
