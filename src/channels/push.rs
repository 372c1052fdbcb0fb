//! Push notifications to a contact's registered devices.
//!
//! Only contacts that are themselves app users (`linked_user_id`) can be
//! reached. The provider reports a result per device token; tokens it calls
//! invalid or unregistered are removed from the token store so they are not
//! tried again.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AlertChannel, AlertMessage, DeliveryReceipt, check_status, http_client, post_json};
use crate::error::ChannelError;
use crate::model::EmergencyContact;
use crate::store::UserStore;

/// Provider error codes that mean the token will never work again.
const PERMANENT_TOKEN_ERRORS: &[&str] = &["invalid_token", "unregistered", "not_registered"];

#[derive(Clone)]
pub struct PushChannel {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    tokens: Arc<dyn UserStore>,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    tokens: &'a [String],
    title: &'a str,
    body: &'a str,
    data: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    results: Vec<TokenResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResult {
    token: String,
    success: bool,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// What a batch of per-token results amounts to.
#[derive(Debug, PartialEq)]
struct PushOutcome {
    first_message_id: Option<String>,
    any_success: bool,
    stale_tokens: Vec<String>,
    last_error: Option<String>,
}

fn summarize(results: &[TokenResult]) -> PushOutcome {
    let mut outcome = PushOutcome {
        first_message_id: None,
        any_success: false,
        stale_tokens: Vec::new(),
        last_error: None,
    };

    for result in results {
        if result.success {
            outcome.any_success = true;
            if outcome.first_message_id.is_none() {
                outcome.first_message_id = result.message_id.clone();
            }
            continue;
        }
        let error = result.error.clone().unwrap_or_else(|| "unknown".to_string());
        if PERMANENT_TOKEN_ERRORS.contains(&error.as_str()) {
            outcome.stale_tokens.push(result.token.clone());
        }
        outcome.last_error = Some(error);
    }

    outcome
}

impl PushChannel {
    pub fn new(base_url: &str, api_token: Option<String>, tokens: Arc<dyn UserStore>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            tokens,
        }
    }

    async fn drop_stale_tokens(&self, stale: &[String]) {
        for token in stale {
            match self.tokens.remove_device_token(token).await {
                Ok(()) => debug!("Removed stale push token"),
                Err(e) => warn!(error = %e, "Failed to remove stale push token"),
            }
        }
    }
}

#[async_trait]
impl AlertChannel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn send(
        &self,
        contact: &EmergencyContact,
        message: &AlertMessage,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let user_id = contact.linked_user_id.ok_or(ChannelError::NoTarget("push"))?;
        let tokens = self
            .tokens
            .get_device_tokens(user_id)
            .await
            .map_err(|e| ChannelError::Transient(format!("token lookup failed: {e}")))?;
        if tokens.is_empty() {
            return Err(ChannelError::NoTarget("push"));
        }

        let request = PushRequest {
            tokens: &tokens,
            title: &message.title,
            body: &message.body,
            data: &message.data,
        };
        let url = format!("{}/send", self.base_url);

        let response = post_json(&self.client, &url, self.api_token.as_deref(), &request)
            .send()
            .await?;
        let data = check_status(response).await?.json::<PushResponse>().await?;

        let outcome = summarize(&data.results);
        if !outcome.stale_tokens.is_empty() {
            self.drop_stale_tokens(&outcome.stale_tokens).await;
        }

        if outcome.any_success {
            return Ok(DeliveryReceipt {
                provider_message_id: outcome.first_message_id,
                delivered: false,
            });
        }

        let reason = outcome.last_error.unwrap_or_else(|| "no results".to_string());
        if outcome.stale_tokens.len() == tokens.len() {
            Err(ChannelError::PermanentToken(reason))
        } else {
            Err(ChannelError::Transient(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(token: &str, success: bool, error: Option<&str>) -> TokenResult {
        TokenResult {
            token: token.into(),
            success,
            message_id: success.then(|| format!("msg-{token}")),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_summarize_mixed_results() {
        let outcome = summarize(&[
            result("a", false, Some("unregistered")),
            result("b", true, None),
            result("c", false, Some("rate_limited")),
        ]);

        assert!(outcome.any_success);
        assert_eq!(outcome.first_message_id.as_deref(), Some("msg-b"));
        assert_eq!(outcome.stale_tokens, vec!["a".to_string()]);
        assert_eq!(outcome.last_error.as_deref(), Some("rate_limited"));
    }

    #[test]
    fn test_summarize_all_invalid() {
        let outcome = summarize(&[
            result("a", false, Some("invalid_token")),
            result("b", false, Some("not_registered")),
        ]);
        assert!(!outcome.any_success);
        assert_eq!(outcome.stale_tokens.len(), 2);
    }
}
