//! Push notification channel
//!
//! The digest is pushed through a `NotificationChannel`. Delivery failures
//! are returned as data (`PushOutcome`), never as errors, so a failed push
//! cannot abort a run.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::DigestError;
use crate::http::{client_with_timeout, send_with_retry, RetryPolicy};
use crate::types::PushConfig;
use crate::util::truncate_chars;

const PUSHOVER_URL: &str = "https://api.pushover.net/1/messages.json";
/// Pushover rejects longer messages.
const PUSHOVER_MAX_MESSAGE: usize = 1024;
const PUSH_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushOutcome {
    pub fn delivered() -> Self {
        Self {
            delivered: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            delivered: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, title: &str, text: &str) -> PushOutcome;
}

/// Build the channel described by `config`. Missing credentials or an
/// unknown provider yield a channel that reports why it cannot deliver.
pub fn channel_from_config(config: &PushConfig) -> Arc<dyn NotificationChannel> {
    if config.provider != "pushover" {
        return Arc::new(DisabledChannel::new(format!(
            "Unsupported push provider: {}",
            config.provider
        )));
    }
    match PushoverChannel::new(config) {
        Ok(channel) => Arc::new(channel),
        Err(e) => Arc::new(DisabledChannel::new(e.to_string())),
    }
}

pub struct PushoverChannel {
    client: reqwest::Client,
    app_token: String,
    user_key: String,
    policy: RetryPolicy,
}

impl PushoverChannel {
    pub fn new(config: &PushConfig) -> Result<Self, DigestError> {
        if config.app_token.is_empty() || config.user_key.is_empty() {
            return Err(DigestError::Configuration(
                "Pushover credentials are missing".to_string(),
            ));
        }
        Ok(Self {
            client: client_with_timeout(PUSH_TIMEOUT_SECS)?,
            app_token: config.app_token.clone(),
            user_key: config.user_key.clone(),
            policy: RetryPolicy::default(),
        })
    }
}

#[async_trait]
impl NotificationChannel for PushoverChannel {
    async fn send(&self, title: &str, text: &str) -> PushOutcome {
        let form = [
            ("token", self.app_token.as_str()),
            ("user", self.user_key.as_str()),
            ("title", title),
            ("message", truncate_chars(text, PUSHOVER_MAX_MESSAGE)),
            ("priority", "0"),
        ];
        let request = self.client.post(PUSHOVER_URL).form(&form);

        let resp = match send_with_retry(request, &self.policy).await {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!("Push failed: {}", e);
                return PushOutcome::failed(e.to_string());
            }
        };
        let status = resp.status();
        if status.is_success() {
            log::info!("Push delivered");
            return PushOutcome::delivered();
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = if body.len() > 100 {
            format!("{}...", truncate_chars(&body, 100))
        } else {
            body
        };
        log::warn!("Push rejected with HTTP {}: {}", status.as_u16(), detail);
        PushOutcome::failed(format!("push provider returned HTTP {}: {}", status.as_u16(), detail))
    }
}

/// Channel used when push is not configured.
pub struct DisabledChannel {
    reason: String,
}

impl DisabledChannel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for DisabledChannel {
    async fn send(&self, _title: &str, _text: &str) -> PushOutcome {
        log::info!("Push skipped: {}", self.reason);
        PushOutcome::failed(self.reason.clone())
    }
}
