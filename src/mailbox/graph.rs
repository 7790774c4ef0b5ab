//! Microsoft Graph mail provider (`/me/messages`).

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::identity::AccessToken;
use super::{MailProvider, RawMessage};
use crate::error::DigestError;
use crate::http::{client_with_timeout, send_with_retry, RetryPolicy};
use crate::types::MailboxConfig;

const SELECT_FIELDS: &str = "id,subject,from,receivedDateTime,bodyPreview,body,importance,webLink";

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<Recipient>,
    #[serde(default)]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    body_preview: Option<String>,
    #[serde(default)]
    body: Option<ItemBody>,
    #[serde(default)]
    importance: Option<String>,
    #[serde(default)]
    web_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    #[serde(default)]
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl From<GraphMessage> for RawMessage {
    fn from(msg: GraphMessage) -> Self {
        let sender = msg.from.and_then(|r| r.email_address).and_then(|e| {
            e.address
                .filter(|a| !a.trim().is_empty())
                .or(e.name.filter(|n| !n.trim().is_empty()))
        });
        let (body, body_is_html) = match msg.body {
            Some(body) => {
                let html = body
                    .content_type
                    .as_deref()
                    .map(|t| t.eq_ignore_ascii_case("html"))
                    .unwrap_or(false);
                (body.content, html)
            }
            None => (None, false),
        };
        RawMessage {
            id: msg.id,
            subject: msg.subject,
            sender,
            received_at: msg.received_date_time,
            url: msg.web_link,
            preview: msg.body_preview,
            body,
            body_is_html,
            high_importance: msg
                .importance
                .map(|i| i.eq_ignore_ascii_case("high"))
                .unwrap_or(false),
        }
    }
}

pub struct GraphMailProvider {
    client: reqwest::Client,
    base: String,
    policy: RetryPolicy,
}

impl GraphMailProvider {
    pub fn new(config: &MailboxConfig) -> Result<Self, DigestError> {
        Ok(Self {
            client: client_with_timeout(config.timeout_secs)?,
            base: config.graph_base.trim_end_matches('/').to_string(),
            policy: RetryPolicy::default(),
        })
    }
}

#[async_trait]
impl MailProvider for GraphMailProvider {
    async fn fetch_messages(
        &self,
        token: &AccessToken,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RawMessage>, DigestError> {
        let filter = format!(
            "receivedDateTime ge {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let top = limit.max(1).to_string();
        let request = self
            .client
            .get(format!("{}/me/messages", self.base))
            .bearer_auth(&token.token)
            .query(&[
                ("$top", top.as_str()),
                ("$filter", filter.as_str()),
                ("$orderby", "receivedDateTime desc"),
                ("$select", SELECT_FIELDS),
            ]);

        let resp = send_with_retry(request, &self.policy).await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DigestError::AuthRequired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DigestError::ProviderUnavailable(format!(
                "Graph API {}: {}",
                status.as_u16(),
                crate::util::truncate_chars(&body, 200)
            )));
        }

        let list: MessageListResponse = resp.json().await?;
        log::debug!("Graph returned {} messages", list.value.len());
        Ok(list.value.into_iter().map(RawMessage::from).collect())
    }
}
