//! Mailbox normalization.
//!
//! A [`MailProvider`] returns loosely-typed provider records; this module turns
//! them into canonical [`MailItem`]s (stable ids, text bodies, defaults for
//! missing fields), newest first.

pub mod graph;
pub mod html;
pub mod identity;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::DigestError;
use crate::types::MailItem;
use crate::util::{truncate_chars, Clock};
use identity::{AccessToken, IdentityProvider};

/// Maximum characters kept from a message body.
pub const BODY_EXCERPT_CHARS: usize = 2000;

/// A provider-shaped message before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub preview: Option<String>,
    pub body: Option<String>,
    pub body_is_html: bool,
    pub high_importance: bool,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn fetch_messages(
        &self,
        token: &AccessToken,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RawMessage>, DigestError>;
}

pub struct MailboxNormalizer {
    identity: Arc<dyn IdentityProvider>,
    provider: Arc<dyn MailProvider>,
    max_messages: u32,
    clock: Arc<dyn Clock>,
}

impl MailboxNormalizer {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        provider: Arc<dyn MailProvider>,
        max_messages: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            provider,
            max_messages,
            clock,
        }
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    /// Fetch and normalize mail received at or after `since`.
    ///
    /// `AuthRequired` is returned untouched when no valid token exists; the
    /// provider is not called in that case.
    pub async fn list_recent_mail(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MailItem>, DigestError> {
        let token = self.identity.get_valid_token().await?;
        let raw = self
            .provider
            .fetch_messages(&token, since, self.max_messages)
            .await?;
        let fetched_at = self.clock.now();

        let mut seen = HashSet::new();
        let mut items: Vec<MailItem> = raw
            .into_iter()
            .map(|msg| normalize_message(msg, fetched_at))
            .filter(|item| item.received_at >= since)
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        items.sort_by(|a, b| {
            b.received_at
                .cmp(&a.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        items.truncate(self.max_messages as usize);

        log::info!("Mailbox: {} messages since {}", items.len(), since);
        Ok(items)
    }
}

/// Convert one provider record into a [`MailItem`].
///
/// `fallback_received` stands in for a missing receive timestamp.
pub fn normalize_message(msg: RawMessage, fallback_received: DateTime<Utc>) -> MailItem {
    let subject = msg
        .subject
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("(no subject)")
        .to_string();
    let sender = msg
        .sender
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string();
    let received_at = msg.received_at.unwrap_or(fallback_received);

    let body_text = match msg.body.as_deref().filter(|b| !b.trim().is_empty()) {
        Some(body) if msg.body_is_html => html::strip_html(body),
        Some(body) => body.trim().to_string(),
        None => msg.preview.as_deref().unwrap_or("").trim().to_string(),
    };
    let body_excerpt = truncate_chars(&body_text, BODY_EXCERPT_CHARS).to_string();

    let id = if msg.id.trim().is_empty() {
        synthetic_mail_id(&subject, &sender, received_at)
    } else {
        msg.id
    };

    MailItem {
        id,
        subject,
        sender,
        received_at,
        url: msg.url.filter(|u| !u.trim().is_empty()),
        body_excerpt,
        is_important: msg.high_importance,
    }
}

fn synthetic_mail_id(subject: &str, sender: &str, received_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(sender.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(received_at.to_rfc3339().as_bytes());
    format!("mail-{}", &hex::encode(hasher.finalize())[..16])
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::util::test_clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn normalizer(connected: bool, provider: Arc<FakeMailProvider>) -> MailboxNormalizer {
        MailboxNormalizer::new(
            Arc::new(FakeIdentity { connected }),
            provider,
            20,
            Arc::new(ManualClock::new(t0())),
        )
    }

    #[tokio::test]
    async fn test_auth_required_skips_provider() {
        let provider = Arc::new(FakeMailProvider::with(vec![]));
        let mailbox = normalizer(false, provider.clone());
        let result = mailbox.list_recent_mail(t0()).await;
        assert!(matches!(result, Err(DigestError::AuthRequired)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let provider = Arc::new(FakeMailProvider::failing(DigestError::ProviderUnavailable(
            "503".to_string(),
        )));
        let mailbox = normalizer(true, provider);
        assert!(matches!(
            mailbox.list_recent_mail(t0()).await,
            Err(DigestError::ProviderUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_sorted_newest_first_and_deduped() {
        let since = t0() - Duration::hours(48);
        let provider = Arc::new(FakeMailProvider::with(vec![
            raw("a", "Older", t0() - Duration::hours(5), "x"),
            raw("b", "Newer", t0() - Duration::hours(1), "y"),
            raw("a", "Older dup", t0() - Duration::hours(5), "x"),
            raw("c", "Too old", since - Duration::minutes(1), "z"),
        ]));
        let mailbox = normalizer(true, provider);
        let items = mailbox.list_recent_mail(since).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_undated_message_is_stamped_with_fetch_time() {
        let provider = Arc::new(FakeMailProvider::with(vec![RawMessage {
            id: "u1".to_string(),
            subject: Some("No date".to_string()),
            ..RawMessage::default()
        }]));
        let mailbox = normalizer(true, provider);
        let items = mailbox
            .list_recent_mail(t0() - Duration::hours(48))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].received_at, t0());
    }

    #[test]
    fn test_missing_fields_get_defaults() {
        let item = normalize_message(
            RawMessage {
                preview: Some("  Reminder text ".to_string()),
                ..RawMessage::default()
            },
            t0(),
        );
        assert_eq!(item.subject, "(no subject)");
        assert_eq!(item.sender, "unknown");
        assert_eq!(item.received_at, t0());
        assert_eq!(item.body_excerpt, "Reminder text");
        assert!(item.id.starts_with("mail-"));
    }

    #[test]
    fn test_synthetic_id_is_stable() {
        let first = normalize_message(RawMessage::default(), t0());
        let second = normalize_message(RawMessage::default(), t0());
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_html_body_is_stripped_and_truncated() {
        let long = format!("<div>{}</div>", "word ".repeat(BODY_EXCERPT_CHARS / 4));
        let item = normalize_message(
            RawMessage {
                id: "m1".to_string(),
                body: Some(long),
                body_is_html: true,
                ..RawMessage::default()
            },
            t0(),
        );
        assert_eq!(item.body_excerpt.chars().count(), BODY_EXCERPT_CHARS);
        assert!(!item.body_excerpt.contains('<'));
    }
}
