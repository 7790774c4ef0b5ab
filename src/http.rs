//! Shared HTTP plumbing for the feed, mailbox, classifier and push clients.
//!
//! Every outbound call goes through [`send_with_retry`]. Throttling, server
//! errors and dropped connections are retried with capped exponential
//! backoff; `Retry-After` wins when the server sends it.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::error::DigestError;

/// Longest `Retry-After` we are willing to sleep for.
const MAX_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// No retries; one request per call.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32, headers: Option<&HeaderMap>) -> Duration {
        if let Some(secs) = headers.and_then(retry_after_secs) {
            return Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS));
        }
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// 408, 429 and 5xx are worth another attempt.
pub fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Send a request, retrying transient failures per `policy`.
///
/// The final response is returned whatever its status, so callers map 401
/// and friends themselves. Transport failures become `ProviderUnavailable`.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, DigestError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        // Streaming bodies cannot be cloned; send those exactly once.
        let Some(this_try) = request.try_clone() else {
            return request.send().await.map_err(DigestError::from);
        };
        let last = attempt >= attempts;

        let delay = match this_try.send().await {
            Ok(resp) if last || !is_transient(resp.status()) => return Ok(resp),
            Ok(resp) => {
                let delay = policy.backoff(attempt, Some(resp.headers()));
                log::warn!(
                    "HTTP {} on attempt {}/{}; retrying in {:?}",
                    resp.status().as_u16(),
                    attempt,
                    attempts,
                    delay
                );
                delay
            }
            Err(e) if !last && (e.is_timeout() || e.is_connect()) => {
                let delay = policy.backoff(attempt, None);
                log::warn!(
                    "Transport error on attempt {}/{}: {}; retrying in {:?}",
                    attempt,
                    attempts,
                    e,
                    delay
                );
                delay
            }
            Err(e) => return Err(DigestError::ProviderUnavailable(e.to_string())),
        };

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Build a client with the given request timeout.
pub fn client_with_timeout(timeout_secs: u64) -> Result<reqwest::Client, DigestError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| DigestError::Configuration(format!("HTTP client: {}", e)))
}
