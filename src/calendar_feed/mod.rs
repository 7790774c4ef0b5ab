//! Calendar feed fetching with an on-disk TTL cache.
//!
//! The feed is refetched at most once per refresh interval unless forced.
//! Failures never propagate: the last cached events are served as stale, or
//! an empty list is returned with a warning when nothing was ever cached.

pub mod ics;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::DigestError;
use crate::http::{client_with_timeout, send_with_retry, RetryPolicy};
use crate::types::{CalendarEvent, FeedConfig};
use crate::util::atomic_write_str;

const CACHE_FILE: &str = "feed_cache.json";

/// Source of raw ICS text.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> Result<String, DigestError>;
}

/// Fetches the feed over HTTP(S). `webcal://` URLs are rewritten to `https://`.
pub struct HttpFeedSource {
    client: reqwest::Client,
    url: String,
    policy: RetryPolicy,
}

impl HttpFeedSource {
    pub fn new(config: &FeedConfig) -> Result<Self, DigestError> {
        Ok(Self {
            client: client_with_timeout(config.timeout_secs)?,
            url: normalize_feed_url(&config.url),
            policy: RetryPolicy::default(),
        })
    }
}

fn normalize_feed_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.strip_prefix("webcal://") {
        Some(rest) => format!("https://{}", rest),
        None => trimmed.to_string(),
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self) -> Result<String, DigestError> {
        if self.url.is_empty() {
            return Err(DigestError::ProviderUnavailable(
                "calendar feed URL is not configured".to_string(),
            ));
        }
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| DigestError::Configuration(format!("Invalid feed URL: {}", e)))?;

        let response = send_with_retry(self.client.get(parsed), &self.policy).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::ProviderUnavailable(format!(
                "feed returned HTTP {}",
                status
            )));
        }
        Ok(response.text().await?)
    }
}

/// Persisted cache payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedCache {
    pub fetched_at: DateTime<Utc>,
    pub events: Vec<CalendarEvent>,
}

/// Result of [`FeedCacheManager::get_events`].
#[derive(Debug, Clone)]
pub struct FeedFetch {
    pub events: Vec<CalendarEvent>,
    /// True only when the network was hit and the body parsed.
    pub fetched_fresh: bool,
    /// True when a failed fetch fell back to previously cached events.
    pub stale: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    pub warning: Option<DigestError>,
}

enum CacheSlot {
    Unloaded,
    Loaded(Option<Arc<FeedCache>>),
}

pub struct FeedCacheManager {
    source: Arc<dyn FeedSource>,
    cache_path: PathBuf,
    refresh_interval: Duration,
    tz: Tz,
    require_due: bool,
    cache: RwLock<CacheSlot>,
}

impl FeedCacheManager {
    pub fn new(
        source: Arc<dyn FeedSource>,
        state_dir: PathBuf,
        config: &FeedConfig,
        tz: Tz,
    ) -> Self {
        Self {
            source,
            cache_path: state_dir.join(CACHE_FILE),
            refresh_interval: Duration::hours(config.refresh_interval_hours.max(0)),
            tz,
            require_due: config.require_due_date,
            cache: RwLock::new(CacheSlot::Unloaded),
        }
    }

    /// Current cache, reading the file on first access.
    fn cached(&self) -> Option<Arc<FeedCache>> {
        if let CacheSlot::Loaded(cache) = &*self.cache.read() {
            return cache.clone();
        }

        let mut slot = self.cache.write();
        if let CacheSlot::Loaded(cache) = &*slot {
            return cache.clone();
        }
        let loaded = self.load_from_disk().map(Arc::new);
        *slot = CacheSlot::Loaded(loaded.clone());
        loaded
    }

    fn load_from_disk(&self) -> Option<FeedCache> {
        let content = match std::fs::read_to_string(&self.cache_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Feed cache unreadable at {}: {}", self.cache_path.display(), e);
                return None;
            }
        };
        match serde_json::from_str::<FeedCache>(&content) {
            Ok(cache) => {
                log::debug!(
                    "Loaded feed cache: {} events fetched at {}",
                    cache.events.len(),
                    cache.fetched_at
                );
                Some(cache)
            }
            Err(e) => {
                log::warn!("Ignoring corrupt feed cache: {}", e);
                None
            }
        }
    }

    fn store(&self, cache: Arc<FeedCache>) {
        match serde_json::to_string_pretty(cache.as_ref()) {
            Ok(json) => {
                if let Err(e) = atomic_write_str(&self.cache_path, &json) {
                    log::warn!("Failed to persist feed cache: {}", e);
                }
            }
            Err(e) => log::warn!("Failed to serialize feed cache: {}", e),
        }
        *self.cache.write() = CacheSlot::Loaded(Some(cache));
    }

    async fn fetch_and_parse(&self) -> Result<Vec<CalendarEvent>, DigestError> {
        let body = self.source.fetch().await?;
        ics::parse_feed(&body, self.tz, self.require_due)
    }

    /// Return calendar events, hitting the network only when the cache is
    /// older than the refresh interval or `force_refresh` is set.
    pub async fn get_events(&self, now: DateTime<Utc>, force_refresh: bool) -> FeedFetch {
        let cached = self.cached();

        if !force_refresh {
            if let Some(cache) = &cached {
                let age = now - cache.fetched_at;
                if age >= Duration::zero() && age < self.refresh_interval {
                    log::debug!("Feed cache hit (age {}m)", age.num_minutes());
                    return FeedFetch {
                        events: cache.events.clone(),
                        fetched_fresh: false,
                        stale: false,
                        fetched_at: Some(cache.fetched_at),
                        warning: None,
                    };
                }
            }
        }

        match self.fetch_and_parse().await {
            Ok(events) => {
                log::info!("Fetched calendar feed: {} events", events.len());
                let fresh = Arc::new(FeedCache {
                    fetched_at: now,
                    events,
                });
                self.store(fresh.clone());
                FeedFetch {
                    events: fresh.events.clone(),
                    fetched_fresh: true,
                    stale: false,
                    fetched_at: Some(now),
                    warning: None,
                }
            }
            Err(e) => match cached {
                Some(cache) => {
                    log::warn!(
                        "Feed fetch failed, serving cache from {}: {}",
                        cache.fetched_at,
                        e
                    );
                    FeedFetch {
                        events: cache.events.clone(),
                        fetched_fresh: false,
                        stale: true,
                        fetched_at: Some(cache.fetched_at),
                        warning: Some(e),
                    }
                }
                None => {
                    log::warn!("Feed fetch failed with no cache: {}", e);
                    FeedFetch {
                        events: Vec::new(),
                        fetched_fresh: false,
                        stale: false,
                        fetched_at: None,
                        warning: Some(e),
                    }
                }
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Feed source returning a scripted body or error, counting fetches.
    pub struct FakeFeedSource {
        pub calls: AtomicUsize,
        pub response: Mutex<Result<String, DigestError>>,
    }

    impl FakeFeedSource {
        pub fn ok(body: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Mutex::new(Ok(body.to_string())),
            }
        }

        pub fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Mutex::new(Err(DigestError::ProviderUnavailable(
                    "connection refused".to_string(),
                ))),
            }
        }

        pub fn set(&self, response: Result<String, DigestError>) {
            *self.response.lock() = response;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FeedSource for FakeFeedSource {
        async fn fetch(&self) -> Result<String, DigestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.lock().clone()
        }
    }

    pub fn ics_with(events: &[(&str, &str, &str)]) -> String {
        let mut body = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n");
        for (uid, summary, dtstart) in events {
            body.push_str(&format!(
                "BEGIN:VEVENT\r\nUID:{}\r\nSUMMARY:{}\r\nDTSTART:{}\r\nEND:VEVENT\r\n",
                uid, summary, dtstart
            ));
        }
        body.push_str("END:VCALENDAR\r\n");
        body
    }
}
