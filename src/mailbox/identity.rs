//! Mailbox identity: where access tokens come from.
//!
//! The OAuth handshake and refresh live outside this crate. We only read the
//! token it leaves behind and decide whether it is still usable.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::error::DigestError;
use crate::types::MailboxConfig;
use crate::util::Clock;

/// Tokens this close to expiry are treated as already expired.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Client credentials are present in config.
    fn is_configured(&self) -> bool;
    /// A usable token exists right now.
    fn is_connected(&self) -> bool;
    /// Return a valid token or `AuthRequired`. Never prompts.
    async fn get_valid_token(&self) -> Result<AccessToken, DigestError>;
}

/// Token JSON written by the OAuth layer. Accepts both MSAL-style
/// (`access_token`, `expires_at`) and legacy (`token`, `expiry`) names.
#[derive(Debug, Deserialize)]
struct StoredToken {
    #[serde(alias = "token")]
    access_token: String,
    #[serde(default, alias = "expiry")]
    expires_at: Option<DateTime<Utc>>,
}

pub struct FileTokenProvider {
    path: PathBuf,
    configured: bool,
    clock: Arc<dyn Clock>,
}

impl FileTokenProvider {
    pub fn new(config: &MailboxConfig, default_path: PathBuf, clock: Arc<dyn Clock>) -> Self {
        let path = config
            .token_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or(default_path);
        Self {
            path,
            configured: !config.client_id.trim().is_empty(),
            clock,
        }
    }

    fn load(&self) -> Result<AccessToken, DigestError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DigestError::AuthRequired)
            }
            Err(e) => {
                log::warn!("Mailbox token unreadable at {}: {}", self.path.display(), e);
                return Err(DigestError::AuthRequired);
            }
        };
        let stored: StoredToken = serde_json::from_str(&content).map_err(|e| {
            log::warn!("Mailbox token file is malformed: {}", e);
            DigestError::AuthRequired
        })?;
        if stored.access_token.trim().is_empty() {
            return Err(DigestError::AuthRequired);
        }
        Ok(AccessToken {
            token: stored.access_token,
            expires_at: stored.expires_at,
        })
    }

    fn is_fresh(&self, token: &AccessToken) -> bool {
        match token.expires_at {
            Some(expires_at) => {
                expires_at - Duration::seconds(EXPIRY_SKEW_SECS) > self.clock.now()
            }
            None => true,
        }
    }
}

#[async_trait]
impl IdentityProvider for FileTokenProvider {
    fn is_configured(&self) -> bool {
        self.configured
    }

    fn is_connected(&self) -> bool {
        self.configured && self.load().map(|t| self.is_fresh(&t)).unwrap_or(false)
    }

    async fn get_valid_token(&self) -> Result<AccessToken, DigestError> {
        if !self.configured {
            return Err(DigestError::AuthRequired);
        }
        let token = self.load()?;
        if !self.is_fresh(&token) {
            log::info!("Mailbox token expired; waiting for re-authorization");
            return Err(DigestError::AuthRequired);
        }
        Ok(token)
    }
}
