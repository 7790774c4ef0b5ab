//! Error types for the digest pipeline
//!
//! Errors are classified by how a run should react to them:
//! - Degrade: provider outages, malformed feeds, classifier unavailable
//! - RequiresUserAction: mailbox not connected, bad configuration
//! - Fatal: snapshot generation failed (both sources unusable)

use std::path::PathBuf;
use thiserror::Error;

/// Error types for digest generation
#[derive(Debug, Clone, Error)]
pub enum DigestError {
    // Degrade gracefully, keep previous data
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Feed could not be parsed: {0}")]
    FeedParseError(String),

    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    // Requires user action
    #[error("Mailbox not connected. Sign in again to authorize mail access")]
    AuthRequired,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file not found at {0}")]
    ConfigNotFound(PathBuf),

    // Run-fatal
    #[error("Snapshot generation failed: {0}")]
    SnapshotGenerationFailed(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl DigestError {
    /// Returns true if a later run may succeed without user intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DigestError::ProviderUnavailable(_)
                | DigestError::FeedParseError(_)
                | DigestError::ClassifierUnavailable(_)
                | DigestError::SnapshotGenerationFailed(_)
        )
    }

    /// Returns true if this error requires user action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            DigestError::AuthRequired
                | DigestError::Configuration(_)
                | DigestError::ConfigNotFound(_)
        )
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            DigestError::ProviderUnavailable(_) => {
                "Check your internet connection; the last known data is still shown."
            }
            DigestError::FeedParseError(_) => "Verify the calendar feed URL returns an .ics file.",
            DigestError::ClassifierUnavailable(_) => {
                "Mail was sorted with keyword rules. Check the classifier API key and model."
            }
            DigestError::AuthRequired => "Reconnect your mailbox from the dashboard.",
            DigestError::Configuration(_) => "Check your configuration in ~/.daydigest/config.json",
            DigestError::ConfigNotFound(_) => {
                "Create ~/.daydigest/config.json or set DAYDIGEST_CONFIG."
            }
            DigestError::SnapshotGenerationFailed(_) => {
                "Neither the calendar nor the mailbox could be reached. Try again later."
            }
            DigestError::Io(_) => "Check file permissions and disk space.",
        }
    }
}

impl From<std::io::Error> for DigestError {
    fn from(err: std::io::Error) -> Self {
        DigestError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DigestError {
    fn from(err: serde_json::Error) -> Self {
        DigestError::Io(format!("JSON: {}", err))
    }
}

impl From<reqwest::Error> for DigestError {
    fn from(err: reqwest::Error) -> Self {
        DigestError::ProviderUnavailable(err.to_string())
    }
}

/// Serializable error representation for the read surface
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorView {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&DigestError> for ErrorView {
    fn from(err: &DigestError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ErrorView {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_required_needs_user_action() {
        let view = ErrorView::from(&DigestError::AuthRequired);
        assert_eq!(view.error_type, ErrorType::RequiresUserAction);
        assert!(!view.can_retry);
    }

    #[test]
    fn test_provider_unavailable_is_retryable() {
        let err = DigestError::ProviderUnavailable("timeout".to_string());
        assert!(err.is_retryable());
        assert!(!err.requires_user_action());
        assert_eq!(ErrorView::from(&err).error_type, ErrorType::Retryable);
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DigestError = io.into();
        assert!(matches!(err, DigestError::Io(_)));
        assert_eq!(ErrorView::from(&err).error_type, ErrorType::NonRetryable);
    }
}
