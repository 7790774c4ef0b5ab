use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::calendar_feed::{FeedCacheManager, HttpFeedSource};
use crate::classify::cache::ClassificationCache;
use crate::classify::model::ModelClassifier;
use crate::classify::rules::RuleClassifier;
use crate::classify::{ClassificationEngine, Classifier};
use crate::consolidate::TaskPolicy;
use crate::error::DigestError;
use crate::executor::{DigestOrchestrator, Pipeline, RunSettings};
use crate::mail_tasks::MailTaskExtractor;
use crate::mailbox::graph::GraphMailProvider;
use crate::mailbox::identity::FileTokenProvider;
use crate::mailbox::MailboxNormalizer;
use crate::notification::channel_from_config;
use crate::types::Config;
use crate::util::{Clock, SystemClock};

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "DAYDIGEST_CONFIG";

const CLASSIFICATION_CACHE_FILE: &str = "classification_cache.json";
const TOKEN_FILE: &str = "mail_token.json";

/// Process-wide state shared by the scheduler, executor and read surface
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<DigestOrchestrator>,
    /// Slot of the last scheduled run, so a slot never runs twice
    pub last_scheduled_run: RwLock<Option<DateTime<Utc>>>,
}

impl AppState {
    /// Wire the production pipeline for `config`.
    pub fn from_config(config: Config) -> Result<Self, DigestError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let orchestrator = build_orchestrator(&config, clock)?;
        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
            last_scheduled_run: RwLock::new(None),
        })
    }
}

fn build_orchestrator(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> Result<DigestOrchestrator, DigestError> {
    let settings = RunSettings::from_config(config)?;
    let tz = settings.tz;
    let dir = state_dir(config)?;

    let feed = FeedCacheManager::new(
        Arc::new(HttpFeedSource::new(&config.feed)?),
        dir.clone(),
        &config.feed,
        tz,
    );

    let identity = FileTokenProvider::new(&config.mailbox, dir.join(TOKEN_FILE), clock.clone());
    let mailbox = MailboxNormalizer::new(
        Arc::new(identity),
        Arc::new(GraphMailProvider::new(&config.mailbox)?),
        config.mailbox.max_messages,
        clock.clone(),
    );

    let model: Option<Arc<dyn Classifier>> = if config.classifier.is_configured() {
        Some(Arc::new(ModelClassifier::new(&config.classifier, tz)?))
    } else {
        log::info!("Classifier model not configured; using keyword rules");
        None
    };
    let engine = ClassificationEngine::new(
        model,
        RuleClassifier::new(tz, &config.tasks),
        ClassificationCache::load(dir.join(CLASSIFICATION_CACHE_FILE)),
        config.classifier.version.clone(),
        Duration::hours(config.classifier.cache_ttl_hours.max(0)),
        clock.clone(),
    );

    let pipeline = Pipeline {
        feed,
        mailbox,
        engine: Arc::new(engine),
        extractor: MailTaskExtractor::new(tz, &config.tasks, &config.feed),
        policy: TaskPolicy::from_config(&config.feed, &config.tasks),
        channel: channel_from_config(&config.push),
    };
    Ok(DigestOrchestrator::new(settings, pipeline, clock))
}

fn home_dir() -> Result<PathBuf, DigestError> {
    dirs::home_dir()
        .map(|home| home.join(".daydigest"))
        .ok_or_else(|| DigestError::Configuration("Could not find home directory".to_string()))
}

/// `$DAYDIGEST_CONFIG`, else `~/.daydigest/config.json`
pub fn config_path() -> Result<PathBuf, DigestError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(home_dir()?.join("config.json")),
    }
}

/// Cache directory, created if missing.
pub fn state_dir(config: &Config) -> Result<PathBuf, DigestError> {
    let dir = match &config.state_dir {
        Some(dir) => PathBuf::from(dir),
        None => home_dir()?.join("state"),
    };
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Load configuration from [`config_path`]
pub fn load_config() -> Result<Config, DigestError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config, DigestError> {
    if !path.exists() {
        return Err(DigestError::ConfigNotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)
        .map_err(|e| DigestError::Configuration(format!("Failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(matches!(
            load_config_from(&path),
            Err(DigestError::ConfigNotFound(p)) if p == path
        ));
    }

    #[test]
    fn test_invalid_timezone_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"schedule": {"timezone": "Mars/Olympus"}}"#).unwrap();
        assert!(matches!(
            load_config_from(&path),
            Err(DigestError::Configuration(_))
        ));
    }

    #[test]
    fn test_state_dir_created_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: Some(dir.path().join("nested").to_string_lossy().into_owned()),
            ..Config::default()
        };
        let created = state_dir(&config).unwrap();
        assert!(created.is_dir());
    }

    #[tokio::test]
    async fn test_wiring_with_defaults_starts_idle() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: Some(dir.path().to_string_lossy().into_owned()),
            ..Config::default()
        };
        let state = AppState::from_config(config).unwrap();
        assert_eq!(state.orchestrator.phase(), crate::executor::RunPhase::Idle);
        assert!(state.orchestrator.current().is_none());
        assert!(!state.orchestrator.mailbox().identity().is_configured());
    }
}
