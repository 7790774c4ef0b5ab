use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::classify::ClassificationStats;
use crate::error::DigestError;
use crate::nudge::{NudgeSet, NudgeStyle};

/// Assumed lead time between publication and due date when the source omits it.
pub const DEFAULT_PUBLISH_LEAD_HOURS: i64 = 72;

// =============================================================================
// Configuration
// =============================================================================

/// Main configuration, read from `~/.daydigest/config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub nudge: NudgeConfig,
    #[serde(default)]
    pub push: PushConfig,
    /// How long a Ready snapshot is served to plain reads before a rerun.
    #[serde(default = "default_snapshot_max_age")]
    pub snapshot_max_age_minutes: i64,
    /// Directory for the feed and classification caches. Defaults to `~/.daydigest/state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            feed: FeedConfig::default(),
            mailbox: MailboxConfig::default(),
            classifier: ClassifierConfig::default(),
            tasks: TaskConfig::default(),
            nudge: NudgeConfig::default(),
            push: PushConfig::default(),
            snapshot_max_age_minutes: default_snapshot_max_age(),
            state_dir: None,
        }
    }
}

impl Config {
    /// Check the fields that would otherwise only fail deep inside a run.
    pub fn validate(&self) -> Result<(), DigestError> {
        self.schedule.tz()?;
        self.schedule.hour_minute()?;
        if self.classifier.enabled && self.classifier.model.trim().is_empty() {
            return Err(DigestError::Configuration(
                "classifier.model is required when the classifier is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn snapshot_max_age(&self) -> Duration {
        Duration::minutes(self.snapshot_max_age_minutes.max(0))
    }
}

fn default_snapshot_max_age() -> i64 {
    60
}

/// Daily digest schedule: a local wall-clock time in a named timezone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "HH:MM", 24h
    #[serde(default = "default_schedule_time")]
    pub time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: default_schedule_time(),
            timezone: default_timezone(),
        }
    }
}

impl ScheduleConfig {
    pub fn tz(&self) -> Result<Tz, DigestError> {
        self.timezone
            .parse()
            .map_err(|_| DigestError::Configuration(format!("Invalid timezone: {}", self.timezone)))
    }

    /// Parse the configured "HH:MM" into (hour, minute).
    pub fn hour_minute(&self) -> Result<(u32, u32), DigestError> {
        let invalid =
            || DigestError::Configuration(format!("Invalid schedule time: {}", self.time));
        let (h, m) = self.time.trim().split_once(':').ok_or_else(invalid)?;
        let hour: u32 = h.parse().map_err(|_| invalid())?;
        let minute: u32 = m.parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok((hour, minute))
    }
}

fn default_true() -> bool {
    true
}

fn default_schedule_time() -> String {
    "07:30".to_string()
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

/// Calendar (ICS) feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_hours: i64,
    #[serde(default = "default_true")]
    pub require_due_date: bool,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            refresh_interval_hours: default_refresh_interval(),
            require_due_date: true,
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_refresh_interval() -> i64 {
    24
}

fn default_http_timeout() -> u64 {
    20
}

/// Mailbox provider settings (Microsoft Graph)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxConfig {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    /// Token file written by the OAuth layer. Defaults to `~/.daydigest/mailbox/token.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,
    #[serde(default = "default_graph_base")]
    pub graph_base: String,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            token_path: None,
            graph_base: default_graph_base(),
            max_messages: default_max_messages(),
            lookback_hours: default_lookback_hours(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_graph_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_max_messages() -> u32 {
    20
}

fn default_lookback_hours() -> i64 {
    48
}

/// Language-model classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Bumping this invalidates every cached classification.
    #[serde(default = "default_classifier_version")]
    pub version: String,
    #[serde(default = "default_calls_per_run")]
    pub max_mail_calls_per_run: u32,
    #[serde(default = "default_calls_per_run")]
    pub max_calendar_calls_per_run: u32,
    /// Course mails handed to the model for task extraction per run.
    #[serde(default = "default_calls_per_run")]
    pub max_extract_mails_per_run: u32,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_hours: i64,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: default_api_base(),
            api_key: String::new(),
            model: default_model(),
            version: default_classifier_version(),
            max_mail_calls_per_run: default_calls_per_run(),
            max_calendar_calls_per_run: default_calls_per_run(),
            max_extract_mails_per_run: default_calls_per_run(),
            cache_ttl_hours: default_cache_ttl(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl ClassifierConfig {
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.api_key.trim().is_empty() && !self.model.trim().is_empty()
    }
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_classifier_version() -> String {
    "triage-v1".to_string()
}

fn default_calls_per_run() -> u32 {
    8
}

fn default_cache_ttl() -> i64 {
    72
}

/// How strictly candidate tasks must look like work items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Candidate titles must contain an action keyword
    ActionOnly,
    All,
}

/// Task consolidation and mail extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default = "default_true")]
    pub mail_extraction: bool,
    /// Also ask the model for tasks in course mail, when a model is configured.
    #[serde(default = "default_true")]
    pub llm_extraction: bool,
    #[serde(default = "default_task_mode")]
    pub mode: TaskMode,
    #[serde(default = "default_action_keywords")]
    pub action_keywords: Vec<String>,
    #[serde(default = "default_noise_keywords")]
    pub noise_keywords: Vec<String>,
    #[serde(default = "default_important_keywords")]
    pub important_keywords: Vec<String>,
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            mail_extraction: true,
            llm_extraction: true,
            mode: default_task_mode(),
            action_keywords: default_action_keywords(),
            noise_keywords: default_noise_keywords(),
            important_keywords: default_important_keywords(),
            lookahead_days: default_lookahead_days(),
        }
    }
}

fn default_task_mode() -> TaskMode {
    TaskMode::ActionOnly
}

fn keywords(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn default_action_keywords() -> Vec<String> {
    keywords(&[
        "due",
        "deadline",
        "exam",
        "quiz",
        "submission",
        "assignment",
        "homework",
        "hw",
        "project",
        "midterm",
        "final",
        "participation",
        "lab",
    ])
}

fn default_noise_keywords() -> Vec<String> {
    keywords(&[
        "assignment graded",
        "graded:",
        "office hours moved",
        "daily digest",
        "announcement posted",
    ])
}

fn default_important_keywords() -> Vec<String> {
    keywords(&["urgent", "important", "deadline", "exam", "quiz", "project"])
}

fn default_lookahead_days() -> i64 {
    7
}

/// Nudge persona and push window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NudgeConfig {
    #[serde(default)]
    pub style: NudgeStyle,
    #[serde(default = "default_push_window")]
    pub push_window_hours: i64,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            style: NudgeStyle::default(),
            push_window_hours: default_push_window(),
        }
    }
}

fn default_push_window() -> i64 {
    48
}

/// Push notification transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    #[serde(default = "default_push_provider")]
    pub provider: String,
    #[serde(default)]
    pub app_token: String,
    #[serde(default)]
    pub user_key: String,
    #[serde(default = "default_push_title")]
    pub title: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            provider: default_push_provider(),
            app_token: String::new(),
            user_key: String::new(),
            title: default_push_title(),
        }
    }
}

fn default_push_provider() -> String {
    "pushover".to_string()
}

fn default_push_title() -> String {
    "Daily digest".to_string()
}

// =============================================================================
// Pipeline data model
// =============================================================================

/// Coarse kind of a calendar feed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Assignment,
    Announcement,
    Other,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Assignment => "assignment",
            EventCategory::Announcement => "announcement",
            EventCategory::Other => "other",
        }
    }
}

/// A parsed calendar feed entry. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub raw_category: EventCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<String>,
}

/// A normalized mailbox message. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailItem {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub url: Option<String>,
    pub body_excerpt: String,
    /// Provider-side "high importance" flag.
    #[serde(default)]
    pub is_important: bool,
}

/// Mutually exclusive mail triage categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageBucket {
    ImmediateAction,
    WeekTodo,
    InfoReference,
    Internship,
    Research,
}

impl TriageBucket {
    pub const ALL: [TriageBucket; 5] = [
        TriageBucket::ImmediateAction,
        TriageBucket::WeekTodo,
        TriageBucket::InfoReference,
        TriageBucket::Internship,
        TriageBucket::Research,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriageBucket::ImmediateAction => "immediate_action",
            TriageBucket::WeekTodo => "week_todo",
            TriageBucket::InfoReference => "info_reference",
            TriageBucket::Internship => "internship",
            TriageBucket::Research => "research",
        }
    }

    /// Parse a canonical bucket label. Unknown labels yield `None`.
    pub fn parse(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace(|c: char| c == '-' || c == ' ', "_");
        TriageBucket::ALL
            .into_iter()
            .find(|bucket| bucket.as_str() == normalized)
    }
}

/// Where a task came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Feed,
    MailExtract,
    LlmMailExtract,
}

/// A consolidated, deduplicated work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub source: TaskSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<String>,
}

impl Task {
    /// Publication time, assuming `due_at - 72h` when the source omitted it.
    pub fn effective_published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
            .or_else(|| self.due_at.map(default_published_at))
    }
}

pub fn default_published_at(due_at: DateTime<Utc>) -> DateTime<Utc> {
    due_at - Duration::hours(DEFAULT_PUBLISH_LEAD_HOURS)
}

/// A degraded path taken during a run. Present in the snapshot so a reader
/// can tell whether the digest is fully trustworthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Degradation {
    /// Feed fetch failed; previously cached events were used.
    StaleFeed { fetched_at: DateTime<Utc>, reason: String },
    /// Feed fetch failed and nothing was cached.
    FeedUnavailable { reason: String },
    MailboxNotConnected,
    MailboxUnavailable { reason: String },
    /// Some items were classified by keyword rules instead of the model.
    FallbackClassifier { items: u32 },
    ClassificationBudgetExhausted { kind: String },
}

/// Immutable digest produced by one run; replaced wholesale by the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestSnapshot {
    pub generated_at: DateTime<Utc>,
    pub date_label: String,
    pub summary_text: String,
    pub tasks: Vec<Task>,
    pub mail_buckets: BTreeMap<TriageBucket, Vec<MailItem>>,
    pub nudges: NudgeSet,
    pub push_style: String,
    pub push_preview: String,
    #[serde(default)]
    pub degradations: Vec<Degradation>,
    #[serde(default)]
    pub classification: ClassificationStats,
}

impl DigestSnapshot {
    pub fn mails_in(&self, bucket: TriageBucket) -> &[MailItem] {
        self.mail_buckets
            .get(&bucket)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.generated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.schedule.time, "07:30");
        assert_eq!(config.feed.refresh_interval_hours, 24);
        assert!(config.feed.require_due_date);
        assert_eq!(config.classifier.cache_ttl_hours, 72);
        assert_eq!(config.classifier.max_mail_calls_per_run, 8);
        assert_eq!(config.nudge.push_window_hours, 48);
        assert_eq!(config.nudge.style, NudgeStyle::Auto);
        assert_eq!(config.tasks.mode, TaskMode::ActionOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_camel_case_fields() {
        let json = r#"{
            "schedule": { "time": "06:45", "timezone": "America/Chicago" },
            "classifier": { "enabled": true, "apiKey": "k", "maxMailCallsPerRun": 3 },
            "snapshotMaxAgeMinutes": 15
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.schedule.hour_minute().unwrap(), (6, 45));
        assert!(config.classifier.is_configured());
        assert_eq!(config.classifier.max_mail_calls_per_run, 3);
        assert_eq!(config.snapshot_max_age(), Duration::minutes(15));
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let mut config = Config::default();
        config.schedule.timezone = "Mars/Olympus".to_string();
        assert!(matches!(config.validate(), Err(DigestError::Configuration(_))));
    }

    #[test]
    fn test_invalid_schedule_time_rejected() {
        let schedule = ScheduleConfig {
            time: "25:00".to_string(),
            ..ScheduleConfig::default()
        };
        assert!(schedule.hour_minute().is_err());
    }

    #[test]
    fn test_bucket_parse() {
        assert_eq!(TriageBucket::parse("week_todo"), Some(TriageBucket::WeekTodo));
        assert_eq!(
            TriageBucket::parse(" Immediate-Action "),
            Some(TriageBucket::ImmediateAction)
        );
        assert_eq!(TriageBucket::parse("whatever"), None);
    }

    #[test]
    fn test_bucket_serializes_snake_case() {
        let json = serde_json::to_string(&TriageBucket::InfoReference).unwrap();
        assert_eq!(json, "\"info_reference\"");
    }

    #[test]
    fn test_effective_published_at_defaults_to_72h_before_due() {
        let due = Utc::now();
        let task = Task {
            id: "t".to_string(),
            title: "t".to_string(),
            due_at: Some(due),
            published_at: None,
            url: None,
            source: TaskSource::Feed,
            course: None,
        };
        assert_eq!(task.effective_published_at(), Some(due - Duration::hours(72)));
    }

    #[test]
    fn test_snapshot_survives_json_round_trip() {
        let now = Utc::now().with_nanosecond(0).unwrap();
        let degradations = vec![
            Degradation::StaleFeed {
                fetched_at: now - Duration::hours(3),
                reason: "timeout".to_string(),
            },
            Degradation::FeedUnavailable {
                reason: "HTTP 500".to_string(),
            },
            Degradation::MailboxNotConnected,
            Degradation::MailboxUnavailable {
                reason: "503".to_string(),
            },
            Degradation::FallbackClassifier { items: 3 },
            Degradation::ClassificationBudgetExhausted {
                kind: "extraction".to_string(),
            },
        ];
        let mail = MailItem {
            id: "m1".to_string(),
            subject: "Quiz 2".to_string(),
            sender: "prof@school.edu".to_string(),
            received_at: now,
            url: None,
            body_excerpt: "Opens Monday.".to_string(),
            is_important: true,
        };
        let snapshot = DigestSnapshot {
            generated_at: now,
            date_label: "2026-03-01".to_string(),
            summary_text: "1 task".to_string(),
            tasks: vec![Task {
                id: "llm-1".to_string(),
                title: "Quiz 2".to_string(),
                due_at: Some(now + Duration::days(1)),
                published_at: Some(now),
                url: None,
                source: TaskSource::LlmMailExtract,
                course: None,
            }],
            mail_buckets: BTreeMap::from([(TriageBucket::WeekTodo, vec![mail])]),
            nudges: crate::nudge::generate_nudges(&[], now, NudgeStyle::Auto, Duration::hours(48)),
            push_style: "auto".to_string(),
            push_preview: "preview".to_string(),
            degradations: degradations.clone(),
            classification: ClassificationStats::default(),
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["degradations"][0]["type"], "stale_feed");
        assert_eq!(json["degradations"][5]["kind"], "extraction");
        assert_eq!(json["tasks"][0]["source"], "llm_mail_extract");

        let restored: DigestSnapshot = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(restored.degradations, degradations);
        assert_eq!(serde_json::to_value(&restored).unwrap(), json);
    }
}
