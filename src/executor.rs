//! Digest run execution
//!
//! `DigestOrchestrator` owns the current snapshot and drives one run:
//! 1. Calendar feed and mailbox, fetched concurrently
//! 2. Mail task extraction and classification (budgeted, cached)
//! 3. Task consolidation and nudges
//! 4. Snapshot swap, then an optional push
//!
//! One run executes at a time. A trigger that arrives while a run is in
//! flight waits for it and receives that run's result instead of starting
//! another run. A joining trigger that wants a push gets one only if the
//! finished run did not already push.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::calendar_feed::FeedCacheManager;
use crate::classify::{
    BudgetKind, ClassificationEngine, ClassificationStats, FallbackReason, MailHint, Outcome,
    RunBudget,
};
use crate::consolidate::{consolidate, TaskPolicy};
use crate::error::DigestError;
use crate::mail_tasks::{earliest_due, MailTaskExtractor};
use crate::mailbox::MailboxNormalizer;
use crate::notification::NotificationChannel;
use crate::nudge::{generate_nudges, to_push_text, NudgeStyle, PushInput};
use crate::scheduler::SchedulerMessage;
use crate::types::{Config, Degradation, DigestSnapshot, MailItem, Task, TriageBucket};
use crate::util::{contains_any, truncate_chars, Clock};

const IMPORTANT_SCAN_CHARS: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Ready,
    Failed,
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTrigger {
    Scheduled,
    /// Scheduled time passed while the machine slept
    Missed,
    Manual,
    Refresh,
    /// Plain read found no snapshot or an old one
    Stale,
}

impl ExecutionTrigger {
    /// Explicit triggers bypass the feed cache TTL.
    fn forces_feed(&self) -> bool {
        matches!(self, ExecutionTrigger::Manual | ExecutionTrigger::Refresh)
    }
}

/// Result of a run, shared with every caller coalesced into it.
#[derive(Debug, Clone)]
pub struct RunNowResult {
    pub generated_at: Option<DateTime<Utc>>,
    pub pushed: bool,
    pub push_error: Option<String>,
    /// Set when the run failed; the previous snapshot is still served.
    pub error: Option<DigestError>,
    pub coalesced: bool,
}

/// Per-run settings derived from `Config`.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub tz: Tz,
    pub mail_lookback: Duration,
    pub snapshot_max_age: Duration,
    pub mail_extraction: bool,
    pub llm_extraction: bool,
    pub lookahead_days: i64,
    pub important_keywords: Vec<String>,
    pub max_mail_calls: u32,
    pub max_calendar_calls: u32,
    pub max_extract_calls: u32,
    pub nudge_style: NudgeStyle,
    pub push_window: Duration,
    pub push_title: String,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Result<Self, DigestError> {
        Ok(Self {
            tz: config.schedule.tz()?,
            mail_lookback: Duration::hours(config.mailbox.lookback_hours.max(1)),
            snapshot_max_age: config.snapshot_max_age(),
            mail_extraction: config.tasks.mail_extraction,
            llm_extraction: config.tasks.llm_extraction,
            lookahead_days: config.tasks.lookahead_days,
            important_keywords: config.tasks.important_keywords.clone(),
            max_mail_calls: config.classifier.max_mail_calls_per_run,
            max_calendar_calls: config.classifier.max_calendar_calls_per_run,
            max_extract_calls: config.classifier.max_extract_mails_per_run,
            nudge_style: config.nudge.style,
            push_window: Duration::hours(config.nudge.push_window_hours.max(1)),
            push_title: config.push.title.clone(),
        })
    }
}

/// Services a run is built from.
pub struct Pipeline {
    pub feed: FeedCacheManager,
    pub mailbox: MailboxNormalizer,
    pub engine: Arc<ClassificationEngine>,
    pub extractor: MailTaskExtractor,
    pub policy: TaskPolicy,
    pub channel: Arc<dyn NotificationChannel>,
}

pub struct DigestOrchestrator {
    settings: RunSettings,
    pipeline: Pipeline,
    clock: Arc<dyn Clock>,
    snapshot: RwLock<Option<Arc<DigestSnapshot>>>,
    phase: RwLock<RunPhase>,
    run_lock: tokio::sync::Mutex<()>,
    completed_runs: AtomicU64,
    last_result: Mutex<Option<RunNowResult>>,
}

impl DigestOrchestrator {
    pub fn new(settings: RunSettings, pipeline: Pipeline, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            pipeline,
            clock,
            snapshot: RwLock::new(None),
            phase: RwLock::new(RunPhase::Idle),
            run_lock: tokio::sync::Mutex::new(()),
            completed_runs: AtomicU64::new(0),
            last_result: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.read()
    }

    pub fn current(&self) -> Option<Arc<DigestSnapshot>> {
        self.snapshot.read().clone()
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::SeqCst)
    }

    pub fn mailbox(&self) -> &MailboxNormalizer {
        &self.pipeline.mailbox
    }

    /// Error of the most recent run, if it failed.
    pub fn last_error(&self) -> Option<DigestError> {
        self.last_result
            .lock()
            .as_ref()
            .and_then(|result| result.error.clone())
    }

    /// Snapshot young enough to serve without a run.
    fn fresh_snapshot(&self) -> Option<Arc<DigestSnapshot>> {
        let snapshot = self.current()?;
        let age = snapshot.age(self.clock.now());
        (age < self.settings.snapshot_max_age).then_some(snapshot)
    }

    /// Current digest. Without `force_refresh` a fresh snapshot is returned
    /// as is; otherwise a run is started (or joined).
    ///
    /// A failed run still returns the previous snapshot when one exists;
    /// [`Self::last_error`] then reports why it was not replaced.
    pub async fn get_digest(&self, force_refresh: bool) -> Result<Arc<DigestSnapshot>, DigestError> {
        if !force_refresh {
            if let Some(snapshot) = self.fresh_snapshot() {
                return Ok(snapshot);
            }
        }

        let trigger = if force_refresh {
            ExecutionTrigger::Refresh
        } else {
            ExecutionTrigger::Stale
        };
        let result = self.run(trigger, false).await;

        match (result.error, self.current()) {
            (None, Some(snapshot)) => Ok(snapshot),
            (Some(e), Some(previous)) => {
                log::warn!(
                    "Serving previous digest from {} after failed run: {}",
                    previous.generated_at,
                    e
                );
                Ok(previous)
            }
            (Some(e), None) => Err(e),
            (None, None) => Err(DigestError::SnapshotGenerationFailed(
                "run finished without a snapshot".to_string(),
            )),
        }
    }

    /// Run now and push the result.
    pub async fn run_now(&self) -> RunNowResult {
        self.run(ExecutionTrigger::Manual, true).await
    }

    /// Run for `trigger`, pushing when `push` is set. Coalesces with a run
    /// already in flight.
    pub async fn run(&self, trigger: ExecutionTrigger, push: bool) -> RunNowResult {
        let ticket = self.completed_runs.load(Ordering::SeqCst);
        let _guard = self.run_lock.lock().await;

        if self.completed_runs.load(Ordering::SeqCst) != ticket {
            let last = self.last_result.lock().clone();
            if let Some(last) = last {
                log::info!("Trigger {:?} joined the run that just finished", trigger);
                let unpushed = last.error.is_none() && !last.pushed && last.push_error.is_none();
                let result = match self.current() {
                    Some(snapshot) if push && unpushed => {
                        let (pushed, push_error) = self.push_snapshot(&snapshot).await;
                        let result = RunNowResult {
                            pushed,
                            push_error,
                            ..last
                        };
                        *self.last_result.lock() = Some(result.clone());
                        result
                    }
                    _ => last,
                };
                return RunNowResult {
                    coalesced: true,
                    ..result
                };
            }
        }

        *self.phase.write() = RunPhase::Running;
        log::info!("Digest run started (trigger: {:?})", trigger);

        let result = match self.build_snapshot(trigger.forces_feed()).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.snapshot.write() = Some(Arc::clone(&snapshot));
                *self.phase.write() = RunPhase::Ready;

                let (pushed, push_error) = if push {
                    self.push_snapshot(&snapshot).await
                } else {
                    (false, None)
                };

                RunNowResult {
                    generated_at: Some(snapshot.generated_at),
                    pushed,
                    push_error,
                    error: None,
                    coalesced: false,
                }
            }
            Err(e) => {
                log::error!("Digest run failed: {}", e);
                *self.phase.write() = RunPhase::Failed;
                RunNowResult {
                    generated_at: None,
                    pushed: false,
                    push_error: None,
                    error: Some(e),
                    coalesced: false,
                }
            }
        };

        *self.last_result.lock() = Some(result.clone());
        self.completed_runs.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn push_snapshot(&self, snapshot: &DigestSnapshot) -> (bool, Option<String>) {
        let outcome = self
            .pipeline
            .channel
            .send(&self.settings.push_title, &snapshot.push_preview)
            .await;
        (outcome.delivered, outcome.error)
    }

    async fn build_snapshot(&self, force_feed: bool) -> Result<DigestSnapshot, DigestError> {
        let now = self.clock.now();
        let since = now - self.settings.mail_lookback;
        let mut degradations = Vec::new();

        let (feed, mail) = tokio::join!(
            self.pipeline.feed.get_events(now, force_feed),
            self.pipeline.mailbox.list_recent_mail(since)
        );

        let feed_unusable = feed.warning.is_some() && !feed.stale;
        if let Some(warning) = &feed.warning {
            degradations.push(if feed.stale {
                Degradation::StaleFeed {
                    fetched_at: feed.fetched_at.unwrap_or(now),
                    reason: warning.to_string(),
                }
            } else {
                Degradation::FeedUnavailable {
                    reason: warning.to_string(),
                }
            });
        }

        let mails = match mail {
            Ok(items) => items,
            Err(DigestError::AuthRequired) => {
                degradations.push(Degradation::MailboxNotConnected);
                Vec::new()
            }
            Err(e) => {
                if feed_unusable {
                    return Err(DigestError::SnapshotGenerationFailed(format!(
                        "calendar feed and mailbox both unavailable ({})",
                        e
                    )));
                }
                degradations.push(Degradation::MailboxUnavailable {
                    reason: e.to_string(),
                });
                Vec::new()
            }
        };

        // Extraction first: extracted deadlines feed the triage hints.
        let mail_tasks: Vec<Vec<Task>> = mails
            .iter()
            .map(|mail| {
                if self.settings.mail_extraction {
                    self.pipeline.extractor.extract(mail, now)
                } else {
                    Vec::new()
                }
            })
            .collect();
        let hinted: Vec<(MailItem, MailHint)> = mails
            .iter()
            .zip(&mail_tasks)
            .map(|(mail, tasks)| {
                let hint = MailHint {
                    now,
                    due_at: earliest_due(tasks),
                };
                (mail.clone(), hint)
            })
            .collect();

        let engine = &self.pipeline.engine;
        // Course mail goes to the model for tasks the keyword rules miss.
        let candidates: Vec<(MailItem, MailHint)> =
            if self.settings.llm_extraction && engine.model_available() {
                hinted
                    .iter()
                    .filter(|(mail, _)| self.pipeline.extractor.is_extraction_candidate(mail))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
        let candidate_mails: Vec<MailItem> =
            candidates.iter().map(|(mail, _)| mail.clone()).collect();

        let budget = Arc::new(
            RunBudget::new(
                self.settings.max_mail_calls,
                self.settings.max_calendar_calls,
            )
            .with_extraction_limit(self.settings.max_extract_calls),
        );
        let (mail_outcomes, event_outcomes, extraction_outcomes) = tokio::join!(
            engine.classify_mail_batch(hinted, Arc::clone(&budget)),
            engine.classify_event_batch(feed.events.clone(), Arc::clone(&budget)),
            engine.extract_tasks_batch(candidates, Arc::clone(&budget))
        );
        engine.persist();

        let mut stats = ClassificationStats::default();
        mail_outcomes.iter().for_each(|o| stats.record(o));
        event_outcomes.iter().for_each(|o| stats.record(o));
        extraction_outcomes.iter().for_each(|o| stats.record(o));
        let model_failures = count_fallbacks(&mail_outcomes, FallbackReason::ModelFailed)
            + count_fallbacks(&event_outcomes, FallbackReason::ModelFailed)
            + count_fallbacks(&extraction_outcomes, FallbackReason::ModelFailed);
        if model_failures > 0 {
            degradations.push(Degradation::FallbackClassifier {
                items: model_failures,
            });
        }
        for (kind, exhausted) in [
            (
                BudgetKind::Mail,
                count_fallbacks(&mail_outcomes, FallbackReason::BudgetExhausted),
            ),
            (
                BudgetKind::Calendar,
                count_fallbacks(&event_outcomes, FallbackReason::BudgetExhausted),
            ),
            (
                BudgetKind::Extraction,
                count_fallbacks(&extraction_outcomes, FallbackReason::BudgetExhausted),
            ),
        ] {
            if exhausted > 0 {
                degradations.push(Degradation::ClassificationBudgetExhausted {
                    kind: kind.as_str().to_string(),
                });
            }
        }

        let actionable: Vec<_> = feed
            .events
            .iter()
            .zip(&event_outcomes)
            .filter(|(_, outcome)| outcome.value)
            .map(|(event, _)| event.clone())
            .collect();
        let model_tasks = candidate_mails
            .iter()
            .zip(extraction_outcomes)
            .flat_map(|(mail, outcome)| self.pipeline.extractor.model_tasks(mail, outcome.value));
        let tasks = consolidate(
            &actionable,
            mail_tasks.into_iter().flatten().chain(model_tasks).collect(),
            &self.pipeline.policy,
            now,
        );

        let mut mail_buckets: BTreeMap<TriageBucket, Vec<MailItem>> = TriageBucket::ALL
            .into_iter()
            .map(|bucket| (bucket, Vec::new()))
            .collect();
        for (mail, outcome) in mails.iter().zip(&mail_outcomes) {
            mail_buckets
                .entry(outcome.value)
                .or_default()
                .push(mail.clone());
        }
        for list in mail_buckets.values_mut() {
            list.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        }

        let important: Vec<MailItem> = mails
            .iter()
            .filter(|m| self.is_important(m))
            .cloned()
            .collect();

        let immediate = mail_buckets
            .get(&TriageBucket::ImmediateAction)
            .map(Vec::len)
            .unwrap_or(0);
        let weekly = mail_buckets
            .get(&TriageBucket::WeekTodo)
            .map(Vec::len)
            .unwrap_or(0);
        let summary_text = format!(
            "{} tasks due in the next {} days; {} mails need action now, {} this week.",
            tasks.len(),
            self.settings.lookahead_days,
            immediate,
            weekly
        );

        let style = self.settings.nudge_style;
        let nudges = generate_nudges(&tasks, now, style, self.settings.push_window);
        let push_style = nudges.style_label(style);
        let immediate_mails = mail_buckets
            .get(&TriageBucket::ImmediateAction)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let push_preview = to_push_text(&PushInput {
            summary: &summary_text,
            tasks: &tasks,
            immediate_mails,
            important_mails: &important,
            nudges: &nudges,
            style_label: &push_style,
            now,
            window: self.settings.push_window,
            tz: self.settings.tz,
        });

        // Strictly increasing even when the clock has not moved.
        let generated_at = match self.current() {
            Some(previous) if now <= previous.generated_at => {
                previous.generated_at + Duration::milliseconds(1)
            }
            _ => now,
        };

        for degradation in &degradations {
            log::warn!("Degraded digest: {:?}", degradation);
        }
        log::info!(
            "Digest ready: {} tasks, {} mails, {} cache hits, {} model calls, {} fallbacks",
            tasks.len(),
            mails.len(),
            stats.cache_hits,
            stats.model_calls,
            stats.fallbacks
        );

        Ok(DigestSnapshot {
            generated_at,
            date_label: generated_at
                .with_timezone(&self.settings.tz)
                .format("%Y-%m-%d")
                .to_string(),
            summary_text,
            tasks,
            mail_buckets,
            nudges,
            push_style,
            push_preview,
            degradations,
            classification: stats,
        })
    }

    fn is_important(&self, mail: &MailItem) -> bool {
        if mail.is_important {
            return true;
        }
        let text = format!(
            "{} {}",
            mail.subject,
            truncate_chars(&mail.body_excerpt, IMPORTANT_SCAN_CHARS)
        )
        .to_lowercase();
        contains_any(&text, &self.settings.important_keywords)
    }
}

fn count_fallbacks<T>(outcomes: &[Outcome<T>], reason: FallbackReason) -> u32 {
    outcomes
        .iter()
        .filter(|o| o.fallback == Some(reason))
        .count() as u32
}

/// Executes runs requested by the scheduler.
pub struct Executor {
    orchestrator: Arc<DigestOrchestrator>,
}

impl Executor {
    pub fn new(orchestrator: Arc<DigestOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Listen for scheduler messages until the sender is dropped.
    pub async fn run(&self, mut receiver: mpsc::Receiver<SchedulerMessage>) {
        while let Some(msg) = receiver.recv().await {
            log::info!("Executing scheduled digest (trigger: {:?})", msg.trigger);
            let result = self.orchestrator.run(msg.trigger, true).await;
            match (&result.error, &result.push_error) {
                (Some(e), _) => log::error!("Scheduled digest failed: {}", e),
                (None, Some(e)) => log::warn!("Scheduled digest ready but push failed: {}", e),
                (None, None) if result.pushed => log::info!(
                    "Scheduled digest delivered (generated at {:?})",
                    result.generated_at
                ),
                (None, None) => log::warn!(
                    "Scheduled digest ready but not pushed (generated at {:?})",
                    result.generated_at
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar_feed::testing::{ics_with, FakeFeedSource};
    use crate::calendar_feed::FeedSource;
    use crate::classify::cache::ClassificationCache;
    use crate::classify::rules::RuleClassifier;
    use crate::classify::testing::FakeModel;
    use crate::classify::{Classifier, ExtractedTask};
    use crate::mailbox::testing::{raw, FakeIdentity, FakeMailProvider};
    use crate::notification::testing::RecordingChannel;
    use crate::types::{FeedConfig, TaskConfig, TaskSource};
    use crate::util::test_clock::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;

    /// Feed source that yields to the scheduler before answering, so
    /// concurrent triggers actually overlap.
    struct SlowFeed(Arc<FakeFeedSource>);

    #[async_trait]
    impl FeedSource for SlowFeed {
        async fn fetch(&self) -> Result<String, DigestError> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.fetch().await
        }
    }

    struct Harness {
        orchestrator: DigestOrchestrator,
        feed: Arc<FakeFeedSource>,
        mail: Arc<FakeMailProvider>,
        channel: Arc<RecordingChannel>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn harness(connected: bool) -> Harness {
        harness_with(connected, None)
    }

    fn harness_with(connected: bool, model: Option<Arc<FakeModel>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let tz = chrono_tz::America::Los_Angeles;
        let config = Config::default();

        let feed = Arc::new(FakeFeedSource::ok(&ics_with(&[
            ("event-assignment-42", "Essay 2", "20260301T200000Z"),
            ("event-assignment-43", "Problem set 5", "20260304T070000Z"),
        ])));
        let mail = Arc::new(FakeMailProvider::with(vec![
            raw("m1", "URGENT: lab safety form", t0() - Duration::hours(1), "Sign it."),
            raw("m2", "Campus newsletter", t0() - Duration::hours(2), "Events."),
        ]));
        let channel = Arc::new(RecordingChannel::default());

        let engine = Arc::new(ClassificationEngine::new(
            model.map(|m| m as Arc<dyn Classifier>),
            RuleClassifier::new(tz, &TaskConfig::default()),
            ClassificationCache::in_memory(),
            "v1",
            Duration::hours(72),
            clock.clone(),
        ));
        let pipeline = Pipeline {
            feed: FeedCacheManager::new(
                Arc::new(SlowFeed(feed.clone())),
                dir.path().to_path_buf(),
                &FeedConfig::default(),
                tz,
            ),
            mailbox: MailboxNormalizer::new(
                Arc::new(FakeIdentity { connected }),
                mail.clone(),
                20,
                clock.clone(),
            ),
            engine,
            extractor: MailTaskExtractor::new(tz, &config.tasks, &config.feed),
            policy: TaskPolicy::from_config(&config.feed, &config.tasks),
            channel: channel.clone(),
        };
        let mut settings = RunSettings::from_config(&config).unwrap();
        settings.tz = tz;

        Harness {
            orchestrator: DigestOrchestrator::new(settings, pipeline, clock.clone()),
            feed,
            mail,
            channel,
            clock,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_concurrent_run_now_coalesces_into_one_run() {
        let h = harness(true);
        let (a, b) = tokio::join!(h.orchestrator.run_now(), h.orchestrator.run_now());

        assert_eq!(h.orchestrator.completed_runs(), 1);
        assert_eq!(h.channel.count(), 1);
        assert_eq!(h.feed.calls(), 1);
        assert!(a.coalesced != b.coalesced);
        assert_eq!(a.generated_at, b.generated_at);
        assert!(a.pushed && b.pushed);
    }

    #[tokio::test]
    async fn test_fresh_snapshot_served_without_rerun() {
        let h = harness(true);
        let first = h.orchestrator.get_digest(false).await.unwrap();
        h.clock.advance(Duration::minutes(30));
        let second = h.orchestrator.get_digest(false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.orchestrator.completed_runs(), 1);

        h.clock.advance(Duration::minutes(31));
        h.orchestrator.get_digest(false).await.unwrap();
        assert_eq!(h.orchestrator.completed_runs(), 2);
    }

    #[tokio::test]
    async fn test_forced_refresh_advances_generated_at() {
        let h = harness(true);
        let first = h.orchestrator.get_digest(false).await.unwrap();
        let forced = h.orchestrator.get_digest(true).await.unwrap();
        assert!(forced.generated_at > first.generated_at);
        assert_eq!(h.feed.calls(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_contents() {
        let h = harness(true);
        let snapshot = h.orchestrator.get_digest(false).await.unwrap();

        assert_eq!(snapshot.date_label, "2026-03-01");
        let ids: Vec<&str> = snapshot.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["event-assignment-42", "event-assignment-43"]);
        assert_eq!(snapshot.mail_buckets.len(), 5);
        assert_eq!(snapshot.mails_in(TriageBucket::ImmediateAction)[0].id, "m1");
        assert_eq!(snapshot.mails_in(TriageBucket::InfoReference)[0].id, "m2");
        assert_eq!(
            snapshot.nudges.target.as_ref().map(|t| t.task_id.as_str()),
            Some("event-assignment-42")
        );
        assert!(snapshot.push_preview.contains("Essay 2"));
        assert!(!snapshot.is_degraded());
        assert_eq!(snapshot.classification.fallbacks, 4);
    }

    #[tokio::test]
    async fn test_mailbox_not_connected_degrades_without_failing() {
        let h = harness(false);
        let snapshot = h.orchestrator.get_digest(false).await.unwrap();
        assert_eq!(h.mail.calls(), 0);
        assert_eq!(snapshot.degradations, vec![Degradation::MailboxNotConnected]);
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(h.orchestrator.phase(), RunPhase::Ready);
    }

    #[tokio::test]
    async fn test_feed_failure_serves_cached_events_as_stale() {
        let h = harness(true);
        h.orchestrator.get_digest(false).await.unwrap();
        h.feed.set(Err(DigestError::ProviderUnavailable("timeout".to_string())));

        let snapshot = h.orchestrator.get_digest(true).await.unwrap();
        assert_eq!(snapshot.tasks.len(), 2);
        assert!(matches!(
            snapshot.degradations.as_slice(),
            [Degradation::StaleFeed { .. }]
        ));
    }

    #[tokio::test]
    async fn test_failed_run_keeps_previous_snapshot() {
        let h = harness(true);
        h.feed.set(Err(DigestError::ProviderUnavailable("down".to_string())));
        let first = h.orchestrator.get_digest(false).await.unwrap();
        assert!(matches!(
            first.degradations.as_slice(),
            [Degradation::FeedUnavailable { .. }]
        ));

        *h.mail.response.lock() = Err(DigestError::ProviderUnavailable("503".to_string()));
        let result = h.orchestrator.run_now().await;
        assert!(matches!(
            result.error,
            Some(DigestError::SnapshotGenerationFailed(_))
        ));
        assert!(!result.pushed);
        assert_eq!(h.channel.count(), 0);
        assert_eq!(h.orchestrator.phase(), RunPhase::Failed);

        let served = h.orchestrator.get_digest(true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &served));
    }

    #[tokio::test]
    async fn test_push_failure_does_not_block_snapshot() {
        let h = harness(true);
        *h.channel.fail_with.lock() = Some("HTTP 500".to_string());
        let result = h.orchestrator.run_now().await;
        assert!(!result.pushed);
        assert_eq!(result.push_error.as_deref(), Some("HTTP 500"));
        assert!(result.error.is_none());
        assert_eq!(h.orchestrator.phase(), RunPhase::Ready);
        assert_eq!(
            h.orchestrator.current().map(|s| s.generated_at),
            result.generated_at
        );
    }

    #[tokio::test]
    async fn test_run_now_joining_a_read_still_pushes_once() {
        let h = harness(true);
        let (read, pushed) = tokio::join!(
            h.orchestrator.get_digest(false),
            async {
                tokio::task::yield_now().await;
                h.orchestrator.run_now().await
            }
        );
        read.unwrap();

        assert_eq!(h.orchestrator.completed_runs(), 1);
        assert!(pushed.coalesced);
        assert!(pushed.pushed);
        assert_eq!(h.channel.count(), 1);

        let again = h.orchestrator.run_now().await;
        assert!(!again.coalesced);
        assert_eq!(h.channel.count(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_reported_alongside_previous_snapshot() {
        let h = harness(true);
        h.feed.set(Err(DigestError::ProviderUnavailable("down".to_string())));
        h.orchestrator.get_digest(false).await.unwrap();
        assert!(h.orchestrator.last_error().is_none());

        *h.mail.response.lock() = Err(DigestError::ProviderUnavailable("503".to_string()));
        h.clock.advance(Duration::hours(2));
        let served = h.orchestrator.get_digest(false).await.unwrap();
        assert_eq!(served.generated_at, t0());
        assert!(matches!(
            h.orchestrator.last_error(),
            Some(DigestError::SnapshotGenerationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_model_extracted_tasks_join_the_digest() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        *model.tasks.lock() = Ok(Some(vec![ExtractedTask {
            title: "Lab safety quiz".to_string(),
            due_at: Some(t0() + Duration::days(1)),
        }]));
        let h = harness_with(true, Some(model));
        let snapshot = h.orchestrator.get_digest(false).await.unwrap();

        let extracted: Vec<&Task> = snapshot
            .tasks
            .iter()
            .filter(|t| t.source == TaskSource::LlmMailExtract)
            .collect();
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].title, "Lab safety quiz");
        assert!(!snapshot.is_degraded());
    }

    #[tokio::test]
    async fn test_extraction_without_allowance_is_reported() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        let mut h = harness_with(true, Some(model));
        h.orchestrator.settings.max_extract_calls = 0;
        let snapshot = h.orchestrator.get_digest(false).await.unwrap();
        assert!(snapshot
            .degradations
            .contains(&Degradation::ClassificationBudgetExhausted {
                kind: "extraction".to_string()
            }));
        assert!(snapshot
            .tasks
            .iter()
            .all(|t| t.source != TaskSource::LlmMailExtract));
    }
}
