//! Budgeted, cached classification of mail and calendar entries.
//!
//! Every item goes through one decision ([`select_strategy`]):
//! 1. an unexpired cache hit wins and costs nothing;
//! 2. otherwise the model is used if it is configured and this run still has
//!    budget for the item's kind;
//! 3. otherwise the keyword rules answer.
//!
//! Only model answers are cached, so rule answers are retried against the
//! model on a later run. Model task extraction from course mail follows the
//! same path with its own budget; its rule fallback extracts nothing, since
//! keyword extraction already runs in `mail_tasks`.

pub mod cache;
pub mod model;
pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;

use crate::error::DigestError;
use crate::types::{CalendarEvent, MailItem, TriageBucket};
use crate::util::{collapse_whitespace, truncate_chars, Clock};
use cache::{ClassificationCache, Verdict};
use rules::RuleClassifier;

/// Body characters folded into a mail fingerprint.
const FINGERPRINT_BODY_CHARS: usize = 500;

/// Stable hex digest of `parts`.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

/// Context a mail classifier may use besides the message itself.
#[derive(Debug, Clone, Copy)]
pub struct MailHint {
    pub now: DateTime<Utc>,
    /// Earliest deadline already extracted from this mail.
    pub due_at: Option<DateTime<Utc>>,
}

/// A task the model found in a mail body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedTask {
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
}

/// A classification strategy. `Ok(None)` means an answer was produced but
/// did not map to a known label.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn triage_mail(
        &self,
        item: &MailItem,
        hint: &MailHint,
    ) -> Result<Option<TriageBucket>, DigestError>;

    async fn is_actionable(&self, event: &CalendarEvent) -> Result<Option<bool>, DigestError>;

    /// Concrete tasks with deadlines mentioned in `item`. Strategies that
    /// cannot extract find nothing.
    async fn extract_tasks(
        &self,
        _item: &MailItem,
        _hint: &MailHint,
    ) -> Result<Option<Vec<ExtractedTask>>, DigestError> {
        Ok(Some(Vec::new()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Mail,
    Calendar,
    Extraction,
}

impl BudgetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetKind::Mail => "mail",
            BudgetKind::Calendar => "calendar",
            BudgetKind::Extraction => "extraction",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Allowance {
    limit: u32,
    used: u32,
}

/// Per-run model call allowance, one counter per item kind.
#[derive(Debug)]
pub struct RunBudget {
    mail: Mutex<Allowance>,
    calendar: Mutex<Allowance>,
    extraction: Mutex<Allowance>,
}

fn allowance(limit: u32) -> Mutex<Allowance> {
    Mutex::new(Allowance { limit, used: 0 })
}

impl RunBudget {
    /// Budget with no task extraction allowance.
    pub fn new(mail_limit: u32, calendar_limit: u32) -> Self {
        Self {
            mail: allowance(mail_limit),
            calendar: allowance(calendar_limit),
            extraction: allowance(0),
        }
    }

    pub fn with_extraction_limit(mut self, limit: u32) -> Self {
        self.extraction = allowance(limit);
        self
    }

    fn slot(&self, kind: BudgetKind) -> &Mutex<Allowance> {
        match kind {
            BudgetKind::Mail => &self.mail,
            BudgetKind::Calendar => &self.calendar,
            BudgetKind::Extraction => &self.extraction,
        }
    }

    /// Take one unit if any remain.
    pub fn try_reserve(&self, kind: BudgetKind) -> bool {
        let mut allowance = self.slot(kind).lock();
        if allowance.used < allowance.limit {
            allowance.used += 1;
            true
        } else {
            false
        }
    }

    pub fn used(&self, kind: BudgetKind) -> u32 {
        self.slot(kind).lock().used
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Cache,
    Model,
    Rules,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No model configured; rules are the normal path.
    ModelDisabled,
    BudgetExhausted,
    /// The model call failed in transport or was rejected.
    ModelFailed,
    /// The model answered without a usable label.
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy<V> {
    Cached(V),
    Model,
    Rules(FallbackReason),
}

/// Pick how to classify one item. `reserve` is only invoked when the model
/// would otherwise be used, so a cache hit never spends budget.
pub fn select_strategy<V>(
    cached: Option<V>,
    model_available: bool,
    reserve: impl FnOnce() -> bool,
) -> Strategy<V> {
    if let Some(value) = cached {
        return Strategy::Cached(value);
    }
    if !model_available {
        return Strategy::Rules(FallbackReason::ModelDisabled);
    }
    if reserve() {
        Strategy::Model
    } else {
        Strategy::Rules(FallbackReason::BudgetExhausted)
    }
}

/// Classification result plus how it was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    pub source: ClassificationSource,
    pub fallback: Option<FallbackReason>,
}

impl<T> Outcome<T> {
    fn cached(value: T) -> Self {
        Self {
            value,
            source: ClassificationSource::Cache,
            fallback: None,
        }
    }

    fn model(value: T) -> Self {
        Self {
            value,
            source: ClassificationSource::Model,
            fallback: None,
        }
    }

    fn rules(value: T, reason: FallbackReason) -> Self {
        Self {
            value,
            source: ClassificationSource::Rules,
            fallback: Some(reason),
        }
    }

    /// A budget unit was spent on this item.
    pub fn model_called(&self) -> bool {
        self.source == ClassificationSource::Model
            || matches!(
                self.fallback,
                Some(FallbackReason::ModelFailed) | Some(FallbackReason::Ambiguous)
            )
    }
}

pub type MailOutcome = Outcome<TriageBucket>;
pub type EventOutcome = Outcome<bool>;
pub type ExtractionOutcome = Outcome<Vec<ExtractedTask>>;

/// Per-run counters stored on the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationStats {
    pub cache_hits: u32,
    pub model_calls: u32,
    pub fallbacks: u32,
}

impl ClassificationStats {
    pub fn record<T>(&mut self, outcome: &Outcome<T>) {
        match outcome.source {
            ClassificationSource::Cache => self.cache_hits += 1,
            ClassificationSource::Model => {}
            ClassificationSource::Rules => self.fallbacks += 1,
        }
        if outcome.model_called() {
            self.model_calls += 1;
        }
    }
}

pub struct ClassificationEngine {
    model: Option<Arc<dyn Classifier>>,
    rules: RuleClassifier,
    cache: ClassificationCache,
    version: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ClassificationEngine {
    pub fn new(
        model: Option<Arc<dyn Classifier>>,
        rules: RuleClassifier,
        cache: ClassificationCache,
        version: impl Into<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            model,
            rules,
            cache,
            version: version.into(),
            ttl,
            clock,
        }
    }

    pub fn model_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn mail_key(&self, item: &MailItem) -> String {
        let normalized = format!(
            "{}\n{}\n{}",
            collapse_whitespace(&item.subject).to_lowercase(),
            item.sender.trim().to_lowercase(),
            collapse_whitespace(truncate_chars(&item.body_excerpt, FINGERPRINT_BODY_CHARS))
                .to_lowercase()
        );
        fingerprint(&["mail", &self.version, &normalized])
    }

    /// Extraction answers depend on the whole body, not just its head.
    pub fn extract_key(&self, item: &MailItem) -> String {
        let normalized = format!(
            "{}\n{}\n{}",
            collapse_whitespace(&item.subject).to_lowercase(),
            item.sender.trim().to_lowercase(),
            collapse_whitespace(&item.body_excerpt).to_lowercase()
        );
        fingerprint(&["extract", &self.version, &normalized])
    }

    pub fn event_key(&self, event: &CalendarEvent) -> String {
        let title = collapse_whitespace(&event.title).to_lowercase();
        fingerprint(&["calendar", &self.version, &title, event.raw_category.as_str()])
    }

    fn remember(&self, key: String, verdict: Verdict) {
        let expires_at = self.clock.now() + self.ttl;
        self.cache.insert(key, verdict, expires_at);
    }

    /// Triage one mail into a bucket.
    pub async fn classify_mail(
        &self,
        item: &MailItem,
        hint: &MailHint,
        budget: &RunBudget,
    ) -> MailOutcome {
        let key = self.mail_key(item);
        let cached = self
            .cache
            .get(&key, self.clock.now())
            .and_then(|v| v.bucket());

        let model = match select_strategy(cached, self.model_available(), || {
            budget.try_reserve(BudgetKind::Mail)
        }) {
            Strategy::Cached(bucket) => return Outcome::cached(bucket),
            Strategy::Rules(reason) => return Outcome::rules(self.rules.bucket(item, hint), reason),
            Strategy::Model => match &self.model {
                Some(model) => model,
                None => {
                    return Outcome::rules(
                        self.rules.bucket(item, hint),
                        FallbackReason::ModelDisabled,
                    )
                }
            },
        };

        match model.triage_mail(item, hint).await {
            Ok(answer) => {
                let bucket = answer.unwrap_or_else(|| {
                    log::debug!("Ambiguous triage for '{}'; using info_reference", item.subject);
                    TriageBucket::InfoReference
                });
                self.remember(key, Verdict::Mail { bucket });
                Outcome::model(bucket)
            }
            Err(e) => {
                log::warn!("Model triage failed for '{}': {}", item.subject, e);
                Outcome::rules(self.rules.bucket(item, hint), FallbackReason::ModelFailed)
            }
        }
    }

    /// Decide whether a calendar entry is an actionable task.
    pub async fn classify_calendar_event(
        &self,
        event: &CalendarEvent,
        budget: &RunBudget,
    ) -> EventOutcome {
        let key = self.event_key(event);
        let cached = self
            .cache
            .get(&key, self.clock.now())
            .and_then(|v| v.actionable());

        let model = match select_strategy(cached, self.model_available(), || {
            budget.try_reserve(BudgetKind::Calendar)
        }) {
            Strategy::Cached(actionable) => return Outcome::cached(actionable),
            Strategy::Rules(reason) => return Outcome::rules(self.rules.actionable(event), reason),
            Strategy::Model => match &self.model {
                Some(model) => model,
                None => {
                    return Outcome::rules(
                        self.rules.actionable(event),
                        FallbackReason::ModelDisabled,
                    )
                }
            },
        };

        match model.is_actionable(event).await {
            Ok(Some(actionable)) => {
                self.remember(key, Verdict::Calendar { actionable });
                Outcome::model(actionable)
            }
            Ok(None) => {
                log::debug!("Ambiguous answer for event '{}'; using rules", event.title);
                Outcome::rules(self.rules.actionable(event), FallbackReason::Ambiguous)
            }
            Err(e) => {
                log::warn!("Model check failed for event '{}': {}", event.title, e);
                Outcome::rules(self.rules.actionable(event), FallbackReason::ModelFailed)
            }
        }
    }

    /// Ask the model for tasks in one course mail. Without a model or budget
    /// this finds nothing.
    pub async fn extract_mail_tasks(
        &self,
        item: &MailItem,
        hint: &MailHint,
        budget: &RunBudget,
    ) -> ExtractionOutcome {
        let key = self.extract_key(item);
        let cached = self
            .cache
            .get(&key, self.clock.now())
            .and_then(Verdict::into_tasks);

        let model = match select_strategy(cached, self.model_available(), || {
            budget.try_reserve(BudgetKind::Extraction)
        }) {
            Strategy::Cached(tasks) => return Outcome::cached(tasks),
            Strategy::Rules(reason) => return Outcome::rules(Vec::new(), reason),
            Strategy::Model => match &self.model {
                Some(model) => model,
                None => return Outcome::rules(Vec::new(), FallbackReason::ModelDisabled),
            },
        };

        match model.extract_tasks(item, hint).await {
            Ok(Some(tasks)) => {
                self.remember(key, Verdict::Tasks {
                    tasks: tasks.clone(),
                });
                Outcome::model(tasks)
            }
            Ok(None) => {
                log::debug!("Unreadable task list for '{}'", item.subject);
                Outcome::rules(Vec::new(), FallbackReason::Ambiguous)
            }
            Err(e) => {
                log::warn!("Model task extraction failed for '{}': {}", item.subject, e);
                Outcome::rules(Vec::new(), FallbackReason::ModelFailed)
            }
        }
    }

    /// Extract tasks from many mails concurrently; see
    /// [`Self::classify_mail_batch`].
    pub async fn extract_tasks_batch(
        self: &Arc<Self>,
        items: Vec<(MailItem, MailHint)>,
        budget: Arc<RunBudget>,
    ) -> Vec<ExtractionOutcome> {
        let (unique, slot_of) = dedupe_by_key(items, |(item, _)| self.extract_key(item));

        let mut set = JoinSet::new();
        for (slot, (item, hint)) in unique.iter().cloned().enumerate() {
            let engine = Arc::clone(self);
            let budget = Arc::clone(&budget);
            set.spawn(async move { (slot, engine.extract_mail_tasks(&item, &hint, &budget).await) });
        }
        let results = collect_slots(&mut set, unique.len()).await;

        slot_of
            .into_iter()
            .map(|slot| {
                results[slot]
                    .clone()
                    .unwrap_or_else(|| Outcome::rules(Vec::new(), FallbackReason::ModelFailed))
            })
            .collect()
    }

    /// Classify many mails concurrently. Items with the same fingerprint are
    /// classified once. Output order matches input order.
    pub async fn classify_mail_batch(
        self: &Arc<Self>,
        items: Vec<(MailItem, MailHint)>,
        budget: Arc<RunBudget>,
    ) -> Vec<MailOutcome> {
        let (unique, slot_of) = dedupe_by_key(items, |(item, _)| self.mail_key(item));

        let mut set = JoinSet::new();
        for (slot, (item, hint)) in unique.iter().cloned().enumerate() {
            let engine = Arc::clone(self);
            let budget = Arc::clone(&budget);
            set.spawn(async move { (slot, engine.classify_mail(&item, &hint, &budget).await) });
        }
        let results = collect_slots(&mut set, unique.len()).await;

        slot_of
            .into_iter()
            .map(|slot| match results[slot] {
                Some(outcome) => outcome,
                None => {
                    let (item, hint) = &unique[slot];
                    Outcome::rules(self.rules.bucket(item, hint), FallbackReason::ModelFailed)
                }
            })
            .collect()
    }

    /// Classify many calendar events concurrently; see [`Self::classify_mail_batch`].
    pub async fn classify_event_batch(
        self: &Arc<Self>,
        events: Vec<CalendarEvent>,
        budget: Arc<RunBudget>,
    ) -> Vec<EventOutcome> {
        let (unique, slot_of) = dedupe_by_key(events, |event| self.event_key(event));

        let mut set = JoinSet::new();
        for (slot, event) in unique.iter().cloned().enumerate() {
            let engine = Arc::clone(self);
            let budget = Arc::clone(&budget);
            set.spawn(async move { (slot, engine.classify_calendar_event(&event, &budget).await) });
        }
        let results = collect_slots(&mut set, unique.len()).await;

        slot_of
            .into_iter()
            .map(|slot| match results[slot] {
                Some(outcome) => outcome,
                None => Outcome::rules(
                    self.rules.actionable(&unique[slot]),
                    FallbackReason::ModelFailed,
                ),
            })
            .collect()
    }

    /// Write model answers to disk. Failures are logged, not returned.
    pub fn persist(&self) {
        if let Err(e) = self.cache.save(self.clock.now()) {
            log::warn!("Failed to persist classification cache: {}", e);
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

/// Split `items` into first occurrences per key plus, for every input
/// position, the index of its representative.
fn dedupe_by_key<T>(items: Vec<T>, key_of: impl Fn(&T) -> String) -> (Vec<T>, Vec<usize>) {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut unique = Vec::new();
    let mut slot_of = Vec::with_capacity(items.len());
    for item in items {
        let key = key_of(&item);
        let slot = match slots.get(&key) {
            Some(&slot) => slot,
            None => {
                unique.push(item);
                slots.insert(key, unique.len() - 1);
                unique.len() - 1
            }
        };
        slot_of.push(slot);
    }
    (unique, slot_of)
}

async fn collect_slots<T: Send + 'static>(
    set: &mut JoinSet<(usize, T)>,
    len: usize,
) -> Vec<Option<T>> {
    let mut results: Vec<Option<T>> = (0..len).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((slot, outcome)) => results[slot] = Some(outcome),
            Err(e) => log::warn!("Classification task failed: {}", e),
        }
    }
    results
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted model that counts calls.
    pub struct FakeModel {
        pub calls: AtomicUsize,
        pub bucket: Mutex<Result<Option<TriageBucket>, DigestError>>,
        pub actionable: Mutex<Result<Option<bool>, DigestError>>,
        pub tasks: Mutex<Result<Option<Vec<ExtractedTask>>, DigestError>>,
    }

    impl FakeModel {
        pub fn answering(bucket: TriageBucket) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                bucket: Mutex::new(Ok(Some(bucket))),
                actionable: Mutex::new(Ok(Some(true))),
                tasks: Mutex::new(Ok(Some(Vec::new()))),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Classifier for FakeModel {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn triage_mail(
            &self,
            _item: &MailItem,
            _hint: &MailHint,
        ) -> Result<Option<TriageBucket>, DigestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.bucket.lock().clone()
        }

        async fn is_actionable(&self, _event: &CalendarEvent) -> Result<Option<bool>, DigestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.actionable.lock().clone()
        }

        async fn extract_tasks(
            &self,
            _item: &MailItem,
            _hint: &MailHint,
        ) -> Result<Option<Vec<ExtractedTask>>, DigestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tasks.lock().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeModel;
    use super::*;
    use crate::types::{EventCategory, TaskConfig};
    use crate::util::test_clock::ManualClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn engine(
        model: Option<Arc<FakeModel>>,
        clock: Arc<ManualClock>,
        version: &str,
    ) -> Arc<ClassificationEngine> {
        Arc::new(ClassificationEngine::new(
            model.map(|m| m as Arc<dyn Classifier>),
            RuleClassifier::new(chrono_tz::America::Los_Angeles, &TaskConfig::default()),
            ClassificationCache::in_memory(),
            version,
            Duration::hours(72),
            clock,
        ))
    }

    fn mail(id: &str, subject: &str) -> MailItem {
        MailItem {
            id: id.to_string(),
            subject: subject.to_string(),
            sender: "prof@school.edu".to_string(),
            received_at: t0(),
            url: None,
            body_excerpt: "See attached.".to_string(),
            is_important: false,
        }
    }

    fn hint() -> MailHint {
        MailHint {
            now: t0(),
            due_at: None,
        }
    }

    fn event(title: &str) -> CalendarEvent {
        CalendarEvent {
            id: title.to_string(),
            title: title.to_string(),
            due_at: Some(t0()),
            published_at: None,
            url: None,
            raw_category: EventCategory::Other,
            course: None,
        }
    }

    #[test]
    fn test_select_strategy_order() {
        let mut reserved = false;
        assert_eq!(
            select_strategy(Some(1), true, || {
                reserved = true;
                true
            }),
            Strategy::Cached(1)
        );
        assert!(!reserved);
        assert_eq!(
            select_strategy::<u8>(None, false, || true),
            Strategy::Rules(FallbackReason::ModelDisabled)
        );
        assert_eq!(
            select_strategy::<u8>(None, true, || false),
            Strategy::Rules(FallbackReason::BudgetExhausted)
        );
        assert_eq!(select_strategy::<u8>(None, true, || true), Strategy::Model);
    }

    #[test]
    fn test_budget_never_exceeds_limit() {
        let budget = RunBudget::new(2, 0);
        assert!(budget.try_reserve(BudgetKind::Mail));
        assert!(budget.try_reserve(BudgetKind::Mail));
        assert!(!budget.try_reserve(BudgetKind::Mail));
        assert!(!budget.try_reserve(BudgetKind::Calendar));
        assert_eq!(budget.used(BudgetKind::Mail), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_model_within_ttl() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model.clone()), clock.clone(), "v1");
        let item = mail("m1", "Problem set 4");

        let first = engine
            .classify_mail(&item, &hint(), &RunBudget::new(8, 8))
            .await;
        clock.advance(Duration::hours(71));
        let second = engine
            .classify_mail(&item, &hint(), &RunBudget::new(8, 8))
            .await;

        assert_eq!(first.source, ClassificationSource::Model);
        assert_eq!(second.source, ClassificationSource::Cache);
        assert_eq!(first.value, second.value);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_calls_model_again() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model.clone()), clock.clone(), "v1");
        let item = mail("m1", "Problem set 4");

        engine
            .classify_mail(&item, &hint(), &RunBudget::new(8, 8))
            .await;
        clock.advance(Duration::hours(72));
        let again = engine
            .classify_mail(&item, &hint(), &RunBudget::new(8, 8))
            .await;
        assert_eq!(again.source, ClassificationSource::Model);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_version_bump_invalidates_keys() {
        let clock = Arc::new(ManualClock::new(t0()));
        let item = mail("m1", "Problem set 4");
        let v1 = engine(None, clock.clone(), "v1");
        let v2 = engine(None, clock, "v2");
        assert_ne!(v1.mail_key(&item), v2.mail_key(&item));
    }

    #[tokio::test]
    async fn test_batch_respects_budget() {
        let model = Arc::new(FakeModel::answering(TriageBucket::ImmediateAction));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model.clone()), clock, "v1");
        let items: Vec<(MailItem, MailHint)> = (0..5)
            .map(|i| (mail(&format!("m{}", i), &format!("Subject {}", i)), hint()))
            .collect();

        let budget = Arc::new(RunBudget::new(2, 2));
        let outcomes = engine.classify_mail_batch(items, budget.clone()).await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(model.calls(), 2);
        assert_eq!(budget.used(BudgetKind::Mail), 2);
        let exhausted = outcomes
            .iter()
            .filter(|o| o.fallback == Some(FallbackReason::BudgetExhausted))
            .count();
        assert_eq!(exhausted, 3);
    }

    #[tokio::test]
    async fn test_duplicate_items_share_one_call() {
        let model = Arc::new(FakeModel::answering(TriageBucket::Research));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model.clone()), clock, "v1");
        let items = vec![
            (mail("a", "Lab meeting notes"), hint()),
            (mail("b", "Lab meeting notes"), hint()),
        ];
        let outcomes = engine
            .classify_mail_batch(items, Arc::new(RunBudget::new(8, 8)))
            .await;
        assert_eq!(model.calls(), 1);
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test]
    async fn test_disabled_model_uses_rules() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(None, clock, "v1");
        let outcome = engine
            .classify_mail(
                &mail("m1", "URGENT: sign the form"),
                &hint(),
                &RunBudget::new(8, 8),
            )
            .await;
        assert_eq!(outcome.value, TriageBucket::ImmediateAction);
        assert_eq!(outcome.source, ClassificationSource::Rules);
        assert_eq!(outcome.fallback, Some(FallbackReason::ModelDisabled));
        assert_eq!(engine.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_and_is_not_cached() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        *model.bucket.lock() = Err(DigestError::ClassifierUnavailable("500".to_string()));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model.clone()), clock, "v1");
        let budget = RunBudget::new(8, 8);

        let outcome = engine
            .classify_mail(&mail("m1", "Campus newsletter"), &hint(), &budget)
            .await;
        assert_eq!(outcome.fallback, Some(FallbackReason::ModelFailed));
        assert_eq!(outcome.value, TriageBucket::InfoReference);
        assert!(outcome.model_called());
        assert_eq!(budget.used(BudgetKind::Mail), 1);
        assert_eq!(engine.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_mail_is_info_reference_and_cached() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        *model.bucket.lock() = Ok(None);
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model), clock, "v1");

        let outcome = engine
            .classify_mail(&mail("m1", "Hello"), &hint(), &RunBudget::new(8, 8))
            .await;
        assert_eq!(outcome.value, TriageBucket::InfoReference);
        assert_eq!(outcome.source, ClassificationSource::Model);
        assert_eq!(engine.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_event_uses_rules_uncached() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        *model.actionable.lock() = Ok(None);
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model), clock, "v1");

        let outcome = engine
            .classify_calendar_event(&event("Midterm review"), &RunBudget::new(8, 8))
            .await;
        assert!(outcome.value);
        assert_eq!(outcome.fallback, Some(FallbackReason::Ambiguous));
        assert_eq!(engine.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_event_batch_preserves_order() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(None, clock, "v1");
        let outcomes = engine
            .classify_event_batch(
                vec![event("Club social"), event("Quiz 3"), event("Club social")],
                Arc::new(RunBudget::new(0, 0)),
            )
            .await;
        let values: Vec<bool> = outcomes.iter().map(|o| o.value).collect();
        assert_eq!(values, vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_extracted_tasks_are_cached_and_budgeted() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        let found = vec![ExtractedTask {
            title: "Submit lab report".to_string(),
            due_at: Some(t0() + Duration::days(2)),
        }];
        *model.tasks.lock() = Ok(Some(found.clone()));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model.clone()), clock, "v1");
        let budget = RunBudget::new(0, 0).with_extraction_limit(1);
        let item = mail("m1", "CHEM 101 lab");

        let first = engine.extract_mail_tasks(&item, &hint(), &budget).await;
        assert_eq!(first.value, found);
        assert_eq!(first.source, ClassificationSource::Model);

        let second = engine.extract_mail_tasks(&item, &hint(), &budget).await;
        assert_eq!(second.value, found);
        assert_eq!(second.source, ClassificationSource::Cache);
        assert_eq!(model.calls(), 1);
        assert_eq!(budget.used(BudgetKind::Extraction), 1);
        assert_eq!(budget.used(BudgetKind::Mail), 0);
    }

    #[tokio::test]
    async fn test_extraction_without_allowance_finds_nothing() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        *model.tasks.lock() = Ok(Some(vec![ExtractedTask {
            title: "Quiz".to_string(),
            due_at: None,
        }]));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model.clone()), clock, "v1");

        let outcome = engine
            .extract_mail_tasks(&mail("m1", "CHEM 101"), &hint(), &RunBudget::new(8, 8))
            .await;
        assert!(outcome.value.is_empty());
        assert_eq!(outcome.fallback, Some(FallbackReason::BudgetExhausted));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_extraction_failure_is_not_cached() {
        let model = Arc::new(FakeModel::answering(TriageBucket::WeekTodo));
        *model.tasks.lock() = Err(DigestError::ClassifierUnavailable("503".to_string()));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(Some(model), clock, "v1");
        let budget = RunBudget::new(0, 0).with_extraction_limit(4);

        let outcomes = engine
            .extract_tasks_batch(
                vec![(mail("m1", "CHEM 101"), hint()), (mail("m2", "CHEM 101"), hint())],
                Arc::new(budget),
            )
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.value.is_empty() && o.fallback == Some(FallbackReason::ModelFailed)));
        assert_eq!(engine.cached_entries(), 0);
    }

    #[test]
    fn test_stats_record() {
        let mut stats = ClassificationStats::default();
        stats.record(&Outcome::cached(1));
        stats.record(&Outcome::model(1));
        stats.record(&Outcome::rules(1, FallbackReason::ModelFailed));
        stats.record(&Outcome::rules(1, FallbackReason::BudgetExhausted));
        assert_eq!(
            stats,
            ClassificationStats {
                cache_hits: 1,
                model_calls: 2,
                fallbacks: 2,
            }
        );
    }
}
