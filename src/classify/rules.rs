//! Deterministic keyword/deadline triage, used whenever the model is not.

use async_trait::async_trait;
use chrono::Duration;
use chrono_tz::Tz;

use super::{Classifier, MailHint};
use crate::error::DigestError;
use crate::mail_tasks::DeadlineParser;
use crate::types::{CalendarEvent, EventCategory, MailItem, TaskConfig, TriageBucket};
use crate::util::{contains_any, truncate_chars};

const URGENT_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "final notice",
    "final reminder",
    "action required today",
];

const INTERNSHIP_KEYWORDS: &[&str] = &[
    "internship",
    "intern position",
    "co-op",
    "career fair",
    "recruiting",
    "recruiter",
    "job offer",
    "handshake",
];

const RESEARCH_KEYWORDS: &[&str] = &[
    "research",
    "lab meeting",
    "irb",
    "thesis",
    "manuscript",
    "principal investigator",
];

const IMMEDIATE_WINDOW_HOURS: i64 = 48;
const WEEK_WINDOW_DAYS: i64 = 7;
const BODY_CHARS: usize = 600;

#[derive(Debug, Clone)]
pub struct RuleClassifier {
    parser: DeadlineParser,
    action_keywords: Vec<String>,
    important_keywords: Vec<String>,
    noise_keywords: Vec<String>,
}

impl RuleClassifier {
    pub fn new(tz: Tz, tasks: &TaskConfig) -> Self {
        Self {
            parser: DeadlineParser::new(tz),
            action_keywords: tasks.action_keywords.clone(),
            important_keywords: tasks.important_keywords.clone(),
            noise_keywords: tasks.noise_keywords.clone(),
        }
    }

    pub fn bucket(&self, item: &MailItem, hint: &MailHint) -> TriageBucket {
        let text = format!(
            "{} {}",
            item.subject,
            truncate_chars(&item.body_excerpt, BODY_CHARS)
        );
        let lower = text.to_lowercase();
        let due = hint.due_at.or_else(|| self.parser.parse(&text, hint.now));
        let due_within = |window: Duration| due.map(|d| d <= hint.now + window).unwrap_or(false);

        if due_within(Duration::hours(IMMEDIATE_WINDOW_HOURS)) || contains_any(&lower, URGENT_KEYWORDS)
        {
            return TriageBucket::ImmediateAction;
        }
        if contains_any(&lower, INTERNSHIP_KEYWORDS) {
            return TriageBucket::Internship;
        }
        if contains_any(&lower, RESEARCH_KEYWORDS) {
            return TriageBucket::Research;
        }
        if due_within(Duration::days(WEEK_WINDOW_DAYS))
            || item.is_important
            || contains_any(&lower, &self.action_keywords)
            || contains_any(&lower, &self.important_keywords)
        {
            return TriageBucket::WeekTodo;
        }
        TriageBucket::InfoReference
    }

    pub fn actionable(&self, event: &CalendarEvent) -> bool {
        match event.raw_category {
            EventCategory::Assignment => true,
            EventCategory::Announcement => false,
            EventCategory::Other => {
                let title = event.title.to_lowercase();
                contains_any(&title, &self.action_keywords)
                    && !contains_any(&title, &self.noise_keywords)
            }
        }
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn triage_mail(
        &self,
        item: &MailItem,
        hint: &MailHint,
    ) -> Result<Option<TriageBucket>, DigestError> {
        Ok(Some(self.bucket(item, hint)))
    }

    async fn is_actionable(&self, event: &CalendarEvent) -> Result<Option<bool>, DigestError> {
        Ok(Some(self.actionable(event)))
    }
}
