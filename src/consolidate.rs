//! Task consolidation
//!
//! Merges calendar-derived tasks with tasks extracted from mail into one
//! ordered, deduplicated list. Calendar records are merged first, so when the
//! same assignment arrives from both sources the calendar copy survives.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::types::{CalendarEvent, FeedConfig, Task, TaskConfig, TaskSource};
use crate::util::contains_any;

/// Digest-style titles that summarize other tasks rather than being one.
const GENERIC_TITLES: &[&str] = &[
    "recent canvas notifications",
    "this week's deadlines",
    "weekly deadlines",
    "canvas announcement",
    "course announcement",
    "check out upcoming deadlines",
];

/// Filtering rules applied while merging.
#[derive(Debug, Clone)]
pub struct TaskPolicy {
    pub require_due: bool,
    /// Noise keywords are only applied when mail extraction is on.
    pub noise_keywords: Vec<String>,
    pub lookahead: Duration,
}

impl TaskPolicy {
    pub fn from_config(feed: &FeedConfig, tasks: &TaskConfig) -> Self {
        Self {
            require_due: feed.require_due_date,
            noise_keywords: if tasks.mail_extraction {
                tasks.noise_keywords.clone()
            } else {
                Vec::new()
            },
            lookahead: Duration::days(tasks.lookahead_days),
        }
    }

    fn admits(&self, task: &Task, now: DateTime<Utc>) -> bool {
        let title = task.title.to_lowercase();
        if is_generic_title(&title) || contains_any(&title, &self.noise_keywords) {
            return false;
        }
        match task.due_at {
            Some(due) => due <= now + self.lookahead,
            None => !self.require_due,
        }
    }
}

impl From<&CalendarEvent> for Task {
    fn from(event: &CalendarEvent) -> Self {
        Task {
            id: event.id.clone(),
            title: event.title.clone(),
            due_at: event.due_at,
            published_at: event.published_at,
            url: event.url.clone(),
            source: TaskSource::Feed,
            course: event.course.clone(),
        }
    }
}

fn is_generic_title(title_lower: &str) -> bool {
    let t = title_lower.trim();
    GENERIC_TITLES.iter().any(|p| t.contains(p))
}

fn access_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"access code.*$").expect("static regex"))
}

fn parenthetical_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*\)").expect("static regex"))
}

/// Lowercased title with parentheticals, access-code tails and punctuation
/// removed, so "HW 3 (Ch. 4)" and "hw 3" compare equal.
pub fn normalize_title(title: &str) -> String {
    let lower = title.to_lowercase();
    let stripped = access_code_re().replace(&lower, " ");
    let stripped = parenthetical_re().replace_all(&stripped, " ");
    let alnum: String = stripped
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    alnum.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized title plus due time to the minute.
pub fn logical_key(task: &Task) -> String {
    let due = task
        .due_at
        .map(|d| d.format("%Y-%m-%dT%H:%M").to_string())
        .unwrap_or_else(|| "none".to_string());
    format!("{}|{}", normalize_title(&task.title), due)
}

/// Due ascending, undated last, ties by id.
pub fn task_order(a: &Task, b: &Task) -> Ordering {
    match (a.due_at, b.due_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

/// Merge actionable calendar events with mail-extracted tasks.
pub fn consolidate(
    events: &[CalendarEvent],
    mail_tasks: Vec<Task>,
    policy: &TaskPolicy,
    now: DateTime<Utc>,
) -> Vec<Task> {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_keys: HashSet<String> = HashSet::new();
    let mut merged: Vec<Task> = Vec::new();

    let candidates = events.iter().map(Task::from).chain(mail_tasks);
    for task in candidates {
        if !policy.admits(&task, now) {
            continue;
        }
        let key = logical_key(&task);
        if seen_ids.contains(&task.id) || seen_keys.contains(&key) {
            log::debug!("Dropping duplicate task '{}' ({:?})", task.title, task.source);
            continue;
        }
        seen_ids.insert(task.id.clone());
        seen_keys.insert(key);
        merged.push(task);
    }

    merged.sort_by(task_order);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventCategory;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 25, 9, 0, 0).unwrap()
    }

    fn lenient() -> TaskPolicy {
        TaskPolicy {
            require_due: false,
            noise_keywords: TaskConfig::default().noise_keywords,
            lookahead: Duration::days(7),
        }
    }

    fn event(id: &str, title: &str, due_at: Option<DateTime<Utc>>) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            title: title.to_string(),
            due_at,
            published_at: None,
            url: Some(format!("https://canvas.example.edu/{}", id)),
            raw_category: EventCategory::Assignment,
            course: None,
        }
    }

    fn mail_task(id: &str, title: &str, due_at: Option<DateTime<Utc>>) -> Task {
        Task {
            id: id.to_string(),
            title: title.to_string(),
            due_at,
            published_at: Some(now()),
            url: None,
            source: TaskSource::MailExtract,
            course: None,
        }
    }

    #[test]
    fn test_sorted_by_due_with_undated_last() {
        let events = vec![
            event("A", "Essay draft", Some(now() + Duration::hours(2))),
            event("B", "Reading log", None),
            event("C", "Quiz 2", Some(now() + Duration::hours(1))),
        ];
        let ids: Vec<String> = consolidate(&events, vec![], &lenient(), now())
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_same_assignment_from_both_sources_keeps_calendar() {
        let due = now() + Duration::hours(20);
        let events = vec![event("cal-1", "HW 3 (Chapter 4)", Some(due))];
        let mail = vec![mail_task("mail-1", "hw 3", Some(due))];
        let tasks = consolidate(&events, mail, &lenient(), now());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "cal-1");
        assert_eq!(tasks[0].source, TaskSource::Feed);
    }

    #[test]
    fn test_duplicate_ids_collapse() {
        let due = now() + Duration::hours(3);
        let events = vec![event("x", "Lab 1", Some(due)), event("x", "Lab 1 report", Some(due))];
        assert_eq!(consolidate(&events, vec![], &lenient(), now()).len(), 1);
    }

    #[test]
    fn test_require_due_drops_undated() {
        let policy = TaskPolicy {
            require_due: true,
            ..lenient()
        };
        let events = vec![event("a", "Project proposal", None)];
        assert!(consolidate(&events, vec![], &policy, now()).is_empty());
    }

    #[test]
    fn test_noise_generic_and_far_future_are_dropped() {
        let soon = Some(now() + Duration::days(1));
        let mail = vec![
            mail_task("m1", "Assignment Graded: HW1", soon),
            mail_task("m2", "This week's deadlines", soon),
            mail_task("m3", "Final project", Some(now() + Duration::days(10))),
            mail_task("m4", "Homework 5", soon),
        ];
        let tasks = consolidate(&[], mail, &lenient(), now());
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["m4"]);
    }

    #[test]
    fn test_noise_filter_off_without_mail_extraction() {
        let tasks = TaskConfig {
            mail_extraction: false,
            ..TaskConfig::default()
        };
        let policy = TaskPolicy::from_config(&FeedConfig::default(), &tasks);
        assert!(policy.noise_keywords.is_empty());
        assert!(policy.require_due);
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  HW-3 (Ch. 4): Access code 1234"), "hw 3");
        assert_eq!(normalize_title("Quiz #2 - Limits"), "quiz 2 limits");
    }
}
