//! Due-soon nudges
//!
//! Picks the task closest to its deadline inside the push window and writes
//! a reminder for it in every persona. One persona is chosen for the push;
//! the others stay available as previews.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::types::{MailItem, Task};

const CRITICAL_HOURS: i64 = 6;
const HIGH_HOURS: i64 = 24;
const MEDIUM_HOURS: i64 = 48;

const PUSH_MAX_TASKS: usize = 5;
const PUSH_MAX_MAILS: usize = 3;
/// Tasks that went past due this recently still appear in the push.
const PUSH_OVERDUE_GRACE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    Senior,
    Cute,
    Coach,
}

impl Persona {
    pub const ALL: [Persona; 3] = [Persona::Senior, Persona::Cute, Persona::Coach];

    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Senior => "senior",
            Persona::Cute => "cute",
            Persona::Coach => "coach",
        }
    }
}

/// Configured push tone. `Auto` lets time-to-due pick the persona.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeStyle {
    #[default]
    Auto,
    Senior,
    Cute,
}

impl NudgeStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            NudgeStyle::Auto => "auto",
            NudgeStyle::Senior => "senior",
            NudgeStyle::Cute => "cute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn from_remaining(remaining: Duration) -> Self {
        if remaining <= Duration::hours(CRITICAL_HOURS) {
            Urgency::Critical
        } else if remaining <= Duration::hours(HIGH_HOURS) {
            Urgency::High
        } else if remaining <= Duration::hours(MEDIUM_HOURS) {
            Urgency::Medium
        } else {
            Urgency::Low
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Urgency::None => "nothing urgent",
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

/// The task a nudge is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NudgeTarget {
    pub task_id: String,
    pub title: String,
    pub due_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    /// Share of the publish-to-due interval already elapsed, in `[0, 1]`.
    pub elapsed_ratio: f64,
    pub hours_left: i64,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NudgeSet {
    pub target: Option<NudgeTarget>,
    pub texts: BTreeMap<Persona, String>,
    pub pushed_persona: Persona,
    pub urgency: Urgency,
}

impl NudgeSet {
    pub fn pushed_text(&self) -> &str {
        self.texts
            .get(&self.pushed_persona)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Label shown next to the push, e.g. `auto (coach)` or `cute`.
    pub fn style_label(&self, style: NudgeStyle) -> String {
        match style {
            NudgeStyle::Auto => format!("auto ({})", self.pushed_persona.as_str()),
            forced => forced.as_str().to_string(),
        }
    }
}

/// `(now - published) / (due - published)`, clamped to `[0, 1]`.
pub fn elapsed_ratio(published_at: DateTime<Utc>, due_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let total = (due_at - published_at).num_milliseconds();
    if total <= 0 {
        return 1.0;
    }
    let elapsed = (now - published_at).num_milliseconds();
    (elapsed as f64 / total as f64).clamp(0.0, 1.0)
}

/// Task with the smallest positive time-to-due no further out than `window`.
pub fn select_target<'a>(tasks: &'a [Task], now: DateTime<Utc>, window: Duration) -> Option<&'a Task> {
    tasks
        .iter()
        .filter_map(|t| t.due_at.map(|due| (due - now, t)))
        .filter(|(remaining, _)| *remaining > Duration::zero() && *remaining <= window)
        .min_by(|(a, ta), (b, tb)| a.cmp(b).then_with(|| ta.id.cmp(&tb.id)))
        .map(|(_, t)| t)
}

fn auto_persona(remaining: Duration) -> Persona {
    if remaining <= Duration::hours(CRITICAL_HOURS) {
        Persona::Coach
    } else if remaining <= Duration::hours(HIGH_HOURS) {
        Persona::Senior
    } else {
        Persona::Cute
    }
}

fn hours_left(remaining: Duration) -> i64 {
    let secs = remaining.num_seconds().max(0);
    (secs + 3599) / 3600
}

fn nudge_text(persona: Persona, target: Option<&NudgeTarget>, urgency: Urgency) -> String {
    let Some(t) = target else {
        return match persona {
            Persona::Senior => {
                "Senior reminder: nothing is due soon. Put this week's tasks on your calendar now."
                    .to_string()
            }
            Persona::Cute => {
                "Cute reminder: today is calm! Take 15 minutes to tidy up this week's list."
                    .to_string()
            }
            Persona::Coach => {
                "Coach: no deadlines inside the window. Use the slack to get ahead.".to_string()
            }
        };
    };
    let (title, h) = (&t.title, t.hours_left);
    match (persona, urgency) {
        (Persona::Senior, Urgency::Critical) => {
            format!("Senior nudge: {} is due in about {}h. Finish this one before anything else.", title, h)
        }
        (Persona::Senior, Urgency::High) => {
            format!("Senior reminder: about {}h left on {}. Clear it today.", h, title)
        }
        (Persona::Senior, _) => format!(
            "Senior reminder: {} is due in about {}h. Get it done and the day is settled.",
            title, h
        ),
        (Persona::Cute, Urgency::Critical) => format!(
            "Cute hurry-up: only about {}h left for {}! Hand it in, then treat yourself.",
            h, title
        ),
        (Persona::Cute, Urgency::High) => {
            format!("Cute reminder: {} has about {}h left, let's knock it out today!", title, h)
        }
        (Persona::Cute, _) => format!(
            "Cute reminder: {} is due in about {}h. Starting now is the easiest, go go!",
            title, h
        ),
        (Persona::Coach, Urgency::Critical) => format!(
            "Coach: {}h on the clock for {}. Phone away, start now, submit.",
            h, title
        ),
        (Persona::Coach, _) => format!(
            "Coach: {} is due in {}h. Block 45 minutes today and make real progress.",
            title, h
        ),
    }
}

/// Build the nudge set for `tasks` at `now`.
pub fn generate_nudges(tasks: &[Task], now: DateTime<Utc>, style: NudgeStyle, window: Duration) -> NudgeSet {
    let target = select_target(tasks, now, window).and_then(|task| {
        let due_at = task.due_at?;
        let published_at = task.effective_published_at()?;
        let remaining = due_at - now;
        Some(NudgeTarget {
            task_id: task.id.clone(),
            title: task.title.clone(),
            due_at,
            published_at,
            elapsed_ratio: elapsed_ratio(published_at, due_at, now),
            hours_left: hours_left(remaining),
            critical: remaining <= Duration::hours(CRITICAL_HOURS),
        })
    });

    let remaining = target.as_ref().map(|t| t.due_at - now);
    let urgency = remaining.map(Urgency::from_remaining).unwrap_or(Urgency::None);
    let pushed_persona = match style {
        NudgeStyle::Senior => Persona::Senior,
        NudgeStyle::Cute => Persona::Cute,
        NudgeStyle::Auto => remaining.map(auto_persona).unwrap_or(Persona::Senior),
    };

    let texts = Persona::ALL
        .into_iter()
        .map(|p| (p, nudge_text(p, target.as_ref(), urgency)))
        .collect();

    NudgeSet {
        target,
        texts,
        pushed_persona,
        urgency,
    }
}

/// Everything the push message is assembled from.
pub struct PushInput<'a> {
    pub summary: &'a str,
    pub tasks: &'a [Task],
    pub immediate_mails: &'a [MailItem],
    pub important_mails: &'a [MailItem],
    pub nudges: &'a NudgeSet,
    pub style_label: &'a str,
    pub now: DateTime<Utc>,
    pub window: Duration,
    pub tz: Tz,
}

/// Plain-text push message.
pub fn to_push_text(input: &PushInput<'_>) -> String {
    let floor = input.now - Duration::hours(PUSH_OVERDUE_GRACE_HOURS);
    let limit = input.now + input.window;

    let mut lines = vec![
        input.summary.to_string(),
        format!(
            "[push] style {} | urgency {}",
            input.style_label,
            input.nudges.urgency.label()
        ),
        input.nudges.pushed_text().to_string(),
    ];

    let in_window = input
        .tasks
        .iter()
        .filter_map(|t| t.due_at.map(|due| (t, due)))
        .filter(|(_, due)| *due >= floor && *due <= limit);
    for (task, due) in in_window.take(PUSH_MAX_TASKS) {
        lines.push(format!(
            "[task] {} | {}",
            task.title,
            due.with_timezone(&input.tz).format("%m-%d %H:%M")
        ));
    }

    let focus = if input.immediate_mails.is_empty() {
        input.important_mails
    } else {
        input.immediate_mails
    };
    for mail in focus.iter().take(PUSH_MAX_MAILS) {
        lines.push(format!("[mail] {} | {}", mail.subject, mail.sender));
    }

    lines.join("\n")
}
