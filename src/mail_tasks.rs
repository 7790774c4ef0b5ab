//! Task extraction from course-platform mail.
//!
//! Deadlines are read from free text (relative days, ISO, US and month-name
//! dates). Bodies that list "DUE ..." lines followed by item lines yield one
//! task per item; otherwise the subject (or an `Assignment:` line) becomes
//! the title.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;

use crate::classify::ExtractedTask;
use crate::types::{FeedConfig, MailItem, Task, TaskConfig, TaskMode, TaskSource};
use crate::util::{collapse_whitespace, contains_any, truncate_chars};

const CANVAS_INDICATORS: &[&str] = &[
    "canvas",
    "instructure",
    "submission",
    "assignment",
    "quiz",
    "discussion",
    "course announcement",
    "due",
    "deadline",
];

const DUE_MARKERS: &[&str] = &["due", "deadline", "tonight", "tomorrow"];

/// Lines after a due marker that are sign-offs or boilerplate, not items.
const WEAK_LINE_PREFIXES: &[&str] = &[
    "questions?",
    "cheers",
    "have a great",
    "view announcement",
    "update your notification",
];
const WEAK_LINE_FRAGMENTS: &[&str] = &["links to an external site", "syllabus", "piazza q&a"];

/// How many lines after a due marker are scanned for items.
const BLOCK_LOOKAHEAD_LINES: usize = 5;
const MAX_ITEMS_PER_BLOCK: usize = 3;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

fn relative_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"(?i)\b(today|tomorrow)\b(?:\s+(?:at\s+)?)?(?:(\d{1,2}):(\d{2}))?\s*(am|pm)?",
    )
}

fn iso_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(20\d{2})-(\d{1,2})-(\d{1,2})(?:\s+(\d{1,2}):(\d{2}))?")
}

fn us_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"\b(\d{1,2})/(\d{1,2})(?:/(\d{2,4}))?(?:\s+(\d{1,2}):(\d{2})\s*([AaPp][Mm])?)?",
    )
}

fn month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"\b(January|Jan|February|Feb|March|Mar|April|Apr|May|June|Jun|July|Jul|August|Aug|September|Sept|Sep|October|Oct|November|Nov|December|Dec)\s+(\d{1,2})(?:,\s*(20\d{2}))?(?:\s+(?:at\s+)?(\d{1,2}):(\d{2})\s*([AaPp][Mm])?)?",
    )
}

fn inline_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)\d\s*(?:am|pm)\b(?:\s*(?:central time|ct)\b)?")
}

fn title_patterns() -> &'static [Regex; 4] {
    static RE: OnceLock<[Regex; 4]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"(?i)Assignment\s*[:\-]\s*(.+)").expect("static regex"),
            Regex::new(r"(?i)\bDue\s*[:\-]\s*(.+)").expect("static regex"),
            Regex::new(r"(?i)(.+?)\s+(?:is due|due\s+on)").expect("static regex"),
            Regex::new(r"(?i)Submission Reminder\s*[:\-]\s*(.+)").expect("static regex"),
        ]
    })
}

fn preview_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)Assignment\s*[:\-]\s*(.+?)(?:\.|$)")
}

fn month_number(word: &str) -> Option<u32> {
    let prefix = word.get(..3)?.to_ascii_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// 12h clock to 24h. `None` meridiem leaves the hour as written.
fn to_24h(hour: u32, meridiem: Option<&str>) -> u32 {
    match meridiem.map(|m| m.to_ascii_lowercase()).as_deref() {
        Some("pm") if hour != 12 => hour + 12,
        Some("am") if hour == 12 => 0,
        _ => hour,
    }
}

/// Resolves deadline phrases in mail text against a local timezone.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineParser {
    tz: Tz,
}

impl DeadlineParser {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    fn local(&self, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        self.tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn time_of(caps: &regex::Captures, hour_idx: usize, ampm_idx: usize) -> Option<(u32, u32)> {
        let hour: u32 = caps.get(hour_idx)?.as_str().parse().ok()?;
        let minute: u32 = caps.get(hour_idx + 1)?.as_str().parse().ok()?;
        Some((to_24h(hour, caps.get(ampm_idx).map(|m| m.as_str())), minute))
    }

    /// Roll a yearless date forward when it lies far in the past
    /// (a "1/5" seen in November means next January).
    fn roll_year(&self, parsed: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if parsed >= now - Duration::days(180) {
            return Some(parsed);
        }
        let local = parsed.with_timezone(&self.tz);
        let next = local.date_naive().with_year(local.year() + 1)?;
        self.local(next, local.hour(), local.minute())
    }

    /// First deadline found in `text`, or `None`.
    ///
    /// Date-only phrases resolve to 23:59 local time.
    pub fn parse(&self, text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.with_timezone(&self.tz).date_naive();

        if let Some(caps) = relative_re().captures(text) {
            let day = if caps[1].eq_ignore_ascii_case("tomorrow") {
                today.succ_opt()?
            } else {
                today
            };
            let (hour, minute) = Self::time_of(&caps, 2, 4).unwrap_or((23, 59));
            return self.local(day, hour, minute);
        }

        if let Some(caps) = iso_re().captures(text) {
            let date = NaiveDate::from_ymd_opt(
                caps[1].parse().ok()?,
                caps[2].parse().ok()?,
                caps[3].parse().ok()?,
            );
            if let Some(date) = date {
                let (hour, minute) = match (caps.get(4), caps.get(5)) {
                    (Some(h), Some(m)) => (h.as_str().parse().ok()?, m.as_str().parse().ok()?),
                    _ => (23, 59),
                };
                if let Some(parsed) = self.local(date, hour, minute) {
                    return Some(parsed);
                }
            }
        }

        if let Some(caps) = us_re().captures(text) {
            let explicit_year = caps.get(3).and_then(|y| y.as_str().parse::<i32>().ok());
            let year = match explicit_year {
                Some(y) if y < 100 => y + 2000,
                Some(y) => y,
                None => today.year(),
            };
            let (hour, minute) = Self::time_of(&caps, 4, 6).unwrap_or((23, 59));
            let date = NaiveDate::from_ymd_opt(year, caps[1].parse().ok()?, caps[2].parse().ok()?);
            if let Some(parsed) = date.and_then(|d| self.local(d, hour, minute)) {
                return if explicit_year.is_some() {
                    Some(parsed)
                } else {
                    self.roll_year(parsed, now)
                };
            }
        }

        if let Some(caps) = month_re().captures(text) {
            let month = month_number(&caps[1])?;
            let day: u32 = caps[2].parse().ok()?;
            let explicit_year = caps.get(3).and_then(|y| y.as_str().parse::<i32>().ok());
            let (hour, minute) = Self::time_of(&caps, 4, 6).unwrap_or((23, 59));
            let date = NaiveDate::from_ymd_opt(explicit_year.unwrap_or(today.year()), month, day)?;
            let parsed = self.local(date, hour, minute)?;
            return if explicit_year.is_some() {
                Some(parsed)
            } else {
                self.roll_year(parsed, now)
            };
        }

        if text.to_lowercase().contains("midnight") {
            return self.local(today, 23, 59);
        }
        None
    }
}

/// Extracts candidate tasks from course-platform mail.
#[derive(Debug, Clone)]
pub struct MailTaskExtractor {
    parser: DeadlineParser,
    mode: TaskMode,
    action_keywords: Vec<String>,
    noise_keywords: Vec<String>,
    require_due: bool,
}

impl MailTaskExtractor {
    pub fn new(tz: Tz, tasks: &TaskConfig, feed: &FeedConfig) -> Self {
        Self {
            parser: DeadlineParser::new(tz),
            mode: tasks.mode,
            action_keywords: tasks.action_keywords.clone(),
            noise_keywords: tasks.noise_keywords.clone(),
            require_due: feed.require_due_date,
        }
    }

    pub fn parser(&self) -> &DeadlineParser {
        &self.parser
    }

    pub fn looks_like_course_mail(&self, mail: &MailItem) -> bool {
        let text = format!(
            "{} {} {}",
            mail.subject,
            truncate_chars(&mail.body_excerpt, 280),
            mail.sender
        )
        .to_lowercase();
        contains_any(&text, CANVAS_INDICATORS)
    }

    /// Noise is judged on the subject only.
    pub fn is_noise(&self, mail: &MailItem) -> bool {
        contains_any(&mail.subject.to_lowercase(), &self.noise_keywords)
    }

    fn passes_mode(&self, title: &str) -> bool {
        self.mode == TaskMode::All || contains_any(&title.to_lowercase(), &self.action_keywords)
    }

    /// Mail worth handing to the model for task extraction.
    pub fn is_extraction_candidate(&self, mail: &MailItem) -> bool {
        self.looks_like_course_mail(mail) && !self.is_noise(mail)
    }

    /// Turn model-extracted tasks into digest tasks. In action-only mode a
    /// title needs an action keyword and no noise keyword.
    pub fn model_tasks(&self, mail: &MailItem, extracted: Vec<ExtractedTask>) -> Vec<Task> {
        extracted
            .into_iter()
            .filter(|t| {
                self.mode == TaskMode::All
                    || (self.passes_mode(&t.title)
                        && !contains_any(&t.title.to_lowercase(), &self.noise_keywords))
            })
            .map(|t| {
                let due = t.due_at.map(|d| d.to_rfc3339()).unwrap_or_default();
                let id = crate::classify::fingerprint(&[
                    "llm",
                    mail.id.as_str(),
                    t.title.as_str(),
                    due.as_str(),
                ]);
                Task {
                    id: format!("llm-{}", &id[..16]),
                    title: collapse_whitespace(&t.title),
                    due_at: t.due_at,
                    published_at: Some(mail.received_at),
                    url: mail.url.clone(),
                    source: TaskSource::LlmMailExtract,
                    course: None,
                }
            })
            .collect()
    }

    fn has_due_marker(line_lower: &str) -> bool {
        DUE_MARKERS.iter().any(|m| line_lower.contains(m))
    }

    fn is_item_line(line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.chars().count() < 4 {
            return false;
        }
        let lower = trimmed.to_lowercase();
        !WEAK_LINE_PREFIXES.iter().any(|p| lower.starts_with(p))
            && !WEAK_LINE_FRAGMENTS.iter().any(|f| lower.contains(f))
    }

    fn body_lines(mail: &MailItem) -> Vec<String> {
        mail.body_excerpt
            .lines()
            .map(|l| collapse_whitespace(l).trim_matches([' ', '-', '\t']).to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    fn due_blocks(&self, mail: &MailItem, lines: &[String], now: DateTime<Utc>) -> Vec<Task> {
        let mut tasks = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            if !Self::has_due_marker(&line.to_lowercase()) {
                continue;
            }
            let Some(due_at) = self.parser.parse(line, now) else {
                continue;
            };

            let mut candidates: Vec<&str> = Vec::new();
            // Item named on the same line, after the time.
            if let Some(m) = inline_tail_re().find(line) {
                let tail = line[m.end()..].trim_matches([' ', '-', ':', '|', ',', '.']);
                if Self::is_item_line(tail) {
                    candidates.push(tail);
                }
            }
            for next in lines.iter().skip(idx + 1).take(BLOCK_LOOKAHEAD_LINES) {
                if self.parser.parse(next, now).is_some() {
                    break;
                }
                if Self::is_item_line(next) {
                    candidates.push(next.as_str());
                }
            }

            for candidate in candidates.into_iter().take(MAX_ITEMS_PER_BLOCK) {
                if !self.passes_mode(candidate) {
                    continue;
                }
                tasks.push(self.task(mail, clean_title(candidate), Some(due_at)));
            }
        }
        tasks
    }

    fn subject_title(&self, mail: &MailItem) -> String {
        let subject = mail.subject.trim();
        for pattern in title_patterns() {
            if let Some(caps) = pattern.captures(subject) {
                return caps[1].to_string();
            }
        }
        let first_line = mail.body_excerpt.lines().next().unwrap_or("");
        if let Some(caps) = preview_title_re().captures(first_line) {
            return caps[1].to_string();
        }
        subject.to_string()
    }

    fn task(&self, mail: &MailItem, title: String, due_at: Option<DateTime<Utc>>) -> Task {
        let id = crate::classify::fingerprint(&[mail.id.as_str(), title.as_str()]);
        Task {
            id: format!("mail-{}", &id[..16]),
            title,
            due_at,
            published_at: Some(mail.received_at),
            url: mail.url.clone(),
            source: TaskSource::MailExtract,
            course: None,
        }
    }

    /// Tasks found in one mail; empty for non-course mail and noise.
    pub fn extract(&self, mail: &MailItem, now: DateTime<Utc>) -> Vec<Task> {
        if !self.looks_like_course_mail(mail) || self.is_noise(mail) {
            return Vec::new();
        }

        let lines = Self::body_lines(mail);
        let block_tasks = self.due_blocks(mail, &lines, now);
        if !block_tasks.is_empty() {
            return block_tasks;
        }
        // Multi-line bodies with dated lines but no item lines are roundups.
        let dated_body = lines.iter().any(|l| {
            Self::has_due_marker(&l.to_lowercase()) && self.parser.parse(l, now).is_some()
        });
        if dated_body && lines.len() > 1 {
            return Vec::new();
        }

        let combined = format!(
            "{} {}",
            mail.subject,
            truncate_chars(&mail.body_excerpt, 1600)
        );
        let due_at = self.parser.parse(&combined, now);
        if self.mode == TaskMode::ActionOnly
            && due_at.is_none()
            && !contains_any(&combined.to_lowercase(), &self.action_keywords)
        {
            return Vec::new();
        }
        if self.require_due && due_at.is_none() {
            return Vec::new();
        }

        vec![self.task(mail, clean_title(&self.subject_title(mail)), due_at)]
    }
}

fn clean_title(raw: &str) -> String {
    let text = collapse_whitespace(raw);
    let text = text.trim_matches([' ', '-', ':', '|']);
    if text.is_empty() {
        "Course task".to_string()
    } else {
        text.to_string()
    }
}

/// Earliest due date among tasks, used as a hint for mail triage.
pub fn earliest_due(tasks: &[Task]) -> Option<DateTime<Utc>> {
    tasks.iter().filter_map(|t| t.due_at).min()
}
