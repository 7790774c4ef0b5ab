//! Minimal iCalendar (RFC 5545) reader for course-platform feeds.
//!
//! Only VEVENT blocks are read. Properties used: UID, SUMMARY, DTSTART
//! (fallback DUE, DTEND), CREATED, URL, DESCRIPTION, CATEGORIES.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::DigestError;
use crate::types::{CalendarEvent, EventCategory};

/// A single content line: `NAME;PARAM=V;...:VALUE`
#[derive(Debug, PartialEq)]
struct ContentLine {
    name: String,
    params: HashMap<String, String>,
    value: String,
}

#[derive(Debug, Default)]
struct EventBuilder {
    uid: Option<String>,
    summary: Option<String>,
    start: Option<DateTime<Utc>>,
    due: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    created: Option<DateTime<Utc>>,
    url: Option<String>,
    description: Option<String>,
    categories: Option<String>,
}

/// Parse an ICS document into calendar events.
///
/// `tz` resolves floating times and all-day dates (which become 23:59 local).
/// With `require_due`, events lacking any timestamp are dropped.
pub fn parse_feed(
    body: &str,
    tz: Tz,
    require_due: bool,
) -> Result<Vec<CalendarEvent>, DigestError> {
    if !body.contains("BEGIN:VCALENDAR") {
        return Err(DigestError::FeedParseError(
            "response is not an iCalendar document".to_string(),
        ));
    }

    let mut events = Vec::new();
    let mut current: Option<EventBuilder> = None;

    for raw in unfold_lines(body) {
        let Some(line) = parse_content_line(&raw) else {
            continue;
        };

        match (line.name.as_str(), line.value.as_str()) {
            ("BEGIN", "VEVENT") => current = Some(EventBuilder::default()),
            ("END", "VEVENT") => {
                if let Some(builder) = current.take() {
                    if let Some(event) = builder.finish() {
                        if require_due && event.due_at.is_none() {
                            log::debug!("Dropping undated feed event '{}'", event.title);
                            continue;
                        }
                        events.push(event);
                    }
                }
            }
            _ => {
                if let Some(builder) = current.as_mut() {
                    builder.apply(&line, tz);
                }
            }
        }
    }

    Ok(events)
}

impl EventBuilder {
    fn apply(&mut self, line: &ContentLine, tz: Tz) {
        match line.name.as_str() {
            "UID" => self.uid = Some(line.value.trim().to_string()),
            "SUMMARY" => self.summary = Some(unescape_text(&line.value)),
            "DTSTART" => self.start = parse_ics_datetime(&line.value, &line.params, tz),
            "DUE" => self.due = parse_ics_datetime(&line.value, &line.params, tz),
            "DTEND" => self.end = parse_ics_datetime(&line.value, &line.params, tz),
            "CREATED" => self.created = parse_ics_datetime(&line.value, &line.params, tz),
            "URL" => self.url = Some(line.value.trim().to_string()),
            "DESCRIPTION" => self.description = Some(unescape_text(&line.value)),
            "CATEGORIES" => self.categories = Some(unescape_text(&line.value)),
            _ => {}
        }
    }

    fn finish(self) -> Option<CalendarEvent> {
        let title = self
            .summary
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("Untitled event")
            .to_string();
        let due_at = self.start.or(self.due).or(self.end);

        let url = self
            .url
            .filter(|u| !u.is_empty())
            .or_else(|| self.description.as_deref().and_then(first_url));

        let course = self
            .categories
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let id = match self.uid.filter(|u| !u.is_empty()) {
            Some(uid) => uid,
            None => synthetic_uid(&title, due_at),
        };

        let raw_category = categorize(&id, url.as_deref(), &title, course.as_deref());

        Some(CalendarEvent {
            id,
            title,
            due_at,
            published_at: self.created,
            url,
            raw_category,
            course,
        })
    }
}

fn categorize(
    uid: &str,
    url: Option<&str>,
    title: &str,
    categories: Option<&str>,
) -> EventCategory {
    let uid_lower = uid.to_lowercase();
    let url_lower = url.unwrap_or("").to_lowercase();
    if uid_lower.contains("assignment") || url_lower.contains("/assignments/") {
        return EventCategory::Assignment;
    }
    let title_lower = title.to_lowercase();
    let cat_lower = categories.unwrap_or("").to_lowercase();
    if title_lower.contains("announcement") || cat_lower.contains("announcement") {
        return EventCategory::Announcement;
    }
    EventCategory::Other
}

fn synthetic_uid(title: &str, due_at: Option<DateTime<Utc>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    if let Some(due) = due_at {
        hasher.update(due.to_rfc3339().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("feed-{}", &digest[..16])
}

fn first_url(text: &str) -> Option<String> {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    let re = URL_RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"]+"#).expect("static regex"));
    re.find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')']).to_string())
}

/// Join folded continuation lines (leading space/tab) onto their predecessor.
fn unfold_lines(body: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in body.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = line.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

fn parse_content_line(line: &str) -> Option<ContentLine> {
    // Split at the first ':' that is not inside a quoted parameter value.
    let mut in_quotes = false;
    let mut split_at = None;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                split_at = Some(idx);
                break;
            }
            _ => {}
        }
    }
    let split_at = split_at?;
    let (head, value) = (&line[..split_at], &line[split_at + 1..]);

    let mut parts = head.split(';');
    let name = parts.next()?.trim().to_uppercase();
    if name.is_empty() {
        return None;
    }
    let params = parts
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim().to_uppercase(), v.trim().trim_matches('"').to_string()))
        .collect();

    Some(ContentLine {
        name,
        params,
        value: value.to_string(),
    })
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parse DATE / DATE-TIME values (UTC `Z`, `TZID=`, or floating).
fn parse_ics_datetime(
    value: &str,
    params: &HashMap<String, String>,
    default_tz: Tz,
) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let tz = params
        .get("TZID")
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(default_tz);

    let is_date = params.get("VALUE").map(|v| v.eq_ignore_ascii_case("DATE")) == Some(true)
        || (value.len() == 8 && value.chars().all(|c| c.is_ascii_digit()));
    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 0)?;
        return localize(tz, date.and_time(end_of_day));
    }

    if let Some(utc_part) = value.strip_suffix('Z') {
        let naive = parse_naive(utc_part)?;
        return Some(Utc.from_utc_datetime(&naive));
    }

    localize(tz, parse_naive(value)?)
}

fn parse_naive(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M"))
        .ok()
}

fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}
