//! Language-model classifier over an OpenAI-compatible chat completions API.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Classifier, ExtractedTask, MailHint};
use crate::error::DigestError;
use crate::http::{client_with_timeout, send_with_retry, RetryPolicy};
use crate::types::{CalendarEvent, ClassifierConfig, MailItem, TriageBucket};
use crate::util::truncate_chars;

const MAIL_BODY_CHARS: usize = 1200;
const EXTRACT_BODY_CHARS: usize = 5000;

const MAIL_SYSTEM_PROMPT: &str = "You triage a student's email into exactly one bucket: \
immediate_action (must act within about 48 hours), week_todo (actionable this week), \
info_reference (informational only), internship (internship, job or recruiting), \
research (research groups, labs, theses). \
Return a JSON object only: {\"bucket\": \"<one of the five>\"}.";

const CALENDAR_SYSTEM_PROMPT: &str = "You decide whether a course calendar entry is a task the \
student must complete (submit, register, take, attend for credit). Announcements and \
informational entries are not tasks. Return a JSON object only: {\"actionable\": true|false}.";

const EXTRACT_SYSTEM_PROMPT: &str = "You extract actionable school tasks (assignments, quizzes, \
exams, participation) from a student's email. Keep titles concise and specific. Interpret \
relative dates in the given timezone; when unsure of a due date use null. \
Return a JSON object only: {\"tasks\": [{\"title\": \"...\", \"due_at_iso\": \
\"YYYY-MM-DDTHH:MM:SS+HH:MM\" or null, \"reason\": \"...\"}]}.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ModelClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    tz: Tz,
    policy: RetryPolicy,
}

impl ModelClassifier {
    /// Every call is a single HTTP request; a failed call falls back to the
    /// rules instead of spending more of the run's allowance.
    pub fn new(config: &ClassifierConfig, tz: Tz) -> Result<Self, DigestError> {
        if !config.is_configured() {
            return Err(DigestError::ClassifierUnavailable(
                "classifier is disabled or missing an API key".to_string(),
            ));
        }
        Ok(Self {
            client: client_with_timeout(config.timeout_secs)?,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            tz,
            policy: RetryPolicy::single_attempt(),
        })
    }

    fn request_body(&self, system: &str, user: &Value) -> ChatRequest<'_> {
        ChatRequest {
            model: &self.model,
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
        }
    }

    /// One completion; the reply parsed as JSON, or `Value::Null` when the
    /// model answered with something that is not a JSON object.
    async fn complete(&self, system: &str, user: Value) -> Result<Value, DigestError> {
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(system, &user));

        let resp = send_with_retry(request, &self.policy)
            .await
            .map_err(|e| DigestError::ClassifierUnavailable(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(DigestError::ClassifierUnavailable(
                "model API rejected the credentials".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(DigestError::ClassifierUnavailable(format!(
                "model API returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| DigestError::ClassifierUnavailable(format!("bad response: {}", e)))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(parse_reply(&content))
    }
}

/// Slice from the first `{` to the last `}`; models sometimes wrap JSON in prose.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_reply(content: &str) -> Value {
    extract_json_object(content)
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or(Value::Null)
}

pub fn parse_bucket(reply: &Value) -> Option<TriageBucket> {
    reply
        .get("bucket")
        .or_else(|| reply.get("label"))
        .and_then(Value::as_str)
        .and_then(TriageBucket::parse)
}

pub fn parse_actionable(reply: &Value) -> Option<bool> {
    match reply.get("actionable")? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// `Some` when the reply carries a `tasks` array. Rows without a title are
/// dropped.
pub fn parse_tasks(reply: &Value, tz: Tz) -> Option<Vec<ExtractedTask>> {
    let rows = reply.get("tasks")?.as_array()?;
    let tasks = rows
        .iter()
        .filter_map(|row| {
            let title = row.get("title").and_then(Value::as_str)?.trim();
            if title.is_empty() {
                return None;
            }
            Some(ExtractedTask {
                title: title.to_string(),
                due_at: row
                    .get("due_at_iso")
                    .and_then(Value::as_str)
                    .and_then(|raw| parse_due(raw, tz)),
            })
        })
        .collect();
    Some(tasks)
}

/// RFC 3339, or a local date-time in `tz`. A bare date means end of day.
fn parse_due(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            let end_of_day = NaiveTime::from_hms_opt(23, 59, 0)?;
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(end_of_day))
        })?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn mail_payload(item: &MailItem, hint: &MailHint) -> Value {
    json!({
        "now": hint.now.to_rfc3339(),
        "subject": item.subject,
        "sender": item.sender,
        "receivedAt": item.received_at.to_rfc3339(),
        "body": truncate_chars(&item.body_excerpt, MAIL_BODY_CHARS),
        "importance": if item.is_important { "high" } else { "normal" },
        "dueHint": hint.due_at.map(|d| d.to_rfc3339()),
    })
}

fn extract_payload(item: &MailItem, hint: &MailHint, tz: Tz) -> Value {
    json!({
        "now": hint.now.to_rfc3339(),
        "timezone": tz.name(),
        "subject": item.subject,
        "sender": item.sender,
        "body": truncate_chars(&item.body_excerpt, EXTRACT_BODY_CHARS),
    })
}

fn calendar_payload(event: &CalendarEvent) -> Value {
    json!({
        "title": event.title,
        "category": event.raw_category.as_str(),
        "course": event.course,
        "dueAt": event.due_at.map(|d| d.to_rfc3339()),
    })
}

#[async_trait]
impl Classifier for ModelClassifier {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn triage_mail(
        &self,
        item: &MailItem,
        hint: &MailHint,
    ) -> Result<Option<TriageBucket>, DigestError> {
        let reply = self
            .complete(MAIL_SYSTEM_PROMPT, mail_payload(item, hint))
            .await?;
        Ok(parse_bucket(&reply))
    }

    async fn is_actionable(&self, event: &CalendarEvent) -> Result<Option<bool>, DigestError> {
        let reply = self
            .complete(CALENDAR_SYSTEM_PROMPT, calendar_payload(event))
            .await?;
        Ok(parse_actionable(&reply))
    }

    async fn extract_tasks(
        &self,
        item: &MailItem,
        hint: &MailHint,
    ) -> Result<Option<Vec<ExtractedTask>>, DigestError> {
        let reply = self
            .complete(EXTRACT_SYSTEM_PROMPT, extract_payload(item, hint, self.tz))
            .await?;
        Ok(parse_tasks(&reply, self.tz))
    }
}
