//! Read surface over the orchestrator
//!
//! Each command returns a serializable view in camelCase. Reads never
//! surface a raw error: failures are folded into the view.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classify::ClassificationStats;
use crate::error::ErrorView;
use crate::executor::{RunNowResult, RunPhase};
use crate::nudge::{NudgeTarget, Persona, Urgency};
use crate::scheduler;
use crate::state::AppState;
use crate::types::{Degradation, DigestSnapshot, MailItem, Task, TriageBucket};

/// Reads slower than this are logged.
const TODAY_LATENCY_BUDGET_MS: u128 = 300;

/// Result of `get_today`
#[derive(Debug, Serialize)]
#[allow(clippy::large_enum_variant)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TodayResult {
    Success {
        data: TodayView,
        phase: RunPhase,
    },
    Error {
        #[serde(flatten)]
        error: ErrorView,
        phase: RunPhase,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayView {
    pub date_label: String,
    pub summary_text: String,
    pub generated_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    /// Every bucket is present, possibly empty.
    pub mails: BTreeMap<TriageBucket, Vec<MailItem>>,
    pub nudges: NudgeView,
    pub push_style: String,
    pub push_preview: String,
    pub degraded: bool,
    pub degradations: Vec<Degradation>,
    pub classification: ClassificationStats,
    /// Why the latest run did not replace this snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NudgeView {
    pub target: Option<NudgeTarget>,
    pub urgency: Urgency,
    pub pushed_persona: Persona,
    pub previews: BTreeMap<Persona, String>,
}

impl From<&DigestSnapshot> for TodayView {
    fn from(snapshot: &DigestSnapshot) -> Self {
        let mails = TriageBucket::ALL
            .into_iter()
            .map(|bucket| (bucket, snapshot.mails_in(bucket).to_vec()))
            .collect();

        TodayView {
            date_label: snapshot.date_label.clone(),
            summary_text: snapshot.summary_text.clone(),
            generated_at: snapshot.generated_at,
            tasks: snapshot.tasks.clone(),
            mails,
            nudges: NudgeView {
                target: snapshot.nudges.target.clone(),
                urgency: snapshot.nudges.urgency,
                pushed_persona: snapshot.nudges.pushed_persona,
                previews: snapshot.nudges.texts.clone(),
            },
            push_style: snapshot.push_style.clone(),
            push_preview: snapshot.push_preview.clone(),
            degraded: snapshot.is_degraded(),
            degradations: snapshot.degradations.clone(),
            classification: snapshot.classification,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNowView {
    pub ok: bool,
    pub pushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorView>,
    pub generated_at: Option<DateTime<Utc>>,
    pub coalesced: bool,
}

impl From<RunNowResult> for RunNowView {
    fn from(result: RunNowResult) -> Self {
        RunNowView {
            ok: result.error.is_none(),
            pushed: result.pushed,
            push_error: result.push_error,
            error: result.error.as_ref().map(ErrorView::from),
            generated_at: result.generated_at,
            coalesced: result.coalesced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatusView {
    pub configured: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub phase: RunPhase,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub schedule_enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub completed_runs: u64,
}

/// Today's digest, running the pipeline when no fresh snapshot exists or
/// when `force_refresh` is set.
pub async fn get_today(state: &AppState, force_refresh: bool) -> TodayResult {
    let started = Instant::now();
    let result = match state.orchestrator.get_digest(force_refresh).await {
        Ok(snapshot) => {
            let mut data = TodayView::from(snapshot.as_ref());
            data.last_error = state.orchestrator.last_error().as_ref().map(ErrorView::from);
            TodayResult::Success {
                data,
                phase: state.orchestrator.phase(),
            }
        }
        Err(e) => TodayResult::Error {
            error: ErrorView::from(&e),
            phase: state.orchestrator.phase(),
        },
    };

    let elapsed = started.elapsed().as_millis();
    if !force_refresh && elapsed > TODAY_LATENCY_BUDGET_MS {
        log::debug!(
            "get_today took {}ms (budget {}ms)",
            elapsed,
            TODAY_LATENCY_BUDGET_MS
        );
    }
    result
}

/// Run the pipeline now and push the digest.
pub async fn run_now(state: &AppState) -> RunNowView {
    RunNowView::from(state.orchestrator.run_now().await)
}

/// Whether the mailbox identity is configured and currently holds a token.
pub fn auth_status(state: &AppState) -> AuthStatusView {
    let identity = state.orchestrator.mailbox().identity();
    AuthStatusView {
        configured: identity.is_configured(),
        connected: identity.is_connected(),
    }
}

pub fn get_status(state: &AppState) -> StatusView {
    let schedule = &state.config.schedule;
    let next_run_at = if schedule.enabled {
        scheduler::get_next_run_time(schedule, Utc::now()).ok()
    } else {
        None
    };
    StatusView {
        phase: state.orchestrator.phase(),
        last_generated_at: state.orchestrator.current().map(|s| s.generated_at),
        schedule_enabled: schedule.enabled,
        next_run_at,
        completed_runs: state.orchestrator.completed_runs(),
    }
}
