//! Daily digest trigger.
//!
//! The configured `HH:MM` becomes a daily cron entry evaluated in the
//! configured timezone. The loop polls once a minute; a large gap between
//! polls means the machine slept, and a slot missed during sleep still runs
//! if it is less than two hours old.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::mpsc;

use crate::error::DigestError;
use crate::executor::ExecutionTrigger;
use crate::state::AppState;
use crate::types::ScheduleConfig;

/// How old a missed slot may be and still run.
const MISSED_JOB_GRACE_PERIOD_SECS: i64 = 7200;

/// Poll gap that counts as a sleep/wake cycle.
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

const POLL_INTERVAL_SECS: u64 = 60;

/// Message sent to trigger a digest run
#[derive(Debug, Clone)]
pub struct SchedulerMessage {
    pub trigger: ExecutionTrigger,
}

pub struct Scheduler {
    state: Arc<AppState>,
    sender: mpsc::Sender<SchedulerMessage>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>, sender: mpsc::Sender<SchedulerMessage>) -> Self {
        Self { state, sender }
    }

    /// Start the scheduler loop. Runs until the executor goes away.
    pub async fn run(&self) {
        let entry = &self.state.config.schedule;
        if !entry.enabled {
            log::info!("Daily schedule disabled");
            return;
        }
        match get_next_run_time(entry, Utc::now()) {
            Ok(next) => log::info!("Next digest scheduled for {}", next),
            Err(e) => {
                log::error!("Scheduler not started: {}", e);
                return;
            }
        }

        let mut last_check = Utc::now();
        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
            let now = Utc::now();

            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for missed run",
                    time_jump
                );
                if let Ok(Some(missed)) = find_missed_job(entry, self.last_run(), now) {
                    log::info!("Found missed digest run scheduled for {}, running now", missed);
                    if !self.trigger(ExecutionTrigger::Missed, missed).await {
                        return;
                    }
                }
            }

            match should_run_now(entry, self.last_run(), now) {
                Ok(Some(scheduled)) => {
                    if !self.trigger(ExecutionTrigger::Scheduled, scheduled).await {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("Schedule check failed: {}", e),
            }

            last_check = now;
        }
    }

    fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.state.last_scheduled_run.read()
    }

    /// Record the scheduled slot and hand it to the executor. Returns false
    /// once the executor has shut down.
    async fn trigger(&self, trigger: ExecutionTrigger, scheduled: DateTime<Utc>) -> bool {
        *self.state.last_scheduled_run.write() = Some(scheduled);
        if self.sender.send(SchedulerMessage { trigger }).await.is_err() {
            log::error!("Executor stopped; scheduler exiting");
            return false;
        }
        true
    }
}

/// Five-field cron expression for a daily `HH:MM`.
pub fn daily_cron(entry: &ScheduleConfig) -> Result<String, DigestError> {
    let (hour, minute) = entry.hour_minute()?;
    Ok(format!("{} {} * * *", minute, hour))
}

/// Parse a cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule, DigestError> {
    // The cron crate expects 6 fields (with seconds); prepend "0"
    let full_expr = format!("0 {}", expr);

    full_expr.parse::<Schedule>().map_err(|e| {
        DigestError::Configuration(format!("Invalid cron expression '{}': {}", expr, e))
    })
}

/// The scheduled slot to run now, if `now` is within two minutes of one
/// that has not run yet.
pub fn should_run_now(
    entry: &ScheduleConfig,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, DigestError> {
    let schedule = parse_cron(&daily_cron(entry)?)?;
    let now_local = now.with_timezone(&entry.tz()?);

    let Some(next_time) = schedule
        .after(&(now_local - chrono::Duration::minutes(2)))
        .next()
    else {
        return Ok(None);
    };
    let next_utc = next_time.with_timezone(&Utc);
    if (now - next_utc).num_seconds().abs() >= 120 {
        return Ok(None);
    }
    if let Some(last) = last_run {
        if (last - next_utc).num_seconds().abs() < 60 {
            return Ok(None);
        }
    }
    Ok(Some(next_utc))
}

/// A slot inside the grace period that passed without running.
pub fn find_missed_job(
    entry: &ScheduleConfig,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, DigestError> {
    let schedule = parse_cron(&daily_cron(entry)?)?;
    let now_local = now.with_timezone(&entry.tz()?);
    let grace_start = now_local - chrono::Duration::seconds(MISSED_JOB_GRACE_PERIOD_SECS);

    for scheduled in schedule.after(&grace_start) {
        let scheduled_utc = scheduled.with_timezone(&Utc);
        if scheduled_utc > now {
            break;
        }
        if matches!(last_run, Some(last) if last >= scheduled_utc) {
            continue;
        }
        return Ok(Some(scheduled_utc));
    }
    Ok(None)
}

/// Next scheduled run after `now`
pub fn get_next_run_time(
    entry: &ScheduleConfig,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, DigestError> {
    let schedule = parse_cron(&daily_cron(entry)?)?;
    let now_local = now.with_timezone(&entry.tz()?);
    let next = schedule
        .after(&now_local)
        .next()
        .ok_or_else(|| DigestError::Configuration("No upcoming scheduled time".to_string()))?;
    Ok(next.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(time: &str) -> ScheduleConfig {
        ScheduleConfig {
            enabled: true,
            time: time.to_string(),
            timezone: "America/New_York".to_string(),
        }
    }

    /// 07:30 New York on 2026-03-02 (EST, UTC-5)
    fn slot() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_daily_cron_from_time() {
        assert_eq!(daily_cron(&entry("07:30")).unwrap(), "30 7 * * *");
        assert!(daily_cron(&entry("25:00")).is_err());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_next_run_time_in_timezone() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        assert_eq!(get_next_run_time(&entry("07:30"), now).unwrap(), slot());
    }

    #[test]
    fn test_should_run_now_once_per_slot() {
        let e = entry("07:30");
        let now = slot() + chrono::Duration::seconds(30);
        assert_eq!(should_run_now(&e, None, now).unwrap(), Some(slot()));
        assert_eq!(should_run_now(&e, Some(slot()), now).unwrap(), None);
        assert_eq!(
            should_run_now(&e, None, slot() + chrono::Duration::minutes(10)).unwrap(),
            None
        );
    }

    #[test]
    fn test_missed_job_within_grace_period() {
        let e = entry("07:30");
        let woke = slot() + chrono::Duration::minutes(90);
        assert_eq!(find_missed_job(&e, None, woke).unwrap(), Some(slot()));
        assert_eq!(find_missed_job(&e, Some(slot()), woke).unwrap(), None);

        let too_late = slot() + chrono::Duration::hours(3);
        assert_eq!(find_missed_job(&e, None, too_late).unwrap(), None);
    }
}
