//! Scheduler for cron-based federation job execution
//!
//! Manages scheduled jobs with support for:
//! - Cron expression parsing
//! - Timezone-aware scheduling
//! - Sleep/wake detection via time-jump polling
//! - Missed job handling (runs if within grace period)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::mpsc;

use crate::error::FederationError;
use crate::state::AppState;
use crate::types::{ExecutionTrigger, JobId, ScheduleEntry};

/// Grace period for missed jobs (2 hours)
const MISSED_JOB_GRACE_PERIOD_SECS: i64 = 7200;

/// Time jump threshold to detect sleep/wake (5 minutes)
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Poll interval for scheduler loop (1 minute)
const POLL_INTERVAL_SECS: u64 = 60;

/// Message sent to trigger job execution
#[derive(Debug, Clone)]
pub struct SchedulerMessage {
    pub job: JobId,
    pub trigger: ExecutionTrigger,
}

/// Scheduler for managing federation job execution times
pub struct Scheduler {
    state: Arc<AppState>,
    sender: mpsc::Sender<SchedulerMessage>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>, sender: mpsc::Sender<SchedulerMessage>) -> Self {
        Self { state, sender }
    }

    /// Start the scheduler loop
    ///
    /// This runs indefinitely, checking for due jobs every minute.
    /// It also handles sleep/wake detection.
    pub async fn run(&self) {
        let mut last_check = Utc::now();

        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;

            let now = Utc::now();

            // Detect sleep: time jumped more than 5 minutes
            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for missed jobs",
                    time_jump
                );
                self.check_missed_jobs(now).await;
            }

            // Check and run due jobs
            self.check_and_run_due_jobs(now).await;

            last_check = now;
        }
    }

    /// Check for jobs that should run now
    async fn check_and_run_due_jobs(&self, now: DateTime<Utc>) {
        let config = self.state.config_snapshot();

        for (job, entry) in config.schedules.entries() {
            if !entry.enabled {
                continue;
            }
            if let Ok(true) = self.should_run_now(entry, job, now) {
                self.trigger_job(job, ExecutionTrigger::Scheduled).await;
            }
        }
    }

    /// Check if a job should run at the given time
    fn should_run_now(
        &self,
        entry: &ScheduleEntry,
        job: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, FederationError> {
        let schedule = parse_cron(&entry.cron)?;
        let tz: Tz = entry
            .timezone
            .parse()
            .map_err(|_| FederationError::Config(format!("Invalid timezone: {}", entry.timezone)))?;

        // Convert now to the configured timezone
        let now_local = now.with_timezone(&tz);

        // Get the last scheduled run time
        let last_run = self.state.get_last_scheduled_run(job);

        // Find the most recent scheduled time that's <= now
        let mut scheduled_times = schedule.after(&(now_local - chrono::Duration::minutes(2)));

        if let Some(next_time) = scheduled_times.next() {
            // Check if this minute matches
            let next_utc = next_time.with_timezone(&Utc);
            let diff = (now - next_utc).num_seconds().abs();

            // Within 2 minutes of scheduled time, wide enough to survive a
            // late poll after wake
            if diff < 120 {
                // Check if we already ran this scheduled time
                if let Some(last) = last_run {
                    if (last - next_utc).num_seconds().abs() < 60 {
                        return Ok(false); // Already ran
                    }
                }
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Check for jobs that were missed during sleep
    async fn check_missed_jobs(&self, now: DateTime<Utc>) {
        let config = self.state.config_snapshot();

        for (job, entry) in config.schedules.entries() {
            if !entry.enabled {
                continue;
            }
            if let Ok(Some(_)) = self.find_missed_job(entry, job, now) {
                log::info!("Found missed '{:?}' job, running now", job);
                self.trigger_job(job, ExecutionTrigger::CatchUp).await;
            }
        }
    }

    /// Find a missed job within the grace period.
    fn find_missed_job(
        &self,
        entry: &ScheduleEntry,
        job: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, FederationError> {
        let schedule = parse_cron(&entry.cron)?;
        let tz: Tz = entry
            .timezone
            .parse()
            .map_err(|_| FederationError::Config(format!("Invalid timezone: {}", entry.timezone)))?;

        let now_local = now.with_timezone(&tz);
        let grace_period = chrono::Duration::seconds(MISSED_JOB_GRACE_PERIOD_SECS);
        let grace_start = now_local - grace_period;

        // Get last run time
        let last_run = self.state.get_last_scheduled_run(job);

        // Look for scheduled times in the grace period
        let iter = schedule.after(&grace_start);

        for scheduled in iter {
            let scheduled_utc = scheduled.with_timezone(&Utc);

            // Stop if we've passed now
            if scheduled_utc > now {
                break;
            }

            // Check if this was missed
            if let Some(last) = last_run {
                if last >= scheduled_utc {
                    continue; // Already ran
                }
            }

            // Found a missed job
            return Ok(Some(scheduled_utc));
        }

        Ok(None)
    }

    /// Trigger a job execution
    async fn trigger_job(&self, job: JobId, trigger: ExecutionTrigger) {
        if self
            .sender
            .send(SchedulerMessage { job, trigger })
            .await
            .is_err()
        {
            log::error!("Failed to send scheduler message for {:?}", job);
        }
    }
}

/// Parse a cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule, FederationError> {
    // The cron crate expects 6 fields (with seconds), but we use 5-field format
    // Add "0" for seconds at the start
    let full_expr = format!("0 {}", expr);

    full_expr
        .parse::<Schedule>()
        .map_err(|e| FederationError::Config(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// Get the next scheduled time for a job
pub fn get_next_run_time(entry: &ScheduleEntry) -> Result<DateTime<Utc>, FederationError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz: Tz = entry
        .timezone
        .parse()
        .map_err(|_| FederationError::Config(format!("Invalid timezone: {}", entry.timezone)))?;

    let next = schedule
        .upcoming(tz)
        .next()
        .ok_or_else(|| FederationError::Config("No upcoming scheduled time".to_string()))?;

    Ok(next.with_timezone(&Utc))
}
