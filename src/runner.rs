//! Federation job runner
//!
//! Consumes scheduler messages and executes the build, delivery, and merge
//! jobs. Distinct job types run concurrently; each job type is single
//! flight, so a trigger that lands while the same job is still running is
//! dropped with a log line rather than queued behind it.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::{AdminError, FederationError};
use crate::scheduler::SchedulerMessage;
use crate::state::{create_job_run, AppState};
use crate::types::{ExecutionTrigger, JobId, JobStatus};

pub struct Runner {
    state: Arc<AppState>,
}

impl Runner {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Start the runner loop
    ///
    /// Listens for job execution requests from the scheduler or manual
    /// triggers.
    pub async fn run(&self, mut receiver: mpsc::Receiver<SchedulerMessage>) {
        while let Some(msg) = receiver.recv().await {
            log::info!("Executing job {:?} (trigger: {:?})", msg.job, msg.trigger);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                execute_job(&state, msg.job, msg.trigger).await;
            });
        }
    }
}

/// Execute one job, maintaining its status and run history.
pub async fn execute_job(state: &Arc<AppState>, job: JobId, trigger: ExecutionTrigger) {
    let Some(_guard) = state.try_begin_job(job) else {
        log::info!(
            "Job {:?} is already running, dropping {:?} trigger",
            job,
            trigger
        );
        return;
    };

    let record = create_job_run(job, trigger);
    let run_id = record.id.clone();
    let started_at = record.started_at;
    state.add_job_run(record);
    state.set_job_status(
        job,
        JobStatus::Running {
            started_at,
            run_id: run_id.clone(),
        },
    );

    let result = dispatch(state, job).await;

    let finished_at = Utc::now();
    let duration_secs = (finished_at - started_at).num_seconds().max(0) as u64;

    match result {
        Ok(detail) => {
            state.update_job_run(&run_id, |r| {
                r.finished_at = Some(finished_at);
                r.duration_secs = Some(duration_secs);
                r.success = true;
                r.detail = Some(detail.clone());
            });
            state.set_job_status(
                job,
                JobStatus::Completed {
                    finished_at,
                    duration_secs,
                    run_id,
                },
            );
            log::info!("Job {:?} finished in {}s: {}", job, duration_secs, detail);

            // Only a successful run claims the schedule slot; a failed one
            // stays eligible for catch-up
            if matches!(
                trigger,
                ExecutionTrigger::Scheduled | ExecutionTrigger::CatchUp
            ) {
                state.set_last_scheduled_run(job, Utc::now());
            }
        }
        Err(e) => {
            log::error!("Job {:?} failed: {}", job, e);
            state.update_job_run(&run_id, |r| {
                r.finished_at = Some(finished_at);
                r.duration_secs = Some(duration_secs);
                r.success = false;
                r.error_message = Some(e.to_string());
            });
            state.set_job_status(
                job,
                JobStatus::Failed {
                    error: AdminError::from(&e),
                    run_id,
                },
            );
        }
    }
}

async fn dispatch(state: &Arc<AppState>, job: JobId) -> Result<String, FederationError> {
    match job {
        JobId::BuildBundles => crate::builder::run(state).await.map(|o| o.summary()),
        JobId::DeliverQueued => crate::delivery::run(state).await.map(|o| o.summary()),
        JobId::MergeSignals => crate::merge::run(state).await.map(|o| o.summary()),
    }
}
