//! Daily bundle builder (FED-42).
//!
//! Aggregates the previous UTC day's impact observations per division,
//! applies the policy filters, noises the averages, and queues one signed
//! bundle for that window. The window key makes the job idempotent: once a
//! bundle exists for a window it is never rebuilt, so reruns and catch-up
//! triggers are safe.

use std::sync::Arc;

use chrono::{DateTime, Days, Utc};
use uuid::Uuid;

use crate::db::{BundleStatus, DbOutboundBundle};
use crate::error::FederationError;
use crate::notify::FederationEvent;
use crate::payload::{canonical_payload, content_hash, DivisionSignal};
use crate::state::AppState;

/// What a build run did, for logs and run history.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub window_start: String,
    pub window_end: String,
    pub policy_disabled: bool,
    pub skipped_existing: bool,
    pub bundle_id: Option<String>,
    pub divisions: usize,
}

impl BuildOutcome {
    pub fn summary(&self) -> String {
        if self.policy_disabled {
            return "federation disabled, nothing built".to_string();
        }
        if self.skipped_existing {
            return format!("bundle already exists for window {}", self.window_start);
        }
        match &self.bundle_id {
            Some(id) => format!("queued {} with {} division(s)", id, self.divisions),
            None => "no eligible signals in window".to_string(),
        }
    }
}

/// The previous full UTC day: `[yesterday 00:00, today 00:00)`.
pub fn previous_day_window(now: DateTime<Utc>) -> (String, String) {
    let today = now.date_naive();
    let yesterday = today - Days::new(1);
    let start = yesterday.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    let end = today.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    (start.to_rfc3339(), end.to_rfc3339())
}

/// Build and queue the previous day's bundle.
pub async fn run(state: &Arc<AppState>) -> Result<BuildOutcome, FederationError> {
    let db = state.open_db()?;
    let (window_start, window_end) = previous_day_window(Utc::now());

    let mut outcome = BuildOutcome {
        window_start: window_start.clone(),
        window_end: window_end.clone(),
        policy_disabled: false,
        skipped_existing: false,
        bundle_id: None,
        divisions: 0,
    };

    let policy = db.get_policy()?;
    if !policy.enabled {
        log::info!("Bundle build skipped: federation is disabled");
        outcome.policy_disabled = true;
        return Ok(outcome);
    }
    // Bad privacy parameters reject the build before anything is signed
    policy.validate().map_err(FederationError::PolicyViolation)?;

    if db.get_bundle_for_window(&window_start, &window_end)?.is_some() {
        log::info!(
            "Bundle build skipped: window {} already built",
            window_start
        );
        outcome.skipped_existing = true;
        return Ok(outcome);
    }

    let aggregates = db.window_division_aggregates(&window_start, &window_end)?;
    let signals: Vec<DivisionSignal> = aggregates
        .into_iter()
        .filter(|agg| {
            policy.share_divisions.contains(&agg.division) && agg.sample_size >= policy.min_sample
        })
        .map(|agg| DivisionSignal {
            division: agg.division,
            impact_per_sc_avg: crate::privacy::apply_dp_noise(
                agg.impact_per_sc_avg,
                policy.dp_epsilon,
            ),
            sample_size: agg.sample_size,
        })
        .collect();

    if signals.is_empty() {
        log::info!(
            "Bundle build produced nothing: no division cleared policy for window {}",
            window_start
        );
        return Ok(outcome);
    }

    let payload = canonical_payload(&window_start, &window_end, &signals);
    let hash = content_hash(&payload);
    let signature = state.identity.sign_payload(payload.as_bytes());

    let now = Utc::now().to_rfc3339();
    let bundle = DbOutboundBundle {
        id: format!("bdl-{}", Uuid::new_v4()),
        window_start: window_start.clone(),
        window_end: window_end.clone(),
        payload,
        hash,
        signature,
        status: BundleStatus::Queued.as_str().to_string(),
        attempts: 0,
        last_error: None,
        created_at: now.clone(),
        updated_at: now,
    };
    db.insert_bundle(&bundle)?;

    log::info!(
        "Queued bundle {} for window {} with {} division(s)",
        bundle.id,
        window_start,
        signals.len()
    );
    state.notifier.emit(FederationEvent::BundleQueued {
        bundle_id: bundle.id.clone(),
        window_start,
        window_end,
        divisions: signals.len(),
    });

    outcome.bundle_id = Some(bundle.id);
    outcome.divisions = signals.len();
    Ok(outcome)
}
