//! Global prior merge engine (FED-73).
//!
//! Folds verified peer signals into the local division learning weights. The
//! pull toward the federation mean is deliberately slow: a fixed learning
//! rate, and a cumulative 24h drift budget per division so no single day of
//! peer traffic can move a weight by more than the configured fraction. Each
//! division commits atomically; a division that cannot take the write lock is
//! skipped for the run, never half-applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::db::{DbError, FederationDb};
use crate::error::FederationError;
use crate::notify::FederationEvent;
use crate::state::AppState;

pub const MERGE_LEARNING_RATE: f64 = 0.25;
pub const MERGE_LOOKBACK_DAYS: i64 = 7;
pub const DRIFT_WINDOW_HOURS: i64 = 24;
/// Fraction of the previous trend retained per update.
pub const TREND_SMOOTHING: f64 = 0.7;
pub const DEFAULT_IMPACT_WEIGHT: f64 = 1.0;
pub const MIN_IMPACT_WEIGHT: f64 = 0.01;

/// What a merge run did, for logs and run history.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub policy_disabled: bool,
    pub aborted_mid_run: bool,
    pub signals_consumed: usize,
    pub divisions_updated: usize,
    pub divisions_skipped: usize,
}

impl MergeOutcome {
    pub fn summary(&self) -> String {
        if self.policy_disabled {
            return "federation disabled, nothing merged".to_string();
        }
        let mut text = format!(
            "consumed {} signal(s), updated {} division(s)",
            self.signals_consumed, self.divisions_updated
        );
        if self.divisions_skipped > 0 {
            text.push_str(&format!(", {} busy", self.divisions_skipped));
        }
        if self.aborted_mid_run {
            text.push_str(", aborted after disable");
        }
        text
    }
}

#[derive(Debug, Default)]
struct DivisionAccumulator {
    weighted_sum: f64,
    weight_total: f64,
}

/// Merge unconsumed verified signals into the division weights.
pub async fn run(state: &Arc<AppState>) -> Result<MergeOutcome, FederationError> {
    let db = state.open_db()?;
    let mut outcome = MergeOutcome::default();

    let policy = db.get_policy()?;
    if !policy.enabled {
        log::info!("Merge skipped: federation is disabled");
        outcome.policy_disabled = true;
        return Ok(outcome);
    }
    policy.validate().map_err(FederationError::Misconfigured)?;

    let since = (Utc::now() - chrono::Duration::days(MERGE_LOOKBACK_DAYS)).to_rfc3339();
    let rows = db.unmerged_valid_signals(&since)?;
    if rows.is_empty() {
        return Ok(outcome);
    }
    outcome.signals_consumed = rows.len();

    // Trust-weighted aggregation. BTreeMap keeps division order stable run to
    // run.
    let mut groups: BTreeMap<String, DivisionAccumulator> = BTreeMap::new();
    for row in &rows {
        let entries = match row.signals() {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Stored signal {} has unreadable entries: {}", row.id, e);
                continue;
            }
        };
        for entry in entries {
            if !policy.share_divisions.contains(&entry.division) {
                continue;
            }
            if entry.sample_size < policy.min_sample {
                continue;
            }
            let weight = row.peer_trust * entry.sample_size as f64;
            let acc = groups.entry(entry.division).or_default();
            acc.weighted_sum += weight * entry.impact_per_sc_avg;
            acc.weight_total += weight;
        }
    }

    for (division, acc) in &groups {
        // The kill switch is honored between divisions, not just at the start
        let live = db.get_policy()?;
        if !live.enabled {
            log::info!("Merge aborted: federation disabled mid-run");
            outcome.aborted_mid_run = true;
            break;
        }
        if acc.weight_total <= 0.0 {
            continue;
        }
        let global_mean = acc.weighted_sum / acc.weight_total;
        match merge_division(&db, division, global_mean, live.max_daily_weight_drift) {
            Ok(Some((old_weight, new_weight))) => {
                outcome.divisions_updated += 1;
                log::info!(
                    "Division '{}' weight {:.4} -> {:.4} (federation mean {:.4})",
                    division,
                    old_weight,
                    new_weight,
                    global_mean
                );
                state.notifier.emit(FederationEvent::WeightUpdated {
                    division: division.clone(),
                    old_weight,
                    new_weight,
                });
            }
            Ok(None) => {}
            Err(e) if e.is_busy() => {
                outcome.divisions_skipped += 1;
                log::info!("Division '{}' is locked by another merge, skipping", division);
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Consumption is per run: every selected signal is stamped, whether or
    // not its divisions survived filtering or the run aborted mid-way.
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let merged_at = Utc::now().to_rfc3339();
    db.mark_signals_merged(&ids, &merged_at)?;

    state.notifier.emit(FederationEvent::SignalsMerged {
        divisions_updated: outcome.divisions_updated,
        signals_consumed: outcome.signals_consumed,
    });
    Ok(outcome)
}

/// Apply one division's clamped delta inside a single write transaction.
///
/// Budget bookkeeping reads the trailing 24h of the drift ledger: the budget
/// is anchored to the weight at the start of that window, and what earlier
/// merges already spent (in absolute terms) comes off the top. Returns the
/// old and new weight when the weight actually moved.
fn merge_division(
    db: &FederationDb,
    division: &str,
    global_mean: f64,
    max_drift: f64,
) -> Result<Option<(f64, f64)>, DbError> {
    db.with_transaction(|db| {
        let existing = db.get_division_weight(division)?;
        let (current, prev_trend) = existing
            .map(|w| (w.impact_weight, w.trend))
            .unwrap_or((DEFAULT_IMPACT_WEIGHT, 0.0));

        let window_start = (Utc::now() - chrono::Duration::hours(DRIFT_WINDOW_HOURS)).to_rfc3339();
        let (signed_total, abs_total) = db.drift_totals(division, &window_start)?;
        let weight_at_window_start = current - signed_total;
        let budget = (weight_at_window_start * max_drift).max(0.0);
        let remaining = (budget - abs_total).max(0.0);

        let proposed = (global_mean - current) * MERGE_LEARNING_RATE;
        let clamped = proposed.clamp(-remaining, remaining);
        let new_weight = (current + clamped).max(MIN_IMPACT_WEIGHT);
        let applied = new_weight - current;
        let trend = TREND_SMOOTHING * prev_trend + (1.0 - TREND_SMOOTHING) * applied;

        if applied != 0.0 {
            db.insert_drift_entry(division, applied, current)?;
        }
        db.upsert_division_weight(division, new_weight, trend)?;

        Ok(if applied != 0.0 {
            Some((current, new_weight))
        } else {
            None
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbInboundSignal;
    use crate::db::DbPolicy;
    use crate::payload::{canonical_payload, content_hash, DivisionSignal};
    use uuid::Uuid;

    fn temp_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(AppState::for_tests(dir.path()));
        std::mem::forget(dir);
        state
    }

    fn set_policy(
        state: &Arc<AppState>,
        enabled: bool,
        divisions: &[&str],
        min_sample: i64,
        max_drift: f64,
    ) {
        let db = state.open_db().expect("db");
        db.set_policy(&DbPolicy {
            enabled,
            share_divisions: divisions.iter().map(|d| d.to_string()).collect(),
            min_sample,
            dp_epsilon: 1.0,
            max_daily_weight_drift: max_drift,
            updated_at: Utc::now().to_rfc3339(),
        })
        .expect("set policy");
    }

    fn add_peer(state: &Arc<AppState>, name: &str) -> String {
        let db = state.open_db().expect("db");
        let peer = crate::peers::add_peer(
            &db,
            name,
            "http://127.0.0.1:9",
            &state.identity.public_key_b64(),
        )
        .expect("add peer");
        peer.id
    }

    fn seed_signal(
        state: &Arc<AppState>,
        peer_id: &str,
        window_start: &str,
        entries: &[(&str, f64, i64)],
        trust: f64,
        received_at: &str,
    ) -> String {
        let signals: Vec<DivisionSignal> = entries
            .iter()
            .map(|(division, value, sample)| DivisionSignal {
                division: division.to_string(),
                impact_per_sc_avg: *value,
                sample_size: *sample,
            })
            .collect();
        let window_end = window_start.replace("T00:00:00", "T23:59:59");
        let payload = canonical_payload(window_start, &window_end, &signals);
        let row = DbInboundSignal {
            id: format!("sig-{}", Uuid::new_v4()),
            peer_id: peer_id.to_string(),
            window_start: window_start.to_string(),
            window_end,
            signals_json: serde_json::to_string(&signals).expect("encode"),
            hash: content_hash(&payload),
            signature: "dGVzdA==".to_string(),
            signature_valid: true,
            peer_trust: trust,
            summary_strength: 0.5,
            received_at: received_at.to_string(),
            merged_at: None,
        };
        let db = state.open_db().expect("db");
        db.insert_inbound_signal(&row).expect("insert signal");
        row.id
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    #[tokio::test]
    async fn test_merge_pulls_weight_toward_peer_mean_with_drift_cap() {
        let state = temp_state();
        set_policy(&state, true, &["health"], 1, 0.2);
        let peer = add_peer(&state, "ally");
        seed_signal(
            &state,
            &peer,
            "2026-08-20T00:00:00+00:00",
            &[("health", 2.0, 100)],
            50.0,
            &now(),
        );

        let outcome = run(&state).await.expect("merge");
        assert_eq!(outcome.signals_consumed, 1);
        assert_eq!(outcome.divisions_updated, 1);

        let db = state.open_db().expect("db");
        let weight = db
            .get_division_weight("health")
            .expect("get")
            .expect("exists");
        // Proposed 0.25 capped to the 0.2 daily budget
        assert!((weight.impact_weight - 1.2).abs() < 1e-9);
        assert!((weight.trend - 0.06).abs() < 1e-9);

        // The contributing signal is consumed exactly once
        let signals = db.list_inbound_signals(10).expect("list");
        assert!(signals[0].merged_at.is_some());
        let again = run(&state).await.expect("second merge");
        assert_eq!(again.signals_consumed, 0);
        let weight = db
            .get_division_weight("health")
            .expect("get")
            .expect("exists");
        assert!((weight.impact_weight - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_merge_drift_budget_is_cumulative_within_day() {
        let state = temp_state();
        set_policy(&state, true, &["health"], 1, 0.2);
        let peer = add_peer(&state, "ally");
        seed_signal(
            &state,
            &peer,
            "2026-08-19T00:00:00+00:00",
            &[("health", 2.0, 100)],
            50.0,
            &now(),
        );
        run(&state).await.expect("first merge");

        // Same day, fresh signal: the first merge already spent the budget
        seed_signal(
            &state,
            &peer,
            "2026-08-20T00:00:00+00:00",
            &[("health", 2.0, 100)],
            50.0,
            &now(),
        );
        let outcome = run(&state).await.expect("second merge");
        assert_eq!(outcome.signals_consumed, 1);
        assert_eq!(outcome.divisions_updated, 0);

        let db = state.open_db().expect("db");
        let weight = db
            .get_division_weight("health")
            .expect("get")
            .expect("exists");
        assert!((weight.impact_weight - 1.2).abs() < 1e-9);
        // Ledger only records real movement
        let since = "2000-01-01T00:00:00+00:00";
        let (signed, abs) = db.drift_totals("health", since).expect("totals");
        assert!((signed - 0.2).abs() < 1e-9);
        assert!((abs - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_merge_weights_mean_by_trust_and_sample() {
        let state = temp_state();
        set_policy(&state, true, &["health"], 1, 1.0);
        let strong = add_peer(&state, "strong");
        let weak = add_peer(&state, "weak");
        seed_signal(
            &state,
            &strong,
            "2026-08-20T00:00:00+00:00",
            &[("health", 3.0, 50)],
            80.0,
            &now(),
        );
        seed_signal(
            &state,
            &weak,
            "2026-08-20T00:00:00+00:00",
            &[("health", 1.0, 50)],
            20.0,
            &now(),
        );

        run(&state).await.expect("merge");

        // Mean = (4000*3 + 1000*1) / 5000 = 2.6; delta = 1.6 * 0.25
        let db = state.open_db().expect("db");
        let weight = db
            .get_division_weight("health")
            .expect("get")
            .expect("exists");
        assert!((weight.impact_weight - 1.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_merge_filters_low_samples_and_zero_trust() {
        let state = temp_state();
        set_policy(&state, true, &["health"], 10, 1.0);
        let ally = add_peer(&state, "ally");
        let silenced = add_peer(&state, "silenced");

        // Counts: trust 50, sample 50, value 2.0
        seed_signal(
            &state,
            &ally,
            "2026-08-20T00:00:00+00:00",
            &[("health", 2.0, 50)],
            50.0,
            &now(),
        );
        // Below min_sample
        seed_signal(
            &state,
            &ally,
            "2026-08-19T00:00:00+00:00",
            &[("health", 50.0, 3)],
            50.0,
            &now(),
        );
        // Zero trust carries zero weight
        seed_signal(
            &state,
            &silenced,
            "2026-08-20T00:00:00+00:00",
            &[("health", 100.0, 50)],
            0.0,
            &now(),
        );

        let outcome = run(&state).await.expect("merge");
        assert_eq!(outcome.signals_consumed, 3);

        let db = state.open_db().expect("db");
        let weight = db
            .get_division_weight("health")
            .expect("get")
            .expect("exists");
        // Mean is exactly 2.0: the noisy outliers contributed nothing
        assert!((weight.impact_weight - 1.25).abs() < 1e-9);

        // All three rows consumed regardless
        let signals = db.list_inbound_signals(10).expect("list");
        assert!(signals.iter().all(|s| s.merged_at.is_some()));
    }

    #[tokio::test]
    async fn test_merge_unshared_division_consumed_but_not_applied() {
        let state = temp_state();
        set_policy(&state, true, &["health"], 1, 1.0);
        let peer = add_peer(&state, "ally");
        seed_signal(
            &state,
            &peer,
            "2026-08-20T00:00:00+00:00",
            &[("covert", 9.0, 50)],
            50.0,
            &now(),
        );

        let outcome = run(&state).await.expect("merge");
        assert_eq!(outcome.signals_consumed, 1);
        assert_eq!(outcome.divisions_updated, 0);

        let db = state.open_db().expect("db");
        assert!(db.get_division_weight("covert").expect("get").is_none());
        let signals = db.list_inbound_signals(10).expect("list");
        assert!(signals[0].merged_at.is_some());
    }

    #[tokio::test]
    async fn test_merge_disabled_leaves_signals_untouched() {
        let state = temp_state();
        set_policy(&state, false, &["health"], 1, 0.2);
        let peer = add_peer(&state, "ally");
        seed_signal(
            &state,
            &peer,
            "2026-08-20T00:00:00+00:00",
            &[("health", 2.0, 100)],
            50.0,
            &now(),
        );

        let outcome = run(&state).await.expect("merge");
        assert!(outcome.policy_disabled);

        let db = state.open_db().expect("db");
        let signals = db.list_inbound_signals(10).expect("list");
        assert!(signals[0].merged_at.is_none());
        assert!(db.get_division_weight("health").expect("get").is_none());
    }

    #[tokio::test]
    async fn test_merge_invalid_policy_halts_without_consuming() {
        let state = temp_state();
        let db = state.open_db().expect("db");
        db.set_policy(&DbPolicy {
            enabled: true,
            share_divisions: vec!["health".to_string()],
            min_sample: 1,
            dp_epsilon: 0.0,
            max_daily_weight_drift: 0.2,
            updated_at: Utc::now().to_rfc3339(),
        })
        .expect("set policy");
        let peer = add_peer(&state, "ally");
        seed_signal(
            &state,
            &peer,
            "2026-08-20T00:00:00+00:00",
            &[("health", 2.0, 100)],
            50.0,
            &now(),
        );

        let result = run(&state).await;
        assert!(matches!(result, Err(FederationError::Misconfigured(_))));
        let signals = db.list_inbound_signals(10).expect("list");
        assert!(signals[0].merged_at.is_none());
    }

    #[tokio::test]
    async fn test_merge_lookback_excludes_stale_signals() {
        let state = temp_state();
        set_policy(&state, true, &["health"], 1, 0.2);
        let peer = add_peer(&state, "ally");
        let stale = (Utc::now() - chrono::Duration::days(8)).to_rfc3339();
        seed_signal(
            &state,
            &peer,
            "2026-08-10T00:00:00+00:00",
            &[("health", 2.0, 100)],
            50.0,
            &stale,
        );

        let outcome = run(&state).await.expect("merge");
        assert_eq!(outcome.signals_consumed, 0);

        let db = state.open_db().expect("db");
        assert!(db.get_division_weight("health").expect("get").is_none());
    }

    #[tokio::test]
    async fn test_merge_floors_weight_and_records_actual_delta() {
        let state = temp_state();
        set_policy(&state, true, &["health"], 1, 1.0);
        let peer = add_peer(&state, "ally");
        let db = state.open_db().expect("db");
        db.upsert_division_weight("health", 0.012, 0.0)
            .expect("seed weight");
        seed_signal(
            &state,
            &peer,
            "2026-08-20T00:00:00+00:00",
            &[("health", 0.0, 100)],
            50.0,
            &now(),
        );

        run(&state).await.expect("merge");

        let weight = db
            .get_division_weight("health")
            .expect("get")
            .expect("exists");
        assert!((weight.impact_weight - MIN_IMPACT_WEIGHT).abs() < 1e-12);

        // The ledger holds the applied delta, not the pre-floor proposal
        let since = "2000-01-01T00:00:00+00:00";
        let (signed, _) = db.drift_totals("health", since).expect("totals");
        assert!((signed - (MIN_IMPACT_WEIGHT - 0.012)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_merge_trend_is_smoothed() {
        let state = temp_state();
        set_policy(&state, true, &["health"], 1, 0.2);
        let peer = add_peer(&state, "ally");
        let db = state.open_db().expect("db");
        db.upsert_division_weight("health", 1.0, 0.5)
            .expect("seed weight");
        seed_signal(
            &state,
            &peer,
            "2026-08-20T00:00:00+00:00",
            &[("health", 2.0, 100)],
            50.0,
            &now(),
        );

        run(&state).await.expect("merge");

        let weight = db
            .get_division_weight("health")
            .expect("get")
            .expect("exists");
        // 0.7 * 0.5 + 0.3 * 0.2
        assert!((weight.trend - 0.41).abs() < 1e-9);
    }
}
