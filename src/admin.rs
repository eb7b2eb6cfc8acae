//! Operator entry points (FED-96).
//!
//! Everything the admin surface can do to a running node, as plain library
//! functions over the shared state. Mutations validate before they touch the
//! store and log after; reads hand back the stored records as-is. Each call
//! opens its own database handle, so these are safe from any task.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{
    DbAuditEvent, DbDivisionWeight, DbInboundSignal, DbObservation, DbOutboundBundle, DbPeer,
    DbPolicy,
};
use crate::error::FederationError;
use crate::payload::valid_division;
use crate::peers::{self, ConnectivityReport};
use crate::state::AppState;
use crate::types::{ExecutionTrigger, JobId, JobRun};

/// Upper bound on rows a list call returns in one page.
const MAX_LIST_LIMIT: i64 = 500;

/// Replacement policy values. The policy is replaced whole; merging a partial
/// update into the current row is the caller's concern.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpdate {
    pub enabled: bool,
    pub share_divisions: Vec<String>,
    pub min_sample: i64,
    pub dp_epsilon: f64,
    pub max_daily_weight_drift: f64,
}

/// A local impact measurement to feed the next bundle build.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationInput {
    pub division: String,
    pub spend_sc: f64,
    pub impact_units: f64,
    /// RFC3339; defaults to now when absent.
    #[serde(default)]
    pub observed_at: Option<String>,
}

/// Receipt for a fire-and-forget job trigger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub job: JobId,
    pub requested_at: String,
}

/// What an operator hands to a peer administrator to register this node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_name: String,
    pub listen_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_url: Option<String>,
    pub public_key: String,
}

/// Register a new peer. Starts at neutral trust with both directions open.
pub fn add_peer(
    state: &Arc<AppState>,
    name: &str,
    base_url: &str,
    public_key: &str,
) -> Result<DbPeer, FederationError> {
    let db = state.open_db()?;
    peers::add_peer(&db, name, base_url, public_key)
}

/// Replace a peer's name, URL and key. Trust and flags carry over.
pub fn update_peer(
    state: &Arc<AppState>,
    peer_id: &str,
    name: &str,
    base_url: &str,
    public_key: &str,
) -> Result<DbPeer, FederationError> {
    let db = state.open_db()?;
    peers::update_peer(&db, peer_id, name, base_url, public_key)
}

/// Delete a peer and its delivery ledger. Returns the removed record.
pub fn remove_peer(state: &Arc<AppState>, peer_id: &str) -> Result<DbPeer, FederationError> {
    let db = state.open_db()?;
    let peer = db
        .get_peer(peer_id)?
        .ok_or_else(|| FederationError::NotFound(format!("No peer with id {}", peer_id)))?;
    db.delete_peer(peer_id)?;
    log::info!("Removed peer '{}'", peer.name);
    Ok(peer)
}

/// Flip a peer's send/recv flags. Enabling send also zeroes the failure
/// streak, so a peer recovered from an auto-disable starts clean.
pub fn set_peer_enabled(
    state: &Arc<AppState>,
    peer_id: &str,
    send_enabled: bool,
    recv_enabled: bool,
) -> Result<DbPeer, FederationError> {
    let db = state.open_db()?;
    if !db.set_peer_enabled(peer_id, send_enabled, recv_enabled)? {
        return Err(FederationError::NotFound(format!(
            "No peer with id {}",
            peer_id
        )));
    }
    if send_enabled {
        db.clear_failure_streak(peer_id)?;
    }
    let peer = db
        .get_peer(peer_id)?
        .ok_or_else(|| FederationError::NotFound(format!("No peer with id {}", peer_id)))?;
    log::info!(
        "Peer '{}' directions set: send={}, recv={}",
        peer.name,
        peer.send_enabled,
        peer.recv_enabled
    );
    Ok(peer)
}

/// Round-trip a signed challenge with a peer to prove its key.
pub async fn test_peer_connectivity(
    state: &Arc<AppState>,
    peer_id: &str,
) -> Result<ConnectivityReport, FederationError> {
    peers::test_connectivity(state, peer_id).await
}

pub fn list_peers(state: &Arc<AppState>) -> Result<Vec<DbPeer>, FederationError> {
    let db = state.open_db()?;
    Ok(db.list_peers()?)
}

pub fn get_policy(state: &Arc<AppState>) -> Result<DbPolicy, FederationError> {
    let db = state.open_db()?;
    Ok(db.get_policy()?)
}

/// Replace the sharing policy. Division names are normalized (trimmed,
/// deduplicated, sorted) and the numeric bounds are checked before anything
/// is written; a rejected update leaves the stored policy untouched.
pub fn update_policy(
    state: &Arc<AppState>,
    update: PolicyUpdate,
) -> Result<DbPolicy, FederationError> {
    let mut divisions = BTreeSet::new();
    for division in &update.share_divisions {
        let trimmed = division.trim();
        if !valid_division(trimmed) {
            return Err(FederationError::InvalidInput(format!(
                "'{}' is not a valid division name",
                division
            )));
        }
        divisions.insert(trimmed.to_string());
    }

    let policy = DbPolicy {
        enabled: update.enabled,
        share_divisions: divisions.into_iter().collect(),
        min_sample: update.min_sample,
        dp_epsilon: update.dp_epsilon,
        max_daily_weight_drift: update.max_daily_weight_drift,
        updated_at: Utc::now().to_rfc3339(),
    };
    policy.validate().map_err(FederationError::InvalidInput)?;

    let db = state.open_db()?;
    db.set_policy(&policy)?;
    log::info!(
        "Policy updated: enabled={}, sharing {} division(s)",
        policy.enabled,
        policy.share_divisions.len()
    );
    Ok(db.get_policy()?)
}

/// Ask the runner to execute a job soon. Returns immediately; the outcome
/// lands in `job_history` once the run finishes.
pub fn run_now(state: &Arc<AppState>, job: JobId) -> Result<RunRequest, FederationError> {
    state.trigger_job(job, ExecutionTrigger::Manual);
    Ok(RunRequest {
        job,
        requested_at: Utc::now().to_rfc3339(),
    })
}

/// Put a failed bundle back in the delivery queue, resetting its failed
/// per-peer ledger rows to a fresh attempt count.
pub fn requeue_bundle(
    state: &Arc<AppState>,
    bundle_id: &str,
) -> Result<DbOutboundBundle, FederationError> {
    let db = state.open_db()?;
    let bundle = db
        .get_bundle(bundle_id)?
        .ok_or_else(|| FederationError::NotFound(format!("No bundle with id {}", bundle_id)))?;
    if !db.requeue_bundle(bundle_id)? {
        return Err(FederationError::InvalidInput(format!(
            "Bundle {} is {}, only failed bundles can be requeued",
            bundle_id, bundle.status
        )));
    }
    log::info!("Requeued bundle {} for delivery", bundle_id);
    db.get_bundle(bundle_id)?
        .ok_or_else(|| FederationError::NotFound(format!("No bundle with id {}", bundle_id)))
}

pub fn list_bundles(
    state: &Arc<AppState>,
    limit: i64,
) -> Result<Vec<DbOutboundBundle>, FederationError> {
    let db = state.open_db()?;
    Ok(db.list_bundles(limit.clamp(1, MAX_LIST_LIMIT))?)
}

pub fn list_inbound_signals(
    state: &Arc<AppState>,
    limit: i64,
) -> Result<Vec<DbInboundSignal>, FederationError> {
    let db = state.open_db()?;
    Ok(db.list_inbound_signals(limit.clamp(1, MAX_LIST_LIMIT))?)
}

pub fn list_division_weights(
    state: &Arc<AppState>,
) -> Result<Vec<DbDivisionWeight>, FederationError> {
    let db = state.open_db()?;
    Ok(db.list_division_weights()?)
}

/// Store a local impact measurement. These feed the next bundle build for
/// their observation window.
pub fn record_observation(
    state: &Arc<AppState>,
    input: ObservationInput,
) -> Result<DbObservation, FederationError> {
    let division = input.division.trim().to_string();
    if !valid_division(&division) {
        return Err(FederationError::InvalidInput(format!(
            "'{}' is not a valid division name",
            input.division
        )));
    }
    if !input.spend_sc.is_finite() || input.spend_sc <= 0.0 {
        return Err(FederationError::InvalidInput(
            "Spend must be a positive amount of SC".to_string(),
        ));
    }
    if !input.impact_units.is_finite() || input.impact_units < 0.0 {
        return Err(FederationError::InvalidInput(
            "Impact units must be a non-negative number".to_string(),
        ));
    }
    let observed_at = match &input.observed_at {
        Some(raw) => chrono::DateTime::parse_from_rfc3339(raw)
            .map_err(|e| {
                FederationError::InvalidInput(format!("Invalid observedAt timestamp: {}", e))
            })?
            .with_timezone(&Utc)
            .to_rfc3339(),
        None => Utc::now().to_rfc3339(),
    };

    let obs = DbObservation {
        id: format!("obs-{}", Uuid::new_v4()),
        division,
        spend_sc: input.spend_sc,
        impact_units: input.impact_units,
        observed_at,
    };
    let db = state.open_db()?;
    db.insert_observation(&obs)?;
    Ok(obs)
}

pub fn recent_audit_events(
    state: &Arc<AppState>,
    limit: i64,
) -> Result<Vec<DbAuditEvent>, FederationError> {
    let db = state.open_db()?;
    Ok(db.recent_audit_events(limit.clamp(1, MAX_LIST_LIMIT))?)
}

/// Most recent job runs, newest first.
pub fn job_history(state: &Arc<AppState>, limit: usize) -> Vec<JobRun> {
    state.get_job_history(limit)
}

/// Identity and reachability details for this node.
pub fn node_info(state: &Arc<AppState>) -> NodeInfo {
    let config = state.config_snapshot();
    NodeInfo {
        node_name: config.node_name,
        listen_addr: config.listen_addr,
        advertise_url: config.advertise_url,
        public_key: state.identity.public_key_b64(),
    }
}
