//! Peer registry operations and trust bookkeeping (FED-102).
//!
//! Trust is a bounded score in [0, 100], nudged by observed behavior:
//! successful exchanges reward a little, failures cost more. The asymmetry
//! means a peer has to be reliable for a while to earn back what one bad
//! stretch costs. Five consecutive delivery failures force `send_enabled`
//! off until an operator re-enables the peer.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::db::{audit, DbPeer, FederationDb};
use crate::error::FederationError;
use crate::notify::FederationEvent;
use crate::payload::{ChallengeRequest, ChallengeResponse};
use crate::state::AppState;

/// Trust reward for a verified connectivity test.
pub const TRUST_CONNECT_REWARD: f64 = 2.0;
/// Trust reward for an acknowledged bundle delivery.
pub const TRUST_DELIVERY_REWARD: f64 = 1.0;
/// Trust cost of a failed delivery attempt.
pub const TRUST_FAILURE_DECAY: f64 = 5.0;
/// Consecutive delivery failures before a peer loses send eligibility.
pub const MAX_CONSECUTIVE_DELIVERY_FAILURES: i64 = 5;

/// Timeout for a connectivity challenge round-trip (seconds).
const CHALLENGE_TIMEOUT_SECS: u64 = 10;

/// Outcome of a connectivity test, shaped for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityReport {
    pub peer_id: String,
    pub reachable: bool,
    pub signature_valid: bool,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Validate a peer base URL: http(s) with a host, nothing else.
pub fn validate_base_url(base_url: &str) -> Result<Url, FederationError> {
    let parsed = Url::parse(base_url)
        .map_err(|e| FederationError::InvalidInput(format!("Invalid base URL: {}", e)))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(FederationError::InvalidInput(format!(
            "Base URL must be http or https, got {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(FederationError::InvalidInput(
            "Base URL must include a host".to_string(),
        ));
    }
    Ok(parsed)
}

fn validate_peer_name(name: &str) -> Result<(), FederationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(FederationError::InvalidInput(
            "Peer name cannot be empty".to_string(),
        ));
    }
    if trimmed.len() > 64 {
        return Err(FederationError::InvalidInput(
            "Peer name is limited to 64 characters".to_string(),
        ));
    }
    Ok(())
}

/// Register a peer. New peers start at neutral trust (50) with both
/// directions enabled.
pub fn add_peer(
    db: &FederationDb,
    name: &str,
    base_url: &str,
    public_key: &str,
) -> Result<DbPeer, FederationError> {
    validate_peer_name(name)?;
    validate_base_url(base_url)?;
    crate::keys::parse_public_key(public_key)?;

    if db.get_peer_by_name(name)?.is_some() {
        return Err(FederationError::InvalidInput(format!(
            "A peer named '{}' already exists",
            name.trim()
        )));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let peer = DbPeer {
        id: format!("peer-{}", Uuid::new_v4()),
        name: name.trim().to_string(),
        base_url: base_url.trim_end_matches('/').to_string(),
        public_key: public_key.trim().to_string(),
        trust_score: 50.0,
        send_enabled: true,
        recv_enabled: true,
        last_seen: None,
        consecutive_failures: 0,
        created_at: now.clone(),
        updated_at: now,
    };
    db.insert_peer(&peer)?;
    log::info!("Registered peer '{}' at {}", peer.name, peer.base_url);
    Ok(peer)
}

/// Re-register a peer's connection details. Trust, direction flags and the
/// failure streak are untouched; rotating a key does not reset standing.
pub fn update_peer(
    db: &FederationDb,
    peer_id: &str,
    name: &str,
    base_url: &str,
    public_key: &str,
) -> Result<DbPeer, FederationError> {
    validate_peer_name(name)?;
    validate_base_url(base_url)?;
    crate::keys::parse_public_key(public_key)?;

    if let Some(existing) = db.get_peer_by_name(name.trim())? {
        if existing.id != peer_id {
            return Err(FederationError::InvalidInput(format!(
                "A peer named '{}' already exists",
                name.trim()
            )));
        }
    }

    let updated = db.update_peer(
        peer_id,
        name.trim(),
        base_url.trim_end_matches('/'),
        public_key.trim(),
    )?;
    if !updated {
        return Err(FederationError::NotFound(format!(
            "No peer with id {}",
            peer_id
        )));
    }
    db.get_peer(peer_id)?
        .ok_or_else(|| FederationError::NotFound(format!("No peer with id {}", peer_id)))
}

/// Reward an acknowledged delivery and clear the failure streak.
pub fn record_send_success(db: &FederationDb, peer_id: &str) -> Result<(), FederationError> {
    db.apply_trust_delta(peer_id, TRUST_DELIVERY_REWARD)?;
    db.record_peer_success(peer_id)?;
    Ok(())
}

/// Penalize a failed delivery attempt. Crossing the consecutive-failure
/// threshold force-disables sending and leaves an audit trail.
pub fn record_send_failure(
    db: &FederationDb,
    state: &AppState,
    peer_id: &str,
    error: &str,
) -> Result<(), FederationError> {
    db.apply_trust_delta(peer_id, -TRUST_FAILURE_DECAY)?;
    let failures = match db.record_peer_failure(peer_id)? {
        Some(count) => count,
        None => return Ok(()),
    };

    if failures >= MAX_CONSECUTIVE_DELIVERY_FAILURES {
        let peer = db.get_peer(peer_id)?;
        let still_enabled = peer.as_ref().map(|p| p.send_enabled).unwrap_or(false);
        if still_enabled {
            db.force_send_disabled(peer_id)?;
            db.insert_audit_event(
                audit::AUDIT_PEER_AUTO_DISABLED,
                Some(peer_id),
                &format!(
                    "{} consecutive delivery failures, last: {}",
                    failures, error
                ),
            )?;
            let name = peer.map(|p| p.name).unwrap_or_else(|| peer_id.to_string());
            log::warn!(
                "Peer '{}' disabled for sending after {} consecutive failures",
                name,
                failures
            );
            state
                .notifier
                .emit(FederationEvent::PeerAutoDisabled { peer: name });
        }
    }
    Ok(())
}

/// Challenge a peer to prove it holds the registered key.
///
/// Sends a random nonce to the peer's challenge endpoint and verifies the
/// signed response. A verified round-trip rewards trust and stamps
/// `last_seen`; failures are reported but don't touch the trust score.
pub async fn test_connectivity(
    state: &Arc<AppState>,
    peer_id: &str,
) -> Result<ConnectivityReport, FederationError> {
    let db = state.open_db()?;
    let peer = db
        .get_peer(peer_id)?
        .ok_or_else(|| FederationError::NotFound(format!("No peer with id {}", peer_id)))?;

    let nonce = Uuid::new_v4().to_string();
    let request = ChallengeRequest {
        peer: state.config_snapshot().node_name,
        nonce: nonce.clone(),
    };
    let url = format!("{}/federation/challenge", peer.base_url);

    let client = reqwest::Client::new();
    let started = Instant::now();
    let response = client
        .post(&url)
        .timeout(std::time::Duration::from_secs(CHALLENGE_TIMEOUT_SECS))
        .json(&request)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            return Ok(ConnectivityReport {
                peer_id: peer.id,
                reachable: false,
                signature_valid: false,
                latency_ms: None,
                error: Some(format!("Request failed: {}", e)),
            });
        }
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status();
    if !status.is_success() {
        return Ok(ConnectivityReport {
            peer_id: peer.id,
            reachable: false,
            signature_valid: false,
            latency_ms: Some(latency_ms),
            error: Some(format!("Challenge endpoint returned {}", status)),
        });
    }

    let answer: ChallengeResponse = match response.json().await {
        Ok(answer) => answer,
        Err(e) => {
            return Ok(ConnectivityReport {
                peer_id: peer.id,
                reachable: true,
                signature_valid: false,
                latency_ms: Some(latency_ms),
                error: Some(format!("Malformed challenge response: {}", e)),
            });
        }
    };

    let signature_valid = answer.nonce == nonce
        && crate::keys::verify_challenge(&peer.public_key, &nonce, &answer.signature);

    if signature_valid {
        db.apply_trust_delta(&peer.id, TRUST_CONNECT_REWARD)?;
        db.record_peer_success(&peer.id)?;
        log::info!("Connectivity verified for peer '{}' in {}ms", peer.name, latency_ms);
    } else {
        log::warn!(
            "Peer '{}' answered the challenge with an invalid signature",
            peer.name
        );
    }

    Ok(ConnectivityReport {
        peer_id: peer.id,
        reachable: true,
        signature_valid,
        latency_ms: Some(latency_ms),
        error: None,
    })
}
