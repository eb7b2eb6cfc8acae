//! Inbound federation receiver (FED-61).
//!
//! HTTP surface for peer traffic: bundle ingest and the identity challenge.
//! Verification recomputes the canonical payload locally, so a sender can
//! never make us verify bytes we did not derive ourselves. Invalid signatures
//! are stored as audit records rather than dropped; the merge engine never
//! reads them.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::db::{audit, DbInboundSignal, FederationDb};
use crate::error::FederationError;
use crate::keys::verify_signature;
use crate::notify::FederationEvent;
use crate::payload::{
    canonical_payload, content_hash, valid_division, BundleAck, BundleRequest, ChallengeRequest,
    ChallengeResponse,
};
use crate::state::AppState;

/// Sample size at which a peer's summary reaches full strength.
pub const SAMPLE_NORM: i64 = 100;

/// Influence of a received summary: normalized sample size scaled by the
/// peer's trust. Trust 0 zeroes the summary out entirely.
pub fn summary_strength(total_sample: i64, trust_score: f64) -> f64 {
    let sample = total_sample.clamp(0, SAMPLE_NORM) as f64 / SAMPLE_NORM as f64;
    sample * (trust_score / 100.0)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/federation/bundle", post(receive_bundle))
        .route("/federation/challenge", post(receive_challenge))
        .with_state(state)
}

// Extract as Value first: serde field errors then map to a plain 400 instead
// of axum's 422.
async fn receive_bundle(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let request: BundleRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(FederationError::InvalidInput(format!(
                "malformed bundle request: {}",
                e
            )))
        }
    };
    match ingest_bundle(&state, &request) {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn receive_challenge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let request: ChallengeRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(FederationError::InvalidInput(format!(
                "malformed challenge request: {}",
                e
            )))
        }
    };
    match answer_challenge(&state, &request) {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: FederationError) -> Response {
    let status = match &err {
        FederationError::InvalidInput(_) | FederationError::PolicyViolation(_) => {
            StatusCode::BAD_REQUEST
        }
        FederationError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        FederationError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("Receiver error: {}", err);
    }
    (status, Json(json!({ "ok": false, "error": err.to_string() }))).into_response()
}

fn validate_bundle_request(request: &BundleRequest) -> Result<(), FederationError> {
    if request.peer.trim().is_empty() {
        return Err(FederationError::InvalidInput(
            "peer name is required".to_string(),
        ));
    }
    for field in [&request.window_start, &request.window_end] {
        DateTime::parse_from_rfc3339(field).map_err(|_| {
            FederationError::InvalidInput(format!("invalid window timestamp: {}", field))
        })?;
    }
    if request.window_start >= request.window_end {
        return Err(FederationError::InvalidInput(
            "window_start must precede window_end".to_string(),
        ));
    }
    if request.signals.is_empty() {
        return Err(FederationError::InvalidInput(
            "bundle carries no signals".to_string(),
        ));
    }
    for signal in &request.signals {
        if !valid_division(&signal.division) {
            return Err(FederationError::InvalidInput(format!(
                "invalid division name: {:?}",
                signal.division
            )));
        }
        if signal.sample_size < 0 {
            return Err(FederationError::InvalidInput(
                "negative sample_size".to_string(),
            ));
        }
        if !signal.impact_per_sc_avg.is_finite() {
            return Err(FederationError::InvalidInput(
                "impact_per_sc_avg must be finite".to_string(),
            ));
        }
    }
    Ok(())
}

/// Store one peer bundle, verifying origin and content honesty.
pub fn ingest_bundle(
    state: &AppState,
    request: &BundleRequest,
) -> Result<BundleAck, FederationError> {
    validate_bundle_request(request)?;
    let db = state.open_db()?;

    let peer = match db.get_peer_by_name(&request.peer)? {
        Some(peer) => peer,
        None => {
            reject_bundle(&db, None, &request.peer, "unknown peer")?;
            return Err(FederationError::NotAuthorized(format!(
                "unknown peer '{}'",
                request.peer
            )));
        }
    };
    if !peer.recv_enabled {
        reject_bundle(&db, Some(&peer.id), &peer.name, "receiving disabled")?;
        return Err(FederationError::NotAuthorized(format!(
            "receiving from '{}' is disabled",
            peer.name
        )));
    }

    // The hash must match the payload we would canonicalize ourselves; it is
    // part of the dedupe key and has to be honest.
    let canonical = canonical_payload(&request.window_start, &request.window_end, &request.signals);
    if content_hash(&canonical) != request.hash {
        return Err(FederationError::InvalidInput(
            "content hash does not match canonical payload".to_string(),
        ));
    }

    let signature_valid =
        verify_signature(&peer.public_key, canonical.as_bytes(), &request.signature);

    if db.inbound_signal_exists(&peer.id, &request.window_start, &request.window_end, &request.hash)?
    {
        log::info!(
            "Duplicate bundle from '{}' for window {}",
            peer.name,
            request.window_start
        );
        return Ok(BundleAck {
            ok: true,
            duplicate: true,
            signature_valid,
        });
    }

    let total_sample: i64 = request.signals.iter().map(|s| s.sample_size).sum();
    let signal = DbInboundSignal {
        id: format!("sig-{}", Uuid::new_v4()),
        peer_id: peer.id.clone(),
        window_start: request.window_start.clone(),
        window_end: request.window_end.clone(),
        signals_json: serde_json::to_string(&request.signals)?,
        hash: request.hash.clone(),
        signature: request.signature.clone(),
        signature_valid,
        peer_trust: peer.trust_score,
        summary_strength: summary_strength(total_sample, peer.trust_score),
        received_at: Utc::now().to_rfc3339(),
        merged_at: None,
    };
    db.insert_inbound_signal(&signal)?;

    if signature_valid {
        log::info!(
            "Received bundle from '{}' for window {} ({} division(s))",
            peer.name,
            request.window_start,
            request.signals.len()
        );
    } else {
        let detail = format!(
            "signature did not verify for window {} (hash {})",
            request.window_start, request.hash
        );
        db.insert_audit_event(audit::AUDIT_SIGNATURE_INVALID, Some(&peer.id), &detail)?;
        log::warn!("Security event from '{}': {}", peer.name, detail);
        state.notifier.emit(FederationEvent::SecurityEvent {
            peer: peer.name.clone(),
            detail,
        });
    }
    state.notifier.emit(FederationEvent::SignalReceived {
        peer: peer.name,
        window_start: request.window_start.clone(),
        signature_valid,
    });

    Ok(BundleAck {
        ok: true,
        duplicate: false,
        signature_valid,
    })
}

fn reject_bundle(
    db: &FederationDb,
    peer_id: Option<&str>,
    claimed_name: &str,
    reason: &str,
) -> Result<(), FederationError> {
    let detail = format!("bundle from '{}' rejected: {}", claimed_name, reason);
    db.insert_audit_event(audit::AUDIT_BUNDLE_REJECTED, peer_id, &detail)?;
    log::warn!("{}", detail);
    Ok(())
}

/// Prove this node holds its signing key. The prefix ties the signature to
/// the challenge protocol, never to bundle content.
pub fn answer_challenge(
    state: &AppState,
    request: &ChallengeRequest,
) -> Result<ChallengeResponse, FederationError> {
    if request.nonce.trim().is_empty() || request.nonce.len() > 128 {
        return Err(FederationError::InvalidInput(
            "nonce must be 1..=128 characters".to_string(),
        ));
    }
    log::debug!("Answering challenge from '{}'", request.peer);
    Ok(ChallengeResponse {
        nonce: request.nonce.clone(),
        signature: state.identity.sign_challenge(&request.nonce),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NodeIdentity;
    use crate::payload::DivisionSignal;

    fn temp_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(AppState::for_tests(dir.path()));
        std::mem::forget(dir);
        state
    }

    fn peer_identity() -> NodeIdentity {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = NodeIdentity::load_or_generate(dir.path()).expect("identity");
        std::mem::forget(dir);
        identity
    }

    fn signed_request(identity: &NodeIdentity, peer_name: &str) -> BundleRequest {
        let signals = vec![
            DivisionSignal {
                division: "health".to_string(),
                impact_per_sc_avg: 2.5,
                sample_size: 12,
            },
            DivisionSignal {
                division: "education".to_string(),
                impact_per_sc_avg: 1.75,
                sample_size: 30,
            },
        ];
        let window_start = "2026-08-20T00:00:00+00:00".to_string();
        let window_end = "2026-08-21T00:00:00+00:00".to_string();
        let payload = canonical_payload(&window_start, &window_end, &signals);
        BundleRequest {
            peer: peer_name.to_string(),
            window_start,
            window_end,
            hash: content_hash(&payload),
            signature: identity.sign_payload(payload.as_bytes()),
            signals,
        }
    }

    fn register_peer(state: &Arc<AppState>, identity: &NodeIdentity, name: &str) -> String {
        let db = state.open_db().expect("db");
        let peer = crate::peers::add_peer(
            &db,
            name,
            "http://127.0.0.1:9",
            &identity.public_key_b64(),
        )
        .expect("add peer");
        peer.id
    }

    #[test]
    fn test_summary_strength_scales_with_sample_and_trust() {
        assert!((summary_strength(50, 80.0) - 0.4).abs() < 1e-9);
        assert!((summary_strength(200, 100.0) - 1.0).abs() < 1e-9);
        assert_eq!(summary_strength(50, 0.0), 0.0);
        assert_eq!(summary_strength(-3, 90.0), 0.0);
    }

    #[test]
    fn test_ingest_stores_verified_bundle() {
        let state = temp_state();
        let identity = peer_identity();
        let peer_id = register_peer(&state, &identity, "ally");
        let request = signed_request(&identity, "ally");

        let mut events = state.notifier.subscribe();
        let ack = ingest_bundle(&state, &request).expect("ingest");
        assert!(ack.ok);
        assert!(!ack.duplicate);
        assert!(ack.signature_valid);

        let db = state.open_db().expect("db");
        let stored = db.list_inbound_signals(10).expect("list");
        assert_eq!(stored.len(), 1);
        let row = &stored[0];
        assert_eq!(row.peer_id, peer_id);
        assert!(row.signature_valid);
        assert!((row.peer_trust - 50.0).abs() < 1e-9);
        // 42 of 100 samples at trust 50
        assert!((row.summary_strength - 0.21).abs() < 1e-9);
        assert!(row.merged_at.is_none());
        assert_eq!(row.signals().expect("parse").len(), 2);

        let event = events.try_recv().expect("event");
        assert!(matches!(
            event,
            FederationEvent::SignalReceived { signature_valid: true, .. }
        ));
    }

    #[test]
    fn test_ingest_duplicate_is_flagged_not_stored() {
        let state = temp_state();
        let identity = peer_identity();
        register_peer(&state, &identity, "ally");
        let request = signed_request(&identity, "ally");

        let first = ingest_bundle(&state, &request).expect("first");
        assert!(!first.duplicate);
        let second = ingest_bundle(&state, &request).expect("second");
        assert!(second.duplicate);
        assert!(second.signature_valid);

        let db = state.open_db().expect("db");
        assert_eq!(db.list_inbound_signals(10).expect("list").len(), 1);
    }

    #[test]
    fn test_ingest_unknown_peer_rejected_with_audit() {
        let state = temp_state();
        let identity = peer_identity();
        let request = signed_request(&identity, "stranger");

        let result = ingest_bundle(&state, &request);
        assert!(matches!(result, Err(FederationError::NotAuthorized(_))));

        let db = state.open_db().expect("db");
        assert!(db.list_inbound_signals(10).expect("list").is_empty());
        let audit_rows = db.recent_audit_events(10).expect("audit");
        assert_eq!(audit_rows.len(), 1);
        assert_eq!(audit_rows[0].kind, audit::AUDIT_BUNDLE_REJECTED);
        assert!(audit_rows[0].peer_id.is_none());
    }

    #[test]
    fn test_ingest_recv_disabled_peer_rejected() {
        let state = temp_state();
        let identity = peer_identity();
        let peer_id = register_peer(&state, &identity, "ally");
        let db = state.open_db().expect("db");
        db.set_peer_enabled(&peer_id, true, false).expect("disable recv");

        let request = signed_request(&identity, "ally");
        let result = ingest_bundle(&state, &request);
        assert!(matches!(result, Err(FederationError::NotAuthorized(_))));

        let audit_rows = db.recent_audit_events(10).expect("audit");
        assert_eq!(audit_rows[0].kind, audit::AUDIT_BUNDLE_REJECTED);
        assert_eq!(audit_rows[0].peer_id.as_deref(), Some(peer_id.as_str()));
    }

    #[test]
    fn test_ingest_hash_mismatch_rejected() {
        let state = temp_state();
        let identity = peer_identity();
        register_peer(&state, &identity, "ally");
        let mut request = signed_request(&identity, "ally");
        request.hash = content_hash("something else");

        let result = ingest_bundle(&state, &request);
        assert!(matches!(result, Err(FederationError::InvalidInput(_))));

        let db = state.open_db().expect("db");
        assert!(db.list_inbound_signals(10).expect("list").is_empty());
    }

    #[test]
    fn test_ingest_invalid_signature_stored_and_audited() {
        let state = temp_state();
        let identity = peer_identity();
        let imposter = peer_identity();
        register_peer(&state, &identity, "ally");

        // Signed by a key that is not the registered one
        let request = signed_request(&imposter, "ally");

        let mut events = state.notifier.subscribe();
        let ack = ingest_bundle(&state, &request).expect("ingest");
        assert!(ack.ok);
        assert!(!ack.signature_valid);

        let db = state.open_db().expect("db");
        let stored = db.list_inbound_signals(10).expect("list");
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].signature_valid);

        let audit_rows = db.recent_audit_events(10).expect("audit");
        assert!(audit_rows
            .iter()
            .any(|e| e.kind == audit::AUDIT_SIGNATURE_INVALID));

        let mut saw_security_event = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, FederationEvent::SecurityEvent { .. }) {
                saw_security_event = true;
            }
        }
        assert!(saw_security_event);

        // Never eligible for merge
        assert!(db
            .unmerged_valid_signals("2000-01-01T00:00:00+00:00")
            .expect("unmerged")
            .is_empty());
    }

    #[test]
    fn test_ingest_zero_trust_peer_stores_zero_strength() {
        let state = temp_state();
        let identity = peer_identity();
        let peer_id = register_peer(&state, &identity, "ally");
        let db = state.open_db().expect("db");
        db.apply_trust_delta(&peer_id, -50.0).expect("zero trust");

        let request = signed_request(&identity, "ally");
        let ack = ingest_bundle(&state, &request).expect("ingest");
        assert!(ack.signature_valid);

        let stored = db.list_inbound_signals(10).expect("list");
        assert_eq!(stored[0].peer_trust, 0.0);
        assert_eq!(stored[0].summary_strength, 0.0);
    }

    #[test]
    fn test_ingest_validates_request_shape() {
        let state = temp_state();
        let identity = peer_identity();
        register_peer(&state, &identity, "ally");

        let mut bad_window = signed_request(&identity, "ally");
        bad_window.window_start = "yesterday".to_string();
        assert!(matches!(
            ingest_bundle(&state, &bad_window),
            Err(FederationError::InvalidInput(_))
        ));

        let mut bad_division = signed_request(&identity, "ally");
        bad_division.signals[0].division = "Health Dept!".to_string();
        assert!(matches!(
            ingest_bundle(&state, &bad_division),
            Err(FederationError::InvalidInput(_))
        ));

        let mut empty = signed_request(&identity, "ally");
        empty.signals.clear();
        assert!(matches!(
            ingest_bundle(&state, &empty),
            Err(FederationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_challenge_answer_verifies_and_rejects_tamper() {
        let state = temp_state();
        let request = ChallengeRequest {
            peer: "ally".to_string(),
            nonce: "nonce-123".to_string(),
        };
        let response = answer_challenge(&state, &request).expect("challenge");
        assert_eq!(response.nonce, "nonce-123");
        assert!(crate::keys::verify_challenge(
            &state.identity.public_key_b64(),
            &response.nonce,
            &response.signature
        ));
        assert!(!crate::keys::verify_challenge(
            &state.identity.public_key_b64(),
            "nonce-124",
            &response.signature
        ));

        let empty = ChallengeRequest {
            peer: "ally".to_string(),
            nonce: "  ".to_string(),
        };
        assert!(answer_challenge(&state, &empty).is_err());
    }

    #[tokio::test]
    async fn test_http_surface_status_codes() {
        let state = temp_state();
        let identity = peer_identity();
        register_peer(&state, &identity, "ally");

        let app = create_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let client = reqwest::Client::new();
        let base = format!("http://{}", addr);

        let ok = client
            .post(format!("{}/federation/bundle", base))
            .json(&signed_request(&identity, "ally"))
            .send()
            .await
            .expect("send");
        assert_eq!(ok.status(), reqwest::StatusCode::OK);
        let ack: BundleAck = ok.json().await.expect("ack");
        assert!(ack.ok && ack.signature_valid);

        let forbidden = client
            .post(format!("{}/federation/bundle", base))
            .json(&signed_request(&identity, "stranger"))
            .send()
            .await
            .expect("send");
        assert_eq!(forbidden.status(), reqwest::StatusCode::FORBIDDEN);

        let malformed = client
            .post(format!("{}/federation/bundle", base))
            .json(&json!({ "peer": "ally" }))
            .send()
            .await
            .expect("send");
        assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

        let challenge = client
            .post(format!("{}/federation/challenge", base))
            .json(&json!({ "peer": "ally", "nonce": "abc" }))
            .send()
            .await
            .expect("send");
        assert_eq!(challenge.status(), reqwest::StatusCode::OK);
        let answer: ChallengeResponse = challenge.json().await.expect("answer");
        assert!(crate::keys::verify_challenge(
            &state.identity.public_key_b64(),
            "abc",
            &answer.signature
        ));
    }
}
