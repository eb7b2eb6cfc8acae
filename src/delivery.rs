//! Outbound bundle delivery (FED-57).
//!
//! Drains the delivery ledger: one POST per (bundle, peer) pair, sends to
//! distinct peers in parallel, sends to the same peer strictly oldest window
//! first so receivers observe windows in order. Backoff is durable: a failed
//! attempt schedules `next_attempt_at` in the ledger rather than sleeping, so
//! a restart never loses retry state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::db::{BundleStatus, DbBundleDelivery, DbPeer, FederationDb};
use crate::error::FederationError;
use crate::notify::FederationEvent;
use crate::payload::{BundleAck, BundleRequest, CanonicalPayload};
use crate::peers::{record_send_failure, record_send_success};
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_secs: 30,
            max_backoff_secs: 900,
            request_timeout_secs: 10,
        }
    }
}

/// Seconds until the next attempt after `attempt` failures.
fn backoff_secs(attempt: u32, policy: &DeliveryPolicy) -> u64 {
    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_secs
        .saturating_mul(exponent)
        .min(policy.max_backoff_secs);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 5;
    base.saturating_add(jitter)
}

/// What a delivery run did, for logs and run history.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOutcome {
    pub fanned_out: usize,
    pub peers: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DeliveryOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{} sent, {} awaiting retry, {} failed across {} peer(s)",
            self.sent, self.retried, self.failed, self.peers
        )
    }
}

#[derive(Debug, Default)]
struct PeerQueueStats {
    sent: usize,
    retried: usize,
    failed: usize,
}

enum AttemptResult {
    Sent,
    Retrying,
    Failed,
}

/// Fan out pending deliveries and drain every send-enabled peer's queue.
pub async fn run(state: &Arc<AppState>) -> Result<DeliveryOutcome, FederationError> {
    run_with_policy(state, &DeliveryPolicy::default()).await
}

pub async fn run_with_policy(
    state: &Arc<AppState>,
    policy: &DeliveryPolicy,
) -> Result<DeliveryOutcome, FederationError> {
    let db = state.open_db()?;
    let fanned_out = db.fan_out_deliveries()?;
    if fanned_out > 0 {
        log::info!("Fanned out {} new delivery ledger row(s)", fanned_out);
    }
    let peers = db.list_send_enabled_peers()?;
    drop(db);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(policy.request_timeout_secs))
        .build()
        .map_err(|e| FederationError::Http(e.to_string()))?;

    let mut handles = Vec::new();
    for peer in peers {
        let state = Arc::clone(state);
        let client = client.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            drain_peer_queue(&state, &client, &policy, &peer).await
        }));
    }

    let mut outcome = DeliveryOutcome {
        fanned_out,
        peers: handles.len(),
        ..Default::default()
    };
    for handle in handles {
        match handle.await {
            Ok(Ok(stats)) => {
                outcome.sent += stats.sent;
                outcome.retried += stats.retried;
                outcome.failed += stats.failed;
            }
            Ok(Err(e)) => log::error!("Delivery task error: {}", e),
            Err(e) => log::error!("Delivery task panicked: {}", e),
        }
    }
    Ok(outcome)
}

/// Work one peer's queue oldest window first.
///
/// The walk stops at the first delivery that cannot complete right now: a
/// terminally failed head (operator must requeue), a head still inside its
/// backoff window, or a fresh failure. Newer windows never jump the queue.
async fn drain_peer_queue(
    state: &Arc<AppState>,
    client: &reqwest::Client,
    policy: &DeliveryPolicy,
    peer: &DbPeer,
) -> Result<PeerQueueStats, FederationError> {
    // Each task owns its own connection; WAL coordinates concurrent writers.
    let mut db = state.open_db()?;
    let mut stats = PeerQueueStats::default();

    for delivery in db.pending_deliveries_for_peer(&peer.id)? {
        if delivery.status == BundleStatus::Failed.as_str() {
            break;
        }
        if let Some(next) = &delivery.next_attempt_at {
            let now = Utc::now().to_rfc3339();
            if next.as_str() > now.as_str() {
                break;
            }
        }
        match attempt_delivery(state, &mut db, client, policy, peer, &delivery).await? {
            AttemptResult::Sent => stats.sent += 1,
            AttemptResult::Retrying => {
                stats.retried += 1;
                break;
            }
            AttemptResult::Failed => {
                stats.failed += 1;
                break;
            }
        }
    }
    Ok(stats)
}

async fn attempt_delivery(
    state: &Arc<AppState>,
    db: &mut FederationDb,
    client: &reqwest::Client,
    policy: &DeliveryPolicy,
    peer: &DbPeer,
    delivery: &DbBundleDelivery,
) -> Result<AttemptResult, FederationError> {
    let bundle = db
        .get_bundle(&delivery.bundle_id)?
        .ok_or_else(|| FederationError::NotFound(format!("bundle {}", delivery.bundle_id)))?;
    let parsed: CanonicalPayload = serde_json::from_str(&bundle.payload)
        .map_err(|e| FederationError::Db(format!("bundle {} payload unreadable: {}", bundle.id, e)))?;

    let request = BundleRequest {
        peer: state.config_snapshot().node_name,
        window_start: bundle.window_start.clone(),
        window_end: bundle.window_end.clone(),
        signals: parsed.signals,
        hash: bundle.hash.clone(),
        signature: bundle.signature.clone(),
    };

    let url = format!("{}/federation/bundle", peer.base_url);
    let error_text = match client.post(&url).json(&request).send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                if let Ok(ack) = response.json::<BundleAck>().await {
                    if ack.duplicate {
                        log::info!(
                            "Peer '{}' already had bundle {} (window {})",
                            peer.name,
                            bundle.id,
                            bundle.window_start
                        );
                    }
                }
                db.mark_delivery_sent(&delivery.id)?;
                record_send_success(db, &peer.id)?;
                note_bundle_transition(state, db, &delivery.bundle_id)?;
                log::info!("Delivered bundle {} to '{}'", bundle.id, peer.name);
                return Ok(AttemptResult::Sent);
            }
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            format!("peer returned {}: {}", status, snippet)
        }
        Err(e) => classify_send_error(&e, policy.request_timeout_secs).to_string(),
    };

    let new_attempts = delivery.attempts.saturating_add(1);
    let terminal = new_attempts >= policy.max_attempts as i64;
    let next_attempt_at = if terminal {
        None
    } else {
        let delay = backoff_secs(new_attempts as u32, policy);
        Some((Utc::now() + chrono::Duration::seconds(delay as i64)).to_rfc3339())
    };
    let attempts = db.mark_delivery_failed_attempt(
        &delivery.id,
        &error_text,
        next_attempt_at.as_deref(),
        terminal,
    )?;
    record_send_failure(db, state, &peer.id, &error_text)?;
    note_bundle_transition(state, db, &delivery.bundle_id)?;
    log::warn!(
        "Delivery of bundle {} to '{}' failed (attempt {}/{}): {}",
        bundle.id,
        peer.name,
        attempts,
        policy.max_attempts,
        error_text
    );
    Ok(if terminal {
        AttemptResult::Failed
    } else {
        AttemptResult::Retrying
    })
}

fn classify_send_error(err: &reqwest::Error, timeout_secs: u64) -> FederationError {
    if err.is_timeout() {
        FederationError::Timeout(timeout_secs)
    } else if err.is_connect() {
        FederationError::TransientNetwork(err.to_string())
    } else {
        FederationError::Http(err.to_string())
    }
}

/// Recompute the bundle's aggregate status and announce terminal transitions.
fn note_bundle_transition(
    state: &Arc<AppState>,
    db: &FederationDb,
    bundle_id: &str,
) -> Result<(), FederationError> {
    if let Some((old, new)) = db.recompute_bundle_status(bundle_id)? {
        if old != new {
            match new {
                BundleStatus::Sent => state.notifier.emit(FederationEvent::BundleSent {
                    bundle_id: bundle_id.to_string(),
                }),
                BundleStatus::Failed => {
                    let error = db
                        .get_bundle(bundle_id)?
                        .and_then(|b| b.last_error)
                        .unwrap_or_else(|| "delivery failed".to_string());
                    state.notifier.emit(FederationEvent::BundleFailed {
                        bundle_id: bundle_id.to_string(),
                        error,
                    });
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbOutboundBundle, FederationDb};
    use crate::payload::{canonical_payload, content_hash, DivisionSignal};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn temp_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(AppState::for_tests(dir.path()));
        std::mem::forget(dir);
        state
    }

    fn zero_backoff_policy() -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: 5,
            initial_backoff_secs: 0,
            max_backoff_secs: 0,
            request_timeout_secs: 2,
        }
    }

    fn seed_bundle(
        state: &Arc<AppState>,
        db: &FederationDb,
        window_start: &str,
        window_end: &str,
    ) -> String {
        let signals = vec![DivisionSignal {
            division: "health".to_string(),
            impact_per_sc_avg: 2.5,
            sample_size: 12,
        }];
        let payload = canonical_payload(window_start, window_end, &signals);
        let hash = content_hash(&payload);
        let signature = state.identity.sign_payload(payload.as_bytes());
        let now = Utc::now().to_rfc3339();
        let bundle = DbOutboundBundle {
            id: format!("bdl-{}", Uuid::new_v4()),
            window_start: window_start.to_string(),
            window_end: window_end.to_string(),
            payload,
            hash,
            signature,
            status: "queued".to_string(),
            attempts: 0,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        };
        db.insert_bundle(&bundle).expect("insert bundle");
        bundle.id
    }

    fn add_test_peer(state: &Arc<AppState>, db: &FederationDb, base_url: &str) -> String {
        let peer = crate::peers::add_peer(db, "ally", base_url, &state.identity.public_key_b64())
            .expect("add peer");
        peer.id
    }

    async fn unreachable_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        format!("http://{}", addr)
    }

    /// Accepts bundles, records bodies, returns `{ok:true}`.
    async fn spawn_ack_server(
        bodies: Arc<Mutex<Vec<Value>>>,
        hits: Arc<AtomicUsize>,
    ) -> String {
        let app = Router::new().route(
            "/federation/bundle",
            post(move |Json(body): Json<Value>| {
                let bodies = bodies.clone();
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if let Ok(mut guard) = bodies.lock() {
                        guard.push(body);
                    }
                    Json(json!({ "ok": true }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_backoff_schedule_doubles_and_caps() {
        let policy = DeliveryPolicy::default();
        let first = backoff_secs(1, &policy);
        assert!((30..35).contains(&first), "got {}", first);
        let second = backoff_secs(2, &policy);
        assert!((60..65).contains(&second), "got {}", second);
        let fourth = backoff_secs(4, &policy);
        assert!((240..245).contains(&fourth), "got {}", fourth);
        let huge = backoff_secs(30, &policy);
        assert!((900..905).contains(&huge), "got {}", huge);
    }

    #[tokio::test]
    async fn test_delivery_success_rewards_peer_and_marks_sent() {
        let state = temp_state();
        let db = state.open_db().expect("db");
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = spawn_ack_server(bodies.clone(), hits.clone()).await;
        let peer_id = add_test_peer(&state, &db, &base_url);
        let bundle_id = seed_bundle(
            &state,
            &db,
            "2026-08-20T00:00:00+00:00",
            "2026-08-21T00:00:00+00:00",
        );

        let mut events = state.notifier.subscribe();
        let outcome = run_with_policy(&state, &zero_backoff_policy())
            .await
            .expect("run");
        assert_eq!(outcome.sent, 1);
        assert_eq!(outcome.failed, 0);

        let bundle = db.get_bundle(&bundle_id).expect("get").expect("exists");
        assert_eq!(bundle.status, "sent");
        let peer = db.get_peer(&peer_id).expect("get").expect("exists");
        assert!((peer.trust_score - 51.0).abs() < 1e-9);
        assert!(peer.last_seen.is_some());
        assert_eq!(peer.consecutive_failures, 0);

        let sent = bodies.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["peer"], "impactos-node");
        assert_eq!(sent[0]["hash"], bundle.hash.as_str());
        assert_eq!(sent[0]["signature"], bundle.signature.as_str());
        assert_eq!(sent[0]["signals"][0]["division"], "health");
        assert_eq!(sent[0]["signals"][0]["sample_size"], 12);

        let mut saw_sent_event = false;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, FederationEvent::BundleSent { bundle_id: id } if *id == bundle_id)
            {
                saw_sent_event = true;
            }
        }
        assert!(saw_sent_event);
    }

    #[tokio::test]
    async fn test_unreachable_peer_exhausts_attempts_and_disables() {
        let state = temp_state();
        let db = state.open_db().expect("db");
        let base_url = unreachable_url().await;
        let peer_id = add_test_peer(&state, &db, &base_url);
        let bundle_id = seed_bundle(
            &state,
            &db,
            "2026-08-20T00:00:00+00:00",
            "2026-08-21T00:00:00+00:00",
        );

        let mut events = state.notifier.subscribe();
        let policy = zero_backoff_policy();
        for _ in 0..5 {
            run_with_policy(&state, &policy).await.expect("run");
        }

        let bundle = db.get_bundle(&bundle_id).expect("get").expect("exists");
        assert_eq!(bundle.status, "failed");
        assert_eq!(bundle.attempts, 5);
        assert!(bundle.last_error.is_some());

        let deliveries = db.deliveries_for_bundle(&bundle_id).expect("deliveries");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, "failed");
        assert_eq!(deliveries[0].attempts, 5);

        let peer = db.get_peer(&peer_id).expect("get").expect("exists");
        assert!(!peer.send_enabled);
        assert!((peer.trust_score - 25.0).abs() < 1e-9);

        let audit = db.recent_audit_events(10).expect("audit");
        assert!(audit
            .iter()
            .any(|e| e.kind == crate::db::audit::AUDIT_PEER_AUTO_DISABLED));

        let mut saw_failed_event = false;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, FederationEvent::BundleFailed { bundle_id: id, .. } if *id == bundle_id)
            {
                saw_failed_event = true;
            }
        }
        assert!(saw_failed_event);

        // Disabled peer drops out of the rotation entirely
        let outcome = run_with_policy(&state, &policy).await.expect("run");
        assert_eq!(outcome.peers, 0);
    }

    #[tokio::test]
    async fn test_failed_head_blocks_newer_windows_until_requeue() {
        let state = temp_state();
        let db = state.open_db().expect("db");
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = spawn_ack_server(bodies.clone(), hits.clone()).await;
        add_test_peer(&state, &db, &base_url);

        let older = seed_bundle(
            &state,
            &db,
            "2026-08-19T00:00:00+00:00",
            "2026-08-20T00:00:00+00:00",
        );
        let newer = seed_bundle(
            &state,
            &db,
            "2026-08-20T00:00:00+00:00",
            "2026-08-21T00:00:00+00:00",
        );

        db.fan_out_deliveries().expect("fan out");
        let older_delivery = db
            .deliveries_for_bundle(&older)
            .expect("deliveries")
            .remove(0);
        db.mark_delivery_failed_attempt(&older_delivery.id, "peer returned 500", None, true)
            .expect("fail");
        db.recompute_bundle_status(&older).expect("recompute");

        let policy = zero_backoff_policy();
        let outcome = run_with_policy(&state, &policy).await.expect("run");
        assert_eq!(outcome.sent, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "newer window must wait");
        let newer_bundle = db.get_bundle(&newer).expect("get").expect("exists");
        assert_eq!(newer_bundle.status, "queued");

        assert!(db.requeue_bundle(&older).expect("requeue"));
        let outcome = run_with_policy(&state, &policy).await.expect("run");
        assert_eq!(outcome.sent, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let sent = bodies.lock().expect("lock");
        assert_eq!(sent[0]["window_start"], "2026-08-19T00:00:00+00:00");
        assert_eq!(sent[1]["window_start"], "2026-08-20T00:00:00+00:00");
        assert_eq!(
            db.get_bundle(&older).expect("get").expect("exists").status,
            "sent"
        );
    }

    #[tokio::test]
    async fn test_backoff_defers_next_attempt() {
        let state = temp_state();
        let db = state.open_db().expect("db");
        let base_url = unreachable_url().await;
        add_test_peer(&state, &db, &base_url);
        let bundle_id = seed_bundle(
            &state,
            &db,
            "2026-08-20T00:00:00+00:00",
            "2026-08-21T00:00:00+00:00",
        );

        let policy = DeliveryPolicy {
            max_attempts: 5,
            initial_backoff_secs: 3600,
            max_backoff_secs: 3600,
            request_timeout_secs: 2,
        };
        run_with_policy(&state, &policy).await.expect("first run");
        let outcome = run_with_policy(&state, &policy).await.expect("second run");
        assert_eq!(outcome.retried, 0, "head inside backoff window is skipped");

        let deliveries = db.deliveries_for_bundle(&bundle_id).expect("deliveries");
        assert_eq!(deliveries[0].attempts, 1);
        assert_eq!(deliveries[0].status, "sending");
        assert!(deliveries[0].next_attempt_at.is_some());
    }
}
