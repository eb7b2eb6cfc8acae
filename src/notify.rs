//! In-process event stream for federation activity.
//!
//! Components publish typed events through a broadcast channel instead of
//! calling each other. Subscribers (the structured log listener, admin
//! surfaces, tests) attach and detach freely; events with no subscribers are
//! dropped.

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Something observable happened in the federation pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum FederationEvent {
    BundleQueued {
        #[serde(rename = "bundleId")]
        bundle_id: String,
        #[serde(rename = "windowStart")]
        window_start: String,
        #[serde(rename = "windowEnd")]
        window_end: String,
        divisions: usize,
    },
    BundleSent {
        #[serde(rename = "bundleId")]
        bundle_id: String,
    },
    BundleFailed {
        #[serde(rename = "bundleId")]
        bundle_id: String,
        error: String,
    },
    SignalReceived {
        peer: String,
        #[serde(rename = "windowStart")]
        window_start: String,
        #[serde(rename = "signatureValid")]
        signature_valid: bool,
    },
    SignalsMerged {
        #[serde(rename = "divisionsUpdated")]
        divisions_updated: usize,
        #[serde(rename = "signalsConsumed")]
        signals_consumed: usize,
    },
    WeightUpdated {
        division: String,
        #[serde(rename = "oldWeight")]
        old_weight: f64,
        #[serde(rename = "newWeight")]
        new_weight: f64,
    },
    PeerAutoDisabled {
        peer: String,
    },
    SecurityEvent {
        peer: String,
        detail: String,
    },
}

/// Handle for publishing and subscribing to federation events.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<FederationEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FederationEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error only means nobody is listening.
    pub fn emit(&self, event: FederationEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that mirrors every event into the log as one JSON line.
pub fn spawn_log_listener(notifier: &Notifier) {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => log::info!("event {}", json),
                    Err(e) => log::warn!("Failed to encode event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event log listener lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
