//! Wire types and the canonical bundle form.
//!
//! Hashing and signing operate on one exact byte sequence, so both sides must
//! derive it the same way. The canonical form is single-line JSON with keys in
//! alphabetical order, signal entries sorted by division, and averages fixed
//! at six decimal places. Field names on the wire are snake_case.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One division's shared aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivisionSignal {
    pub division: String,
    pub impact_per_sc_avg: f64,
    pub sample_size: i64,
}

/// Body of `POST /federation/bundle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRequest {
    /// Sender's name in the receiver's peer registry.
    pub peer: String,
    pub window_start: String,
    pub window_end: String,
    pub signals: Vec<DivisionSignal>,
    pub hash: String,
    pub signature: String,
}

/// Acknowledgement for an accepted bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleAck {
    pub ok: bool,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub signature_valid: bool,
}

/// Body of `POST /federation/challenge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    /// Name the caller knows this node by; echoed into logs only.
    pub peer: String,
    pub nonce: String,
}

/// Signed challenge answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub nonce: String,
    pub signature: String,
}

/// Parsed form of a stored canonical payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CanonicalPayload {
    pub signals: Vec<DivisionSignal>,
    pub window_end: String,
    pub window_start: String,
}

/// Build the canonical payload for a window's signals.
///
/// Signals are sorted by division here; callers don't need to pre-sort.
/// Strings are JSON-escaped, so the output parses as JSON for any input,
/// though division names are expected to pass `valid_division`.
pub fn canonical_payload(
    window_start: &str,
    window_end: &str,
    signals: &[DivisionSignal],
) -> String {
    let mut sorted: Vec<&DivisionSignal> = signals.iter().collect();
    sorted.sort_by(|a, b| a.division.cmp(&b.division));

    let mut out = String::from("{\"signals\":[");
    for (i, signal) in sorted.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!(
            "{{\"division\":{},\"impact_per_sc_avg\":{:.6},\"sample_size\":{}}}",
            json_string(&signal.division),
            signal.impact_per_sc_avg,
            signal.sample_size
        ));
    }
    out.push_str(&format!(
        "],\"window_end\":{},\"window_start\":{}}}",
        json_string(window_end),
        json_string(window_start)
    ));
    out
}

/// SHA-256 of the canonical payload, lowercase hex.
pub fn content_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Division identifiers are lowercase slugs: `[a-z0-9_-]`, 1..=64 chars.
pub fn valid_division(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn json_string(s: &str) -> String {
    // Encoding a &str cannot fail
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}
