//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

impl DbError {
    /// True when the error is SQLITE_BUSY or SQLITE_LOCKED, meaning another
    /// writer holds the lock. Jobs treat this as "skip and retry later".
    pub fn is_busy(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// A row from the `peers` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPeer {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub public_key: String,
    pub trust_score: f64,
    pub send_enabled: bool,
    pub recv_enabled: bool,
    pub last_seen: Option<String>,
    pub consecutive_failures: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// The sharing policy singleton (`federation_policy`, id = 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPolicy {
    pub enabled: bool,
    /// Divisions cleared for sharing, stored as a JSON array of strings.
    pub share_divisions: Vec<String>,
    pub min_sample: i64,
    pub dp_epsilon: f64,
    pub max_daily_weight_drift: f64,
    pub updated_at: String,
}

impl DbPolicy {
    /// Check the numeric parameters a merge or build run depends on.
    /// A violation here halts the run before any state is touched.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.dp_epsilon > 0.0) {
            return Err(format!("dp_epsilon must be positive, got {}", self.dp_epsilon));
        }
        if self.min_sample < 1 {
            return Err(format!("min_sample must be at least 1, got {}", self.min_sample));
        }
        if !(self.max_daily_weight_drift > 0.0 && self.max_daily_weight_drift <= 1.0) {
            return Err(format!(
                "max_daily_weight_drift must be in (0, 1], got {}",
                self.max_daily_weight_drift
            ));
        }
        Ok(())
    }
}

/// Lifecycle states for an outbound bundle and its per-peer deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Queued => "queued",
            BundleStatus::Sending => "sending",
            BundleStatus::Sent => "sent",
            BundleStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BundleStatus::Queued),
            "sending" => Some(BundleStatus::Sending),
            "sent" => Some(BundleStatus::Sent),
            "failed" => Some(BundleStatus::Failed),
            _ => None,
        }
    }
}

/// A row from the `outbound_bundles` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbOutboundBundle {
    pub id: String,
    pub window_start: String,
    pub window_end: String,
    /// Canonical payload JSON, exactly the bytes that were hashed and signed.
    pub payload: String,
    pub hash: String,
    pub signature: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `bundle_deliveries` table: one bundle fanned out to one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbBundleDelivery {
    pub id: String,
    pub bundle_id: String,
    pub peer_id: String,
    pub status: String,
    pub attempts: i64,
    pub next_attempt_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `inbound_signals` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbInboundSignal {
    pub id: String,
    pub peer_id: String,
    pub window_start: String,
    pub window_end: String,
    /// The peer's signal entries as a JSON array.
    pub signals_json: String,
    pub hash: String,
    pub signature: String,
    pub signature_valid: bool,
    /// Peer trust score captured at receipt time.
    pub peer_trust: f64,
    pub summary_strength: f64,
    pub received_at: String,
    pub merged_at: Option<String>,
}

impl DbInboundSignal {
    /// Parse the stored signal entries. Rows are only written through the
    /// receiver, which validates the JSON shape before insert.
    pub fn signals(&self) -> Result<Vec<crate::payload::DivisionSignal>, serde_json::Error> {
        serde_json::from_str(&self.signals_json)
    }
}

/// A row from the `division_weights` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDivisionWeight {
    pub division: String,
    pub impact_weight: f64,
    pub trend: f64,
    pub last_updated: String,
}

/// A row from the `weight_drift_ledger` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDriftEntry {
    pub id: String,
    pub division: String,
    pub delta: f64,
    pub weight_before: f64,
    pub applied_at: String,
}

/// A row from the `impact_observations` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbObservation {
    pub id: String,
    pub division: String,
    pub spend_sc: f64,
    pub impact_units: f64,
    pub observed_at: String,
}

/// A row from the `audit_events` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAuditEvent {
    pub id: String,
    pub kind: String,
    pub peer_id: Option<String>,
    pub detail: String,
    pub created_at: String,
}
