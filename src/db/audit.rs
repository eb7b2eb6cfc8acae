use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

/// A bundle arrived with a signature that failed verification.
pub const AUDIT_SIGNATURE_INVALID: &str = "signature_invalid";
/// A bundle was rejected before storage (unknown peer, receiving disabled).
pub const AUDIT_BUNDLE_REJECTED: &str = "bundle_rejected";
/// A peer crossed the consecutive-failure threshold and lost send eligibility.
pub const AUDIT_PEER_AUTO_DISABLED: &str = "peer_auto_disabled";

impl FederationDb {
    // =========================================================================
    // Audit trail
    // =========================================================================

    /// Append an audit event.
    pub fn insert_audit_event(
        &self,
        kind: &str,
        peer_id: Option<&str>,
        detail: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO audit_events (id, kind, peer_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![format!("aud-{}", Uuid::new_v4()), kind, peer_id, detail, now],
        )?;
        Ok(())
    }

    /// Most recent audit events, newest first.
    pub fn recent_audit_events(&self, limit: i64) -> Result<Vec<DbAuditEvent>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, peer_id, detail, created_at
             FROM audit_events
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(DbAuditEvent {
                id: row.get(0)?,
                kind: row.get(1)?,
                peer_id: row.get(2)?,
                detail: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
