use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

impl FederationDb {
    // =========================================================================
    // Outbound bundles
    // =========================================================================

    /// Insert a freshly built bundle in `queued` state.
    pub fn insert_bundle(&self, bundle: &DbOutboundBundle) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO outbound_bundles (
                id, window_start, window_end, payload, hash, signature,
                status, attempts, last_error, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                bundle.id,
                bundle.window_start,
                bundle.window_end,
                bundle.payload,
                bundle.hash,
                bundle.signature,
                bundle.status,
                bundle.attempts,
                bundle.last_error,
                bundle.created_at,
                bundle.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a bundle by ID.
    pub fn get_bundle(&self, id: &str) -> Result<Option<DbOutboundBundle>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, window_start, window_end, payload, hash, signature,
                    status, attempts, last_error, created_at, updated_at
             FROM outbound_bundles
             WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], Self::map_bundle_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Get the bundle covering an exact window, if one was already built.
    /// The window key is the idempotence boundary for the builder.
    pub fn get_bundle_for_window(
        &self,
        window_start: &str,
        window_end: &str,
    ) -> Result<Option<DbOutboundBundle>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, window_start, window_end, payload, hash, signature,
                    status, attempts, last_error, created_at, updated_at
             FROM outbound_bundles
             WHERE window_start = ?1 AND window_end = ?2",
        )?;
        let mut rows = stmt.query_map(params![window_start, window_end], Self::map_bundle_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// List bundles, newest window first.
    pub fn list_bundles(&self, limit: i64) -> Result<Vec<DbOutboundBundle>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, window_start, window_end, payload, hash, signature,
                    status, attempts, last_error, created_at, updated_at
             FROM outbound_bundles
             ORDER BY window_start DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], Self::map_bundle_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Recompute a bundle's aggregate status from its delivery ledger.
    ///
    /// Rules: any delivery failed → `failed`; all sent (and at least one
    /// delivery exists) → `sent`; any attempt made → `sending`; otherwise
    /// `queued`. Bundle `attempts` mirrors the largest per-delivery count.
    ///
    /// Returns `(old, new)` status so callers can emit events on transitions,
    /// or None if the bundle doesn't exist.
    pub fn recompute_bundle_status(
        &self,
        bundle_id: &str,
    ) -> Result<Option<(BundleStatus, BundleStatus)>, DbError> {
        let old = match self.get_bundle(bundle_id)? {
            Some(bundle) => bundle.status,
            None => return Ok(None),
        };
        let old_status = BundleStatus::from_str(&old).unwrap_or(BundleStatus::Queued);

        let (total, sent, failed, max_attempts): (i64, i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'sent'), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    COALESCE(MAX(attempts), 0)
             FROM bundle_deliveries
             WHERE bundle_id = ?1",
            params![bundle_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let new_status = if failed > 0 {
            BundleStatus::Failed
        } else if total > 0 && sent == total {
            BundleStatus::Sent
        } else if max_attempts > 0 {
            BundleStatus::Sending
        } else {
            BundleStatus::Queued
        };

        let last_error: Option<String> = self
            .conn
            .query_row(
                "SELECT last_error FROM bundle_deliveries
                 WHERE bundle_id = ?1 AND last_error IS NOT NULL
                 ORDER BY updated_at DESC
                 LIMIT 1",
                params![bundle_id],
                |row| row.get(0),
            )
            .unwrap_or(None);

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE outbound_bundles
             SET status = ?2, attempts = ?3, last_error = ?4, updated_at = ?5
             WHERE id = ?1",
            params![bundle_id, new_status.as_str(), max_attempts, last_error, now],
        )?;

        Ok(Some((old_status, new_status)))
    }

    /// Put a failed bundle back in the queue: its failed deliveries reset to
    /// `queued` with a clean attempt counter. Deliveries already sent stay
    /// sent. Returns false if the bundle isn't in `failed` state.
    pub fn requeue_bundle(&self, bundle_id: &str) -> Result<bool, DbError> {
        let bundle = match self.get_bundle(bundle_id)? {
            Some(bundle) => bundle,
            None => return Ok(false),
        };
        if bundle.status != BundleStatus::Failed.as_str() {
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE bundle_deliveries
             SET status = 'queued', attempts = 0, next_attempt_at = NULL,
                 last_error = NULL, updated_at = ?2
             WHERE bundle_id = ?1 AND status = 'failed'",
            params![bundle_id, now],
        )?;
        self.conn.execute(
            "UPDATE outbound_bundles
             SET status = 'queued', attempts = 0, last_error = NULL, updated_at = ?2
             WHERE id = ?1",
            params![bundle_id, now],
        )?;
        Ok(true)
    }

    // =========================================================================
    // Delivery ledger
    // =========================================================================

    /// Fan out non-terminal bundles to every send-enabled peer, creating the
    /// missing ledger rows. Peers enabled after a bundle was built pick it up
    /// on the next delivery run through this call. Returns rows created.
    pub fn fan_out_deliveries(&self) -> Result<usize, DbError> {
        let pairs: Vec<(String, String)> = {
            let mut stmt = self.conn.prepare(
                "SELECT b.id, p.id
                 FROM outbound_bundles b
                 CROSS JOIN peers p
                 WHERE p.send_enabled = 1
                   AND b.status != 'sent'
                   AND NOT EXISTS (
                       SELECT 1 FROM bundle_deliveries d
                       WHERE d.bundle_id = b.id AND d.peer_id = p.id
                   )",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let now = Utc::now().to_rfc3339();
        for (bundle_id, peer_id) in &pairs {
            self.conn.execute(
                "INSERT OR IGNORE INTO bundle_deliveries (
                    id, bundle_id, peer_id, status, attempts, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?4)",
                params![format!("dlv-{}", Uuid::new_v4()), bundle_id, peer_id, now],
            )?;
        }
        Ok(pairs.len())
    }

    /// Non-sent deliveries for a peer, oldest window first. The delivery
    /// runner walks these in order and stops at the first it can't complete.
    pub fn pending_deliveries_for_peer(
        &self,
        peer_id: &str,
    ) -> Result<Vec<DbBundleDelivery>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT d.id, d.bundle_id, d.peer_id, d.status, d.attempts,
                    d.next_attempt_at, d.last_error, d.created_at, d.updated_at
             FROM bundle_deliveries d
             JOIN outbound_bundles b ON b.id = d.bundle_id
             WHERE d.peer_id = ?1 AND d.status != 'sent'
             ORDER BY b.window_start ASC",
        )?;
        let rows = stmt.query_map(params![peer_id], Self::map_delivery_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All ledger rows for a bundle.
    pub fn deliveries_for_bundle(
        &self,
        bundle_id: &str,
    ) -> Result<Vec<DbBundleDelivery>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, bundle_id, peer_id, status, attempts,
                    next_attempt_at, last_error, created_at, updated_at
             FROM bundle_deliveries
             WHERE bundle_id = ?1
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![bundle_id], Self::map_delivery_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Mark a delivery acknowledged by the peer.
    pub fn mark_delivery_sent(&self, delivery_id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE bundle_deliveries
             SET status = 'sent', next_attempt_at = NULL, last_error = NULL, updated_at = ?2
             WHERE id = ?1",
            params![delivery_id, now],
        )?;
        Ok(())
    }

    /// Record a failed attempt. Non-terminal failures go to `sending` with a
    /// backoff gate in `next_attempt_at`; terminal ones go to `failed`.
    /// Returns the new attempt count.
    pub fn mark_delivery_failed_attempt(
        &self,
        delivery_id: &str,
        error: &str,
        next_attempt_at: Option<&str>,
        terminal: bool,
    ) -> Result<i64, DbError> {
        let status = if terminal { "failed" } else { "sending" };
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE bundle_deliveries
             SET attempts = attempts + 1, status = ?2, last_error = ?3,
                 next_attempt_at = ?4, updated_at = ?5
             WHERE id = ?1",
            params![delivery_id, status, error, next_attempt_at, now],
        )?;
        let attempts: i64 = self.conn.query_row(
            "SELECT attempts FROM bundle_deliveries WHERE id = ?1",
            params![delivery_id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub(crate) fn map_bundle_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbOutboundBundle> {
        Ok(DbOutboundBundle {
            id: row.get(0)?,
            window_start: row.get(1)?,
            window_end: row.get(2)?,
            payload: row.get(3)?,
            hash: row.get(4)?,
            signature: row.get(5)?,
            status: row.get(6)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    pub(crate) fn map_delivery_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbBundleDelivery> {
        Ok(DbBundleDelivery {
            id: row.get(0)?,
            bundle_id: row.get(1)?,
            peer_id: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            next_attempt_at: row.get(5)?,
            last_error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}
