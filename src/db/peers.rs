use chrono::Utc;
use rusqlite::params;

use super::*;

impl FederationDb {
    // =========================================================================
    // Peers
    // =========================================================================

    /// Insert a new peer row.
    pub fn insert_peer(&self, peer: &DbPeer) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO peers (
                id, name, base_url, public_key, trust_score, send_enabled,
                recv_enabled, last_seen, consecutive_failures, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                peer.id,
                peer.name,
                peer.base_url,
                peer.public_key,
                peer.trust_score,
                peer.send_enabled as i32,
                peer.recv_enabled as i32,
                peer.last_seen,
                peer.consecutive_failures,
                peer.created_at,
                peer.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a peer by ID.
    pub fn get_peer(&self, id: &str) -> Result<Option<DbPeer>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, base_url, public_key, trust_score, send_enabled,
                    recv_enabled, last_seen, consecutive_failures, created_at, updated_at
             FROM peers
             WHERE id = ?1",
        )?;

        let mut rows = stmt.query_map(params![id], Self::map_peer_row)?;

        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Get a peer by name (case-insensitive).
    pub fn get_peer_by_name(&self, name: &str) -> Result<Option<DbPeer>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, base_url, public_key, trust_score, send_enabled,
                    recv_enabled, last_seen, consecutive_failures, created_at, updated_at
             FROM peers
             WHERE LOWER(name) = LOWER(?1)",
        )?;

        let mut rows = stmt.query_map(params![name], Self::map_peer_row)?;

        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// List all peers, ordered by name.
    pub fn list_peers(&self) -> Result<Vec<DbPeer>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, base_url, public_key, trust_score, send_enabled,
                    recv_enabled, last_seen, consecutive_failures, created_at, updated_at
             FROM peers
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], Self::map_peer_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// List peers eligible for outbound delivery.
    pub fn list_send_enabled_peers(&self) -> Result<Vec<DbPeer>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, base_url, public_key, trust_score, send_enabled,
                    recv_enabled, last_seen, consecutive_failures, created_at, updated_at
             FROM peers
             WHERE send_enabled = 1
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], Self::map_peer_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Update a peer's editable fields.
    pub fn update_peer(
        &self,
        id: &str,
        name: &str,
        base_url: &str,
        public_key: &str,
    ) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE peers
             SET name = ?2, base_url = ?3, public_key = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, name, base_url, public_key, now],
        )?;
        Ok(rows > 0)
    }

    /// Delete a peer. Cascades to its delivery ledger rows.
    pub fn delete_peer(&self, id: &str) -> Result<bool, DbError> {
        let rows = self
            .conn
            .execute("DELETE FROM peers WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Flip the send/recv flags for a peer.
    pub fn set_peer_enabled(
        &self,
        id: &str,
        send_enabled: bool,
        recv_enabled: bool,
    ) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE peers
             SET send_enabled = ?2, recv_enabled = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, send_enabled as i32, recv_enabled as i32, now],
        )?;
        Ok(rows > 0)
    }

    /// Zero the consecutive-failure counter without touching trust or
    /// `last_seen`. A manual re-enable starts a fresh streak.
    pub fn clear_failure_streak(&self, id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE peers SET consecutive_failures = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Apply a trust delta, clamping the result into [0, 100] in SQL.
    /// Returns the new trust score, or None if the peer doesn't exist.
    pub fn apply_trust_delta(&self, id: &str, delta: f64) -> Result<Option<f64>, DbError> {
        let now = Utc::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE peers
             SET trust_score = MIN(100.0, MAX(0.0, trust_score + ?2)), updated_at = ?3
             WHERE id = ?1",
            params![id, delta, now],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        let score: f64 = self.conn.query_row(
            "SELECT trust_score FROM peers WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(score))
    }

    /// Record a successful exchange with a peer: reset the failure streak and
    /// stamp `last_seen`.
    pub fn record_peer_success(&self, id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE peers
             SET consecutive_failures = 0, last_seen = ?2, updated_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Record a failed delivery attempt. Returns the new consecutive failure
    /// count, or None if the peer doesn't exist.
    pub fn record_peer_failure(&self, id: &str) -> Result<Option<i64>, DbError> {
        let now = Utc::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE peers
             SET consecutive_failures = consecutive_failures + 1, updated_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        let count: i64 = self.conn.query_row(
            "SELECT consecutive_failures FROM peers WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(count))
    }

    /// Force `send_enabled = 0`. Used when a peer crosses the failure
    /// threshold; re-enabling requires an explicit admin action.
    pub fn force_send_disabled(&self, id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE peers SET send_enabled = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    pub(crate) fn map_peer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbPeer> {
        Ok(DbPeer {
            id: row.get(0)?,
            name: row.get(1)?,
            base_url: row.get(2)?,
            public_key: row.get(3)?,
            trust_score: row.get(4)?,
            send_enabled: row.get::<_, i32>(5)? != 0,
            recv_enabled: row.get::<_, i32>(6)? != 0,
            last_seen: row.get(7)?,
            consecutive_failures: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}
