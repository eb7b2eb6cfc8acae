use rusqlite::params;

use super::*;

impl FederationDb {
    // =========================================================================
    // Inbound signals
    // =========================================================================

    /// Store a received signal bundle.
    pub fn insert_inbound_signal(&self, signal: &DbInboundSignal) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO inbound_signals (
                id, peer_id, window_start, window_end, signals, hash, signature,
                signature_valid, peer_trust, summary_strength, received_at, merged_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                signal.id,
                signal.peer_id,
                signal.window_start,
                signal.window_end,
                signal.signals_json,
                signal.hash,
                signal.signature,
                signal.signature_valid as i32,
                signal.peer_trust,
                signal.summary_strength,
                signal.received_at,
                signal.merged_at,
            ],
        )?;
        Ok(())
    }

    /// Check whether this exact bundle was already received from this peer.
    pub fn inbound_signal_exists(
        &self,
        peer_id: &str,
        window_start: &str,
        window_end: &str,
        hash: &str,
    ) -> Result<bool, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM inbound_signals
             WHERE peer_id = ?1 AND window_start = ?2 AND window_end = ?3 AND hash = ?4",
            params![peer_id, window_start, window_end, hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Signals eligible for merging: unmerged, signature verified, received
    /// within the lookback horizon. Oldest first for a stable merge order.
    pub fn unmerged_valid_signals(&self, since: &str) -> Result<Vec<DbInboundSignal>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, peer_id, window_start, window_end, signals, hash, signature,
                    signature_valid, peer_trust, summary_strength, received_at, merged_at
             FROM inbound_signals
             WHERE merged_at IS NULL AND signature_valid = 1 AND received_at >= ?1
             ORDER BY received_at ASC",
        )?;
        let rows = stmt.query_map(params![since], Self::map_inbound_signal_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Stamp `merged_at` on a set of signals. Consumption is per-run: every
    /// signal selected for a run is stamped, whether or not its divisions
    /// survived filtering.
    pub fn mark_signals_merged(&self, ids: &[String], merged_at: &str) -> Result<usize, DbError> {
        let mut updated = 0;
        for id in ids {
            updated += self.conn.execute(
                "UPDATE inbound_signals SET merged_at = ?2 WHERE id = ?1",
                params![id, merged_at],
            )?;
        }
        Ok(updated)
    }

    /// List received bundles, newest first.
    pub fn list_inbound_signals(&self, limit: i64) -> Result<Vec<DbInboundSignal>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, peer_id, window_start, window_end, signals, hash, signature,
                    signature_valid, peer_trust, summary_strength, received_at, merged_at
             FROM inbound_signals
             ORDER BY received_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], Self::map_inbound_signal_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub(crate) fn map_inbound_signal_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<DbInboundSignal> {
        Ok(DbInboundSignal {
            id: row.get(0)?,
            peer_id: row.get(1)?,
            window_start: row.get(2)?,
            window_end: row.get(3)?,
            signals_json: row.get(4)?,
            hash: row.get(5)?,
            signature: row.get(6)?,
            signature_valid: row.get::<_, i32>(7)? != 0,
            peer_trust: row.get(8)?,
            summary_strength: row.get(9)?,
            received_at: row.get(10)?,
            merged_at: row.get(11)?,
        })
    }
}
