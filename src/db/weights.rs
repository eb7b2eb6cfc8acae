use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

impl FederationDb {
    // =========================================================================
    // Division weights and drift ledger
    // =========================================================================

    /// Get the weight row for a division.
    pub fn get_division_weight(&self, division: &str) -> Result<Option<DbDivisionWeight>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT division, impact_weight, trend, last_updated
             FROM division_weights
             WHERE division = ?1",
        )?;
        let mut rows = stmt.query_map(params![division], Self::map_weight_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Insert or update a division's weight and trend.
    pub fn upsert_division_weight(
        &self,
        division: &str,
        impact_weight: f64,
        trend: f64,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO division_weights (division, impact_weight, trend, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(division) DO UPDATE SET
                impact_weight = excluded.impact_weight,
                trend = excluded.trend,
                last_updated = excluded.last_updated",
            params![division, impact_weight, trend, now],
        )?;
        Ok(())
    }

    /// List all division weights, ordered by division.
    pub fn list_division_weights(&self) -> Result<Vec<DbDivisionWeight>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT division, impact_weight, trend, last_updated
             FROM division_weights
             ORDER BY division",
        )?;
        let rows = stmt.query_map([], Self::map_weight_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Append an applied weight change to the drift ledger.
    pub fn insert_drift_entry(
        &self,
        division: &str,
        delta: f64,
        weight_before: f64,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO weight_drift_ledger (id, division, delta, weight_before, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                format!("drl-{}", Uuid::new_v4()),
                division,
                delta,
                weight_before,
                now,
            ],
        )?;
        Ok(())
    }

    /// Drift applied to a division since `since`: `(signed_sum, abs_sum)`.
    /// The signed sum reconstructs the day's base weight; the absolute sum is
    /// what counts against the drift budget.
    pub fn drift_totals(&self, division: &str, since: &str) -> Result<(f64, f64), DbError> {
        let totals = self.conn.query_row(
            "SELECT COALESCE(SUM(delta), 0.0), COALESCE(SUM(ABS(delta)), 0.0)
             FROM weight_drift_ledger
             WHERE division = ?1 AND applied_at >= ?2",
            params![division, since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(totals)
    }

    pub(crate) fn map_weight_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbDivisionWeight> {
        Ok(DbDivisionWeight {
            division: row.get(0)?,
            impact_weight: row.get(1)?,
            trend: row.get(2)?,
            last_updated: row.get(3)?,
        })
    }
}
