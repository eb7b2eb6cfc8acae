use rusqlite::params;

use super::*;

/// Per-division aggregate over an observation window, before noise.
#[derive(Debug, Clone, PartialEq)]
pub struct DivisionAggregate {
    pub division: String,
    pub impact_per_sc_avg: f64,
    pub sample_size: i64,
}

impl FederationDb {
    // =========================================================================
    // Impact observations
    // =========================================================================

    /// Record a local impact observation.
    pub fn insert_observation(&self, obs: &DbObservation) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO impact_observations (id, division, spend_sc, impact_units, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![obs.id, obs.division, obs.spend_sc, obs.impact_units, obs.observed_at],
        )?;
        Ok(())
    }

    /// Aggregate observations in `[window_start, window_end)` per division:
    /// mean impact-per-SC ratio and sample count, sorted by division.
    /// Zero-spend rows carry no ratio and are excluded.
    pub fn window_division_aggregates(
        &self,
        window_start: &str,
        window_end: &str,
    ) -> Result<Vec<DivisionAggregate>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT division, AVG(impact_units / spend_sc), COUNT(*)
             FROM impact_observations
             WHERE observed_at >= ?1 AND observed_at < ?2 AND spend_sc > 0
             GROUP BY division
             ORDER BY division",
        )?;
        let rows = stmt.query_map(params![window_start, window_end], |row| {
            Ok(DivisionAggregate {
                division: row.get(0)?,
                impact_per_sc_avg: row.get(1)?,
                sample_size: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
