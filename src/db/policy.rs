use chrono::Utc;
use rusqlite::params;

use super::*;

impl FederationDb {
    // =========================================================================
    // Sharing policy
    // =========================================================================

    /// Read the policy singleton. The row is seeded by migration 001, so a
    /// missing row means the schema is broken.
    pub fn get_policy(&self) -> Result<DbPolicy, DbError> {
        let (enabled, share_divisions_json, min_sample, dp_epsilon, max_drift, updated_at): (
            i32,
            String,
            i64,
            f64,
            f64,
            String,
        ) = self.conn.query_row(
            "SELECT enabled, share_divisions, min_sample, dp_epsilon,
                    max_daily_weight_drift, updated_at
             FROM federation_policy
             WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )?;

        let share_divisions: Vec<String> =
            serde_json::from_str(&share_divisions_json).unwrap_or_default();

        Ok(DbPolicy {
            enabled: enabled != 0,
            share_divisions,
            min_sample,
            dp_epsilon,
            max_daily_weight_drift: max_drift,
            updated_at,
        })
    }

    /// Replace the policy singleton.
    pub fn set_policy(&self, policy: &DbPolicy) -> Result<(), DbError> {
        // Encoding a Vec<String> cannot fail
        let share_divisions_json =
            serde_json::to_string(&policy.share_divisions).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE federation_policy
             SET enabled = ?1, share_divisions = ?2, min_sample = ?3,
                 dp_epsilon = ?4, max_daily_weight_drift = ?5, updated_at = ?6
             WHERE id = 1",
            params![
                policy.enabled as i32,
                share_divisions_json,
                policy.min_sample,
                policy.dp_epsilon,
                policy.max_daily_weight_drift,
                now,
            ],
        )?;
        Ok(())
    }
}
