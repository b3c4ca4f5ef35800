use super::{time_col, to_db_time, Database, NewUsageRecord, UsageRecord};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;

impl Database {
    pub fn insert_usage(&self, record: &NewUsageRecord, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO usage_records (entry_id, service, model, input_units, output_units, cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.entry_id,
                record.service,
                record.model,
                record.input_units,
                record.output_units,
                record.cost_usd,
                to_db_time(now)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Sum of costs recorded in `[since, until)`.
    pub fn total_cost_between(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<f64> {
        let conn = self.conn()?;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records
             WHERE created_at >= ?1 AND created_at < ?2",
            params![to_db_time(since), to_db_time(until)],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn usage_for_entry(&self, entry_id: &str) -> Result<Vec<UsageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entry_id, service, model, input_units, output_units, cost_usd, created_at
             FROM usage_records WHERE entry_id = ?1 ORDER BY id ASC",
        )?;
        let records = stmt
            .query_map(params![entry_id], |row| {
                Ok(UsageRecord {
                    id: row.get(0)?,
                    entry_id: row.get(1)?,
                    service: row.get(2)?,
                    model: row.get(3)?,
                    input_units: row.get(4)?,
                    output_units: row.get(5)?,
                    cost_usd: row.get(6)?,
                    created_at: time_col(row, 7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count_usage_records(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM usage_records", [], |row| row.get(0))?;
        Ok(count)
    }
}
