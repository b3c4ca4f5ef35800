use super::{opt_time_col, to_db_time, Database, LockState};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

impl Database {
    /// Try to take the processing lock for `owner`.
    ///
    /// A single conditional UPDATE; whether it touched the row decides
    /// ownership. A lock whose `locked_at` is older than `stale_after` is
    /// taken over and the previous owner overwritten.
    pub fn try_acquire_lock(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let stale_cutoff = to_db_time(now - stale_after);
        let changed = conn.execute(
            "UPDATE processing_lock
             SET locked_at = ?1, locked_by = ?2
             WHERE id = 1 AND (locked_at IS NULL OR locked_at < ?3)",
            params![to_db_time(now), owner, stale_cutoff],
        )?;
        Ok(changed == 1)
    }

    /// Unconditionally free the lock.
    pub fn release_lock(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE processing_lock SET locked_at = NULL, locked_by = NULL WHERE id = 1",
            [],
        )?;
        Ok(())
    }

    pub fn get_lock_state(&self) -> Result<LockState> {
        let conn = self.conn()?;
        let state = conn.query_row(
            "SELECT locked_at, locked_by FROM processing_lock WHERE id = 1",
            [],
            |row| {
                Ok(LockState {
                    locked_at: opt_time_col(row, 0)?,
                    locked_by: row.get(1)?,
                })
            },
        )?;
        Ok(state)
    }
}
