pub mod models;

mod lock;
mod usage;


use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use models::*;

const ENTRY_COLUMNS: &str = "id, url, status, extracted_title, extracted_content, transcript_json,
     expected_segment_count, retry_count, next_retry_at, error_message,
     force_reprocess, created_at, processed_at";

const EPISODE_COLUMNS: &str =
    "id, entry_id, title, audio_ref, duration_seconds, size_bytes, published_at";

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that SQL
/// string comparison orders them chronologically.
pub fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp: {}", raw).into(),
        )
    })
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => time_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        url: row.get(1)?,
        status: row.get::<_, String>(2)?.into(),
        extracted_title: row.get(3)?,
        extracted_content: row.get(4)?,
        transcript_json: row.get(5)?,
        expected_segment_count: row.get(6)?,
        retry_count: row.get::<_, i64>(7)?.max(0) as u32,
        next_retry_at: opt_time_col(row, 8)?,
        error_message: row.get(9)?,
        force_reprocess: row.get::<_, i32>(10)? == 1,
        created_at: time_col(row, 11)?,
        processed_at: opt_time_col(row, 12)?,
    })
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        title: row.get(2)?,
        audio_ref: row.get(3)?,
        duration_seconds: row.get(4)?,
        size_bytes: row.get(5)?,
        published_at: time_col(row, 6)?,
    })
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Several scheduler processes may share the file; writers wait for
        // each other instead of failing with SQLITE_BUSY.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
                extracted_title TEXT,
                extracted_content TEXT,
                transcript_json TEXT,
                expected_segment_count INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                error_message TEXT,
                force_reprocess INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                processed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_entries_status_created
                ON entries(status, created_at);

            CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                entry_id TEXT NOT NULL,
                title TEXT NOT NULL,
                audio_ref TEXT NOT NULL,
                duration_seconds REAL NOT NULL,
                size_bytes INTEGER NOT NULL,
                published_at TEXT NOT NULL,
                FOREIGN KEY (entry_id) REFERENCES entries(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_published ON episodes(published_at);
            CREATE INDEX IF NOT EXISTS idx_episodes_entry ON episodes(entry_id);

            -- Append-only ledger of billed operations
            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT,
                service TEXT NOT NULL,
                model TEXT NOT NULL,
                input_units INTEGER NOT NULL DEFAULT 0,
                output_units INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_usage_created ON usage_records(created_at);
            CREATE INDEX IF NOT EXISTS idx_usage_entry ON usage_records(entry_id);

            -- Single-row processing lock; NULL locked_at means free
            CREATE TABLE IF NOT EXISTS processing_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                locked_at TEXT,
                locked_by TEXT
            );

            INSERT OR IGNORE INTO processing_lock (id, locked_at, locked_by) VALUES (1, NULL, NULL);

            -- App settings (key-value store)
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT DEFAULT (datetime('now'))
            );
        "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Entry queries
    // =========================================================================

    /// Insert a new pending entry. Fails if the URL is already present.
    pub fn create_entry(&self, url: &str, now: DateTime<Utc>) -> Result<Entry> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO entries (id, url, status, retry_count, force_reprocess, created_at)
                 VALUES (?1, ?2, 'pending', 0, 0, ?3)",
                params![id, url, to_db_time(now)],
            )?;
        }
        self.get_entry(&id)?
            .ok_or_else(|| anyhow!("entry {} vanished after insert", id))
    }

    pub fn get_entry(&self, id: &str) -> Result<Option<Entry>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS);
        let entry = conn
            .query_row(&sql, params![id], entry_from_row)
            .optional()?;
        Ok(entry)
    }

    pub fn get_entry_by_url(&self, url: &str) -> Result<Option<Entry>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM entries WHERE url = ?1", ENTRY_COLUMNS);
        let entry = conn
            .query_row(&sql, params![url], entry_from_row)
            .optional()?;
        Ok(entry)
    }

    pub fn list_entries(&self, status: Option<EntryStatus>, limit: i64) -> Result<Vec<Entry>> {
        let conn = self.conn()?;
        let (sql, status_param) = match status {
            Some(s) => (
                format!(
                    "SELECT {} FROM entries WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                    ENTRY_COLUMNS
                ),
                Some(s.as_str()),
            ),
            None => (
                format!(
                    "SELECT {} FROM entries WHERE ?1 IS NULL ORDER BY created_at DESC LIMIT ?2",
                    ENTRY_COLUMNS
                ),
                None,
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![status_param, limit], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count_entries(&self, max_retries: u32) -> Result<EntryCounts> {
        let conn = self.conn()?;
        let mut counts = EntryCounts::default();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM entries GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match EntryStatus::from(status) {
                EntryStatus::Pending => counts.pending += count,
                EntryStatus::Processing => counts.processing += count,
                EntryStatus::Completed => counts.completed += count,
                EntryStatus::Failed => counts.failed += count,
            }
        }
        counts.terminal = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE status = 'failed' AND retry_count >= ?1",
            params![max_retries],
            |row| row.get(0),
        )?;
        Ok(counts)
    }

    /// Entries the scheduler may pick up now, oldest first.
    pub fn eligible_entries(&self, max_retries: u32, now: DateTime<Utc>) -> Result<Vec<Entry>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM entries
             WHERE status = 'pending'
                OR (status = 'failed'
                    AND retry_count < ?1
                    AND (next_retry_at IS NULL OR next_retry_at <= ?2))
             ORDER BY created_at ASC",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![max_retries, to_db_time(now)], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Fresh read of the retry counter, bypassing any in-memory copy.
    pub fn get_retry_count(&self, id: &str) -> Result<u32> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT retry_count FROM entries WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u32)
    }

    pub fn mark_processing(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE entries SET status = 'processing' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Drop every cached artifact and clear the force flag.
    pub fn clear_artifacts(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE entries SET
                extracted_title = NULL,
                extracted_content = NULL,
                transcript_json = NULL,
                expected_segment_count = NULL,
                force_reprocess = 0
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn save_extracted_content(&self, id: &str, title: &str, body: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE entries SET extracted_title = ?1, extracted_content = ?2 WHERE id = ?3",
            params![title, body, id],
        )?;
        Ok(())
    }

    pub fn save_transcript(&self, id: &str, transcript_json: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE entries SET transcript_json = ?1, expected_segment_count = NULL WHERE id = ?2",
            params![transcript_json, id],
        )?;
        Ok(())
    }

    pub fn save_expected_segment_count(&self, id: &str, count: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE entries SET expected_segment_count = ?1 WHERE id = ?2",
            params![count, id],
        )?;
        Ok(())
    }

    /// Insert the episode and mark the entry completed in one transaction.
    /// A reprocess requested while the run was in flight leaves the entry
    /// pending so the request is honoured on the next run.
    pub fn complete_entry(
        &self,
        entry_id: &str,
        episode: &NewEpisode,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = to_db_time(now);
        tx.execute(
            "INSERT INTO episodes (id, entry_id, title, audio_ref, duration_seconds, size_bytes, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                episode.id,
                entry_id,
                episode.title,
                episode.audio_ref,
                episode.duration_seconds,
                episode.size_bytes,
                now
            ],
        )?;
        tx.execute(
            "UPDATE entries SET
                status = CASE WHEN force_reprocess = 1 THEN 'pending' ELSE 'completed' END,
                processed_at = ?1,
                error_message = NULL,
                next_retry_at = NULL
             WHERE id = ?2",
            params![now, entry_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persist a failed attempt. `next_retry_at = None` marks it terminal.
    pub fn record_failure(
        &self,
        id: &str,
        error: &str,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE entries SET
                status = 'failed',
                error_message = ?1,
                retry_count = ?2,
                next_retry_at = ?3
             WHERE id = ?4",
            params![error, retry_count, next_retry_at.map(to_db_time), id],
        )?;
        Ok(())
    }

    /// Queue a full rerun of an entry, whatever state it is in.
    pub fn request_reprocess(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entries SET
                force_reprocess = 1,
                status = 'pending',
                retry_count = 0,
                next_retry_at = NULL,
                error_message = NULL
             WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Give a failed entry a fresh retry budget, keeping its cached artifacts.
    pub fn reset_for_retry(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entries SET
                status = 'pending',
                retry_count = 0,
                next_retry_at = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Reset any stuck "processing" entries to "pending" (for recovery after crash)
    pub fn reset_stuck_processing(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE entries SET status = 'pending' WHERE status = 'processing'",
            [],
        )?;
        if count > 0 {
            log::info!("Reset {} stuck processing entries to pending", count);
        }
        Ok(count)
    }

    // =========================================================================
    // Episode queries
    // =========================================================================

    pub fn get_episode_for_entry(&self, entry_id: &str) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes WHERE entry_id = ?1 ORDER BY published_at DESC LIMIT 1",
            EPISODE_COLUMNS
        );
        let episode = conn
            .query_row(&sql, params![entry_id], episode_from_row)
            .optional()?;
        Ok(episode)
    }

    pub fn list_episodes(&self, limit: i64) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes ORDER BY published_at DESC LIMIT ?1",
            EPISODE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let episodes = stmt
            .query_map(params![limit], episode_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(episodes)
    }

    pub fn delete_episodes_published_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "DELETE FROM episodes WHERE published_at < ?1",
            params![to_db_time(cutoff)],
        )?;
        Ok(count)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM app_settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }
}
