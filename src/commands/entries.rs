use crate::database::{Database, Entry, EntryStatus, Episode, UsageRecord};
use crate::error::AppError;
use chrono::Utc;
use serde::Serialize;

use super::find_entry;

#[derive(Debug, Serialize)]
pub struct AddEntryResponse {
    pub entry: Entry,
    /// False when the URL was already queued.
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct EntryDetail {
    pub entry: Entry,
    pub episode: Option<Episode>,
    pub usage: Vec<UsageRecord>,
    pub total_cost_usd: f64,
}

/// Queue a URL. Submitting a URL twice returns the existing entry.
pub fn add_entry(db: &Database, url: &str) -> Result<AddEntryResponse, AppError> {
    let url = url.trim();
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| AppError::Other(format!("Invalid URL '{}': {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::Other(format!(
            "Unsupported URL scheme '{}'",
            parsed.scheme()
        )));
    }

    if let Some(entry) = db.get_entry_by_url(url)? {
        log::info!("URL already queued as {}", entry.id);
        return Ok(AddEntryResponse {
            entry,
            created: false,
        });
    }

    let entry = db.create_entry(url, Utc::now())?;
    log::info!("Queued {} as {}", url, entry.id);
    Ok(AddEntryResponse {
        entry,
        created: true,
    })
}

/// Discard every cached artifact and run the entry again from the start.
pub fn reprocess_entry(db: &Database, key: &str) -> Result<Entry, AppError> {
    let entry = find_entry(db, key)?;
    db.request_reprocess(&entry.id)?;
    log::info!("Entry {} queued for full reprocessing", entry.id);
    find_entry(db, &entry.id)
}

/// Give a failed entry a fresh set of retries. Cached artifacts are kept.
pub fn retry_entry(db: &Database, key: &str) -> Result<Entry, AppError> {
    let entry = find_entry(db, key)?;
    if !db.reset_for_retry(&entry.id)? {
        return Err(AppError::Other(format!(
            "Entry {} is {}, only failed entries can be retried",
            entry.id, entry.status
        )));
    }
    log::info!("Entry {} reset for retry", entry.id);
    find_entry(db, &entry.id)
}

pub fn get_entry_detail(db: &Database, key: &str) -> Result<EntryDetail, AppError> {
    let entry = find_entry(db, key)?;
    let episode = db.get_episode_for_entry(&entry.id)?;
    let usage = db.usage_for_entry(&entry.id)?;
    let total_cost_usd = usage.iter().map(|u| u.cost_usd).sum();
    Ok(EntryDetail {
        entry,
        episode,
        usage,
        total_cost_usd,
    })
}

pub fn list_entries(
    db: &Database,
    status: Option<EntryStatus>,
    limit: i64,
) -> Result<Vec<Entry>, AppError> {
    Ok(db.list_entries(status, limit)?)
}

pub fn list_episodes(db: &Database, limit: i64) -> Result<Vec<Episode>, AppError> {
    Ok(db.list_episodes(limit)?)
}
