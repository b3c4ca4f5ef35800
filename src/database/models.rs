use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Default for EntryStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EntryStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown entry status '{}'", other)),
        }
    }
}

/// One submitted URL and everything persisted about its conversion so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub url: String,
    pub status: EntryStatus,
    pub extracted_title: Option<String>,
    pub extracted_content: Option<String>,
    pub transcript_json: Option<String>,
    pub expected_segment_count: Option<i64>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub force_reprocess: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub entry_id: String,
    pub title: String,
    pub audio_ref: String,
    pub duration_seconds: f64,
    pub size_bytes: i64,
    pub published_at: DateTime<Utc>,
}

/// Fields the pipeline supplies when an entry completes.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub id: String,
    pub title: String,
    pub audio_ref: String,
    pub duration_seconds: f64,
    pub size_bytes: i64,
}

/// One billed operation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub entry_id: Option<String>,
    pub service: String,
    pub model: String,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub entry_id: Option<String>,
    pub service: String,
    pub model: String,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockState {
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

impl LockState {
    pub fn is_held(&self) -> bool {
        self.locked_at.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// Failed entries that have used up their retries.
    pub terminal: i64,
}

impl EntryCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
