use crate::budget::{BudgetGate, BudgetStatus};
use crate::database::{Database, Entry, EntryCounts, EntryStatus, LockState};
use crate::error::AppError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub entries: EntryCounts,
    pub budget: BudgetStatus,
    pub lock: LockState,
    pub recent_failures: Vec<FailureSummary>,
}

#[derive(Debug, Serialize)]
pub struct FailureSummary {
    pub id: String,
    pub url: String,
    pub retry_count: u32,
    pub error_message: Option<String>,
    /// No retry scheduled: the entry is out of attempts.
    pub terminal: bool,
}

impl From<Entry> for FailureSummary {
    fn from(entry: Entry) -> Self {
        Self {
            terminal: entry.next_retry_at.is_none(),
            id: entry.id,
            url: entry.url,
            retry_count: entry.retry_count,
            error_message: entry.error_message,
        }
    }
}

/// Queue counts, current spend and lock holder.
pub fn get_status(
    db: &Database,
    budget: &dyn BudgetGate,
    max_retries: u32,
) -> Result<StatusReport, AppError> {
    let recent_failures = db
        .list_entries(Some(EntryStatus::Failed), 10)?
        .into_iter()
        .map(FailureSummary::from)
        .collect();

    Ok(StatusReport {
        entries: db.count_entries(max_retries)?,
        budget: budget.status()?,
        lock: db.get_lock_state()?,
        recent_failures,
    })
}
