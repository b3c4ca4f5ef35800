//! Periodic jobs: the lock-guarded processing batch and the cleanup sweep.

use crate::budget::{BudgetGate, BudgetStatus};
use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::notify::Notifier;
use crate::stages::SegmentStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::pipeline::Pipeline;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_retries: u32,
    pub lock_stale_after: chrono::Duration,
    pub episode_retention: chrono::Duration,
    pub orphan_max_age: Duration,
    pub process_interval: Duration,
    pub cleanup_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            lock_stale_after: config.lock_stale_timeout(),
            episode_retention: config.episode_retention(),
            orphan_max_age: config.orphan_segment_max_age(),
            process_interval: Duration::from_secs(config.process_interval_minutes * 60),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_minutes * 60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub selected: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stopped_for_budget: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Another worker holds the lock.
    LockBusy { holder: Option<String> },
    BudgetBlocked { status: BudgetStatus },
    Ran(BatchSummary),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub episodes_deleted: usize,
    pub stuck_reset: usize,
    /// The processing lock was held, so processing entries were left alone.
    pub stuck_reset_skipped: bool,
    pub orphans_removed: usize,
    pub errors: Vec<String>,
}

/// `<host>:<pid>:<random>`, unique per scheduler instance.
pub fn instance_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "host".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", host, std::process::id(), &nonce[..8])
}

/// Frees the processing lock when dropped.
struct LockGuard<'a> {
    db: &'a Database,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.db.release_lock() {
            log::error!("Failed to release processing lock: {}", e);
        }
    }
}

pub struct Scheduler {
    db: Arc<Database>,
    budget: Arc<dyn BudgetGate>,
    notifier: Arc<dyn Notifier>,
    pipeline: Arc<Pipeline>,
    segments: SegmentStore,
    settings: SchedulerSettings,
    owner: String,
    trigger: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        budget: Arc<dyn BudgetGate>,
        notifier: Arc<dyn Notifier>,
        pipeline: Arc<Pipeline>,
        segments: SegmentStore,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            db,
            budget,
            notifier,
            pipeline,
            segments,
            settings,
            owner: instance_identity(),
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Handle that wakes the daemon for an immediate processing run.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// One processing run: take the lock, check the budget, work through
    /// every eligible entry oldest first, release the lock.
    pub async fn run_processing_job(&self) -> Result<JobOutcome, AppError> {
        if !self
            .db
            .try_acquire_lock(&self.owner, Utc::now(), self.settings.lock_stale_after)?
        {
            let holder = self.db.get_lock_state().ok().and_then(|s| s.locked_by);
            log::info!(
                "Processing lock held by {}, skipping this run",
                holder.as_deref().unwrap_or("unknown")
            );
            return Ok(JobOutcome::LockBusy { holder });
        }

        let _guard = LockGuard { db: &self.db };
        log::debug!("Processing lock acquired by {}", self.owner);
        self.process_batch().await
    }

    async fn process_batch(&self) -> Result<JobOutcome, AppError> {
        let status = self.budget.status()?;
        match self.budget.record_status(&status) {
            Ok(Some(level)) => {
                log::warn!(
                    "Budget crossed into {}: ${:.2} of ${:.2} ({:.0}%)",
                    level,
                    status.spent_usd,
                    status.budget_usd,
                    status.percent_used
                );
                self.notifier
                    .on_budget_transition(level, status.spent_usd, status.budget_usd)
                    .await;
            }
            Ok(None) => {}
            Err(e) => log::error!("Failed to record budget status: {}", e),
        }

        if !status.level.allows_processing() {
            log::warn!(
                "Monthly budget exhausted (${:.2} of ${:.2}), not processing",
                status.spent_usd,
                status.budget_usd
            );
            return Ok(JobOutcome::BudgetBlocked { status });
        }

        let entries = self
            .db
            .eligible_entries(self.settings.max_retries, Utc::now())?;
        let mut summary = BatchSummary {
            selected: entries.len(),
            ..BatchSummary::default()
        };
        if entries.is_empty() {
            log::debug!("No eligible entries");
            return Ok(JobOutcome::Ran(summary));
        }
        log::info!("Processing {} eligible entries", entries.len());

        for entry in &entries {
            match self.budget.can_process() {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!(
                        "Budget exhausted mid-batch, leaving {} entries for later",
                        entries.len() - summary.processed
                    );
                    summary.stopped_for_budget = true;
                    break;
                }
                Err(e) => {
                    log::error!("Budget check failed, stopping batch: {}", e);
                    summary.stopped_for_budget = true;
                    break;
                }
            }

            let result = self.pipeline.process_entry(entry).await;
            summary.processed += 1;
            if result.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        log::info!(
            "Batch done: {} processed, {} succeeded, {} failed",
            summary.processed,
            summary.succeeded,
            summary.failed
        );
        Ok(JobOutcome::Ran(summary))
    }

    /// Retention, stuck-entry recovery and orphan segment removal. Each step
    /// runs even when an earlier one fails.
    pub async fn run_cleanup_job(&self) -> CleanupReport {
        self.cleanup_at(Utc::now(), SystemTime::now())
    }

    pub fn cleanup_at(&self, now: chrono::DateTime<Utc>, fs_now: SystemTime) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self
            .db
            .delete_episodes_published_before(now - self.settings.episode_retention)
        {
            Ok(n) => report.episodes_deleted = n,
            Err(e) => report.errors.push(format!("episode retention: {}", e)),
        }

        // Entries marked processing belong to whoever holds the lock.
        let cleanup_owner = format!("{}:cleanup", self.owner);
        match self
            .db
            .try_acquire_lock(&cleanup_owner, now, self.settings.lock_stale_after)
        {
            Ok(true) => {
                let _guard = LockGuard { db: &self.db };
                match self.db.reset_stuck_processing() {
                    Ok(n) => report.stuck_reset = n,
                    Err(e) => report.errors.push(format!("stuck reset: {}", e)),
                }
            }
            Ok(false) => {
                log::info!("Processing lock held, skipping stuck-entry reset");
                report.stuck_reset_skipped = true;
            }
            Err(e) => report.errors.push(format!("lock: {}", e)),
        }

        match self
            .segments
            .sweep_orphans(self.settings.orphan_max_age, fs_now)
        {
            Ok(n) => report.orphans_removed = n,
            Err(e) => report.errors.push(format!("orphan sweep: {}", e)),
        }

        for error in &report.errors {
            log::error!("Cleanup step failed: {}", error);
        }
        log::info!(
            "Cleanup: {} episodes expired, {} stuck entries reset, {} orphan segments removed",
            report.episodes_deleted,
            report.stuck_reset,
            report.orphans_removed
        );
        report
    }

    /// Run both jobs on their intervals until `cancel` fires. A running job
    /// always finishes before shutdown.
    pub async fn run(&self, cancel: CancellationToken) {
        log::info!(
            "Scheduler {} started (processing every {:?}, cleanup every {:?})",
            self.owner,
            self.settings.process_interval,
            self.settings.cleanup_interval
        );

        let mut process_tick = tokio::time::interval(self.settings.process_interval);
        process_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = tokio::time::interval(self.settings.cleanup_interval);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Scheduler shutting down");
                    break;
                }
                _ = process_tick.tick() => self.log_processing(self.run_processing_job().await),
                _ = self.trigger.notified() => {
                    log::info!("Manual processing trigger");
                    self.log_processing(self.run_processing_job().await);
                }
                _ = cleanup_tick.tick() => {
                    self.run_cleanup_job().await;
                }
            }
        }

        log::info!("Scheduler stopped");
    }

    fn log_processing(&self, outcome: Result<JobOutcome, AppError>) {
        match outcome {
            Ok(JobOutcome::Ran(summary)) if summary.stopped_for_budget => {
                log::warn!("Processing stopped early for budget: {:?}", summary);
            }
            Ok(outcome) => log::debug!("Processing outcome: {:?}", outcome),
            Err(e) => log::error!("Processing job failed: {}", e),
        }
    }
}
