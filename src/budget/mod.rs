//! Monthly cost ledger.
//!
//! Every billed stage call is written to `usage_records` with a cost computed
//! from the configured pricing table. Spending is summed over the current
//! calendar month (UTC) and compared against the monthly budget.

use crate::config::Rate;
use crate::database::{Database, NewUsageRecord};
use crate::error::AppError;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const LAST_STATUS_KEY: &str = "budget_last_status";
const LAST_PERIOD_KEY: &str = "budget_last_period";

/// Units consumed by one billed call, as reported by a stage executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub service: String,
    pub model: String,
    pub input_units: i64,
    pub output_units: i64,
}

impl Usage {
    pub fn new(service: &str, model: &str, input_units: i64, output_units: i64) -> Self {
        Self {
            service: service.to_string(),
            model: model.to_string(),
            input_units,
            output_units,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLevel {
    Ok,
    Warning,
    Exceeded,
}

impl BudgetLevel {
    pub fn allows_processing(&self) -> bool {
        !matches!(self, Self::Exceeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Exceeded => "exceeded",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "warning" => Some(Self::Warning),
            "exceeded" => Some(Self::Exceeded),
            _ => None,
        }
    }
}

impl std::fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub spent_usd: f64,
    pub budget_usd: f64,
    pub percent_used: f64,
    pub level: BudgetLevel,
    pub period_start: DateTime<Utc>,
}

impl BudgetStatus {
    /// `YYYY-MM` key of the period this status was computed for.
    pub fn period_key(&self) -> String {
        self.period_start.format("%Y-%m").to_string()
    }
}

/// What the scheduler and pipeline need from the ledger.
pub trait BudgetGate: Send + Sync {
    fn status(&self) -> Result<BudgetStatus, AppError>;

    fn can_process(&self) -> Result<bool, AppError> {
        Ok(self.status()?.level.allows_processing())
    }

    /// Record one billed call; returns the computed cost.
    fn log_usage(&self, entry_id: Option<&str>, usage: &Usage) -> Result<f64, AppError>;

    /// Remember `status` as the latest observation and report the threshold
    /// newly crossed since the previous one, if any.
    fn record_status(&self, status: &BudgetStatus) -> Result<Option<BudgetLevel>, AppError>;
}

pub struct BudgetLedger {
    db: Arc<Database>,
    monthly_budget_usd: f64,
    warning_percent: f64,
    pricing: HashMap<String, Rate>,
}

impl BudgetLedger {
    pub fn new(
        db: Arc<Database>,
        monthly_budget_usd: f64,
        warning_percent: f64,
        pricing: HashMap<String, Rate>,
    ) -> Self {
        Self {
            db,
            monthly_budget_usd,
            warning_percent,
            pricing,
        }
    }

    pub fn cost_for(&self, usage: &Usage) -> f64 {
        match self.pricing.get(&usage.model) {
            Some(rate) => {
                (usage.input_units.max(0) as f64) * rate.input_per_million / 1_000_000.0
                    + (usage.output_units.max(0) as f64) * rate.output_per_million / 1_000_000.0
            }
            None => {
                log::warn!(
                    "No pricing configured for model '{}' ({}), recording zero cost",
                    usage.model,
                    usage.service
                );
                0.0
            }
        }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> Result<BudgetStatus, AppError> {
        let (start, end) = month_bounds(now);
        let spent = self.db.total_cost_between(start, end)?;
        let percent_used = if self.monthly_budget_usd > 0.0 {
            spent / self.monthly_budget_usd * 100.0
        } else {
            100.0
        };
        Ok(BudgetStatus {
            spent_usd: spent,
            budget_usd: self.monthly_budget_usd,
            percent_used,
            level: level_for(percent_used, self.warning_percent),
            period_start: start,
        })
    }

    pub fn log_usage_at(
        &self,
        entry_id: Option<&str>,
        usage: &Usage,
        now: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        let cost = self.cost_for(usage);
        self.db.insert_usage(
            &NewUsageRecord {
                entry_id: entry_id.map(str::to_string),
                service: usage.service.clone(),
                model: usage.model.clone(),
                input_units: usage.input_units,
                output_units: usage.output_units,
                cost_usd: cost,
            },
            now,
        )?;
        log::debug!(
            "Usage: {} {} in={} out={} cost=${:.4} entry={:?}",
            usage.service,
            usage.model,
            usage.input_units,
            usage.output_units,
            cost,
            entry_id
        );
        Ok(cost)
    }
}

impl BudgetGate for BudgetLedger {
    fn status(&self) -> Result<BudgetStatus, AppError> {
        self.status_at(Utc::now())
    }

    fn log_usage(&self, entry_id: Option<&str>, usage: &Usage) -> Result<f64, AppError> {
        self.log_usage_at(entry_id, usage, Utc::now())
    }

    fn record_status(&self, status: &BudgetStatus) -> Result<Option<BudgetLevel>, AppError> {
        let period = status.period_key();
        let same_period = self.db.get_setting(LAST_PERIOD_KEY)?.as_deref() == Some(period.as_str());
        let previous = if same_period {
            self.db
                .get_setting(LAST_STATUS_KEY)?
                .as_deref()
                .and_then(BudgetLevel::parse)
                .unwrap_or(BudgetLevel::Ok)
        } else {
            BudgetLevel::Ok
        };

        self.db.set_setting(LAST_STATUS_KEY, status.level.as_str())?;
        self.db.set_setting(LAST_PERIOD_KEY, &period)?;

        Ok(crossed_threshold(previous, status.level))
    }
}

/// `[first instant of the month, first instant of the next month)`.
pub fn month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, end)
}

pub fn level_for(percent_used: f64, warning_percent: f64) -> BudgetLevel {
    if percent_used >= 100.0 {
        BudgetLevel::Exceeded
    } else if percent_used >= warning_percent {
        BudgetLevel::Warning
    } else {
        BudgetLevel::Ok
    }
}

/// Transitions that warrant a notification: ok→warning and anything→exceeded.
pub fn crossed_threshold(previous: BudgetLevel, current: BudgetLevel) -> Option<BudgetLevel> {
    match (previous, current) {
        (BudgetLevel::Exceeded, BudgetLevel::Exceeded) => None,
        (_, BudgetLevel::Exceeded) => Some(BudgetLevel::Exceeded),
        (BudgetLevel::Ok, BudgetLevel::Warning) => Some(BudgetLevel::Warning),
        _ => None,
    }
}
