//! Operator notifications for permanent failures and budget thresholds.
//!
//! Notifiers never return errors: a delivery problem is logged and the
//! calling job carries on.

use crate::budget::BudgetLevel;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn on_permanent_failure(&self, entry_id: &str, url: &str, message: &str);

    async fn on_budget_transition(&self, level: BudgetLevel, spent_usd: f64, budget_usd: f64);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn on_permanent_failure(&self, entry_id: &str, url: &str, message: &str) {
        log::warn!(
            "Entry {} ({}) failed permanently: {}",
            entry_id,
            url,
            message
        );
    }

    async fn on_budget_transition(&self, level: BudgetLevel, spent_usd: f64, budget_usd: f64) {
        log::warn!(
            "Monthly budget {}: ${:.2} of ${:.2} spent",
            level,
            spent_usd,
            budget_usd
        );
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WebhookEvent<'a> {
    PermanentFailure {
        entry_id: &'a str,
        url: &'a str,
        message: &'a str,
    },
    BudgetTransition {
        level: BudgetLevel,
        spent_usd: f64,
        budget_usd: f64,
    },
}

/// Logs like [`LogNotifier`] and also POSTs a JSON event to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }

    async fn post(&self, event: &WebhookEvent<'_>) {
        match self.client.post(&self.url).json(event).send().await {
            Ok(response) if response.status().is_success() => {
                log::debug!("Webhook delivered to {}", self.url);
            }
            Ok(response) => {
                log::error!("Webhook {} returned {}", self.url, response.status());
            }
            Err(e) => {
                log::error!("Webhook {} failed: {}", self.url, e);
            }
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn on_permanent_failure(&self, entry_id: &str, url: &str, message: &str) {
        LogNotifier.on_permanent_failure(entry_id, url, message).await;
        self.post(&WebhookEvent::PermanentFailure {
            entry_id,
            url,
            message,
        })
        .await;
    }

    async fn on_budget_transition(&self, level: BudgetLevel, spent_usd: f64, budget_usd: f64) {
        LogNotifier
            .on_budget_transition(level, spent_usd, budget_usd)
            .await;
        self.post(&WebhookEvent::BudgetTransition {
            level,
            spent_usd,
            budget_usd,
        })
        .await;
    }
}
