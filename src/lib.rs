pub mod budget;
pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod llm;
pub mod logging;
pub mod notify;
pub mod stages;
pub mod worker;

use budget::BudgetLedger;
use config::Config;
use database::Database;
use error::AppError;
use llm::LlmClient;
use notify::{LogNotifier, Notifier, WebhookNotifier};
use stages::fetch::FetchSettings;
use stages::{
    FilePublisher, HtmlExtractor, HttpFetcher, LlmScriptWriter, SegmentStore, SpeechSynthesizer,
    Stages,
};
use std::sync::Arc;
use std::time::Duration;
use worker::{Pipeline, PipelineSettings, Scheduler, SchedulerSettings};

/// Everything a command needs, wired from one [`Config`].
pub struct App {
    pub config: Config,
    pub db: Arc<Database>,
    pub ledger: Arc<BudgetLedger>,
    pub scheduler: Arc<Scheduler>,
}

impl App {
    pub fn build(config: Config) -> Result<Self, AppError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(Database::new(&db_path)?);
        log::info!("Database ready at {:?}", db_path);

        let segments = SegmentStore::new(config.segments_dir());
        segments.ensure_dir()?;

        let ledger = Arc::new(BudgetLedger::new(
            db.clone(),
            config.monthly_budget_usd,
            config.budget_warning_percent,
            config.pricing.clone(),
        ));

        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };

        let llm = Arc::new(LlmClient::new(&config.llm));
        let stages = Stages {
            fetcher: Arc::new(HttpFetcher::new(FetchSettings {
                timeout: Duration::from_secs(config.fetch_timeout_secs),
                max_bytes: config.fetch_max_bytes,
            })),
            extractor: Arc::new(HtmlExtractor::new(llm.clone())),
            script_writer: Arc::new(LlmScriptWriter::new(llm)),
            synthesizer: Arc::new(SpeechSynthesizer::new(config.tts.clone(), segments.clone())),
            publisher: Arc::new(FilePublisher::new(
                config.publish_dir(),
                &config.public_base_url,
                config.tts.bitrate_kbps,
            )),
        };

        let pipeline = Arc::new(Pipeline::new(
            db.clone(),
            ledger.clone(),
            notifier.clone(),
            stages,
            segments.clone(),
            PipelineSettings {
                max_retries: config.max_retries,
                min_content_length: config.min_content_length,
            },
        ));

        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            ledger.clone(),
            notifier,
            pipeline,
            segments,
            SchedulerSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            db,
            ledger,
            scheduler,
        })
    }
}
