//! In-process fakes for driving the pipeline and scheduler in tests.

use crate::budget::{BudgetGate, BudgetLedger, BudgetLevel, BudgetStatus, Usage};
use crate::config::Rate;
use crate::database::{Database, Entry};
use crate::error::AppError;
use crate::notify::Notifier;
use crate::stages::{
    ExtractedContent, Extractor, FallbackContent, Fetcher, PublishedAudio, Publisher, ScriptLine,
    ScriptOutput, ScriptWriter, SegmentStore, Stages, SynthesisOutput, Synthesizer,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use super::pipeline::{Pipeline, PipelineSettings};

pub const TEST_MIN_CONTENT: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: usize,
    pub extract: usize,
    pub fallback: usize,
    pub script: usize,
    pub synthesize: usize,
    pub publish: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Fetch,
    Extract,
    Fallback,
    Script,
    Synthesize,
    Publish,
}

struct FakeState {
    calls: CallCounts,
    fail_at: Option<FailAt>,
    bill_failures: bool,
    structural_body: String,
    fallback_body: String,
    script_lines: usize,
    fetched_urls: Vec<String>,
    published_segments: usize,
}

/// One object standing in for every stage executor.
pub struct FakeStages {
    segments: SegmentStore,
    state: Mutex<FakeState>,
}

impl FakeStages {
    pub fn new(segments: SegmentStore) -> Self {
        Self {
            segments,
            state: Mutex::new(FakeState {
                calls: CallCounts::default(),
                fail_at: None,
                bill_failures: false,
                structural_body: format!("Structural body. {}", "Lorem ipsum dolor sit amet. ".repeat(5)),
                fallback_body: format!("Fallback body. {}", "Consectetur adipiscing elit. ".repeat(5)),
                script_lines: 3,
                fetched_urls: Vec::new(),
                published_segments: 0,
            }),
        }
    }

    pub fn stages(self: &Arc<Self>) -> Stages {
        Stages {
            fetcher: self.clone() as Arc<dyn Fetcher>,
            extractor: self.clone() as Arc<dyn Extractor>,
            script_writer: self.clone() as Arc<dyn ScriptWriter>,
            synthesizer: self.clone() as Arc<dyn Synthesizer>,
            publisher: self.clone() as Arc<dyn Publisher>,
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().unwrap().calls
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls = CallCounts::default();
    }

    pub fn fail_at(&self, stage: FailAt) {
        self.state.lock().unwrap().fail_at = Some(stage);
    }

    /// Injected failures at billed stages carry the usage of the failed call.
    pub fn bill_failures(&self) {
        self.state.lock().unwrap().bill_failures = true;
    }

    pub fn clear_failure(&self) {
        self.state.lock().unwrap().fail_at = None;
    }

    pub fn set_structural_body(&self, body: &str) {
        self.state.lock().unwrap().structural_body = body.to_string();
    }

    pub fn set_fallback_body(&self, body: &str) {
        self.state.lock().unwrap().fallback_body = body.to_string();
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.state.lock().unwrap().fetched_urls.clone()
    }

    pub fn published_segments(&self) -> usize {
        self.state.lock().unwrap().published_segments
    }

    /// Count the call and return the injected failure for `stage`, if any.
    fn enter(&self, stage: FailAt) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let calls = &mut state.calls;
        match stage {
            FailAt::Fetch => calls.fetch += 1,
            FailAt::Extract => calls.extract += 1,
            FailAt::Fallback => calls.fallback += 1,
            FailAt::Script => calls.script += 1,
            FailAt::Synthesize => calls.synthesize += 1,
            FailAt::Publish => calls.publish += 1,
        }
        if state.fail_at == Some(stage) {
            let name = match stage {
                FailAt::Fetch => "fetch",
                FailAt::Extract | FailAt::Fallback => "extract",
                FailAt::Script => "script",
                FailAt::Synthesize => "synthesize",
                FailAt::Publish => "publish",
            };
            let error = AppError::stage(name, "injected failure");
            let usage = match stage {
                FailAt::Fallback | FailAt::Script => Some(Usage::new("llm", "fake-llm", 100, 50)),
                FailAt::Synthesize => Some(Usage::new("tts", "fake-tts", 10, 0)),
                _ => None,
            };
            return Err(match usage {
                Some(usage) if state.bill_failures => AppError::billed(usage, error),
                _ => error,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for FakeStages {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.enter(FailAt::Fetch)?;
        self.state.lock().unwrap().fetched_urls.push(url.to_string());
        Ok("<html><body><article><p>fake</p></article></body></html>".to_string())
    }
}

#[async_trait]
impl Extractor for FakeStages {
    fn extract(&self, _html: &str) -> Result<ExtractedContent, AppError> {
        self.enter(FailAt::Extract)?;
        Ok(ExtractedContent {
            title: Some("Fake Title".to_string()),
            body: self.state.lock().unwrap().structural_body.clone(),
        })
    }

    async fn extract_fallback(&self, _html: &str) -> Result<FallbackContent, AppError> {
        self.enter(FailAt::Fallback)?;
        Ok(FallbackContent {
            body: self.state.lock().unwrap().fallback_body.clone(),
            usage: Usage::new("llm", "fake-llm", 200, 40),
        })
    }
}

#[async_trait]
impl ScriptWriter for FakeStages {
    async fn generate_script(&self, _title: &str, _body: &str) -> Result<ScriptOutput, AppError> {
        self.enter(FailAt::Script)?;
        let lines = self.state.lock().unwrap().script_lines;
        let script = (0..lines)
            .map(|i| ScriptLine {
                speaker: if i % 2 == 0 { "Host" } else { "Guest" }.to_string(),
                text: format!("Generated line {}", i),
                instruction: "neutral".to_string(),
            })
            .collect();
        Ok(ScriptOutput {
            script,
            usage: Usage::new("llm", "fake-llm", 100, 50),
        })
    }
}

#[async_trait]
impl Synthesizer for FakeStages {
    async fn synthesize(
        &self,
        entry_id: &str,
        script: &[ScriptLine],
    ) -> Result<SynthesisOutput, AppError> {
        self.enter(FailAt::Synthesize)?;
        self.segments.ensure_dir()?;
        let mut segment_paths = Vec::new();
        let mut characters = 0;
        for (i, line) in script.iter().enumerate() {
            let path = self.segments.path(entry_id, i);
            std::fs::write(&path, line.text.as_bytes())?;
            characters += line.text.len() as i64;
            segment_paths.push(path);
        }
        Ok(SynthesisOutput {
            segment_paths,
            usage: Usage::new("tts", "fake-tts", characters, 0),
        })
    }
}

#[async_trait]
impl Publisher for FakeStages {
    async fn publish(
        &self,
        episode_id: &str,
        segment_paths: &[PathBuf],
    ) -> Result<PublishedAudio, AppError> {
        self.enter(FailAt::Publish)?;
        let mut size = 0;
        for path in segment_paths {
            size += std::fs::metadata(path)?.len() as i64;
        }
        self.state.lock().unwrap().published_segments = segment_paths.len();
        Ok(PublishedAudio {
            audio_ref: format!("https://cdn.test/{}.mp3", episode_id),
            duration_seconds: segment_paths.len() as f64 * 2.5,
            size_bytes: size,
        })
    }
}

/// Records every notification it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    failures: Mutex<Vec<(String, String)>>,
    budget: Mutex<Vec<BudgetLevel>>,
}

impl RecordingNotifier {
    /// `(entry_id, message)` per permanent failure.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().unwrap().clone()
    }

    pub fn budget_transitions(&self) -> Vec<BudgetLevel> {
        self.budget.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn on_permanent_failure(&self, entry_id: &str, _url: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((entry_id.to_string(), message.to_string()));
    }

    async fn on_budget_transition(&self, level: BudgetLevel, _spent_usd: f64, _budget_usd: f64) {
        self.budget.lock().unwrap().push(level);
    }
}

/// Budget gate whose `can_process` answers are scripted in advance.
pub struct ScriptedBudget {
    level: BudgetLevel,
    answers: Mutex<VecDeque<bool>>,
    checks: Mutex<usize>,
}

impl ScriptedBudget {
    pub fn new(level: BudgetLevel, answers: &[bool]) -> Self {
        Self {
            level,
            answers: Mutex::new(answers.iter().copied().collect()),
            checks: Mutex::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        *self.checks.lock().unwrap()
    }
}

impl BudgetGate for ScriptedBudget {
    fn status(&self) -> Result<BudgetStatus, AppError> {
        Ok(BudgetStatus {
            spent_usd: 0.0,
            budget_usd: 10.0,
            percent_used: 0.0,
            level: self.level,
            period_start: Utc::now(),
        })
    }

    fn can_process(&self) -> Result<bool, AppError> {
        *self.checks.lock().unwrap() += 1;
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or(true))
    }

    fn log_usage(&self, _entry_id: Option<&str>, _usage: &Usage) -> Result<f64, AppError> {
        Ok(0.0)
    }

    fn record_status(&self, _status: &BudgetStatus) -> Result<Option<BudgetLevel>, AppError> {
        Ok(None)
    }
}

/// Temporary database, segment directory and fakes wired together.
pub struct TestEnv {
    pub db: Arc<Database>,
    pub segments: SegmentStore,
    pub fakes: Arc<FakeStages>,
    pub notifier: Arc<RecordingNotifier>,
    pub ledger: Arc<BudgetLedger>,
    _temp: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_budget(1000.0)
    }

    pub fn with_budget(monthly_budget_usd: f64) -> Self {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        let segments = SegmentStore::new(temp.path().join("segments"));
        segments.ensure_dir().unwrap();

        let mut pricing = HashMap::new();
        for model in ["fake-llm", "fake-tts", "priced"] {
            pricing.insert(
                model.to_string(),
                Rate {
                    input_per_million: 1.0,
                    output_per_million: 1.0,
                },
            );
        }
        let ledger = Arc::new(BudgetLedger::new(db.clone(), monthly_budget_usd, 80.0, pricing));

        Self {
            fakes: Arc::new(FakeStages::new(segments.clone())),
            notifier: Arc::new(RecordingNotifier::default()),
            db,
            segments,
            ledger,
            _temp: temp,
        }
    }

    pub fn add_entry(&self, url: &str) -> Entry {
        self.db.create_entry(url, Utc::now()).unwrap()
    }

    pub fn add_entry_at(&self, url: &str, at: DateTime<Utc>) -> Entry {
        self.db.create_entry(url, at).unwrap()
    }

    pub fn reload(&self, id: &str) -> Entry {
        self.db.get_entry(id).unwrap().unwrap()
    }

    /// Write placeholder segments `0..count` for `entry_id`.
    pub fn write_segments(&self, entry_id: &str, count: usize) {
        for i in 0..count {
            std::fs::write(self.segments.path(entry_id, i), b"audio").unwrap();
        }
    }

    pub fn segment_count(&self, entry_id: &str) -> usize {
        let prefix = format!("{}_", entry_id);
        std::fs::read_dir(self.segments.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .count()
    }

    pub fn pipeline(&self, max_retries: u32) -> Pipeline {
        self.pipeline_with_budget(max_retries, self.ledger.clone())
    }

    pub fn pipeline_with_budget(&self, max_retries: u32, budget: Arc<dyn BudgetGate>) -> Pipeline {
        Pipeline::new(
            self.db.clone(),
            budget,
            self.notifier.clone(),
            self.fakes.stages(),
            self.segments.clone(),
            PipelineSettings {
                max_retries,
                min_content_length: TEST_MIN_CONTENT,
            },
        )
    }
}
