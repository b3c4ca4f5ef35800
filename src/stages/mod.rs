//! Stage executors.
//!
//! Each pipeline stage sits behind a trait so the worker can be driven by
//! fakes in tests. The production implementations live in the submodules.

pub mod extract;
pub mod fetch;
pub mod publish;
pub mod script;
pub mod segments;
pub mod synthesize;

use crate::budget::Usage;
use crate::error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use extract::HtmlExtractor;
pub use fetch::HttpFetcher;
pub use publish::FilePublisher;
pub use script::{parse_script, LlmScriptWriter};
pub use segments::SegmentStore;
pub use synthesize::SpeechSynthesizer;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedContent {
    pub title: Option<String>,
    pub body: String,
}

/// Body recovered by the billed fallback extractor.
#[derive(Debug, Clone)]
pub struct FallbackContent {
    pub body: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptLine {
    pub speaker: String,
    pub text: String,
    #[serde(default, alias = "delivery", alias = "delivery_instruction")]
    pub instruction: String,
}

#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub script: Vec<ScriptLine>,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub segment_paths: Vec<PathBuf>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedAudio {
    pub audio_ref: String,
    pub duration_seconds: f64,
    pub size_bytes: i64,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, AppError>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Free structural extraction.
    fn extract(&self, html: &str) -> Result<ExtractedContent, AppError>;

    /// Billed extraction used when the structural body is missing or short.
    async fn extract_fallback(&self, html: &str) -> Result<FallbackContent, AppError>;
}

#[async_trait]
pub trait ScriptWriter: Send + Sync {
    async fn generate_script(&self, title: &str, body: &str) -> Result<ScriptOutput, AppError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render one segment per script line, named by [`SegmentStore::path`].
    async fn synthesize(
        &self,
        entry_id: &str,
        script: &[ScriptLine],
    ) -> Result<SynthesisOutput, AppError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        episode_id: &str,
        segment_paths: &[PathBuf],
    ) -> Result<PublishedAudio, AppError>;
}

/// The full set of executors a pipeline runs with.
#[derive(Clone)]
pub struct Stages {
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub script_writer: Arc<dyn ScriptWriter>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub publisher: Arc<dyn Publisher>,
}
