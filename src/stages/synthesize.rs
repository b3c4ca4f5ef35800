use crate::budget::Usage;
use crate::config::TtsConfig;
use crate::error::AppError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{ScriptLine, SegmentStore, SynthesisOutput, Synthesizer};

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
}

/// OpenAI-compatible `/audio/speech` synthesizer, one request per line.
pub struct SpeechSynthesizer {
    client: reqwest::Client,
    config: TtsConfig,
    segments: SegmentStore,
}

impl SpeechSynthesizer {
    pub fn new(config: TtsConfig, segments: SegmentStore) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
            config,
            segments,
        }
    }

    fn voice_for(&self, speaker: &str) -> &str {
        self.config
            .voices
            .get(&speaker.trim().to_lowercase())
            .map(String::as_str)
            .unwrap_or(&self.config.default_voice)
    }

    /// Lines already rendered were paid for even when a later one fails.
    fn with_usage(&self, characters: i64, error: AppError) -> AppError {
        if characters == 0 {
            return error;
        }
        AppError::billed(Usage::new("tts", &self.config.model, characters, 0), error)
    }

    async fn render_line(&self, line: &ScriptLine) -> Result<Vec<u8>, AppError> {
        let url = format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'));
        let instructions = Some(line.instruction.trim())
            .filter(|i| self.config.send_instructions && !i.is_empty());
        let request = SpeechRequest {
            model: &self.config.model,
            voice: self.voice_for(&line.speaker),
            input: &line.text,
            response_format: "mp3",
            instructions,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| AppError::stage("synthesize", e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::stage(
                "synthesize",
                format!("speech endpoint returned {}: {}", status, body),
            ));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| AppError::stage("synthesize", e.to_string()))?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl Synthesizer for SpeechSynthesizer {
    async fn synthesize(
        &self,
        entry_id: &str,
        script: &[ScriptLine],
    ) -> Result<SynthesisOutput, AppError> {
        self.segments.ensure_dir()?;

        let mut segment_paths = Vec::with_capacity(script.len());
        let mut characters = 0i64;
        for (index, line) in script.iter().enumerate() {
            let rendered = match self.render_line(line).await {
                Ok(audio) => {
                    characters += line.text.chars().count() as i64;
                    let path = self.segments.path(entry_id, index);
                    tokio::fs::write(&path, &audio).await.map(|_| path)
                }
                Err(e) => return Err(self.with_usage(characters, e)),
            };
            match rendered {
                Ok(path) => segment_paths.push(path),
                Err(e) => return Err(self.with_usage(characters, e.into())),
            }
        }

        log::info!(
            "Synthesized {} segments ({} characters) for entry {}",
            segment_paths.len(),
            characters,
            entry_id
        );

        Ok(SynthesisOutput {
            segment_paths,
            usage: Usage::new("tts", &self.config.model, characters, 0),
        })
    }
}
