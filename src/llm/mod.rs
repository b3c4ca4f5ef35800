//! OpenAI-compatible chat completions client
//!
//! Used by the fallback extractor and the script writer. Returns the reply
//! text together with the token counts the server billed.

use crate::config::LlmConfig;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat completions client for making API calls
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one system + user exchange and return the first choice.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<Completion, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        log::info!(
            "Sending chat request: model={}, prompt_len={}",
            self.model,
            prompt.len()
        );

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| AppError::Http(format!("Failed to call {}: {}", url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Http(format!(
                "Chat completion returned {}: {}",
                status, body
            )));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Http(format!("Failed to parse chat response: {}", e)))?;

        let text = result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::Other("Chat response contained no choices".to_string()))?;
        let usage = result.usage.unwrap_or_default();

        log::info!(
            "Chat response received: {} chars, tokens in={} out={}",
            text.len(),
            usage.prompt_tokens,
            usage.completion_tokens
        );

        Ok(Completion {
            text,
            model: self.model.clone(),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

/// Extract JSON from LLM response (handles markdown code blocks)
pub fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    // Try to extract from markdown code block
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let after_marker = after_fence.strip_prefix("json").unwrap_or(after_fence);
        if let Some(end) = after_marker.find("```") {
            let json_str = after_marker[..end].trim();
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                return Some(json);
            }
        }
    }

    // Try to find a JSON array or object in the response, whichever opens first
    let open = trimmed.find(|c: char| c == '[' || c == '{')?;
    let (open_ch, close_ch) = if trimmed[open..].starts_with('[') {
        ('[', ']')
    } else {
        ('{', '}')
    };
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in trimmed[open..].char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open_ch => depth += 1,
            c if c == close_ch => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[open..open + i + 1];
                    return serde_json::from_str::<serde_json::Value>(candidate).ok();
                }
            }
            _ => {}
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Configured model name, which is also the pricing key.
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}
