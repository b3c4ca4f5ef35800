use crate::budget::Usage;
use crate::error::AppError;
use crate::llm::{extract_json_from_response, LlmClient};
use async_trait::async_trait;
use std::sync::Arc;

use super::{ScriptLine, ScriptOutput, ScriptWriter};

const MAX_BODY_CHARS: usize = 32_000;

const SCRIPT_SYSTEM_PROMPT: &str = "You write two-person podcast scripts. A host and a guest \
discuss the article they are given in a natural, engaging way. Respond with a JSON array only. \
Each element is an object with \"speaker\" (\"Host\" or \"Guest\"), \"text\" (what is said) and \
\"instruction\" (a short delivery note such as \"curious\" or \"laughing\").";

/// Parse a stored or generated script. `None` when the JSON is not a
/// non-empty list of lines.
pub fn parse_script(json: &str) -> Option<Vec<ScriptLine>> {
    let lines: Vec<ScriptLine> = serde_json::from_str(json).ok()?;
    if lines.is_empty() {
        None
    } else {
        Some(lines)
    }
}

/// Accepts either a bare array or an object wrapping it under `script`/`lines`.
fn lines_from_value(value: serde_json::Value) -> Option<Vec<ScriptLine>> {
    let array = match value {
        serde_json::Value::Array(items) => serde_json::Value::Array(items),
        serde_json::Value::Object(mut map) => map
            .remove("script")
            .or_else(|| map.remove("lines"))
            .or_else(|| map.remove("dialogue"))?,
        _ => return None,
    };
    let lines: Vec<ScriptLine> = serde_json::from_value(array).ok()?;
    Some(
        lines
            .into_iter()
            .filter(|l| !l.text.trim().is_empty())
            .collect(),
    )
}

/// Generates a host/guest dialogue with the chat model.
pub struct LlmScriptWriter {
    llm: Arc<LlmClient>,
}

impl LlmScriptWriter {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ScriptWriter for LlmScriptWriter {
    async fn generate_script(&self, title: &str, body: &str) -> Result<ScriptOutput, AppError> {
        let body: String = body.chars().take(MAX_BODY_CHARS).collect();
        let prompt = format!(
            "TITLE: {}\n---\nARTICLE:\n{}\n---\n\nWrite the podcast script as a JSON array.",
            title, body
        );

        let completion = self.llm.complete(SCRIPT_SYSTEM_PROMPT, &prompt).await?;
        let usage = Usage::new(
            "llm",
            &completion.model,
            completion.input_tokens,
            completion.output_tokens,
        );

        let script = match extract_json_from_response(&completion.text).and_then(lines_from_value) {
            Some(script) if !script.is_empty() => script,
            Some(_) => {
                return Err(AppError::billed(
                    usage,
                    AppError::stage("script", "model returned an empty script"),
                ))
            }
            None => {
                return Err(AppError::billed(
                    usage,
                    AppError::stage("script", "model reply is not a script"),
                ))
            }
        };

        log::info!("Generated script with {} lines for '{}'", script.len(), title);
        Ok(ScriptOutput { script, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn writer_replying(content: &str) -> (LlmScriptWriter, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": content}}],
                "usage": {"prompt_tokens": 50, "completion_tokens": 30}
            })))
            .mount(&server)
            .await;
        let llm = LlmClient::new(&LlmConfig {
            base_url: server.uri(),
            ..LlmConfig::default()
        });
        (LlmScriptWriter::new(Arc::new(llm)), server)
    }

    #[test]
    fn test_parse_script() {
        let lines = parse_script(r#"[{"speaker":"Host","text":"Hi","instruction":"warm"}]"#).unwrap();
        assert_eq!(lines[0].speaker, "Host");
        assert_eq!(lines[0].instruction, "warm");

        // instruction is optional
        let lines = parse_script(r#"[{"speaker":"Guest","text":"Hello"}]"#).unwrap();
        assert_eq!(lines[0].instruction, "");

        assert!(parse_script("[]").is_none());
        assert!(parse_script("{not json").is_none());
        assert!(parse_script(r#"{"speaker":"Host"}"#).is_none());
    }

    #[test]
    fn test_lines_from_wrapped_object() {
        let value = serde_json::json!({"script": [
            {"speaker": "Host", "text": "One"},
            {"speaker": "Guest", "text": "  "}
        ]});
        let lines = lines_from_value(value).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "One");
    }

    #[tokio::test]
    async fn test_generate_script_from_fenced_reply() {
        let reply = "Here you go:\n```json\n[{\"speaker\":\"Host\",\"text\":\"Welcome\",\"instruction\":\"upbeat\"},{\"speaker\":\"Guest\",\"text\":\"Thanks\"}]\n```";
        let (writer, _server) = writer_replying(reply).await;

        let output = writer.generate_script("Title", "Body").await.unwrap();
        assert_eq!(output.script.len(), 2);
        assert_eq!(output.usage.input_units, 50);
        assert_eq!(output.usage.output_units, 30);
        assert_eq!(output.usage.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_empty_script_is_rejected() {
        let (writer, _server) = writer_replying("[]").await;
        let err = writer.generate_script("Title", "Body").await.unwrap_err();
        assert!(err.to_string().contains("empty script"));
    }

    #[tokio::test]
    async fn test_prose_reply_is_rejected_but_billed() {
        let (writer, _server) = writer_replying("Sorry, I can't do that.").await;
        match writer.generate_script("Title", "Body").await {
            Err(AppError::Billed { usage, error }) => {
                assert_eq!(usage, Usage::new("llm", "gpt-4o-mini", 50, 30));
                assert!(matches!(*error, AppError::Stage { stage: "script", .. }));
            }
            other => panic!("expected a billed script error, got {:?}", other.map(|o| o.script)),
        }
    }
}
