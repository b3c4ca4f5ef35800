use crate::budget::Usage;
use crate::error::AppError;
use crate::llm::LlmClient;
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;

use super::{ExtractedContent, Extractor, FallbackContent};

/// Containers tried in order for the article body.
const BODY_CONTAINERS: [&str; 5] = ["article", "main", "[role='main']", ".post-content", "body"];
const TEXT_BLOCKS: &str = "p, h2, h3, pre";
/// Upper bound on page text sent to the model.
const MAX_FALLBACK_INPUT_CHARS: usize = 48_000;

const FALLBACK_SYSTEM_PROMPT: &str = "You extract the main article text from web pages. \
Return only the article text as plain paragraphs. Drop navigation, ads, cookie banners, \
comments and footers. Do not summarize or add commentary.";

/// Structural HTML extraction with an LLM fallback.
pub struct HtmlExtractor {
    llm: Arc<LlmClient>,
}

impl HtmlExtractor {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Extractor for HtmlExtractor {
    fn extract(&self, html: &str) -> Result<ExtractedContent, AppError> {
        if html.trim().is_empty() {
            return Err(AppError::stage("extract", "empty document"));
        }
        let doc = Html::parse_document(html);
        let whitespace = whitespace_regex()?;

        let title = extract_title(&doc, &whitespace)?;

        let blocks = selector(TEXT_BLOCKS)?;
        let mut body = String::new();
        for container in BODY_CONTAINERS {
            let Some(node) = doc.select(&selector(container)?).next() else {
                continue;
            };
            let paragraphs: Vec<String> = node
                .select(&blocks)
                .map(|el| normalize(&el, &whitespace))
                .filter(|t| !t.is_empty())
                .collect();
            if !paragraphs.is_empty() {
                body = paragraphs.join("\n\n");
                break;
            }
        }

        Ok(ExtractedContent { title, body })
    }

    async fn extract_fallback(&self, html: &str) -> Result<FallbackContent, AppError> {
        let text = visible_text(html)?;
        if text.is_empty() {
            return Err(AppError::stage("extract", "page has no visible text"));
        }
        let text: String = text.chars().take(MAX_FALLBACK_INPUT_CHARS).collect();

        let prompt = format!("---\nPAGE TEXT:\n{}\n---\n\nReturn the article text.", text);
        let completion = self.llm.complete(FALLBACK_SYSTEM_PROMPT, &prompt).await?;

        Ok(FallbackContent {
            body: completion.text.trim().to_string(),
            usage: Usage::new(
                "llm",
                &completion.model,
                completion.input_tokens,
                completion.output_tokens,
            ),
        })
    }
}

fn selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::Other(format!("bad selector {}: {}", css, e)))
}

fn whitespace_regex() -> Result<Regex, AppError> {
    Regex::new(r"\s+").map_err(|e| AppError::Other(e.to_string()))
}

fn normalize(el: &ElementRef<'_>, whitespace: &Regex) -> String {
    let raw = el.text().collect::<String>();
    whitespace.replace_all(raw.trim(), " ").into_owned()
}

/// `og:title`, then `<title>`, then the first `<h1>`.
fn extract_title(doc: &Html, whitespace: &Regex) -> Result<Option<String>, AppError> {
    let og = selector(r#"meta[property="og:title"]"#)?;
    if let Some(content) = doc
        .select(&og)
        .next()
        .and_then(|m| m.value().attr("content"))
    {
        let title = whitespace.replace_all(content.trim(), " ").into_owned();
        if !title.is_empty() {
            return Ok(Some(title));
        }
    }
    for css in ["title", "h1"] {
        if let Some(el) = doc.select(&selector(css)?).next() {
            let title = normalize(&el, whitespace);
            if !title.is_empty() {
                return Ok(Some(title));
            }
        }
    }
    Ok(None)
}

/// Page text with script, style and noscript blocks removed.
fn visible_text(html: &str) -> Result<String, AppError> {
    let hidden = Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<noscript\b.*?</noscript>")
        .map_err(|e| AppError::Other(e.to_string()))?;
    let cleaned = hidden.replace_all(html, " ");
    let doc = Html::parse_document(&cleaned);
    let whitespace = whitespace_regex()?;
    let text = match doc.select(&selector("body")?).next() {
        Some(body) => normalize(&body, &whitespace),
        None => normalize(&doc.root_element(), &whitespace),
    };
    Ok(text)
}
