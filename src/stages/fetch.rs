use crate::error::AppError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

use super::Fetcher;

const USER_AGENT: &str = concat!("url-podcast/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Downloads a page with reqwest, refusing bodies above `max_bytes`.
pub struct HttpFetcher {
    client: reqwest::Client,
    settings: FetchSettings,
}

impl HttpFetcher {
    pub fn new(settings: FetchSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default();
        Self { client, settings }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| AppError::stage("fetch", format!("invalid URL {}: {}", url, e)))?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| AppError::stage("fetch", format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::stage("fetch", format!("HTTP {} for {}", status, url)));
        }

        let too_large = || {
            AppError::stage(
                "fetch",
                format!("response larger than {} bytes", self.settings.max_bytes),
            )
        };
        if response.content_length().unwrap_or(0) > self.settings.max_bytes {
            return Err(too_large());
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AppError::stage("fetch", e.to_string()))?;
            if bytes.len() as u64 + chunk.len() as u64 > self.settings.max_bytes {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }

        log::debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
