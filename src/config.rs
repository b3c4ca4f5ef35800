//! Runtime configuration.
//!
//! Loaded from a YAML file, then overridden by `URL_PODCAST_*` environment
//! variables or a `.env` file in the data directory.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "URL_PODCAST_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub database_path: Option<PathBuf>,
    pub segments_dir: Option<PathBuf>,
    pub publish_dir: Option<PathBuf>,
    pub public_base_url: String,

    pub max_retries: u32,
    pub lock_stale_minutes: i64,
    pub min_content_length: usize,

    pub monthly_budget_usd: f64,
    pub budget_warning_percent: f64,

    pub episode_retention_days: i64,
    pub orphan_segment_max_age_hours: u64,

    pub process_interval_minutes: u64,
    pub cleanup_interval_minutes: u64,

    pub fetch_timeout_secs: u64,
    pub fetch_max_bytes: u64,

    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub pricing: HashMap<String, Rate>,
    pub notify_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub default_voice: String,
    /// Speaker name (lowercased) to voice id.
    pub voices: HashMap<String, String>,
    pub bitrate_kbps: u32,
    pub timeout_secs: u64,
    /// Forward per-line delivery instructions; only some speech models accept them.
    pub send_instructions: bool,
}

impl Default for TtsConfig {
    fn default() -> Self {
        let mut voices = HashMap::new();
        voices.insert("host".to_string(), "alloy".to_string());
        voices.insert("guest".to_string(), "onyx".to_string());
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            default_voice: "alloy".to_string(),
            voices,
            bitrate_kbps: 128,
            timeout_secs: 120,
            send_instructions: false,
        }
    }
}

/// USD per million units. Units are tokens for chat models and input
/// characters for speech models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

fn default_pricing() -> HashMap<String, Rate> {
    let mut pricing = HashMap::new();
    pricing.insert(
        "gpt-4o-mini".to_string(),
        Rate {
            input_per_million: 0.15,
            output_per_million: 0.60,
        },
    );
    pricing.insert(
        "gpt-4o".to_string(),
        Rate {
            input_per_million: 2.50,
            output_per_million: 10.00,
        },
    );
    pricing.insert(
        "tts-1".to_string(),
        Rate {
            input_per_million: 15.00,
            output_per_million: 0.0,
        },
    );
    pricing.insert(
        "tts-1-hd".to_string(),
        Rate {
            input_per_million: 30.00,
            output_per_million: 0.0,
        },
    );
    pricing
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("url-podcast")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: None,
            segments_dir: None,
            publish_dir: None,
            public_base_url: "http://localhost:8080/episodes".to_string(),
            max_retries: 3,
            lock_stale_minutes: 30,
            min_content_length: 500,
            monthly_budget_usd: 10.0,
            budget_warning_percent: 80.0,
            episode_retention_days: 30,
            orphan_segment_max_age_hours: 24,
            process_interval_minutes: 15,
            cleanup_interval_minutes: 60,
            fetch_timeout_secs: 30,
            fetch_max_bytes: 5 * 1024 * 1024,
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            pricing: default_pricing(),
            notify_webhook_url: None,
        }
    }
}

impl Config {
    /// Load from `path` (or `<default data dir>/config.yaml`), apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_data_dir().join("config.yaml"));

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            log::info!("Loading config from {:?}", path);
            serde_yaml::from_str::<Config>(&raw)?
        } else {
            log::info!("No config file at {:?}, using defaults", path);
            Config::default()
        };

        let data_dir = config.data_dir.clone();
        config.apply_overrides(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| load_env_value(&data_dir, key))
        });
        config.validate()?;
        Ok(config)
    }

    /// Apply `URL_PODCAST_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("TTS_API_KEY") {
            self.tts.api_key = Some(v);
        }
        // A single key for both is the common setup.
        if let Some(v) = get("API_KEY") {
            self.llm.api_key.get_or_insert_with(|| v.clone());
            self.tts.api_key.get_or_insert(v);
        }
        if let Some(v) = get("NOTIFY_WEBHOOK_URL") {
            self.notify_webhook_url = Some(v);
        }
        if let Some(v) = get("MONTHLY_BUDGET_USD") {
            match v.parse() {
                Ok(budget) => self.monthly_budget_usd = budget,
                Err(_) => log::warn!("Ignoring non-numeric {}MONTHLY_BUDGET_USD={}", ENV_PREFIX, v),
            }
        }
        if let Some(v) = get("MAX_RETRIES") {
            match v.parse() {
                Ok(n) => self.max_retries = n,
                Err(_) => log::warn!("Ignoring non-numeric {}MAX_RETRIES={}", ENV_PREFIX, v),
            }
        }
        if let Some(v) = get("DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_retries == 0 {
            return Err(AppError::Config("max_retries must be at least 1".into()));
        }
        if self.lock_stale_minutes <= 0 {
            return Err(AppError::Config("lock_stale_minutes must be positive".into()));
        }
        if !(self.monthly_budget_usd >= 0.0) {
            return Err(AppError::Config(
                "monthly_budget_usd must be zero or positive".into(),
            ));
        }
        if !(self.budget_warning_percent > 0.0 && self.budget_warning_percent <= 100.0) {
            return Err(AppError::Config(
                "budget_warning_percent must be in (0, 100]".into(),
            ));
        }
        if self.process_interval_minutes == 0 || self.cleanup_interval_minutes == 0 {
            return Err(AppError::Config("job intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("url_podcast.db"))
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.segments_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("segments"))
    }

    pub fn publish_dir(&self) -> PathBuf {
        self.publish_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("episodes"))
    }

    pub fn lock_stale_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lock_stale_minutes)
    }

    pub fn episode_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.episode_retention_days)
    }

    pub fn orphan_segment_max_age(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.orphan_segment_max_age_hours * 3600)
    }
}

/// Load a value from the .env file in `dir` by key name
pub fn load_env_value(dir: &Path, key: &str) -> Option<String> {
    let env_path = dir.join(".env");
    let prefix = format!("{}=", key);
    let content = std::fs::read_to_string(env_path).ok()?;
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(&prefix) {
            let value = rest.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
