use crate::budget::Usage;
use thiserror::Error;

/// Typed error hierarchy shared by stage executors, commands and config.
///
/// Stage failures of every kind end up in the same retry path, so the
/// variants exist for matching in tests and for readable log lines rather
/// than for per-stage recovery.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Insufficient content: extracted {length} characters, need at least {minimum}")]
    InsufficientContent { length: usize, minimum: usize },

    #[error("{stage} failed: {message}")]
    Stage { stage: &'static str, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),

    /// A stage failed after calls that were already paid for.
    #[error("{error}")]
    Billed { usage: Usage, error: Box<AppError> },
}

impl AppError {
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        AppError::Stage {
            stage,
            message: message.into(),
        }
    }

    /// Attach the usage a failing stage accrued before it failed.
    pub fn billed(usage: Usage, error: AppError) -> Self {
        AppError::Billed {
            usage,
            error: Box::new(error),
        }
    }
}

/// Serialize as a plain string so JSON output (status reports, webhook
/// payloads) carries the same message that is stored in `error_message`.
impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Http(e.to_string())
    }
}

/// Allows `.map_err(|e| format!("…", e))?` and `ok_or_else(|| format!(…))?`
/// to coerce into AppError without changing the call sites.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

/// Allows `.ok_or("literal string")?` to coerce into AppError.
impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}
