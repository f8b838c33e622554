// src/error.rs
// Standardized error types for sibyl

use thiserror::Error;

/// Main error type for the sibyl library.
///
/// The provider-facing variants map onto the failure taxonomy the task
/// router uses to decide between retry, fallback, and hard failure:
/// rate limits and 5xx-class errors are transient, missing credentials
/// and missing CLI binaries flip a provider off for the process.
#[derive(Error, Debug)]
pub enum SibylError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rate limited by {provider}: {message}")]
    RateLimited { provider: String, message: String },

    #[error("provider {provider} error: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("request to {provider} timed out after {after_ms}ms")]
    Timeout { provider: String, after_ms: u64 },

    #[error("no credentials for {provider}")]
    AuthMissing { provider: String },

    #[error("CLI not found: {command}")]
    CliMissing { command: String },

    #[error("embedding not supported by {provider}")]
    EmbedUnsupported { provider: String },

    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("retrieval source {source_name} failed: {message}")]
    RetrievalSource { source_name: String, message: String },

    #[error("retrieval exceeded wall clock after {elapsed_ms}ms")]
    WallClockExceeded { elapsed_ms: u64 },

    #[error("citation [cite_{index}] out of range (valid: 1..={total})")]
    InvalidCitation { index: usize, total: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using SibylError
pub type Result<T> = std::result::Result<T, SibylError>;

impl SibylError {
    /// Rate-limit failures skip straight to the next candidate model.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SibylError::RateLimited { .. })
    }

    /// Transient failures are retried on the same model before falling back.
    pub fn is_transient(&self) -> bool {
        match self {
            SibylError::RateLimited { .. } | SibylError::Timeout { .. } => true,
            SibylError::Provider { status, .. } => {
                status.map(|s| s == 429 || s >= 500).unwrap_or(true)
            }
            SibylError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Unavailability flips the provider off for the rest of the process.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            SibylError::AuthMissing { .. } | SibylError::CliMissing { .. }
        )
    }
}

impl From<String> for SibylError {
    fn from(s: String) -> Self {
        SibylError::Other(s)
    }
}

impl From<tokio::task::JoinError> for SibylError {
    fn from(err: tokio::task::JoinError) -> Self {
        SibylError::Other(err.to_string())
    }
}
