// src/llm/provider.rs
// LLM provider abstraction layer

use crate::error::{Result, SibylError};
use crate::llm::types::{ChatReply, ChatRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// LLM provider backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gemini,
    Mistral,
    ClaudeCode,
    QwenCode,
}

impl Provider {
    /// Parse provider from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gemini" => Some(Self::Gemini),
            "mistral" => Some(Self::Mistral),
            "claude_code" | "claude-code" | "claude" => Some(Self::ClaudeCode),
            "qwen_code" | "qwen-code" | "qwen" => Some(Self::QwenCode),
            _ => None,
        }
    }

    /// Environment variable holding this provider's API key, if it uses one
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self {
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Mistral => Some("MISTRAL_API_KEY"),
            Self::ClaudeCode | Self::QwenCode => None, // CLI subscription auth
        }
    }

    /// CLI command name for subprocess-backed providers
    pub fn cli_command(&self) -> Option<&'static str> {
        match self {
            Self::ClaudeCode => Some("claude"),
            Self::QwenCode => Some("qwen"),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gemini => write!(f, "gemini"),
            Self::Mistral => write!(f, "mistral"),
            Self::ClaudeCode => write!(f, "claude_code"),
            Self::QwenCode => write!(f, "qwen_code"),
        }
    }
}

/// How a provider authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Oauth,
    ApiKey,
    Subscription,
    Cli,
}

/// Capability tier a model is rated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    Simple,
    Medium,
    Complex,
    Fallback,
}

/// Billing tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Free,
    Paid,
    Subscription,
}

/// Trait every provider adapter implements.
///
/// `chat` is synchronous from the caller's perspective: one request, one
/// complete reply. `embed` is optional; adapters without embedding support
/// return `EmbedUnsupported`. `probe` checks whether the backend is usable
/// at all and is only called during registry bootstrap.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply>;

    /// Embed a batch of inputs into vectors
    async fn embed(&self, _model: &str, _inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(SibylError::EmbedUnsupported {
            provider: self.provider().to_string(),
        })
    }

    /// Check whether this backend is reachable/usable
    async fn probe(&self) -> bool;

    /// Get the provider type
    fn provider(&self) -> Provider;
}
