// src/llm/types.rs
// Shared request/response types for LLM provider adapters

use std::time::Duration;

/// Default per-request timeout when the caller does not specify one.
pub const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(30);

/// A single non-streaming chat request.
///
/// Adapters may clamp `timeout` to their provider-specific ceiling
/// (Mistral 45s, CLI subprocess providers 10 minutes).
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub timeout: Duration,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            timeout: DEFAULT_CHAT_TIMEOUT,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Token usage normalized across providers.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }
}

/// Result of a chat completion: a single assistant reply.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub request_id: String,
    pub content: String,
    pub usage: Option<Usage>,
    pub duration_ms: u64,
}
