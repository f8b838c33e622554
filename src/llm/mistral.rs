// src/llm/mistral.rs
// Mistral API client (chat completions + embeddings)

use crate::error::{Result, SibylError};
use crate::llm::http_client::LlmHttpClient;
use crate::llm::provider::{LlmClient, Provider};
use crate::llm::types::{ChatReply, ChatRequest, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{Span, info, instrument};
use uuid::Uuid;

const MISTRAL_API_BASE: &str = "https://api.mistral.ai/v1";

/// Mistral caps request latency server-side; anything longer just burns
/// the paid quota waiting for a 504.
const MISTRAL_MAX_TIMEOUT: Duration = Duration::from_secs(45);

pub struct MistralClient {
    api_key: String,
    http: LlmHttpClient,
}

impl MistralClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: LlmHttpClient::new(Provider::Mistral),
        }
    }
}

#[async_trait]
impl LlmClient for MistralClient {
    fn provider(&self) -> Provider {
        Provider::Mistral
    }

    #[instrument(skip(self, request), fields(request_id, model = %request.model))]
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply> {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();
        Span::current().record("request_id", request_id.as_str());

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(MistralMessage {
                role: "system".into(),
                content: system.clone(),
            });
        }
        messages.push(MistralMessage {
            role: "user".into(),
            content: request.prompt.clone(),
        });

        let body = MistralChatRequest {
            model: request.model.clone(),
            messages,
            temperature: 0.2,
        };

        let timeout = request.timeout.min(MISTRAL_MAX_TIMEOUT);
        let response_body = self
            .http
            .post_json(
                &request_id,
                &format!("{MISTRAL_API_BASE}/chat/completions"),
                Some(&self.api_key),
                serde_json::to_string(&body)?,
                timeout,
            )
            .await?;

        let data: MistralChatResponse = serde_json::from_str(&response_body)
            .map_err(|e| SibylError::MalformedJson(format!("mistral response: {e}")))?;

        let content = data
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| SibylError::Provider {
                provider: Provider::Mistral.to_string(),
                status: None,
                message: "empty choices in response".into(),
            })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(request_id = %request_id, model = %request.model, duration_ms, "Mistral chat complete");

        Ok(ChatReply {
            request_id,
            content,
            usage: data.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            duration_ms,
        })
    }

    async fn embed(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let request_id = Uuid::new_v4().to_string();
        let body = MistralEmbedRequest {
            model: model.to_string(),
            input: inputs.to_vec(),
        };

        let response_body = self
            .http
            .post_json(
                &request_id,
                &format!("{MISTRAL_API_BASE}/embeddings"),
                Some(&self.api_key),
                serde_json::to_string(&body)?,
                MISTRAL_MAX_TIMEOUT,
            )
            .await?;

        let data: MistralEmbedResponse = serde_json::from_str(&response_body)
            .map_err(|e| SibylError::MalformedJson(format!("mistral embed response: {e}")))?;

        let mut ordered = data.data;
        ordered.sort_by_key(|d| d.index);
        Ok(ordered.into_iter().map(|d| d.embedding).collect())
    }

    async fn probe(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[derive(Serialize)]
struct MistralChatRequest {
    model: String,
    messages: Vec<MistralMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct MistralMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MistralChatResponse {
    #[serde(default)]
    choices: Vec<MistralChoice>,
    usage: Option<MistralUsage>,
}

#[derive(Deserialize)]
struct MistralChoice {
    message: MistralMessage,
}

#[derive(Deserialize)]
struct MistralUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Serialize)]
struct MistralEmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct MistralEmbedResponse {
    #[serde(default)]
    data: Vec<MistralEmbedding>,
}

#[derive(Deserialize)]
struct MistralEmbedding {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_clamp() {
        let long = Duration::from_secs(600);
        assert_eq!(long.min(MISTRAL_MAX_TIMEOUT), MISTRAL_MAX_TIMEOUT);
        let short = Duration::from_secs(10);
        assert_eq!(short.min(MISTRAL_MAX_TIMEOUT), short);
    }

    #[test]
    fn test_chat_response_parsing() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }"#;
        let data: MistralChatResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(data.choices[0].message.content, "ok");
        assert_eq!(data.usage.expect("usage").total_tokens, 4);
    }

    #[test]
    fn test_embed_response_ordering() {
        let raw = r#"{"data": [
            {"index": 1, "embedding": [0.2]},
            {"index": 0, "embedding": [0.1]}
        ]}"#;
        let data: MistralEmbedResponse = serde_json::from_str(raw).expect("parse");
        let mut ordered = data.data;
        ordered.sort_by_key(|d| d.index);
        assert_eq!(ordered[0].embedding, vec![0.1]);
    }
}
