// src/llm/gemini.rs
// Google Gemini API client (generateContent + batchEmbedContents)

use crate::error::{Result, SibylError};
use crate::llm::http_client::LlmHttpClient;
use crate::llm::provider::{LlmClient, Provider};
use crate::llm::types::{ChatReply, ChatRequest, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{Span, debug, info, instrument};
use uuid::Uuid;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// How Gemini authenticates: a query-string API key, or an OAuth bearer
/// token read from `$HOME/.gemini/oauth_creds.json` at startup.
#[derive(Clone)]
pub enum GeminiAuth {
    ApiKey(String),
    Oauth(String),
}

/// Google Gemini API client. One client serves every Gemini model; the
/// model name travels in the request.
pub struct GeminiClient {
    auth: GeminiAuth,
    http: LlmHttpClient,
}

impl GeminiClient {
    pub fn new(auth: GeminiAuth) -> Self {
        Self {
            auth,
            http: LlmHttpClient::new(Provider::Gemini),
        }
    }

    fn chat_url(&self, model: &str) -> String {
        match &self.auth {
            GeminiAuth::ApiKey(key) => {
                format!("{GEMINI_API_BASE}/{model}:generateContent?key={key}")
            }
            GeminiAuth::Oauth(_) => format!("{GEMINI_API_BASE}/{model}:generateContent"),
        }
    }

    fn embed_url(&self, model: &str) -> String {
        match &self.auth {
            GeminiAuth::ApiKey(key) => {
                format!("{GEMINI_API_BASE}/{model}:batchEmbedContents?key={key}")
            }
            GeminiAuth::Oauth(_) => format!("{GEMINI_API_BASE}/{model}:batchEmbedContents"),
        }
    }

    fn bearer(&self) -> Option<&str> {
        match &self.auth {
            GeminiAuth::ApiKey(_) => None,
            GeminiAuth::Oauth(token) => Some(token.as_str()),
        }
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    #[instrument(skip(self, request), fields(request_id, model = %request.model))]
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply> {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();
        Span::current().record("request_id", request_id.as_str());

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".into(),
                parts: vec![GeminiPart {
                    text: request.prompt.clone(),
                }],
            }],
            system_instruction: request.system.as_ref().map(|s| GeminiSystemInstruction {
                parts: vec![GeminiPart { text: s.clone() }],
            }),
            generation_config: GenerationConfig {
                temperature: 0.2,
                max_output_tokens: 8192,
            },
        };

        let body = serde_json::to_string(&body)?;
        debug!(request_id = %request_id, "Gemini request: {} bytes", body.len());

        let response_body = self
            .http
            .post_json(
                &request_id,
                &self.chat_url(&request.model),
                self.bearer(),
                body,
                request.timeout,
            )
            .await?;

        let data: GeminiResponse = serde_json::from_str(&response_body)
            .map_err(|e| SibylError::MalformedJson(format!("gemini response: {e}")))?;

        let content = data
            .candidates
            .as_deref()
            .and_then(|c| c.first())
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if content.is_empty() {
            return Err(SibylError::Provider {
                provider: Provider::Gemini.to_string(),
                status: None,
                message: "empty candidate list in response".into(),
            });
        }

        let usage = data.usage_metadata.map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        });

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            request_id = %request_id,
            model = %request.model,
            duration_ms,
            "Gemini chat complete"
        );

        Ok(ChatReply {
            request_id,
            content,
            usage,
            duration_ms,
        })
    }

    async fn embed(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let request_id = Uuid::new_v4().to_string();
        let body = GeminiEmbedRequest {
            requests: inputs
                .iter()
                .map(|text| GeminiEmbedEntry {
                    model: format!("models/{model}"),
                    content: GeminiEmbedContent {
                        parts: vec![GeminiPart { text: text.clone() }],
                    },
                })
                .collect(),
        };

        let response_body = self
            .http
            .post_json(
                &request_id,
                &self.embed_url(model),
                self.bearer(),
                serde_json::to_string(&body)?,
                std::time::Duration::from_secs(60),
            )
            .await?;

        let data: GeminiEmbedResponse = serde_json::from_str(&response_body)
            .map_err(|e| SibylError::MalformedJson(format!("gemini embed response: {e}")))?;

        Ok(data.embeddings.into_iter().map(|e| e.values).collect())
    }

    async fn probe(&self) -> bool {
        // Construction implies a resolvable credential; nothing to probe.
        true
    }
}

// Wire types (Google's casing)

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

#[derive(Serialize)]
struct GeminiEmbedRequest {
    requests: Vec<GeminiEmbedEntry>,
}

#[derive(Serialize)]
struct GeminiEmbedEntry {
    model: String,
    content: GeminiEmbedContent,
}

#[derive(Serialize)]
struct GeminiEmbedContent {
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiEmbedResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}
