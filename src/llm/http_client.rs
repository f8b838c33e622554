// src/llm/http_client.rs
// Shared HTTP plumbing for the hosted LLM providers

use crate::error::{Result, SibylError};
use crate::llm::provider::Provider;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// Connect timeout applied to every provider client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper over a shared `reqwest::Client` that normalizes HTTP
/// failures into the provider error taxonomy. Retry policy lives in the
/// task router, not here: a rate-limited reply must surface immediately so
/// the router can fall back to the next candidate model.
pub struct LlmHttpClient {
    client: Client,
    provider: Provider,
}

impl LlmHttpClient {
    pub fn new(provider: Provider) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, provider }
    }

    /// POST a JSON body and return the raw response text.
    ///
    /// `bearer` adds an `Authorization: Bearer` header; Gemini API-key auth
    /// passes the key in the URL instead and sends `None` here.
    pub async fn post_json(
        &self,
        request_id: &str,
        url: &str,
        bearer: Option<&str>,
        body: String,
        timeout: Duration,
    ) -> Result<String> {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .body(body);
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(SibylError::Timeout {
                    provider: self.provider.to_string(),
                    after_ms: timeout.as_millis() as u64,
                });
            }
            Err(e) => return Err(SibylError::Http(e)),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response.text().await?);
        }

        let error_body = response.text().await.unwrap_or_default();
        warn!(
            request_id = %request_id,
            provider = %self.provider,
            status = %status,
            "LLM request failed: {}",
            truncate(&error_body, 300)
        );

        match status.as_u16() {
            429 => Err(SibylError::RateLimited {
                provider: self.provider.to_string(),
                message: truncate(&error_body, 300),
            }),
            401 | 403 => Err(SibylError::AuthMissing {
                provider: self.provider.to_string(),
            }),
            code => Err(SibylError::Provider {
                provider: self.provider.to_string(),
                status: Some(code),
                message: truncate(&error_body, 300),
            }),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "..."
    }
}
