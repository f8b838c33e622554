// src/llm/registry.rs
// Model catalog: capability tier, auth method, rate limits, availability.
// Built once at startup and immutable afterwards.

use crate::config::ApiKeys;
use crate::llm::cli::CliClient;
use crate::llm::gemini::{GeminiAuth, GeminiClient};
use crate::llm::mistral::MistralClient;
use crate::llm::provider::{AuthMethod, CostTier, LlmClient, ModelCapability, Provider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

// Catalog model names. Router rules and tests refer to these.
pub const GEMINI_PRO: &str = "gemini-2.5-pro";
pub const GEMINI_FLASH: &str = "gemini-2.5-flash";
pub const GEMINI_FLASH_LITE: &str = "gemini-2.5-flash-lite";
pub const GEMINI_FLASH_LITE_2: &str = "gemini-2.0-flash-lite";
pub const GEMINI_EMBEDDING: &str = "gemini-embedding-001";
pub const MISTRAL_MEDIUM: &str = "mistral-medium-latest";
pub const CODESTRAL_EMBED: &str = "codestral-embed";
pub const CLAUDE_OPUS: &str = "claude-opus";
pub const CLAUDE_SONNET: &str = "claude-sonnet";
pub const CLAUDE_HAIKU: &str = "claude-haiku";
pub const QWEN_CODER: &str = "qwen3-coder";

/// Catalog entry for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: Provider,
    pub capability: ModelCapability,
    pub cost_tier: CostTier,
    pub rate_limit_rpm: u32,
    pub auth_method: AuthMethod,
    /// Credentials were resolvable at process start.
    pub available: bool,
}

impl ModelInfo {
    fn new(
        name: &str,
        provider: Provider,
        capability: ModelCapability,
        cost_tier: CostTier,
        rate_limit_rpm: u32,
        auth_method: AuthMethod,
        available: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            provider,
            capability,
            cost_tier,
            rate_limit_rpm,
            auth_method,
            available,
        }
    }

    /// Embedding models are specialized and never appear in chat rules.
    pub fn is_embedding(&self) -> bool {
        self.name == GEMINI_EMBEDDING || self.name == CODESTRAL_EMBED
    }
}

/// Immutable catalog of models plus one shared client per provider.
pub struct ModelRegistry {
    models: Vec<ModelInfo>,
    clients: HashMap<Provider, Arc<dyn LlmClient>>,
}

impl ModelRegistry {
    /// Build the registry from resolved credentials, probing CLI providers.
    pub async fn bootstrap(keys: &ApiKeys) -> Self {
        let mut clients: HashMap<Provider, Arc<dyn LlmClient>> = HashMap::new();

        let gemini_auth = if let Some(key) = &keys.gemini {
            Some((GeminiAuth::ApiKey(key.clone()), AuthMethod::ApiKey))
        } else {
            keys.gemini_oauth
                .as_ref()
                .map(|creds| (GeminiAuth::Oauth(creds.access_token.clone()), AuthMethod::Oauth))
        };
        if let Some((auth, _)) = &gemini_auth {
            clients.insert(Provider::Gemini, Arc::new(GeminiClient::new(auth.clone())));
            info!("Gemini client initialized");
        }

        if let Some(key) = &keys.mistral {
            clients.insert(Provider::Mistral, Arc::new(MistralClient::new(key.clone())));
            info!("Mistral client initialized");
        }

        let claude = CliClient::claude_code();
        if claude.probe().await {
            clients.insert(Provider::ClaudeCode, Arc::new(claude));
            info!("claude_code CLI available");
        }

        let qwen = CliClient::qwen_code();
        if qwen.probe().await {
            clients.insert(Provider::QwenCode, Arc::new(qwen));
            info!("qwen_code CLI available");
        }

        let gemini_auth_method = gemini_auth.map(|(_, method)| method);
        let models = builtin_catalog(
            gemini_auth_method,
            keys.gemini.is_some(),
            clients.contains_key(&Provider::Mistral),
            clients.contains_key(&Provider::ClaudeCode),
            clients.contains_key(&Provider::QwenCode),
        );

        let available: Vec<_> = models
            .iter()
            .filter(|m| m.available)
            .map(|m| m.name.as_str())
            .collect();
        info!(models = ?available, "Model registry built");

        Self { models, clients }
    }

    /// Assemble a registry from explicit parts. Used by tests and by
    /// embedders that bring their own adapters.
    pub fn with_clients(
        models: Vec<ModelInfo>,
        clients: HashMap<Provider, Arc<dyn LlmClient>>,
    ) -> Self {
        Self { models, clients }
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn get(&self, name: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.get(name).map(|m| m.available).unwrap_or(false)
    }

    pub fn by_capability(&self, capability: ModelCapability) -> Vec<&ModelInfo> {
        self.models
            .iter()
            .filter(|m| m.capability == capability)
            .collect()
    }

    pub fn by_provider(&self, provider: Provider) -> Vec<&ModelInfo> {
        self.models
            .iter()
            .filter(|m| m.provider == provider)
            .collect()
    }

    pub fn by_auth_method(&self, auth: AuthMethod) -> Vec<&ModelInfo> {
        self.models
            .iter()
            .filter(|m| m.auth_method == auth)
            .collect()
    }

    pub fn client_for(&self, provider: Provider) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(&provider).cloned()
    }

    pub fn has_any_available(&self) -> bool {
        self.models.iter().any(|m| m.available)
    }
}

/// The built-in catalog. Availability reflects which credentials resolved;
/// OAuth raises Gemini's Pro/Flash limits from 10 to 60 RPM, while the
/// Flash-Lite variants are API-key-only at their own fixed limits.
fn builtin_catalog(
    gemini_auth: Option<AuthMethod>,
    gemini_has_api_key: bool,
    has_mistral: bool,
    has_claude: bool,
    has_qwen: bool,
) -> Vec<ModelInfo> {
    let gemini_available = gemini_auth.is_some();
    let gemini_auth_method = gemini_auth.unwrap_or(AuthMethod::ApiKey);
    let gemini_rpm = if gemini_auth == Some(AuthMethod::Oauth) {
        60
    } else {
        10
    };

    vec![
        ModelInfo::new(
            GEMINI_PRO,
            Provider::Gemini,
            ModelCapability::Complex,
            CostTier::Free,
            gemini_rpm,
            gemini_auth_method,
            gemini_available,
        ),
        ModelInfo::new(
            GEMINI_FLASH,
            Provider::Gemini,
            ModelCapability::Medium,
            CostTier::Free,
            gemini_rpm,
            gemini_auth_method,
            gemini_available,
        ),
        ModelInfo::new(
            GEMINI_FLASH_LITE,
            Provider::Gemini,
            ModelCapability::Simple,
            CostTier::Free,
            15,
            AuthMethod::ApiKey,
            gemini_has_api_key,
        ),
        ModelInfo::new(
            GEMINI_FLASH_LITE_2,
            Provider::Gemini,
            ModelCapability::Simple,
            CostTier::Free,
            25,
            AuthMethod::ApiKey,
            gemini_has_api_key,
        ),
        ModelInfo::new(
            GEMINI_EMBEDDING,
            Provider::Gemini,
            ModelCapability::Simple,
            CostTier::Free,
            gemini_rpm,
            gemini_auth_method,
            gemini_available,
        ),
        ModelInfo::new(
            CLAUDE_HAIKU,
            Provider::ClaudeCode,
            ModelCapability::Simple,
            CostTier::Subscription,
            30,
            AuthMethod::Cli,
            has_claude,
        ),
        ModelInfo::new(
            CLAUDE_SONNET,
            Provider::ClaudeCode,
            ModelCapability::Medium,
            CostTier::Subscription,
            30,
            AuthMethod::Cli,
            has_claude,
        ),
        ModelInfo::new(
            CLAUDE_OPUS,
            Provider::ClaudeCode,
            ModelCapability::Complex,
            CostTier::Subscription,
            15,
            AuthMethod::Cli,
            has_claude,
        ),
        ModelInfo::new(
            QWEN_CODER,
            Provider::QwenCode,
            ModelCapability::Fallback,
            CostTier::Free,
            30,
            AuthMethod::Cli,
            has_qwen,
        ),
        // Mistral is paid; it always sits at the end of fallback chains.
        ModelInfo::new(
            MISTRAL_MEDIUM,
            Provider::Mistral,
            ModelCapability::Fallback,
            CostTier::Paid,
            60,
            AuthMethod::ApiKey,
            has_mistral,
        ),
        ModelInfo::new(
            CODESTRAL_EMBED,
            Provider::Mistral,
            ModelCapability::Simple,
            CostTier::Paid,
            60,
            AuthMethod::ApiKey,
            has_mistral,
        ),
    ]
}
