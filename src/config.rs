// src/config.rs
// Credential resolution from environment variables and the Gemini OAuth file

use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Default location of the Gemini OAuth credential file, relative to $HOME.
const GEMINI_OAUTH_RELATIVE: &str = ".gemini/oauth_creds.json";

/// Parsed contents of the Gemini OAuth credential file.
#[derive(Debug, Clone, Deserialize)]
pub struct OauthCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// API credentials resolved once at process start.
///
/// Absence of a credential means the corresponding provider is not
/// available; the model registry never probes the environment again.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub gemini: Option<String>,
    pub mistral: Option<String>,
    pub gemini_oauth: Option<OauthCredentials>,
}

impl ApiKeys {
    /// Load credentials from environment variables and the OAuth file.
    ///
    /// `GEMINI_API_KEY` wins over `GOOGLE_API_KEY`. The OAuth file path can
    /// be overridden with `GEMINI_OAUTH_CREDS_PATH`.
    pub fn from_env() -> Self {
        let gemini = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());

        let mistral = std::env::var("MISTRAL_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let gemini_oauth = load_oauth_credentials(oauth_creds_path());

        Self {
            gemini,
            mistral,
            gemini_oauth,
        }
    }

    /// Whether Gemini can authenticate at all (API key or OAuth).
    pub fn has_gemini(&self) -> bool {
        self.gemini.is_some() || self.gemini_oauth.is_some()
    }

    /// OAuth presence unlocks the higher Gemini rate-limit tier.
    pub fn gemini_uses_oauth(&self) -> bool {
        self.gemini_oauth.is_some()
    }
}

/// Resolve the OAuth credential file path (env override, then $HOME).
fn oauth_creds_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GEMINI_OAUTH_CREDS_PATH") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::home_dir().map(|home| home.join(GEMINI_OAUTH_RELATIVE))
}

fn load_oauth_credentials(path: Option<PathBuf>) -> Option<OauthCredentials> {
    let path = path?;
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => return None,
    };
    match serde_json::from_str::<OauthCredentials>(&raw) {
        Ok(creds) => {
            debug!(path = %path.display(), "Loaded Gemini OAuth credentials");
            Some(creds)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unparseable OAuth credential file");
            None
        }
    }
}
