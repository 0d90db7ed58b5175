//! Runtime configuration.
//!
//! Layering: built-in defaults, then an optional TOML file, then CLI flags
//! (see [`crate::cli::Args`]). Secrets are never read from the file; they
//! come only from the process environment.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};

pub const DEFAULT_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";
pub const DEFAULT_MODERATION_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_MODERATION_MODEL: &str = "meta-llama/Llama-Guard-4-12B";
pub const DEFAULT_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub const DEFAULT_MODELS: [&str; 3] = [
    "google/gemini-3-flash-preview",
    "arcee-ai/trinity-large-preview:free",
    "openrouter/free",
];

pub const SYSTEM_PROMPT: &str = "You are a helpful, friendly assistant created by Abhinav Pola. \
Abhinav Pola is a software engineer with experience at OpenRouter.ai and Google. \
He holds a B.S. in Computer Science and Astronomy from the University of Illinois at Urbana-Champaign. \
At OpenRouter.ai he worked on Cloudflare Workers APIs, real-time evaluation pipelines, provider onboarding automation, \
embeddings APIs and enterprise BYOK integrations, and built CI and end-to-end testing from the ground up. \
At Google he built APIs and distributed data pipelines for YouTube, Nest and Google Assistant. \
He has research experience in AI alignment and IoT systems. \
Provide concise and accurate responses.";

pub const PROVIDER_KEY_VAR: &str = "OPENROUTER_API_KEY";
pub const MODERATION_KEY_VAR: &str = "GROQ_API_KEY";
pub const CHALLENGE_SECRET_VAR: &str = "TURNSTILE_SECRET_KEY";

/// Credentials consumed from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub provider_api_key: Option<String>,
    pub moderation_api_key: Option<String>,
    pub challenge_secret: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary lookup. Blank values count as absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Secrets {
            provider_api_key: get(PROVIDER_KEY_VAR),
            moderation_api_key: get(MODERATION_KEY_VAR),
            challenge_secret: get(CHALLENGE_SECRET_VAR),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Force the local simulation generator even when a provider key exists.
    pub simulate: bool,
    pub verify_url: String,
    pub moderation_url: String,
    pub moderation_model: String,
    pub completions_url: String,
    /// Ordered fallback models handed to the provider in one call.
    pub models: Vec<String>,
    pub system_prompt: String,
    pub max_body_bytes: usize,
    pub simulate_cadence_ms: u64,
    pub connect_timeout_secs: u64,
    #[serde(skip)]
    pub secrets: Secrets,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8787,
            simulate: false,
            verify_url: DEFAULT_VERIFY_URL.to_string(),
            moderation_url: DEFAULT_MODERATION_URL.to_string(),
            moderation_model: DEFAULT_MODERATION_MODEL.to_string(),
            completions_url: DEFAULT_COMPLETIONS_URL.to_string(),
            models: DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            max_body_bytes: 64 * 1024,
            simulate_cadence_ms: 40,
            connect_timeout_secs: 10,
            secrets: Secrets::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load defaults, overlay `path` if given, and attach environment secrets.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    RelayError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Config::default(),
        };
        config.secrets = Secrets::from_env();
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(RelayError::Config("models must list at least one model".into()));
        }
        if self.max_body_bytes == 0 {
            return Err(RelayError::Config("max_body_bytes must be positive".into()));
        }
        Ok(())
    }

    /// The simulation generator runs when forced or when no provider key is set.
    pub fn simulation_enabled(&self) -> bool {
        self.simulate || self.secrets.provider_api_key.is_none()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn simulate_cadence(&self) -> Duration {
        Duration::from_millis(self.simulate_cadence_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
