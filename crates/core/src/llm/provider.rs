//! # Model Configuration
//!
//! Provider selection for the radkit-backed client, with per-handler overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported LLM providers. API keys come from the provider's usual env var
/// (`ANTHROPIC_API_KEY`, `OPENAI_API_KEY`, `GEMINI_API_KEY`, `OPENROUTER_API_KEY`,
/// `XAI_API_KEY`, `DEEPSEEK_API_KEY`).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
    OpenRouter,
    Grok,
    DeepSeek,
}

impl LlmProvider {
    /// Whether this provider supports custom base URL
    pub fn supports_base_url(&self) -> bool {
        matches!(self, LlmProvider::OpenAI)
    }

    /// Model used when neither a global nor a per-handler model is configured
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::OpenAI => "gpt-4o",
            LlmProvider::Gemini => "gemini-2.0-flash-exp",
            LlmProvider::OpenRouter => "anthropic/claude-3.5-sonnet",
            LlmProvider::Grok => "grok-2",
            LlmProvider::DeepSeek => "deepseek-chat",
        }
    }
}

/// Concrete provider + model for one call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    pub model: String,
    /// Base URL override for OpenAI-compatible APIs
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::with_provider(LlmProvider::Anthropic, LlmProvider::Anthropic.default_model())
    }
}

impl ModelConfig {
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Global model selection plus per-handler overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    pub provider: LlmProvider,
    /// Global model; falls back to the provider default
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// purpose -> model name
    pub per_handler_models: HashMap<String, String>,
    /// purpose -> provider
    pub per_handler_providers: HashMap<String, LlmProvider>,
}

impl ModelSettings {
    /// Resolve the model for a caller: per-handler override -> global -> provider default
    pub fn for_purpose(&self, purpose: &str) -> ModelConfig {
        let provider = self
            .per_handler_providers
            .get(purpose)
            .cloned()
            .unwrap_or_else(|| self.provider.clone());

        let model = self
            .per_handler_models
            .get(purpose)
            .or(self.model.as_ref())
            .cloned()
            .unwrap_or_else(|| provider.default_model().to_string());

        let base_url = if provider.supports_base_url() {
            self.base_url.clone()
        } else {
            None
        };

        ModelConfig {
            provider,
            model,
            base_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.provider, LlmProvider::Anthropic);
        assert!(config.model.contains("claude"));
    }

    #[test]
    fn test_provider_serialization() {
        let config = ModelConfig::with_provider(LlmProvider::OpenAI, "gpt-4o");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"openai\""));
        assert!(json.contains("gpt-4o"));
    }

    #[test]
    fn test_per_handler_override_wins() {
        let mut settings = ModelSettings {
            model: Some("claude-3-5-haiku".to_string()),
            ..ModelSettings::default()
        };
        settings
            .per_handler_models
            .insert("generate".to_string(), "claude-opus".to_string());

        assert_eq!(settings.for_purpose("generate").model, "claude-opus");
        assert_eq!(settings.for_purpose("classifier").model, "claude-3-5-haiku");
    }

    #[test]
    fn test_base_url_only_for_openai() {
        let mut settings = ModelSettings {
            base_url: Some("http://localhost:8080/v1".to_string()),
            ..ModelSettings::default()
        };
        assert_eq!(settings.for_purpose("chat").base_url, None);

        settings
            .per_handler_providers
            .insert("chat".to_string(), LlmProvider::OpenAI);
        let config = settings.for_purpose("chat");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080/v1"));
    }
}
