//! # LLM Collaborator
//!
//! The single seam through which the classifier and handlers reach a model.
//!
//! ## Architecture
//!
//! ```text
//! IntentClassifier ─┐
//!                   ├─> dyn LlmClient ──> RadkitClient (run_llm_function! over ModelConfig)
//! Handlers ─────────┘         │
//!                             └──> decode_structured<T> (fence strip + serde)
//! ```

pub mod decode;
pub mod provider;
pub mod radkit_client;

pub use decode::{decode_structured, or_fallback, DecodeError};
pub use provider::{LlmProvider, ModelConfig, ModelSettings};
pub use radkit_client::RadkitClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Speaker of one chat message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One call to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Caller name used to pick a per-handler model override ("classifier", "generate", ...)
    pub purpose: String,
    pub messages: Vec<Message>,
}

impl CompletionRequest {
    pub fn new(purpose: &str, messages: Vec<Message>) -> Self {
        Self {
            purpose: purpose.to_string(),
            messages,
        }
    }
}

/// Model reply plus accounting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Parsed JSON when the provider returned structured output
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
    #[serde(default)]
    pub tokens_in: u32,
    #[serde(default)]
    pub tokens_out: u32,
    /// Estimated cost in USD
    #[serde(default)]
    pub cost_estimate: f64,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Structured payload if present, otherwise the raw text
    pub fn payload(&self) -> String {
        match &self.structured {
            Some(value) => value.to_string(),
            None => self.text.clone(),
        }
    }
}

/// Asynchronous model access. Calls may fail or hang; callers bound them with timeouts.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion>;

    /// Stream the reply as text chunks into `sink`, returning the full completion.
    ///
    /// Providers without native streaming deliver the whole text as one chunk.
    async fn stream(
        &self,
        request: &CompletionRequest,
        sink: &mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<Completion> {
        let completion = self.complete(request).await?;
        let _ = sink.send(completion.text.clone());
        Ok(completion)
    }
}
