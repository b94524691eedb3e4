//! # Radkit Client
//!
//! Production [`LlmClient`] backed by radkit providers. The provider match
//! lives in one macro so every model call shares it.

use async_trait::async_trait;
use radkit::macros::LLMOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Completion, CompletionRequest, LlmClient, ModelSettings, Role};

/// Run an `LlmFunction` against whichever provider `$config` names.
macro_rules! run_llm_function {
    ($config:expr, $output_type:ty, $system_prompt:expr, $input:expr) => {{
        use radkit::agent::LlmFunction;
        use radkit::models::providers::{
            AnthropicLlm, DeepSeekLlm, GeminiLlm, GrokLlm, OpenAILlm, OpenRouterLlm,
        };
        use $crate::llm::LlmProvider;

        let config = $config;
        let result: anyhow::Result<$output_type> = match config.provider {
            LlmProvider::Anthropic => {
                let llm = AnthropicLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::OpenAI => {
                let mut llm = OpenAILlm::from_env(&config.model)?;
                if let Some(base_url) = &config.base_url {
                    llm = llm.with_base_url(base_url);
                }
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::Gemini => {
                let llm = GeminiLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::OpenRouter => {
                let llm = OpenRouterLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::Grok => {
                let llm = GrokLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::DeepSeek => {
                let llm = DeepSeekLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
        };
        result
    }};
}

/// Free-text model reply. Callers that need structure ask for JSON in the
/// prompt and run the text through `decode_structured`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct FreeformReply {
    /// The complete reply text
    pub text: String,
}

pub struct RadkitClient {
    settings: ModelSettings,
}

impl RadkitClient {
    pub fn new(settings: ModelSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl LlmClient for RadkitClient {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion> {
        let config = self.settings.for_purpose(&request.purpose);
        let (system, input) = flatten(request);

        tracing::debug!(
            purpose = %request.purpose,
            model = %config.model,
            messages = request.messages.len(),
            "LLM call"
        );

        let reply = run_llm_function!(&config, FreeformReply, system.clone(), input.clone())?;

        // radkit does not surface usage; approximate at four characters per token
        Ok(Completion {
            tokens_in: ((system.len() + input.len()) / 4) as u32,
            tokens_out: (reply.text.len() / 4) as u32,
            text: reply.text,
            structured: None,
            cost_estimate: 0.0,
        })
    }
}

/// Split a chat transcript into a system prompt and a single input string
fn flatten(request: &CompletionRequest) -> (String, String) {
    let system = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let turns: Vec<&super::Message> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();

    let input = match turns.as_slice() {
        [only] => only.content.clone(),
        _ => turns
            .iter()
            .map(|m| match m.role {
                Role::Assistant => format!("Assistant: {}", m.content),
                _ => format!("User: {}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    (system, input)
}
