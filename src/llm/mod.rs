//! Language model access for the classifier.
//!
//! rig-core does the HTTP work; `RigAdapter` narrows its `CompletionModel`
//! to the `LlmProvider` trait the triage code depends on. The backend is
//! chosen by `TRIAGE_LLM_BACKEND`.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::config::LlmSettings;
use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LlmBackend {
    #[default]
    OpenAi,
    Anthropic,
}

impl LlmBackend {
    pub fn label(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    /// Variable holding the API key.
    pub fn key_var(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    /// Variable overriding the model name.
    pub fn model_var(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_MODEL",
            Self::Anthropic => "ANTHROPIC_MODEL",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Anthropic => "claude-sonnet-4-20250514",
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("expected 'openai' or 'anthropic', got '{other}'")),
        }
    }
}

/// Create the classifier's model from settings.
pub fn create_provider(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::{anthropic, openai};

    let key = settings.api_key.expose_secret();
    let client_error = |e: &dyn fmt::Display| LlmError::RequestFailed {
        provider: settings.backend.label().to_string(),
        reason: format!("failed to create client: {e}"),
    };

    match settings.backend {
        LlmBackend::OpenAi => {
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(&e))?;
            Ok(wrap(client, settings))
        }
        LlmBackend::Anthropic => {
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(&e))?;
            Ok(wrap(client, settings))
        }
    }
}

fn wrap<C>(client: C, settings: &LlmSettings) -> Arc<dyn LlmProvider>
where
    C: CompletionClient,
    C::CompletionModel: 'static,
{
    tracing::info!(backend = %settings.backend, model = %settings.model, "LLM backend selected");
    let model = client.completion_model(&settings.model);
    Arc::new(RigAdapter::new(model, &settings.model))
}
