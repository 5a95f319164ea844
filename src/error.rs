//! Error types for mail triage.

use std::time::Duration;

use crate::triage::state::Stage;

/// Configuration-related errors.
///
/// Raised before a run starts; never reaches the state machine.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing credentials for {provider}: {}", missing.join(", "))]
    MissingCredentials {
        provider: String,
        missing: Vec<String>,
    },

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Authentication failed for {provider}: {reason}")]
    Auth { provider: String, reason: String },

    #[error("Message {id} not found on {provider}")]
    NotFound { provider: String, id: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Delivery failed on {provider}: {reason}")]
    DeliveryFailed { provider: String, reason: String },

    #[error("HTTP error from {provider}: {reason}")]
    Http { provider: String, reason: String },

    #[error("Invalid payload from {provider}: {reason}")]
    InvalidPayload { provider: String, reason: String },
}

/// Classification client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Model unavailable: {reason}")]
    ModelUnavailable { reason: String },

    #[error("Malformed model output: {reason}")]
    MalformedOutput { reason: String },
}

impl From<LlmError> for ClassificationError {
    fn from(e: LlmError) -> Self {
        Self::ModelUnavailable {
            reason: e.to_string(),
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that abort a triage run. Each one names the stage it came from.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("{stage} stage failed: {source}")]
    Connector {
        stage: Stage,
        #[source]
        source: ConnectorError,
    },

    #[error("{stage} stage failed: {source}")]
    Classification {
        stage: Stage,
        #[source]
        source: ClassificationError,
    },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("{stage} stage task aborted: {reason}")]
    TaskJoin { stage: Stage, reason: String },
}

impl TriageError {
    /// The stage the run failed in.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Connector { stage, .. }
            | Self::Classification { stage, .. }
            | Self::TaskJoin { stage, .. } => *stage,
            Self::InvalidTransition { from, .. } => *from,
        }
    }
}
