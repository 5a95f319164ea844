//! Configuration types, built from environment variables.

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::LlmBackend;

/// Default HTTP port for `serve`.
const DEFAULT_PORT: u16 = 8080;

/// Language model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

/// Gmail settings. Both fields are optional; the connector checks them.
#[derive(Debug, Clone, Default)]
pub struct GmailSettings {
    /// OAuth bearer token with the `gmail.modify` scope.
    pub access_token: Option<SecretString>,
    /// Mailbox to operate on. `me` selects the token owner.
    pub delegated_user: Option<String>,
}

/// Microsoft Graph client-credential settings.
#[derive(Debug, Clone, Default)]
pub struct OutlookSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
}

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub llm: LlmSettings,
    pub gmail: GmailSettings,
    pub outlook: OutlookSettings,
    /// Permitted sender addresses. Empty means no restriction.
    pub allowed_senders: Vec<String>,
    pub port: u16,
    pub log_dir: Option<std::path::PathBuf>,
}

impl Settings {
    /// Build settings from environment variables.
    ///
    /// Only the model key is required here. Provider credentials are checked
    /// when a connector is built, so one provider can be configured alone.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match get("TRIAGE_LLM_BACKEND") {
            Some(raw) => raw
                .parse::<LlmBackend>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "TRIAGE_LLM_BACKEND".into(),
                    message,
                })?,
            None => LlmBackend::default(),
        };

        let key_var = backend.key_var();
        let api_key = get(key_var).ok_or_else(|| ConfigError::MissingEnvVar(key_var.into()))?;
        let model = get(backend.model_var()).unwrap_or_else(|| backend.default_model().to_string());

        let port = match get("TRIAGE_PORT") {
            Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "TRIAGE_PORT".into(),
                message: format!("{e}"),
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            llm: LlmSettings {
                backend,
                api_key: SecretString::from(api_key),
                model,
            },
            gmail: GmailSettings {
                access_token: get("GMAIL_ACCESS_TOKEN").map(SecretString::from),
                delegated_user: get("GMAIL_DELEGATED_USER"),
            },
            outlook: OutlookSettings {
                client_id: get("OUTLOOK_CLIENT_ID"),
                client_secret: get("OUTLOOK_CLIENT_SECRET").map(SecretString::from),
                tenant_id: get("OUTLOOK_TENANT_ID"),
                user_id: get("OUTLOOK_USER_ID"),
            },
            allowed_senders: parse_allowed_senders(&get("ALLOWED_SENDERS").unwrap_or_default()),
            port,
            log_dir: get("TRIAGE_LOG_DIR").map(std::path::PathBuf::from),
        })
    }
}

/// Split a comma-separated allow-list, dropping blanks.
pub fn parse_allowed_senders(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
