//! Mail connectors: the capability contract the triage core consumes, plus
//! the Gmail and Outlook implementations and the factory that builds them.

pub mod gmail;
pub mod message;
pub mod outlook;

pub use gmail::GmailConnector;
pub use message::EmailMessage;
pub use outlook::OutlookConnector;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{ConfigError, ConnectorError};

/// Mail provider capability set.
///
/// Implementations must be safe to share across concurrent runs.
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Provider name, for logging.
    fn name(&self) -> &str;

    /// Unread messages, most recent first, at most `limit` of them.
    async fn list_recent(&self, limit: usize) -> Result<Vec<EmailMessage>, ConnectorError>;

    /// Fetch one message by id. Unknown ids fail with `NotFound`.
    async fn fetch(&self, id: &str) -> Result<EmailMessage, ConnectorError>;

    /// Send `body` as a reply into `thread_id` and return the new message id.
    ///
    /// Rejected sends fail with `DeliveryFailed` and are not retried here.
    async fn send_reply(&self, thread_id: &str, body: &str) -> Result<String, ConnectorError>;
}

/// Supported mail providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gmail => write!(f, "gmail"),
            Self::Outlook => write!(f, "outlook"),
        }
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            "outlook" => Ok(Self::Outlook),
            other => Err(ConfigError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// Builds connectors for a provider. Failures happen before any run starts.
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, provider: Provider) -> Result<Arc<dyn MailConnector>, ConfigError>;
}

/// Build a connector straight from settings.
pub fn build_connector(
    settings: &Settings,
    provider: Provider,
) -> Result<Arc<dyn MailConnector>, ConfigError> {
    let http = reqwest::Client::new();
    match provider {
        Provider::Gmail => Ok(Arc::new(GmailConnector::from_settings(
            &settings.gmail,
            http,
        )?)),
        Provider::Outlook => Ok(Arc::new(OutlookConnector::from_settings(
            &settings.outlook,
            http,
        )?)),
    }
}

/// Factory backed by process settings.
///
/// Connectors are built once per provider and reused, so the Outlook token
/// cache is shared by every run.
pub struct SettingsConnectorFactory {
    settings: Settings,
    built: Mutex<HashMap<Provider, Arc<dyn MailConnector>>>,
}

impl SettingsConnectorFactory {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            built: Mutex::new(HashMap::new()),
        }
    }
}

impl ConnectorFactory for SettingsConnectorFactory {
    fn connector(&self, provider: Provider) -> Result<Arc<dyn MailConnector>, ConfigError> {
        let mut built = self.built.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = built.get(&provider) {
            return Ok(Arc::clone(existing));
        }
        let connector = build_connector(&self.settings, provider)?;
        built.insert(provider, Arc::clone(&connector));
        Ok(connector)
    }
}

/// Whether a failed HTTP call was reading mail or sending it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Read,
    Send,
}

/// Map a non-success HTTP status onto the connector taxonomy.
///
/// Any rejected send is `DeliveryFailed`, whatever the status.
pub(crate) fn status_error(
    provider: &str,
    operation: Operation,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    resource: &str,
    detail: &str,
) -> ConnectorError {
    if operation == Operation::Send {
        return ConnectorError::DeliveryFailed {
            provider: provider.into(),
            reason: format!("HTTP {status}: {detail}"),
        };
    }
    match status.as_u16() {
        401 | 403 => ConnectorError::Auth {
            provider: provider.into(),
            reason: format!("HTTP {status}: {detail}"),
        },
        404 => ConnectorError::NotFound {
            provider: provider.into(),
            id: resource.into(),
        },
        429 => ConnectorError::RateLimited {
            provider: provider.into(),
            retry_after,
        },
        _ => ConnectorError::Http {
            provider: provider.into(),
            reason: format!("HTTP {status}: {detail}"),
        },
    }
}

/// Map a transport-level failure.
pub(crate) fn transport_error(
    provider: &str,
    operation: Operation,
    err: reqwest::Error,
) -> ConnectorError {
    match operation {
        Operation::Send => ConnectorError::DeliveryFailed {
            provider: provider.into(),
            reason: err.to_string(),
        },
        Operation::Read => ConnectorError::Http {
            provider: provider.into(),
            reason: err.to_string(),
        },
    }
}

/// Pass a successful response through, or turn it into a `ConnectorError`.
pub(crate) async fn check_response(
    provider: &str,
    operation: Operation,
    resource: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let detail: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect();
    Err(status_error(
        provider,
        operation,
        status,
        retry_after,
        resource,
        &detail,
    ))
}

/// Decode a JSON body into `T`, mapping failures to `InvalidPayload`.
pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    response: reqwest::Response,
) -> Result<T, ConnectorError> {
    response
        .json::<T>()
        .await
        .map_err(|e| ConnectorError::InvalidPayload {
            provider: provider.into(),
            reason: e.to_string(),
        })
}
