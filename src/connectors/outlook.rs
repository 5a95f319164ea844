//! Outlook connector over Microsoft Graph.
//!
//! Authenticates with the OAuth2 client-credentials grant. The access token
//! is cached behind a mutex so concurrent runs share one token.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::message::strip_html;
use super::{
    EmailMessage, MailConnector, Operation, check_response, decode_json, transport_error,
};
use crate::config::OutlookSettings;
use crate::error::{ConfigError, ConnectorError};

const PROVIDER: &str = "outlook";
const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

/// A Graph `message` resource (fields we read).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphMessage {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<Recipient>,
    #[serde(default)]
    pub to_recipients: Vec<Recipient>,
    #[serde(default)]
    pub body_preview: String,
    #[serde(default)]
    pub body: Option<ItemBody>,
    #[serde(default)]
    pub received_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Recipient {
    pub email_address: EmailAddress,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmailAddress {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ItemBody {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct DraftResponse {
    id: String,
}

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

// ── Connector ───────────────────────────────────────────────────────

/// Microsoft Graph connector.
pub struct OutlookConnector {
    http: reqwest::Client,
    graph_url: String,
    login_url: String,
    client_id: String,
    client_secret: SecretString,
    tenant_id: String,
    user_id: String,
    token: Mutex<Option<CachedToken>>,
}

impl OutlookConnector {
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: SecretString,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            graph_url: DEFAULT_GRAPH_URL.to_string(),
            login_url: DEFAULT_LOGIN_URL.to_string(),
            client_id: client_id.into(),
            client_secret,
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            token: Mutex::new(None),
        }
    }

    /// Build from settings, failing if any credential is missing.
    pub fn from_settings(
        settings: &OutlookSettings,
        http: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        match (
            &settings.client_id,
            &settings.client_secret,
            &settings.tenant_id,
            &settings.user_id,
        ) {
            (Some(client_id), Some(secret), Some(tenant), Some(user)) => Ok(Self::new(
                http,
                client_id.clone(),
                secret.clone(),
                tenant.clone(),
                user.clone(),
            )),
            _ => {
                let missing = [
                    ("OUTLOOK_CLIENT_ID", settings.client_id.is_none()),
                    ("OUTLOOK_CLIENT_SECRET", settings.client_secret.is_none()),
                    ("OUTLOOK_TENANT_ID", settings.tenant_id.is_none()),
                    ("OUTLOOK_USER_ID", settings.user_id.is_none()),
                ]
                .into_iter()
                .filter(|(_, absent)| *absent)
                .map(|(name, _)| name.to_string())
                .collect();
                Err(ConfigError::MissingCredentials {
                    provider: PROVIDER.into(),
                    missing,
                })
            }
        }
    }

    /// Point the connector at different Graph and login roots.
    pub fn with_base_urls(mut self, graph_url: &str, login_url: &str) -> Self {
        self.graph_url = graph_url.trim_end_matches('/').to_string();
        self.login_url = login_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/{}/{}", self.graph_url, self.user_id, path)
    }

    /// A valid bearer token, fetched or refreshed as needed.
    async fn access_token(&self) -> Result<String, ConnectorError> {
        let mut cached = self.token.lock().await;
        if let Some(ref token) = *cached
            && Instant::now() < token.expires_at
        {
            return Ok(token.token.expose_secret().to_string());
        }

        let auth_failed = |reason: String| ConnectorError::Auth {
            provider: PROVIDER.into(),
            reason,
        };

        let response = self
            .http
            .post(format!(
                "{}/{}/oauth2/v2.0/token",
                self.login_url, self.tenant_id
            ))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| auth_failed(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            return Err(auth_failed(format!("HTTP {status}: {detail}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_failed(format!("bad token response: {e}")))?;
        debug!(expires_in = token.expires_in, "Acquired Graph access token");

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            token: SecretString::from(token.access_token),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    /// `check_response`, dropping the cached token once Graph rejects it.
    async fn checked(
        &self,
        operation: Operation,
        resource: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ConnectorError> {
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!(resource, "Graph rejected the access token, dropping it");
            self.token.lock().await.take();
        }
        check_response(PROVIDER, operation, resource, response).await
    }

    async fn post_send(
        &self,
        url: String,
        token: &str,
        json: Option<serde_json::Value>,
        resource: &str,
    ) -> Result<reqwest::Response, ConnectorError> {
        let request = self.http.post(url).bearer_auth(token);
        let request = match json {
            Some(body) => request.json(&body),
            None => request.body(Vec::new()),
        };
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, Operation::Send, e))?;
        self.checked(Operation::Send, resource, response).await
    }
}

#[async_trait]
impl MailConnector for OutlookConnector {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<EmailMessage>, ConnectorError> {
        let token = self.access_token().await?;
        let top = limit.to_string();
        let response = self
            .http
            .get(self.url("messages"))
            .bearer_auth(&token)
            .query(&[
                ("$top", top.as_str()),
                ("$orderby", "receivedDateTime desc"),
                ("$filter", "isRead eq false"),
            ])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, Operation::Read, e))?;
        let response = self.checked(Operation::Read, "messages", response).await?;
        let list: MessageList = decode_json(PROVIDER, response).await?;
        debug!(count = list.value.len(), "Graph listed unread messages");

        list.value
            .into_iter()
            .take(limit)
            .map(parse_message)
            .collect()
    }

    async fn fetch(&self, id: &str) -> Result<EmailMessage, ConnectorError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.url(&format!("messages/{id}")))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, Operation::Read, e))?;
        let response = self.checked(Operation::Read, id, response).await?;
        parse_message(decode_json(PROVIDER, response).await?)
    }

    async fn send_reply(&self, thread_id: &str, body: &str) -> Result<String, ConnectorError> {
        let token = self.access_token().await?;

        let response = self
            .post_send(
                self.url(&format!("messages/{thread_id}/createReply")),
                &token,
                Some(serde_json::json!({ "comment": body })),
                thread_id,
            )
            .await?;
        let draft: DraftResponse = decode_json(PROVIDER, response).await?;

        self.post_send(
            self.url(&format!("messages/{}/send", draft.id)),
            &token,
            None,
            &draft.id,
        )
        .await?;

        info!(thread_id = %thread_id, id = %draft.id, "Outlook reply sent");
        Ok(draft.id)
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Turn a Graph message into an `EmailMessage`.
///
/// Graph replies are addressed by message id, so the message is its own thread.
pub(crate) fn parse_message(message: GraphMessage) -> Result<EmailMessage, ConnectorError> {
    let received_at = match message.received_date_time.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ConnectorError::InvalidPayload {
                provider: PROVIDER.into(),
                reason: format!("message {}: bad receivedDateTime '{raw}': {e}", message.id),
            })?,
        None => {
            return Err(ConnectorError::InvalidPayload {
                provider: PROVIDER.into(),
                reason: format!("message {}: no receivedDateTime", message.id),
            });
        }
    };

    let body = message.body.map(|b| {
        if b.content_type.eq_ignore_ascii_case("html") {
            strip_html(&b.content)
        } else {
            b.content
        }
    });

    EmailMessage {
        thread_id: Some(message.id.clone()),
        id: message.id,
        subject: message
            .subject
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "(no subject)".to_string()),
        sender: message
            .from
            .map(|r| r.email_address.address)
            .unwrap_or_default(),
        recipients: message
            .to_recipients
            .into_iter()
            .map(|r| r.email_address.address)
            .filter(|a| !a.is_empty())
            .collect(),
        snippet: message.body_preview,
        body,
        received_at,
    }
    .ensure_identity(PROVIDER)
}
