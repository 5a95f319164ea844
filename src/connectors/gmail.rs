//! Gmail connector over the Gmail REST API.
//!
//! Messages are fetched in `raw` format and parsed with mail-parser; replies
//! are built with lettre and posted back as base64url RFC 822.

use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE};
use base64::engine::DecodePaddingMode;
use chrono::{DateTime, Utc};
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use super::message::{extract_address, extract_addresses, same_address, strip_html};
use super::{
    EmailMessage, MailConnector, Operation, check_response, decode_json, transport_error,
};
use crate::config::GmailSettings;
use crate::error::{ConfigError, ConnectorError};

const PROVIDER: &str = "gmail";
const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail emits base64url with or without padding.
const RAW_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// A message in `format=raw`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub snippet: String,
    /// Epoch milliseconds, as a string.
    #[serde(default)]
    pub internal_date: Option<String>,
    pub raw: String,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    #[serde(default)]
    messages: Vec<MetadataMessage>,
}

#[derive(Debug, Deserialize)]
struct MetadataMessage {
    #[serde(default)]
    payload: Option<MetadataPayload>,
}

#[derive(Debug, Deserialize)]
struct MetadataPayload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Headers of the message being answered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReplyContext {
    pub to: String,
    pub subject: String,
    pub message_id: Option<String>,
    pub references: Option<String>,
}

// ── Connector ───────────────────────────────────────────────────────

/// Gmail connector authenticated by a bearer token.
pub struct GmailConnector {
    http: reqwest::Client,
    base_url: String,
    user: String,
    access_token: SecretString,
}

impl GmailConnector {
    pub fn new(http: reqwest::Client, user: impl Into<String>, access_token: SecretString) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            user: user.into(),
            access_token,
        }
    }

    /// Build from settings, failing if credentials are incomplete.
    pub fn from_settings(
        settings: &GmailSettings,
        http: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        if settings.access_token.is_none() {
            missing.push("GMAIL_ACCESS_TOKEN".to_string());
        }
        if settings.delegated_user.is_none() {
            missing.push("GMAIL_DELEGATED_USER".to_string());
        }
        match (&settings.access_token, &settings.delegated_user) {
            (Some(token), Some(user)) => Ok(Self::new(http, user.clone(), token.clone())),
            _ => Err(ConfigError::MissingCredentials {
                provider: PROVIDER.into(),
                missing,
            }),
        }
    }

    /// Point the connector at a different API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/{}/{}", self.base_url, self.user, path)
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
        resource: &str,
    ) -> Result<reqwest::Response, ConnectorError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(self.access_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, Operation::Read, e))?;
        check_response(PROVIDER, Operation::Read, resource, response).await
    }

    /// Headers of the newest message in a thread.
    async fn reply_context(&self, thread_id: &str) -> Result<ReplyContext, ConnectorError> {
        let response = self
            .http
            .get(self.url(&format!("threads/{thread_id}")))
            .bearer_auth(self.access_token.expose_secret())
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "From"),
                ("metadataHeaders", "Reply-To"),
                ("metadataHeaders", "Subject"),
                ("metadataHeaders", "Message-ID"),
                ("metadataHeaders", "References"),
            ])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, Operation::Send, e))?;
        let response = check_response(PROVIDER, Operation::Send, thread_id, response).await?;
        let thread: ThreadResponse = decode_json(PROVIDER, response).await?;

        reply_context_for(&thread.messages, &self.user).ok_or_else(|| {
            ConnectorError::DeliveryFailed {
                provider: PROVIDER.into(),
                reason: format!("thread {thread_id} has no message from another sender"),
            }
        })
    }
}

#[async_trait]
impl MailConnector for GmailConnector {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<EmailMessage>, ConnectorError> {
        let max_results = limit.to_string();
        let response = self
            .get(
                "messages",
                &[
                    ("maxResults", max_results.as_str()),
                    ("labelIds", "INBOX"),
                    ("q", "is:unread"),
                ],
                "messages",
            )
            .await?;
        let list: ListResponse = decode_json(PROVIDER, response).await?;
        debug!(count = list.messages.len(), "Gmail listed unread messages");

        let mut messages = Vec::with_capacity(list.messages.len().min(limit));
        for entry in list.messages.into_iter().take(limit) {
            messages.push(self.fetch(&entry.id).await?);
        }
        Ok(messages)
    }

    async fn fetch(&self, id: &str) -> Result<EmailMessage, ConnectorError> {
        let response = self
            .get(&format!("messages/{id}"), &[("format", "raw")], id)
            .await?;
        let raw: RawMessage = decode_json(PROVIDER, response).await?;
        parse_raw_message(raw)
    }

    async fn send_reply(&self, thread_id: &str, body: &str) -> Result<String, ConnectorError> {
        let context = self.reply_context(thread_id).await?;
        let raw = build_reply(&self.user, &context, body)?;

        let response = self
            .http
            .post(self.url("messages/send"))
            .bearer_auth(self.access_token.expose_secret())
            .json(&serde_json::json!({
                "raw": URL_SAFE.encode(raw),
                "threadId": thread_id,
            }))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, Operation::Send, e))?;
        let response = check_response(PROVIDER, Operation::Send, thread_id, response).await?;
        let sent: SendResponse = decode_json(PROVIDER, response).await?;

        info!(thread_id = %thread_id, id = %sent.id, "Gmail reply sent");
        Ok(sent.id)
    }
}

// ── Parsing (pub(crate) for tests) ──────────────────────────────────

/// Turn a `format=raw` message into an `EmailMessage`.
pub(crate) fn parse_raw_message(raw: RawMessage) -> Result<EmailMessage, ConnectorError> {
    let invalid = |reason: String| ConnectorError::InvalidPayload {
        provider: PROVIDER.into(),
        reason,
    };

    let bytes = RAW_ENGINE
        .decode(raw.raw.trim())
        .map_err(|e| invalid(format!("message {}: bad base64: {e}", raw.id)))?;
    let parsed = MessageParser::default()
        .parse(&bytes)
        .ok_or_else(|| invalid(format!("message {}: unparsable RFC 822", raw.id)))?;

    let sender = extract_addresses(parsed.from())
        .into_iter()
        .next()
        .unwrap_or_default();
    let body = parsed
        .body_text(0)
        .map(|t| t.trim().to_string())
        .or_else(|| parsed.body_html(0).map(|h| strip_html(h.as_ref())));
    // internalDate is authoritative; the Date header covers its absence.
    let received_at = match raw.internal_date.as_deref() {
        Some(ms) => ms
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| invalid(format!("message {}: bad internalDate '{ms}'", raw.id)))?,
        None => parsed
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
            .ok_or_else(|| invalid(format!("message {}: no receive time", raw.id)))?,
    };

    EmailMessage {
        id: raw.id,
        thread_id: raw.thread_id,
        subject: parsed
            .subject()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("(no subject)")
            .to_string(),
        sender,
        recipients: extract_addresses(parsed.to()),
        snippet: raw.snippet,
        body,
        received_at,
    }
    .ensure_identity(PROVIDER)
}

/// Reply headers from the newest thread message not sent by `own_address`.
///
/// Earlier replies of ours sit at the end of the thread and must not be
/// answered.
fn reply_context_for(messages: &[MetadataMessage], own_address: &str) -> Option<ReplyContext> {
    messages
        .iter()
        .rev()
        .filter_map(|m| m.payload.as_ref())
        .map(|p| p.headers.as_slice())
        .find(|headers| {
            !headers
                .iter()
                .any(|h| h.name.eq_ignore_ascii_case("From") && same_address(&h.value, own_address))
        })
        .and_then(reply_context_from_headers)
}

fn reply_context_from_headers(headers: &[Header]) -> Option<ReplyContext> {
    let find = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let to = find("Reply-To").or_else(|| find("From"))?;
    let subject = find("Subject").unwrap_or_default();
    Some(ReplyContext {
        to,
        subject: reply_subject(&subject),
        message_id: find("Message-ID"),
        references: find("References"),
    })
}

/// Prefix `Re: ` unless the subject already carries it.
pub(crate) fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "Re: (no subject)".to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

/// Build the RFC 822 reply bytes.
pub(crate) fn build_reply(
    from: &str,
    context: &ReplyContext,
    body: &str,
) -> Result<Vec<u8>, ConnectorError> {
    let failed = |reason: String| ConnectorError::DeliveryFailed {
        provider: PROVIDER.into(),
        reason,
    };

    let from: Mailbox = extract_address(from)
        .parse()
        .map_err(|e| failed(format!("invalid from address: {e}")))?;
    let to: Mailbox = context
        .to
        .parse()
        .or_else(|_| extract_address(&context.to).parse())
        .map_err(|e| failed(format!("invalid reply address: {e}")))?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(context.subject.clone())
        .header(ContentType::TEXT_PLAIN);
    if let Some(ref message_id) = context.message_id {
        builder = builder.in_reply_to(message_id.clone());
        let references = match context.references {
            Some(ref refs) => format!("{refs} {message_id}"),
            None => message_id.clone(),
        };
        builder = builder.references(references);
    }

    let message = builder
        .body(body.to_string())
        .map_err(|e| failed(format!("failed to build reply: {e}")))?;
    Ok(message.formatted())
}
