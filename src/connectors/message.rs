//! The provider-neutral email snapshot and helpers shared by connectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// An email as fetched from a provider.
///
/// `id` and `sender` are never empty once a connector hands the message out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Provider-assigned id.
    pub id: String,
    /// Provider thread id, when the provider has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub subject: String,
    /// Sender address.
    pub sender: String,
    /// To recipients, in header order.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Short preview. Always present, possibly empty.
    #[serde(default)]
    pub snippet: String,
    /// Full text body, absent when not fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl EmailMessage {
    /// Thread to reply into: the provider thread, or the message itself.
    pub fn reply_thread_id(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.id)
    }

    /// Reject messages missing an id or sender.
    pub(crate) fn ensure_identity(self, provider: &str) -> Result<Self, ConnectorError> {
        if self.id.trim().is_empty() {
            return Err(ConnectorError::InvalidPayload {
                provider: provider.into(),
                reason: "message has no id".into(),
            });
        }
        if self.sender.trim().is_empty() {
            return Err(ConnectorError::InvalidPayload {
                provider: provider.into(),
                reason: format!("message {} has no sender", self.id),
            });
        }
        Ok(self)
    }
}

/// Pull the bare address out of a `Name <addr>` header value.
pub fn extract_address(raw: &str) -> String {
    let trimmed = raw.trim();
    match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if end > start => trimmed[start + 1..end].trim().to_string(),
        _ => trimmed.to_string(),
    }
}

/// Case-insensitive address comparison that ignores display names.
pub fn same_address(a: &str, b: &str) -> bool {
    extract_address(a).eq_ignore_ascii_case(&extract_address(b))
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract email addresses from an optional mail_parser Address field.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}
