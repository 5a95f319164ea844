//! Classification client: asks the model what to do with an email and
//! drafts the reply.
//!
//! Malformed model output never fails a run: an unknown or missing action
//! becomes `acknowledge`, missing notes become an empty string.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::connectors::EmailMessage;
use crate::error::ClassificationError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::triage::state::{Action, ReplyIntent};

/// Temperature for both calls.
const TEMPERATURE: f32 = 0.1;

/// Max tokens for the classification call.
const CLASSIFY_MAX_TOKENS: u32 = 512;

/// Max tokens for a drafted reply.
const DRAFT_MAX_TOKENS: u32 = 1024;

/// Placeholder used when the body was not fetched.
pub const BODY_NOT_FETCHED: &str = "(body not fetched)";

const CLASSIFY_SYSTEM_PROMPT: &str =
    "You are an AI email chief of staff who classifies emails and decides the best action.";

const DRAFT_SYSTEM_PROMPT: &str = "You write professional email replies.";

/// Outcome of a classification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Already normalized to one of the four canonical actions.
    pub action: Action,
    pub notes: String,
    /// Prompts sent and the response received, in order.
    pub transcript: Vec<ChatMessage>,
}

/// The two model-backed operations the triage core needs.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Decide an action for `message`.
    async fn classify(&self, message: &EmailMessage) -> Result<Classification, ClassificationError>;

    /// Write a short reply body for `intent`.
    async fn draft_reply(
        &self,
        message: &EmailMessage,
        intent: ReplyIntent,
        notes: &str,
    ) -> Result<String, ClassificationError>;
}

/// Classifier backed by an `LlmProvider`.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, message: &EmailMessage) -> Result<Classification, ClassificationError> {
        let system = ChatMessage::system(CLASSIFY_SYSTEM_PROMPT);
        let user = ChatMessage::user(build_classify_prompt(message));
        debug!(
            id = %message.id,
            model = self.llm.model_name(),
            prompt_chars = user.content.len(),
            "Classifying email"
        );

        let request = CompletionRequest::new(vec![system.clone(), user.clone()])
            .with_temperature(TEMPERATURE)
            .with_max_tokens(CLASSIFY_MAX_TOKENS);
        let response = self.llm.complete(request).await?;

        let (action, notes) = match parse_classification(&response.content) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    id = %message.id,
                    raw_response = %response.content,
                    error = %e,
                    "Unparsable classification, falling back to acknowledge"
                );
                (Action::Acknowledge, String::new())
            }
        };

        Ok(Classification {
            action,
            notes,
            transcript: vec![system, user, ChatMessage::assistant(response.content)],
        })
    }

    async fn draft_reply(
        &self,
        message: &EmailMessage,
        intent: ReplyIntent,
        notes: &str,
    ) -> Result<String, ClassificationError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(DRAFT_SYSTEM_PROMPT),
            ChatMessage::user(build_draft_prompt(message, intent, notes)),
        ])
        .with_temperature(TEMPERATURE)
        .with_max_tokens(DRAFT_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        Ok(response.content.trim().to_string())
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Format an email for the model. Field order is fixed.
pub fn format_email_summary(message: &EmailMessage) -> String {
    format!(
        "Subject: {}\nFrom: {}\nTo: {}\nReceived: {}\n\nSnippet:\n{}\n\nBody:\n{}",
        message.subject,
        message.sender,
        message.recipients.join(", "),
        message.received_at.to_rfc3339(),
        message.snippet,
        message.body.as_deref().unwrap_or(BODY_NOT_FETCHED),
    )
}

fn build_classify_prompt(message: &EmailMessage) -> String {
    format!(
        "Determine the best action for this email. Respond with JSON containing \
         {{\"action\": <acknowledge|schedule_call|delegate|ignore>, \"notes\": <reasoning>}}.\
         \n\nEmail:\n{}",
        format_email_summary(message)
    )
}

fn build_draft_prompt(message: &EmailMessage, intent: ReplyIntent, notes: &str) -> String {
    format!(
        "You are an executive assistant. Write a concise email reply given the user's intent.\n\
         Intent: {intent}\nNotes: {notes}\nEmail: {}",
        format_email_summary(message)
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse a classification response into a normalized action and notes.
///
/// Fails only when no JSON object can be read at all. Text after the object
/// is ignored.
fn parse_classification(raw: &str) -> Result<(Action, String), ClassificationError> {
    let candidate = extract_json_object(raw);
    let value = serde_json::Deserializer::from_str(candidate)
        .into_iter::<serde_json::Value>()
        .next()
        .ok_or_else(|| ClassificationError::MalformedOutput {
            reason: "empty response".into(),
        })?
        .map_err(|e| ClassificationError::MalformedOutput {
            reason: format!("JSON parse error: {e}"),
        })?;
    let object = value
        .as_object()
        .ok_or_else(|| ClassificationError::MalformedOutput {
            reason: "response is not a JSON object".into(),
        })?;

    let action = Action::parse_or_acknowledge(object.get("action").and_then(|v| v.as_str()));
    let notes = match object.get("notes") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Ok((action, notes))
}

/// Find where the JSON object starts in LLM output (handles markdown wrapping).
///
/// The returned slice may run past the object; the caller reads one value.
fn extract_json_object(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return trimmed;
    }

    // Prefer the inside of a fenced block
    let body = trimmed
        .find("```")
        .map(|start| {
            let after = &trimmed[start + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            after.find("```").map_or(after, |end| &after[..end])
        })
        .filter(|inner| inner.contains('{'))
        .unwrap_or(trimmed);

    match body.find('{') {
        Some(start) => body[start..].trim_end(),
        None => body.trim(),
    }
}
