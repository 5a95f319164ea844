//! The triage state machine.
//!
//! ```text
//! SELECT ──▶ ANALYZE ──▶ PERFORM ──▶ FINALIZE ──▶ END
//!    │                                  ▲          ▲
//!    ├──────── excluded sender ─────────┘          │
//!    └──────── empty mailbox ──────────────────────┘
//! ```
//!
//! Each stage takes the state by value and returns the extended state plus
//! the stage to run next.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::connectors::message::same_address;
use crate::connectors::MailConnector;
use crate::error::TriageError;
use crate::triage::classifier::Classifier;
use crate::triage::state::{Stage, Task, TriageState};

/// Output of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub state: TriageState,
    pub next: Stage,
}

impl Step {
    fn new(state: TriageState, next: Stage) -> Self {
        Self { state, next }
    }
}

/// Check a sender against the allow-list. An empty list allows everyone.
pub fn is_sender_allowed(allowed: &[String], sender: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|a| same_address(a, sender))
}

/// Stage functions bound to one connector, classifier and allow-list.
///
/// Holds no per-run data, so one machine can serve concurrent runs.
pub struct TriageMachine {
    connector: Arc<dyn MailConnector>,
    classifier: Arc<dyn Classifier>,
    allowed_senders: Vec<String>,
}

impl TriageMachine {
    pub fn new(
        connector: Arc<dyn MailConnector>,
        classifier: Arc<dyn Classifier>,
        allowed_senders: Vec<String>,
    ) -> Self {
        Self {
            connector,
            classifier,
            allowed_senders,
        }
    }

    pub fn connector_name(&self) -> &str {
        self.connector.name()
    }

    /// Run `stage` against `state`.
    pub async fn step(&self, stage: Stage, state: TriageState) -> Result<Step, TriageError> {
        match stage {
            Stage::Select => self.select(state).await,
            Stage::Analyze => self.analyze(state).await,
            Stage::Perform => self.perform(state).await,
            Stage::Finalize => Ok(self.finalize(state)),
            Stage::End => Ok(Step::new(state, Stage::End)),
        }
    }

    /// Pick the newest unread message and decide the route.
    ///
    /// A state that already carries a message passes through unchanged.
    pub async fn select(&self, state: TriageState) -> Result<Step, TriageError> {
        if state.message.is_some() {
            debug!("Message already selected, passing through");
            let next = Stage::after_select(&state);
            return Ok(Step::new(state, next));
        }

        let mut recent = self
            .connector
            .list_recent(1)
            .await
            .map_err(|source| TriageError::Connector {
                stage: Stage::Select,
                source,
            })?;

        if recent.is_empty() {
            info!(connector = self.connector.name(), "No unread mail");
            return Ok(Step::new(state.with_task(Task::Idle), Stage::End));
        }
        let message = recent.swap_remove(0);

        if !is_sender_allowed(&self.allowed_senders, &message.sender) {
            warn!(
                id = %message.id,
                sender = %message.sender,
                "Sender not on allow-list, ignoring"
            );
            let state = state.with_message(message).with_task(Task::Ignore);
            return Ok(Step::new(state, Stage::Finalize));
        }

        info!(id = %message.id, sender = %message.sender, "Selected message for triage");
        let state = state.with_message(message).with_task(Task::Triage);
        Ok(Step::new(state, Stage::Analyze))
    }

    /// Classify the selected message and record the exchange.
    pub async fn analyze(&self, state: TriageState) -> Result<Step, TriageError> {
        let Some(ref message) = state.message else {
            warn!("Analyze reached without a message, passing through");
            return Ok(Step::new(state, Stage::Perform));
        };

        let classification = self.classifier.classify(message).await.map_err(|source| {
            TriageError::Classification {
                stage: Stage::Analyze,
                source,
            }
        })?;

        info!(
            id = %message.id,
            action = classification.action.label(),
            "Email classified"
        );

        let state = state
            .with_turns(classification.transcript)
            .with_action(classification.action)
            .with_result(classification.notes);
        Ok(Step::new(state, Stage::Perform))
    }

    /// Draft and send a reply for actions that call for one.
    ///
    /// The send runs on its own task. If the caller drops the run while the
    /// send is in flight, the send still completes.
    pub async fn perform(&self, state: TriageState) -> Result<Step, TriageError> {
        let (Some(message), Some(intent)) = (
            state.message.as_ref(),
            state.action.and_then(|a| a.reply_intent()),
        ) else {
            debug!(action = ?state.action, "No reply to send");
            return Ok(Step::new(state, Stage::Finalize));
        };

        let notes = state.result.clone().unwrap_or_default();
        let reply = self
            .classifier
            .draft_reply(message, intent, &notes)
            .await
            .map_err(|source| TriageError::Classification {
                stage: Stage::Perform,
                source,
            })?;

        let connector = Arc::clone(&self.connector);
        let thread_id = message.reply_thread_id().to_string();
        let body = reply.clone();
        let sent_id = tokio::spawn(async move { connector.send_reply(&thread_id, &body).await })
            .await
            .map_err(|e| TriageError::TaskJoin {
                stage: Stage::Perform,
                reason: e.to_string(),
            })?
            .map_err(|source| TriageError::Connector {
                stage: Stage::Perform,
                source,
            })?;

        info!(
            id = %message.id,
            reply_id = %sent_id,
            intent = intent.label(),
            "Reply sent"
        );
        Ok(Step::new(state.with_result(reply), Stage::Finalize))
    }

    /// Identity.
    pub fn finalize(&self, state: TriageState) -> Step {
        Step::new(state, Stage::End)
    }
}
