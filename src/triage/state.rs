//! Triage state and the stage transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connectors::EmailMessage;
use crate::llm::ChatMessage;

/// Routing decision made by SELECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// SELECT has not run yet.
    #[default]
    Unset,
    /// No unread mail.
    Idle,
    /// Sender is not on the allow-list.
    Ignore,
    /// Classify and act.
    Triage,
}

/// Canonical triage outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Acknowledge,
    ScheduleCall,
    Delegate,
    Ignore,
}

impl Action {
    /// Parse a model-supplied action, case- and separator-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .trim()
            .to_lowercase()
            .replace([' ', '-'], "_");
        match normalized.as_str() {
            "acknowledge" => Some(Self::Acknowledge),
            "schedule_call" => Some(Self::ScheduleCall),
            "delegate" => Some(Self::Delegate),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }

    /// Parse, falling back to `Acknowledge` for anything unrecognised.
    ///
    /// When uncertain, acknowledge rather than silently drop the email.
    pub fn parse_or_acknowledge(raw: Option<&str>) -> Self {
        raw.and_then(Self::parse).unwrap_or(Self::Acknowledge)
    }

    /// The reply intent for actions that send mail.
    pub fn reply_intent(self) -> Option<ReplyIntent> {
        match self {
            Self::Acknowledge => Some(ReplyIntent::Acknowledge),
            Self::ScheduleCall => Some(ReplyIntent::ScheduleCall),
            Self::Delegate => Some(ReplyIntent::Delegate),
            Self::Ignore => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::ScheduleCall => "schedule_call",
            Self::Delegate => "delegate",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Intent passed to reply drafting. A subset of `Action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyIntent {
    Acknowledge,
    ScheduleCall,
    Delegate,
}

impl ReplyIntent {
    pub fn label(self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::ScheduleCall => "schedule_call",
            Self::Delegate => "delegate",
        }
    }
}

impl fmt::Display for ReplyIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The record threaded through a run.
///
/// Stages never clear a field another stage set. `conversation` only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageState {
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
    #[serde(default)]
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<EmailMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Rationale notes after ANALYZE; the sent reply after PERFORM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl TriageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.task = task;
        self
    }

    pub fn with_message(mut self, message: EmailMessage) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Append turns to the conversation.
    pub fn with_turns(mut self, turns: impl IntoIterator<Item = ChatMessage>) -> Self {
        self.conversation.extend(turns);
        self
    }
}

/// Orchestration stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Select,
    Analyze,
    Perform,
    Finalize,
    End,
}

impl Stage {
    /// The transition table.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;

        matches!(
            (self, target),
            (Select, Analyze) | (Select, Finalize) | (Select, End) |
            (Analyze, Perform) |
            (Perform, Finalize) |
            (Finalize, End)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End)
    }

    /// Where SELECT routes a state, keyed by its task.
    ///
    /// An `Unset` task with a message already present (an injected state)
    /// is treated as triage.
    pub fn after_select(state: &TriageState) -> Stage {
        match state.task {
            Task::Triage => Stage::Analyze,
            Task::Ignore => Stage::Finalize,
            Task::Idle => Stage::End,
            Task::Unset if state.message.is_some() => Stage::Analyze,
            Task::Unset => Stage::End,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Select => "select",
            Self::Analyze => "analyze",
            Self::Perform => "perform",
            Self::Finalize => "finalize",
            Self::End => "end",
        };
        write!(f, "{s}")
    }
}
