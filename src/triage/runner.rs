//! Run driver: takes a fresh state from SELECT to END.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::connectors::MailConnector;
use crate::error::TriageError;
use crate::triage::classifier::Classifier;
use crate::triage::machine::TriageMachine;
use crate::triage::state::{Action, Stage, TriageState};

/// A stage transition event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub timestamp: DateTime<Utc>,
}

/// Final state of a run plus the path it took.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: TriageState,
    pub transitions: Vec<StageTransition>,
}

impl RunReport {
    /// Stages visited, starting with the first one run.
    pub fn path(&self) -> Vec<Stage> {
        let mut path: Vec<Stage> = self.transitions.first().map(|t| t.from).into_iter().collect();
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

/// What a caller of a single triage cycle gets back.
///
/// Both fields are `None` when the mailbox was empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub action: Option<Action>,
    pub result: Option<String>,
}

impl From<TriageState> for RunOutcome {
    fn from(state: TriageState) -> Self {
        Self {
            action: state.action,
            result: state.result,
        }
    }
}

/// A resumable point in a run: the state and the stage about to run.
///
/// Storage is up to the caller. The runner only produces and consumes these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageSnapshot {
    pub run_id: Uuid,
    pub stage: Stage,
    pub state: TriageState,
}

impl TriageSnapshot {
    /// A snapshot for a run that has not started.
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stage: Stage::Select,
            state: TriageState::new(),
        }
    }
}

/// Drives the triage machine. One call is one classify and act cycle.
pub struct TriageRunner {
    machine: TriageMachine,
}

impl TriageRunner {
    pub fn new(
        connector: Arc<dyn MailConnector>,
        classifier: Arc<dyn Classifier>,
        allowed_senders: Vec<String>,
    ) -> Self {
        Self::from_machine(TriageMachine::new(connector, classifier, allowed_senders))
    }

    pub fn from_machine(machine: TriageMachine) -> Self {
        Self { machine }
    }

    /// Run one cycle and return the terminal state.
    pub async fn run(&self) -> Result<TriageState, TriageError> {
        Ok(self.run_with_report().await?.state)
    }

    /// Run one cycle and return only the caller-facing fields.
    pub async fn run_once(&self) -> Result<RunOutcome, TriageError> {
        Ok(self.run().await?.into())
    }

    /// Run one cycle, keeping the transition history.
    pub async fn run_with_report(&self) -> Result<RunReport, TriageError> {
        self.drive(TriageSnapshot::start(), |_| {}).await
    }

    /// Run one cycle, handing a snapshot to `on_checkpoint` before each stage.
    pub async fn run_with_checkpoints<F>(&self, on_checkpoint: F) -> Result<RunReport, TriageError>
    where
        F: FnMut(TriageSnapshot) + Send,
    {
        self.drive(TriageSnapshot::start(), on_checkpoint).await
    }

    /// Continue a run from a snapshot until END.
    pub async fn resume(&self, snapshot: TriageSnapshot) -> Result<RunReport, TriageError> {
        self.drive(snapshot, |_| {}).await
    }

    async fn drive<F>(
        &self,
        snapshot: TriageSnapshot,
        mut on_checkpoint: F,
    ) -> Result<RunReport, TriageError>
    where
        F: FnMut(TriageSnapshot) + Send,
    {
        let TriageSnapshot {
            run_id,
            mut stage,
            mut state,
        } = snapshot;
        let span = info_span!(
            "triage_run",
            run_id = %run_id,
            connector = self.machine.connector_name()
        );

        async move {
            info!(stage = %stage, "Triage run started");
            let mut transitions = Vec::new();

            while !stage.is_terminal() {
                on_checkpoint(TriageSnapshot {
                    run_id,
                    stage,
                    state: state.clone(),
                });

                let step = self.machine.step(stage, state).await?;
                if !stage.can_transition_to(step.next) {
                    return Err(TriageError::InvalidTransition {
                        from: stage,
                        to: step.next,
                    });
                }
                transitions.push(StageTransition {
                    from: stage,
                    to: step.next,
                    timestamp: Utc::now(),
                });
                stage = step.next;
                state = step.state;
            }

            info!(
                task = ?state.task,
                action = ?state.action,
                stages = transitions.len(),
                "Triage run finished"
            );
            Ok(RunReport {
                run_id,
                state,
                transitions,
            })
        }
        .instrument(span)
        .await
    }
}
