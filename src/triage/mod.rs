//! Single-email triage: pick, classify, reply.

pub mod classifier;
pub mod machine;
pub mod runner;
pub mod state;

pub use classifier::{Classification, Classifier, LlmClassifier};
pub use machine::{Step, TriageMachine};
pub use runner::{RunOutcome, RunReport, StageTransition, TriageRunner, TriageSnapshot};
pub use state::{Action, ReplyIntent, Stage, Task, TriageState};
