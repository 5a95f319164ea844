//! Mail Triage: single-email triage over Gmail and Outlook.

pub mod api;
pub mod config;
pub mod connectors;
pub mod error;
pub mod llm;
pub mod logging;
pub mod triage;
