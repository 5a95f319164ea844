use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use mail_triage::api::{self, AppState};
use mail_triage::config::Settings;
use mail_triage::connectors::{ConnectorFactory, Provider, SettingsConnectorFactory};
use mail_triage::llm::create_provider;
use mail_triage::logging;
use mail_triage::triage::{Classifier, LlmClassifier, TriageRunner};

/// Triage the newest unread email and reply when it calls for one.
#[derive(Parser)]
#[command(name = "mail-triage", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        /// Overrides TRIAGE_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one triage cycle and print the outcome as JSON.
    Run {
        /// gmail or outlook.
        #[arg(long)]
        provider: Provider,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().context("failed to load settings")?;
    let _logging_guard = logging::init(settings.log_dir.as_deref())?;

    let llm = create_provider(&settings.llm).context("failed to create LLM provider")?;
    info!(model = llm.model_name(), "LLM provider ready");
    let classifier: Arc<dyn Classifier> = Arc::new(LlmClassifier::new(llm));

    match cli.command {
        Command::Serve { port } => serve(settings, classifier, port).await,
        Command::Run { provider } => run_once(settings, classifier, provider).await,
    }
}

async fn serve(
    settings: Settings,
    classifier: Arc<dyn Classifier>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let port = port.unwrap_or(settings.port);
    let state = AppState {
        classifier,
        allowed_senders: settings.allowed_senders.clone(),
        connectors: Arc::new(SettingsConnectorFactory::new(settings)),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    info!(port, "Triage API listening");
    axum::serve(listener, api::routes(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    Ok(())
}

async fn run_once(
    settings: Settings,
    classifier: Arc<dyn Classifier>,
    provider: Provider,
) -> anyhow::Result<()> {
    let allowed_senders = settings.allowed_senders.clone();
    let connector = SettingsConnectorFactory::new(settings).connector(provider)?;
    let outcome = TriageRunner::new(connector, classifier, allowed_senders)
        .run_once()
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
