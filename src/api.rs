//! HTTP surface: one endpoint to run a triage cycle plus a health probe.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::connectors::{ConnectorFactory, Provider};
use crate::error::{ConfigError, TriageError};
use crate::triage::{Classifier, TriageRunner};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<dyn Classifier>,
    pub connectors: Arc<dyn ConnectorFactory>,
    /// Empty means every sender is triaged.
    pub allowed_senders: Vec<String>,
}

/// Build the router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run_triage))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct RunRequest {
    provider: String,
}

async fn run_triage(State(state): State<AppState>, Json(body): Json<RunRequest>) -> Response {
    let connector = match body
        .provider
        .parse::<Provider>()
        .and_then(|provider| state.connectors.connector(provider))
    {
        Ok(connector) => connector,
        Err(e) => return config_error(e),
    };

    let runner = TriageRunner::new(
        connector,
        Arc::clone(&state.classifier),
        state.allowed_senders.clone(),
    );

    match runner.run_once().await {
        Ok(outcome) => {
            info!(provider = %body.provider, action = ?outcome.action, "Triage run complete");
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => run_error(e),
    }
}

fn config_error(e: ConfigError) -> Response {
    let status = match e {
        ConfigError::UnsupportedProvider(_) => StatusCode::NOT_FOUND,
        ConfigError::MissingCredentials { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(status = status.as_u16(), error = %e, "Cannot build connector");
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

fn run_error(e: TriageError) -> Response {
    error!(stage = %e.stage(), error = %e, "Triage run failed");
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({
            "error": e.to_string(),
            "stage": e.stage(),
        })),
    )
        .into_response()
}
