//! Outlook connector against a mock Microsoft Graph and login endpoint.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use mail_triage::connectors::{MailConnector, OutlookConnector};
use mail_triage::error::ConnectorError;

#[derive(Default)]
struct GraphLog {
    token_requests: Vec<Vec<(String, String)>>,
    replies: Vec<(String, Value)>,
    sent_drafts: Vec<String>,
}

#[derive(Clone)]
struct MockGraph {
    reject_token: bool,
    throttle: bool,
    /// Hand out a token the Graph endpoints refuse on the first request.
    stale_first: bool,
    log: Arc<Mutex<GraphLog>>,
}

fn graph_message(id: &str) -> Value {
    json!({
        "id": id,
        "subject": "Quarterly numbers",
        "from": { "emailAddress": { "name": "Alice", "address": "alice@example.com" } },
        "toRecipients": [{ "emailAddress": { "address": "me@corp.com" } }],
        "bodyPreview": "Can you review",
        "body": { "contentType": "html", "content": "<p>Can you review the <b>deck</b>?</p>" },
        "receivedDateTime": "2024-05-01T09:30:00Z"
    })
}

async fn token(
    State(mock): State<MockGraph>,
    Path(_tenant): Path<String>,
    Form(form): Form<Vec<(String, String)>>,
) -> Response {
    let first = {
        let mut log = mock.log.lock().unwrap();
        log.token_requests.push(form);
        log.token_requests.len() == 1
    };
    if mock.reject_token {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_client" })),
        )
            .into_response();
    }
    let access_token = if mock.stale_first && first {
        "revoked-token"
    } else {
        "graph-token"
    };
    Json(json!({ "access_token": access_token, "expires_in": 3600, "token_type": "Bearer" }))
        .into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer graph-token")
}

async fn list(State(mock): State<MockGraph>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if mock.throttle {
        return (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "7")], "slow down")
            .into_response();
    }
    Json(json!({ "value": [graph_message("AAMk1")] })).into_response()
}

async fn fetch(Path((_user, id)): Path<(String, String)>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if id != "AAMk1" {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(graph_message(&id)).into_response()
}

async fn create_reply(
    State(mock): State<MockGraph>,
    Path((_user, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    mock.log.lock().unwrap().replies.push((id, body));
    Json(json!({ "id": "draft-1" }))
}

async fn send_draft(
    State(mock): State<MockGraph>,
    Path((_user, id)): Path<(String, String)>,
) -> StatusCode {
    mock.log.lock().unwrap().sent_drafts.push(id);
    StatusCode::ACCEPTED
}

async fn start(reject_token: bool, throttle: bool) -> (OutlookConnector, Arc<Mutex<GraphLog>>) {
    start_mock(reject_token, throttle, false).await
}

async fn start_mock(
    reject_token: bool,
    throttle: bool,
    stale_first: bool,
) -> (OutlookConnector, Arc<Mutex<GraphLog>>) {
    let log = Arc::new(Mutex::new(GraphLog::default()));
    let app = Router::new()
        .route("/login/{tenant}/oauth2/v2.0/token", post(token))
        .route("/graph/users/{user}/messages", get(list))
        .route("/graph/users/{user}/messages/{id}", get(fetch))
        .route("/graph/users/{user}/messages/{id}/createReply", post(create_reply))
        .route("/graph/users/{user}/messages/{id}/send", post(send_draft))
        .with_state(MockGraph {
            reject_token,
            throttle,
            stale_first,
            log: Arc::clone(&log),
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let connector = OutlookConnector::new(
        reqwest::Client::new(),
        "client-id",
        SecretString::from("client-secret"),
        "tenant-1",
        "me@corp.com",
    )
    .with_base_urls(&format!("{base}/graph"), &format!("{base}/login"));
    (connector, log)
}

#[tokio::test]
async fn lists_unread_and_reuses_token() {
    let (connector, log) = start(false, false).await;

    let messages = connector.list_recent(1).await.unwrap();
    assert_eq!(messages.len(), 1);
    let m = &messages[0];
    assert_eq!(m.id, "AAMk1");
    assert_eq!(m.thread_id.as_deref(), Some("AAMk1"));
    assert_eq!(m.sender, "alice@example.com");
    assert_eq!(m.recipients, vec!["me@corp.com".to_string()]);
    let body = m.body.as_deref().unwrap();
    assert!(body.contains("Can you review the deck?"), "{body}");
    assert!(!body.contains('<'));

    let again = connector.fetch("AAMk1").await.unwrap();
    assert_eq!(&again, m);

    let log = log.lock().unwrap();
    assert_eq!(log.token_requests.len(), 1);
    let form = &log.token_requests[0];
    assert!(form.contains(&("grant_type".to_string(), "client_credentials".to_string())));
    assert!(form.contains(&("client_id".to_string(), "client-id".to_string())));
}

#[tokio::test]
async fn unknown_message_is_not_found() {
    let (connector, _log) = start(false, false).await;
    let err = connector.fetch("missing").await.unwrap_err();
    assert!(
        matches!(err, ConnectorError::NotFound { ref id, .. } if id == "missing"),
        "{err:?}"
    );
}

#[tokio::test]
async fn reply_creates_and_sends_draft() {
    let (connector, log) = start(false, false).await;

    let id = connector
        .send_reply("AAMk1", "Thanks, reviewing today.")
        .await
        .unwrap();
    assert_eq!(id, "draft-1");

    let log = log.lock().unwrap();
    assert_eq!(log.replies.len(), 1);
    assert_eq!(log.replies[0].0, "AAMk1");
    assert_eq!(log.replies[0].1["comment"], "Thanks, reviewing today.");
    assert_eq!(log.sent_drafts, vec!["draft-1".to_string()]);
}

#[tokio::test]
async fn rejected_credentials_are_auth_errors() {
    let (connector, _log) = start(true, false).await;
    let err = connector.list_recent(1).await.unwrap_err();
    assert!(matches!(err, ConnectorError::Auth { .. }), "{err:?}");
}

#[tokio::test]
async fn throttling_carries_retry_after() {
    let (connector, _log) = start(false, true).await;
    let err = connector.list_recent(1).await.unwrap_err();
    match err {
        ConnectorError::RateLimited { retry_after, .. } => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn refused_token_is_fetched_again() {
    let (connector, log) = start_mock(false, false, true).await;

    let err = connector.list_recent(1).await.unwrap_err();
    assert!(matches!(err, ConnectorError::Auth { .. }), "{err:?}");

    let messages = connector.list_recent(1).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(log.lock().unwrap().token_requests.len(), 2);

    connector.fetch("AAMk1").await.unwrap();
    assert_eq!(log.lock().unwrap().token_requests.len(), 2);
}
