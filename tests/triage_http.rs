//! End-to-end tests: the triage API served on a random port, a mock Gmail
//! API behind the real Gmail connector, and a stub LLM behind the real
//! classifier.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use mail_triage::api::{AppState, routes};
use mail_triage::config::Settings;
use mail_triage::connectors::{
    ConnectorFactory, GmailConnector, MailConnector, Provider, SettingsConnectorFactory,
};
use mail_triage::error::{ConfigError, LlmError};
use mail_triage::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use mail_triage::triage::LlmClassifier;

const RAW_EMAIL: &str = "From: Alice <a@x.com>\r\n\
To: me@corp.com\r\n\
Subject: Hi\r\n\
Message-ID: <abc@x.com>\r\n\
\r\n\
Can we talk this week?\r\n";

const DRAFTED: &str = "Happy to talk. Does Tuesday at 10 work?";

/// Answers classification prompts with `schedule_call` and drafting prompts
/// with a fixed reply.
struct StubLlm {
    calls: Mutex<usize>,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        *self.calls.lock().unwrap() += 1;
        let classifying = request
            .messages
            .first()
            .is_some_and(|m| m.content.contains("classifies"));
        let content = if classifying {
            r#"Sure: {"action": "schedule_call", "notes": "wants a call"}"#.to_string()
        } else {
            DRAFTED.to_string()
        };
        Ok(CompletionResponse { content })
    }
}

/// Recorded traffic of the mock Gmail API.
#[derive(Default)]
struct GmailLog {
    auth_headers: Vec<String>,
    sends: Vec<Value>,
}

#[derive(Clone)]
struct MockGmail {
    unread: bool,
    log: Arc<Mutex<GmailLog>>,
}

async fn list_messages(State(mock): State<MockGmail>, headers: HeaderMap) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    mock.log.lock().unwrap().auth_headers.push(auth);
    if mock.unread {
        Json(json!({ "messages": [{ "id": "m1", "threadId": "t1" }] }))
    } else {
        Json(json!({ "resultSizeEstimate": 0 }))
    }
}

async fn get_message(Path((_user, id)): Path<(String, String)>) -> (StatusCode, Json<Value>) {
    if id != "m1" {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })));
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": "m1",
            "threadId": "t1",
            "snippet": "Can we talk this week?",
            "internalDate": "1700000000000",
            "raw": URL_SAFE_NO_PAD.encode(RAW_EMAIL),
        })),
    )
}

/// Alice's message followed by an earlier reply of ours.
async fn get_thread() -> Json<Value> {
    Json(json!({
        "id": "t1",
        "messages": [{
            "payload": { "headers": [
                { "name": "From", "value": "Alice <a@x.com>" },
                { "name": "Subject", "value": "Hi" },
                { "name": "Message-ID", "value": "<abc@x.com>" },
            ]}
        }, {
            "payload": { "headers": [
                { "name": "From", "value": "me@corp.com" },
                { "name": "Subject", "value": "Re: Hi" },
                { "name": "Message-ID", "value": "<earlier-reply@corp.com>" },
            ]}
        }]
    }))
}

async fn send_message(State(mock): State<MockGmail>, Json(body): Json<Value>) -> Json<Value> {
    mock.log.lock().unwrap().sends.push(body);
    Json(json!({ "id": "m2", "threadId": "t1" }))
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://{addr}")
}

async fn start_gmail(unread: bool) -> (String, Arc<Mutex<GmailLog>>) {
    let log = Arc::new(Mutex::new(GmailLog::default()));
    let app = Router::new()
        .route("/users/{user}/messages", get(list_messages))
        .route("/users/{user}/messages/send", post(send_message))
        .route("/users/{user}/messages/{id}", get(get_message))
        .route("/users/{user}/threads/{id}", get(get_thread))
        .with_state(MockGmail {
            unread,
            log: Arc::clone(&log),
        });
    (serve(app).await, log)
}

/// Gmail goes to the mock; everything else comes from settings.
struct MockFactory {
    gmail: Arc<dyn MailConnector>,
    fallback: SettingsConnectorFactory,
}

impl ConnectorFactory for MockFactory {
    fn connector(&self, provider: Provider) -> Result<Arc<dyn MailConnector>, ConfigError> {
        match provider {
            Provider::Gmail => Ok(Arc::clone(&self.gmail)),
            other => self.fallback.connector(other),
        }
    }
}

fn settings_without_mail_credentials() -> Settings {
    Settings::from_lookup(|key| match key {
        "OPENAI_API_KEY" => Some("sk-test".to_string()),
        _ => None,
    })
    .unwrap()
}

async fn start_api(gmail_url: &str, allowed: &[&str]) -> (String, Arc<StubLlm>) {
    let gmail = GmailConnector::new(
        reqwest::Client::new(),
        "me@corp.com",
        SecretString::from("test-token"),
    )
    .with_base_url(gmail_url);
    let llm = Arc::new(StubLlm {
        calls: Mutex::new(0),
    });
    let state = AppState {
        classifier: Arc::new(LlmClassifier::new(llm.clone())),
        connectors: Arc::new(MockFactory {
            gmail: Arc::new(gmail),
            fallback: SettingsConnectorFactory::new(settings_without_mail_credentials()),
        }),
        allowed_senders: allowed.iter().map(|s| s.to_string()).collect(),
    };
    (serve(routes(state)).await, llm)
}

async fn post_run(api: &str, provider: &str) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("{api}/run"))
        .json(&json!({ "provider": provider }))
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn unread_email_gets_scheduled_reply() {
    let (gmail_url, log) = start_gmail(true).await;
    let (api, llm) = start_api(&gmail_url, &[]).await;

    let (status, body) = post_run(&api, "gmail").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "schedule_call");
    assert_eq!(body["result"], DRAFTED);
    assert_eq!(*llm.calls.lock().unwrap(), 2);

    let log = log.lock().unwrap();
    assert_eq!(log.auth_headers, vec!["Bearer test-token".to_string()]);
    assert_eq!(log.sends.len(), 1);
    let sent = &log.sends[0];
    assert_eq!(sent["threadId"], "t1");

    let raw = URL_SAFE.decode(sent["raw"].as_str().unwrap()).unwrap();
    let mime = String::from_utf8(raw).unwrap();
    assert!(mime.contains("Subject: Re: Hi"), "{mime}");
    let to_line = mime.lines().find(|l| l.starts_with("To:")).unwrap();
    assert!(to_line.contains("a@x.com"), "{mime}");
    assert!(!mime.contains("<earlier-reply@corp.com>"), "{mime}");
    assert!(mime.contains("<abc@x.com>"), "{mime}");
    assert!(mime.contains(DRAFTED), "{mime}");
}

#[tokio::test]
async fn empty_inbox_returns_nulls() {
    let (gmail_url, log) = start_gmail(false).await;
    let (api, llm) = start_api(&gmail_url, &[]).await;

    let (status, body) = post_run(&api, "gmail").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "action": null, "result": null }));
    assert_eq!(*llm.calls.lock().unwrap(), 0);
    assert!(log.lock().unwrap().sends.is_empty());
}

#[tokio::test]
async fn sender_outside_allow_list_is_left_alone() {
    let (gmail_url, log) = start_gmail(true).await;
    let (api, llm) = start_api(&gmail_url, &["boss@corp.com"]).await;

    let (status, body) = post_run(&api, "gmail").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "action": null, "result": null }));
    assert_eq!(*llm.calls.lock().unwrap(), 0);
    assert!(log.lock().unwrap().sends.is_empty());
}

#[tokio::test]
async fn unconfigured_provider_is_bad_request() {
    let (gmail_url, _log) = start_gmail(true).await;
    let (api, _llm) = start_api(&gmail_url, &[]).await;

    let (status, body) = post_run(&api, "outlook").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("OUTLOOK_CLIENT_ID"));

    let (status, _) = post_run(&api, "yahoo").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn gmail_outage_reports_select_stage() {
    // Nothing listens on the mock URL once the listener is dropped.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let (api, _llm) = start_api(&dead_url, &[]).await;

    let (status, body) = post_run(&api, "gmail").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["stage"], "select");
}

#[tokio::test]
async fn healthz_over_the_wire() {
    let (gmail_url, _log) = start_gmail(false).await;
    let (api, _llm) = start_api(&gmail_url, &[]).await;

    let body: Value = reqwest::get(format!("{api}/healthz"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({ "status": "ok" }));
}
