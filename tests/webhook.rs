//! HTTP-level tests: the axum router driven with in-memory collaborators.
//!
//! Run with: cargo test --test webhook

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use kupa::bot::{Dispatcher, DispatcherSettings};
use kupa::clock::{Clock, ManualClock};
use kupa::config::UserProfile;
use kupa::ledger::Ledger;
use kupa::ledger::memory::{MemorySheets, SheetOp};
use kupa::ledger::Book;
use kupa::oracle::scripted::ScriptedCompletion;
use kupa::oracle::{AnalysisMode, ExpenseOracle, Purpose};
use kupa::server::{AppState, router};
use kupa::store::MemoryStore;
use kupa::whatsapp::RecordingMessenger;

const SENDER: &str = "972501111111";

struct App {
    router: Router,
    model: Arc<ScriptedCompletion>,
    sheets: Arc<MemorySheets>,
    messenger: Arc<RecordingMessenger>,
}

fn app() -> App {
    let model = Arc::new(ScriptedCompletion::new());
    let sheets = Arc::new(MemorySheets::with_period("יולי", &[("קניות", 800.0), ("בידור", 300.0)]));
    let messenger = Arc::new(RecordingMessenger::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 7, 1, 9, 0, 0).unwrap()));

    let dispatcher = Dispatcher::new(
        ExpenseOracle::new(model.clone(), AnalysisMode::Combined),
        Ledger::new(sheets.clone()),
        Box::new(MemoryStore::new()),
        Box::new(MemoryStore::new()),
        clock,
        DispatcherSettings {
            users: vec![UserProfile { phone: SENDER.into(), name: "דנה".into(), emoji: "👩‍💼".into() }],
            ..DispatcherSettings::default()
        },
    );
    let state = Arc::new(AppState {
        dispatcher,
        messenger: messenger.clone(),
        verify_token: "s3cret".to_string(),
    });

    App { router: router(state), model, sheets, messenger }
}

fn text_delivery(id: &str, body: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{"id": "1", "changes": [{"field": "messages", "value": {
            "messaging_product": "whatsapp",
            "messages": [{"from": SENDER, "id": id, "timestamp": "1751360400", "type": "text", "text": {"body": body}}]
        }}]}]
    })
}

async fn post(router: &Router, path: &str, body: String) -> (StatusCode, String) {
    let request = Request::post(path)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    send(router, request).await
}

async fn get(router: &Router, path: &str) -> (StatusCode, String) {
    send(router, Request::get(path).body(Body::empty()).unwrap()).await
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_verification_handshake() {
    let app = app();
    let (status, body) =
        get(&app.router, "/webhook?hub.mode=subscribe&hub.verify_token=s3cret&hub.challenge=12345").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "12345");

    let (status, _) = get(&app.router, "/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = get(&app.router, "/webhook").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_expense_message_is_recorded_and_answered() {
    let app = app();
    app.model.push(
        Purpose::Analyze,
        json!({
            "message_type": "budget_entry",
            "confidence": 0.9,
            "expense_data": {"קטגוריה": "קניות", "פירוט": "לחם", "מחיר": 12, "תאריך": "2025-07-01"}
        })
        .to_string(),
    );

    let (status, body) = post(&app.router, "/webhook", text_delivery("wamid.1", "קניתי לחם ב-12").to_string()).await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));

    let sent = app.messenger.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, SENDER);
    assert!(sent[0].1.contains("נרשם בהצלחה"));
    assert_eq!(app.sheets.rows(Book::Tracker, "יולי").len(), 2);
}

#[tokio::test]
async fn test_redelivered_webhook_replies_once() {
    let app = app();
    let payload = text_delivery("wamid.1", "יתרה").to_string();

    post(&app.router, "/webhook", payload.clone()).await;
    let (status, body) = post(&app.router, "/webhook", payload).await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));
    assert_eq!(app.messenger.sent().len(), 1);
}

#[tokio::test]
async fn test_non_message_payloads_are_acknowledged() {
    let app = app();
    let status_only = json!({"entry": [{"changes": [{"value": {"statuses": [{"status": "delivered"}]}}]}]});

    assert_eq!(post(&app.router, "/webhook", status_only.to_string()).await.1, "OK");
    assert_eq!(post(&app.router, "/webhook", "not json".to_string()).await.1, "OK");
    assert!(app.messenger.sent().is_empty());
    assert_eq!(app.model.total_calls(), 0);
}

#[tokio::test]
async fn test_failed_push_still_acknowledged() {
    let app = app();
    app.messenger.fail();
    let (status, body) = post(&app.router, "/webhook", text_delivery("wamid.1", "עזרה").to_string()).await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));
    assert_eq!(app.messenger.sent().len(), 1);
}

#[tokio::test]
async fn test_legacy_endpoint() {
    let app = app();
    assert_eq!(get(&app.router, "/whatsapp").await.1, "Please use /webhook endpoint");

    post(&app.router, "/whatsapp", text_delivery("wamid.9", "קטגוריות").to_string()).await;
    let sent = app.messenger.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("• קניות"));
}

#[tokio::test]
async fn test_liveness() {
    let app = app();
    let (status, body) = get(&app.router, "/").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "WhatsApp Budget Bot");
}

#[tokio::test]
async fn test_readiness_reflects_ledger() {
    let app = app();
    let (status, body) = get(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["components"]["categories_count"], 2);

    app.sheets.fail(SheetOp::Read, Book::Budget);
    let (status, body) = get(&app.router, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["components"]["categories_count"], 0);
}
