//! HTTP surface: Meta webhook, legacy endpoint and health probes.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bot::Dispatcher;
use crate::ledger::Spreadsheet;
use crate::oracle::Completion;
use crate::whatsapp::{Messenger, parse_meta_webhook};

const SERVICE_NAME: &str = "WhatsApp Budget Bot";

pub struct AppState<C, S, M> {
    pub dispatcher: Dispatcher<C, S>,
    pub messenger: M,
    /// Token Meta echoes back during webhook verification.
    pub verify_token: String,
}

pub fn router<C, S, M>(state: Arc<AppState<C, S, M>>) -> Router
where
    C: Completion + 'static,
    S: Spreadsheet + 'static,
    M: Messenger + 'static,
{
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(readiness::<C, S, M>))
        .route("/webhook", get(verify::<C, S, M>).post(receive::<C, S, M>))
        .route("/whatsapp", get(legacy).post(receive::<C, S, M>))
        .with_state(state)
}

pub async fn serve<C, S, M>(state: Arc<AppState<C, S, M>>, addr: std::net::SocketAddr) -> std::io::Result<()>
where
    C: Completion + 'static,
    S: Spreadsheet + 'static,
    M: Messenger + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, router(state)).await
}

fn status_body(status: &str) -> serde_json::Map<String, Value> {
    let mut body = serde_json::Map::new();
    body.insert("status".into(), json!(status));
    body.insert("service".into(), json!(SERVICE_NAME));
    body.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
    body.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    body
}

async fn liveness() -> Json<Value> {
    Json(Value::Object(status_body("healthy")))
}

/// Healthy when the ledger answers with at least one category.
async fn readiness<C, S, M>(State(state): State<Arc<AppState<C, S, M>>>) -> (StatusCode, Json<Value>)
where
    C: Completion + 'static,
    S: Spreadsheet + 'static,
    M: Messenger + 'static,
{
    let stats = state.dispatcher.cache_stats();
    let cache = json!({"hits": stats.hits, "misses": stats.misses, "size": stats.size});

    match state.dispatcher.ledger().list_categories().await {
        Ok(categories) if !categories.is_empty() => {
            let mut body = status_body("healthy");
            body.insert(
                "components".into(),
                json!({"google_sheets": "healthy", "categories_count": categories.len(), "answer_cache": cache}),
            );
            (StatusCode::OK, Json(Value::Object(body)))
        }
        Ok(_) => {
            let mut body = status_body("unhealthy");
            body.insert(
                "components".into(),
                json!({"google_sheets": "unhealthy", "categories_count": 0, "answer_cache": cache}),
            );
            (StatusCode::SERVICE_UNAVAILABLE, Json(Value::Object(body)))
        }
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            let mut body = status_body("unhealthy");
            body.insert(
                "components".into(),
                json!({"google_sheets": "unhealthy", "categories_count": 0, "answer_cache": cache}),
            );
            body.insert("error".into(), json!(e.to_string()));
            (StatusCode::SERVICE_UNAVAILABLE, Json(Value::Object(body)))
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn verify<C, S, M>(
    State(state): State<Arc<AppState<C, S, M>>>,
    Query(params): Query<VerifyParams>,
) -> (StatusCode, String)
where
    C: Completion + 'static,
    S: Spreadsheet + 'static,
    M: Messenger + 'static,
{
    match (params.mode.as_deref(), params.token, params.challenge) {
        (Some("subscribe"), Some(token), Some(challenge)) if token == state.verify_token && !challenge.is_empty() => {
            info!("Webhook verified");
            (StatusCode::OK, challenge)
        }
        _ => {
            warn!("Webhook verification failed");
            (StatusCode::FORBIDDEN, "Forbidden".to_string())
        }
    }
}

/// Always answers 200 "OK" so Meta does not redeliver; failures are logged.
async fn receive<C, S, M>(State(state): State<Arc<AppState<C, S, M>>>, body: Bytes) -> &'static str
where
    C: Completion + 'static,
    S: Spreadsheet + 'static,
    M: Messenger + 'static,
{
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("Webhook body is not JSON: {}", e);
            return "OK";
        }
    };

    let Some(message) = parse_meta_webhook(&payload) else {
        return "OK";
    };

    if let Some(reply) = state.dispatcher.handle(&message).await {
        if !state.messenger.send(&message.sender, &reply).await {
            error!("Reply to {} was not delivered", message.sender);
        }
    }
    "OK"
}

async fn legacy() -> &'static str {
    "Please use /webhook endpoint"
}
