//! WhatsApp Business (Meta Graph API) transport: inbound payload parsing
//! and outbound text messages.

use serde_json::{Value, json};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error};

use crate::bot::Inbound;

pub const GRAPH_API_BASE: &str = "https://graph.facebook.com/v17.0";

/// Longest text body the API accepts.
const MAX_TEXT_CHARS: usize = 4096;

/// Outbound push. Fire-and-forget: failures are logged by the implementor
/// and reported as `false`, never retried.
pub trait Messenger: Send + Sync {
    fn send(&self, to: &str, text: &str) -> impl Future<Output = bool> + Send;
}

impl<T: Messenger + ?Sized> Messenger for std::sync::Arc<T> {
    fn send(&self, to: &str, text: &str) -> impl Future<Output = bool> + Send {
        (**self).send(to, text)
    }
}

pub struct WhatsAppClient {
    http: reqwest::Client,
    base_url: String,
    phone_number_id: String,
    access_token: String,
}

impl WhatsAppClient {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            base_url: GRAPH_API_BASE.to_string(),
            phone_number_id: phone_number_id.to_string(),
            access_token: access_token.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_TEXT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_TEXT_CHARS - 3).collect();
    format!("{cut}...")
}

impl Messenger for WhatsAppClient {
    async fn send(&self, to: &str, text: &str) -> bool {
        let to = to.strip_prefix("whatsapp:").unwrap_or(to);
        let url = format!("{}/{}/messages", self.base_url, self.phone_number_id);
        let body = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": {"body": truncate(text)},
        });

        match self.http.post(&url).bearer_auth(&self.access_token).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Sent {} chars to {}", text.chars().count(), to);
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let detail = resp.text().await.unwrap_or_default();
                error!("WhatsApp send to {} failed: {} {}", to, status, detail);
                false
            }
            Err(e) => {
                error!("WhatsApp send to {} failed: {}", to, e);
                false
            }
        }
    }
}

/// First message of a Meta webhook delivery. `None` for payloads without
/// messages, such as delivery-status callbacks. Non-text messages get the
/// placeholder body `[<type>]`.
pub fn parse_meta_webhook(payload: &Value) -> Option<Inbound> {
    let message = payload
        .get("entry")?
        .get(0)?
        .get("changes")?
        .get(0)?
        .get("value")?
        .get("messages")?
        .get(0)?;

    let sender = message.get("from")?.as_str()?.to_string();
    let kind = message.get("type").and_then(Value::as_str).unwrap_or("unknown");
    let body = if kind == "text" {
        message.pointer("/text/body").and_then(Value::as_str).unwrap_or_default().to_string()
    } else {
        format!("[{kind}]")
    };

    Some(Inbound {
        sender,
        body,
        message_id: message.get("id").and_then(Value::as_str).map(str::to_string),
        timestamp: message.get("timestamp").and_then(|t| match t {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        }),
    })
}

/// [`Messenger`] that keeps what it was asked to send. For tests.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later send report failure (still recorded).
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Messenger for RecordingMessenger {
    async fn send(&self, to: &str, text: &str) -> bool {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push((to.to_string(), text.to_string()));
        !self.failing.load(Ordering::SeqCst)
    }
}
