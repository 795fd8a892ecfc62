//! Tracing layer that forwards log lines to a phone over the messenger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::whatsapp::Messenger;

/// Events from the transport itself are not forwarded; a failing send
/// would otherwise log, forward and fail again.
const TRANSPORT_TARGET: &str = "kupa::whatsapp";

const FLUSH_EVERY: Duration = Duration::from_secs(5);
const MAX_BUFFERED: usize = 50;
const MAX_CHARS: usize = 4000;

enum LogMessage {
    /// WARN/ERROR, sent immediately.
    Urgent(String),
    /// INFO, batched.
    Info(String),
}

pub struct AlertLogLayer {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl AlertLogLayer {
    /// Spawns the sender task; call from inside the runtime.
    pub fn new<M: Messenger + 'static>(messenger: Arc<M>, recipient: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();

        tokio::spawn(async move {
            let mut info_buffer: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(FLUSH_EVERY);

            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(LogMessage::Urgent(text)) => send_log(&*messenger, &recipient, &text).await,
                        Some(LogMessage::Info(text)) => {
                            info_buffer.push(text);
                            if info_buffer.len() >= MAX_BUFFERED {
                                flush_buffer(&*messenger, &recipient, &mut info_buffer).await;
                            }
                        }
                        None => break,
                    },
                    _ = interval.tick() => {
                        flush_buffer(&*messenger, &recipient, &mut info_buffer).await;
                    }
                }
            }
        });

        Self { tx }
    }
}

async fn send_log<M: Messenger>(messenger: &M, recipient: &str, text: &str) {
    let text = if text.chars().count() > MAX_CHARS {
        let truncated: String = text.chars().take(MAX_CHARS).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    };
    if !messenger.send(recipient, &text).await {
        eprintln!("Failed to forward log line to {recipient}");
    }
}

async fn flush_buffer<M: Messenger>(messenger: &M, recipient: &str, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let combined = buffer.join("\n");
    buffer.clear();
    send_log(messenger, recipient, &combined).await;
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message.push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for AlertLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::INFO || event.metadata().target().starts_with(TRANSPORT_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor { message: String::new() };
        event.record(&mut visitor);

        let msg = match level {
            Level::ERROR => LogMessage::Urgent(format!("❌ {}", visitor.message)),
            Level::WARN => LogMessage::Urgent(format!("⚠️ {}", visitor.message)),
            _ => LogMessage::Info(visitor.message),
        };

        if self.tx.send(msg).is_err() {
            eprintln!("Log channel closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whatsapp::RecordingMessenger;
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn test_warnings_forwarded_immediately() {
        let messenger = Arc::new(RecordingMessenger::new());
        let layer = AlertLogLayer::new(messenger.clone(), "972500000000".to_string());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("sheet unreachable");
            tracing::debug!("not forwarded");
        });

        for _ in 0..50 {
            if !messenger.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = messenger.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], ("972500000000".to_string(), "⚠️ sheet unreachable".to_string()));
    }

    #[tokio::test]
    async fn test_transport_events_are_skipped() {
        let messenger = Arc::new(RecordingMessenger::new());
        let layer = AlertLogLayer::new(messenger.clone(), "972500000000".to_string());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "kupa::whatsapp", "send failed");
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(messenger.sent().is_empty());
    }
}
