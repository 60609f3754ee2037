use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned http status {0}")]
    HttpStatus(u16),
    #[error("webhook rejected message: errcode={code} errmsg={message}")]
    Rejected { code: i64, message: String },
}

/// Best-effort, at-most-once message sink. Implementations swallow their own
/// failures; callers never see an error.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Chat-robot text payload.
pub fn text_message_body(message: &str) -> serde_json::Value {
    serde_json::json!({
        "msgtype": "text",
        "text": { "content": message },
    })
}

#[derive(Debug, Deserialize)]
struct WebhookAck {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&text_message_body(message))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::HttpStatus(status.as_u16()));
        }
        // Robot endpoints answer 200 with a non-zero errcode on rejection.
        let body = resp.bytes().await?;
        if let Ok(ack) = serde_json::from_slice::<WebhookAck>(&body) {
            if ack.errcode != 0 {
                return Err(NotifyError::Rejected {
                    code: ack.errcode,
                    message: ack.errmsg,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        match self.send(message).await {
            Ok(()) => info!("notification delivered"),
            Err(err) => warn!(error = %err, "notification delivery failed"),
        }
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        info!("notification webhook not configured; skipping delivery");
        debug!(%message, "undelivered notification");
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().await.push(message.to_string());
    }
}
