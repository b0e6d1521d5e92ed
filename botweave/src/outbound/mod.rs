//! Outbound delivery seam.
//!
//! The webhook framing replies in-band; broadcasts (and anything else that
//! pushes messages) go out through this trait. The production impl talks to
//! the Telegram Bot API; tests and the preview sandbox use [`NullOutbound`].

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::actions::Reply;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SendFailure {
    /// The user blocked the bot; non-retriable.
    #[error("user blocked the bot")]
    Blocked,
    /// Anything else; the broadcast engine retries these.
    #[error("transient send failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, token: &str, chat_id: i64, reply: &Reply) -> Result<(), SendFailure>;
}

/// Telegram Bot API sender.
pub struct TelegramOutbound {
    http: reqwest::Client,
    api_base: String,
}

impl TelegramOutbound {
    pub fn new() -> Self {
        Self::with_base("https://api.telegram.org")
    }

    pub fn with_base(api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for TelegramOutbound {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Outbound for TelegramOutbound {
    async fn send(&self, token: &str, chat_id: i64, reply: &Reply) -> Result<(), SendFailure> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": reply.text,
        });
        if let Some(keyboard) = &reply.keyboard {
            body["reply_markup"] = json!({
                "inline_keyboard": keyboard
                    .rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|b| json!({"text": b.text, "callback_data": b.callback_data}))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            });
        }
        let response = self
            .http
            .post(format!("{}/bot{}/sendMessage", self.api_base, token))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendFailure::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        // Telegram reports a blocked bot as 403
        if status.as_u16() == 403 {
            return Err(SendFailure::Blocked);
        }
        Err(SendFailure::Transient(format!("status {status}")))
    }
}

/// Recorded outbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub chat_id: i64,
    pub text: String,
}

/// Records sends instead of performing them.
#[derive(Default)]
pub struct NullOutbound {
    sent: Mutex<Vec<Delivery>>,
}

impl NullOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Delivery> {
        self.sent.lock().expect("outbound lock").clone()
    }
}

#[async_trait]
impl Outbound for NullOutbound {
    async fn send(&self, _token: &str, chat_id: i64, reply: &Reply) -> Result<(), SendFailure> {
        self.sent.lock().expect("outbound lock").push(Delivery {
            chat_id,
            text: reply.text.clone(),
        });
        Ok(())
    }
}
