//! LLM client seam: trait, OpenAI-compatible HTTP impl, and a scripted mock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Token usage for one call, as reported by the upstream.
#[derive(Clone, Copy, Debug, Default)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct LlmReply {
    pub text: String,
    pub usage: Option<LlmUsage>,
}

#[derive(Clone, Debug, Error)]
pub enum LlmFailure {
    #[error("llm timeout")]
    Timeout,
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm upstream status {0}")]
    Upstream(u16),
    #[error("llm bad response: {0}")]
    BadResponse(String),
}

impl LlmFailure {
    /// Breaker failure definition: transport, timeout, or status ≥ 500.
    pub fn counts_for_breaker(&self) -> bool {
        match self {
            LlmFailure::Timeout | LlmFailure::Transport(_) => true,
            LlmFailure::Upstream(status) => *status >= 500,
            LlmFailure::BadResponse(_) => false,
        }
    }

    /// Label value for `llm_errors_total{error_type}`.
    pub fn error_type(&self) -> &'static str {
        match self {
            LlmFailure::Timeout => "timeout",
            LlmFailure::Transport(_) => "transport",
            LlmFailure::Upstream(_) => "upstream",
            LlmFailure::BadResponse(_) => "bad_response",
        }
    }
}

/// Given user-facing text and a bot preset, return improved text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn improve(&self, text: &str, preset: &str) -> Result<LlmReply, LlmFailure>;
}

fn preset_instruction(preset: &str) -> &'static str {
    match preset {
        "short" => "Rewrite the message to be as short as possible while keeping its meaning and language.",
        "detailed" => "Rewrite the message to be friendlier and more detailed, keeping its meaning and language.",
        _ => "Lightly polish the message, keeping its meaning, tone and language.",
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpLlm {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl HttpLlm {
    pub fn new(base_url: &str, model: &str, timeout: Duration, max_retries: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
            max_retries,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call_once(&self, text: &str, preset: &str) -> Result<LlmReply, LlmFailure> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": preset_instruction(preset)},
                {"role": "user", "content": text}
            ],
            "temperature": 0.3
        });
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmFailure::Timeout
                } else {
                    LlmFailure::Transport(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmFailure::Upstream(status.as_u16()));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmFailure::BadResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmFailure::BadResponse("no choices".into()))?;
        Ok(LlmReply {
            text: content,
            usage: parsed.usage.map(|u| LlmUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlm {
    /// Transport errors are retried up to `max_retries`; upstream status
    /// codes are not, so one request contributes at most one breaker failure.
    async fn improve(&self, text: &str, preset: &str) -> Result<LlmReply, LlmFailure> {
        let mut last = LlmFailure::Transport("no attempt made".into());
        for attempt in 0..=self.max_retries {
            match self.call_once(text, preset).await {
                Ok(reply) => return Ok(reply),
                Err(e @ LlmFailure::Transport(_)) => {
                    tracing::debug!("llm transport error (attempt {}): {}", attempt + 1, e);
                    last = e;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// Scripted mock: pops queued results, then falls back to echoing with a
/// marker. Counts calls so tests can assert the breaker short-circuits.
#[derive(Default)]
pub struct MockLlm {
    script: Mutex<VecDeque<Result<LlmReply, LlmFailure>>>,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, text: &str, tokens: u32) {
        self.script
            .lock()
            .expect("mock llm lock")
            .push_back(Ok(LlmReply {
                text: text.to_string(),
                usage: Some(LlmUsage {
                    prompt_tokens: tokens / 2,
                    completion_tokens: tokens - tokens / 2,
                    total_tokens: tokens,
                }),
            }));
    }

    pub fn push_err(&self, failure: LlmFailure) {
        self.script
            .lock()
            .expect("mock llm lock")
            .push_back(Err(failure));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn improve(&self, text: &str, _preset: &str) -> Result<LlmReply, LlmFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.script.lock().expect("mock llm lock").pop_front() {
            return scripted;
        }
        Ok(LlmReply {
            text: format!("{text} ✨"),
            usage: Some(LlmUsage {
                prompt_tokens: 10,
                completion_tokens: 10,
                total_tokens: 20,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_failure_definition() {
        assert!(LlmFailure::Timeout.counts_for_breaker());
        assert!(LlmFailure::Transport("x".into()).counts_for_breaker());
        assert!(LlmFailure::Upstream(500).counts_for_breaker());
        assert!(LlmFailure::Upstream(503).counts_for_breaker());
        assert!(!LlmFailure::Upstream(429).counts_for_breaker());
        assert!(!LlmFailure::BadResponse("x".into()).counts_for_breaker());
    }

    #[tokio::test]
    async fn mock_plays_script_then_echoes() {
        let mock = MockLlm::new();
        mock.push_err(LlmFailure::Upstream(500));
        mock.push_ok("better", 30);

        assert!(mock.improve("hi", "neutral").await.is_err());
        assert_eq!(mock.improve("hi", "neutral").await.unwrap().text, "better");
        let echoed = mock.improve("hi", "neutral").await.unwrap();
        assert_eq!(echoed.text, "hi ✨");
        assert_eq!(mock.calls(), 3);
    }
}
