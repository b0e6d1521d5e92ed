//! Optional LLM text improvement.
//!
//! The LLM is always an enhancement: every refusal or failure returns the
//! caller's text unchanged. [`LlmService`] composes the prompt cache, the
//! per-(bot, user) rate limit, the per-bot daily token budget, and the
//! per-bot circuit breaker around an [`LlmClient`].

mod breaker;
mod client;
mod service;

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use client::{HttpLlm, LlmClient, LlmFailure, LlmReply, LlmUsage, MockLlm};
pub use service::{ImproveOutcome, LlmService};
