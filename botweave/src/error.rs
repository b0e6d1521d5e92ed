//! Runtime error taxonomy.
//!
//! Every failure the core surfaces maps to one stable [`ErrorCode`]; the code
//! is what lands in `error` events, in `bot_errors_total{where,code}`, and in
//! the HTTP error envelope. Implementation details never reach user replies.

use thiserror::Error;

/// Stable error codes. The wire/metric form is [`ErrorCode::as_str`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DbUnavailable,
    SqlError,
    ValidationFailed,
    TemplateError,
    StateCorrupt,
    CircuitBreakerOpen,
    RateLimitExceeded,
    BudgetExhausted,
    Timeout,
    CallbackOwnerMismatch,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DbUnavailable => "db_unavailable",
            ErrorCode::SqlError => "sql_error",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::TemplateError => "template_error",
            ErrorCode::StateCorrupt => "state_corrupt",
            ErrorCode::CircuitBreakerOpen => "circuit_breaker_open",
            ErrorCode::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCode::BudgetExhausted => "budget_exhausted",
            ErrorCode::Timeout => "timeout",
            ErrorCode::CallbackOwnerMismatch => "callback_owner_mismatch",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core runtime error. Carries enough context for the event log; user-facing
/// text is decided by the caller (fallback reply, validation message, or
/// silence), never by the error message itself.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("database unavailable: {0}")]
    DbUnavailable(String),
    #[error("sql rejected or failed: {0}")]
    Sql(String),
    #[error("wizard input validation failed")]
    ValidationFailed,
    #[error("template error: {0}")]
    Template(String),
    #[error("wizard state corrupt")]
    StateCorrupt,
    #[error("llm circuit breaker open")]
    CircuitBreakerOpen,
    #[error("llm rate limit exceeded")]
    RateLimitExceeded,
    #[error("llm daily budget exhausted")]
    BudgetExhausted,
    #[error("deadline exceeded")]
    Timeout,
    #[error("callback addressed to a different user")]
    CallbackOwnerMismatch,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::DbUnavailable(_) => ErrorCode::DbUnavailable,
            RuntimeError::Sql(_) => ErrorCode::SqlError,
            RuntimeError::ValidationFailed => ErrorCode::ValidationFailed,
            RuntimeError::Template(_) => ErrorCode::TemplateError,
            RuntimeError::StateCorrupt => ErrorCode::StateCorrupt,
            RuntimeError::CircuitBreakerOpen => ErrorCode::CircuitBreakerOpen,
            RuntimeError::RateLimitExceeded => ErrorCode::RateLimitExceeded,
            RuntimeError::BudgetExhausted => ErrorCode::BudgetExhausted,
            RuntimeError::Timeout => ErrorCode::Timeout,
            RuntimeError::CallbackOwnerMismatch => ErrorCode::CallbackOwnerMismatch,
            RuntimeError::Internal(_) => ErrorCode::Internal,
        }
    }
}
