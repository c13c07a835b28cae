//! Failure taxonomy for dispatch.
//!
//! Handlers and pipeline behaviors return `Result<T, DispatchError>`; no
//! panic crosses the mediator boundary in normal flow. The variants here are
//! the only kinds a caller ever observes.

use serde::{Deserialize, Serialize};

/// Discriminant for [`DispatchError`], usable as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    HandlerNotFound,
    Validation,
    Transient,
    Terminal,
    Timeout,
    Cancelled,
    RateLimited,
    Overloaded,
    CircuitOpen,
    Duplicate,
    BackpressureExceeded,
    Unhandled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HandlerNotFound => "handler_not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Terminal => "terminal",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::BackpressureExceeded => "backpressure_exceeded",
            ErrorKind::Unhandled => "unhandled",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler for {0}")]
    HandlerNotFound(String),

    /// Aggregated validator messages, joined with `"; "`.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Retryable resource failure (I/O, broker unavailable).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retryable failure (serialization, bad request, broken invariant).
    #[error("terminal failure: {0}")]
    Terminal(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("cancelled by caller")]
    Cancelled,

    #[error("rate limited")]
    RateLimited,

    #[error("concurrency limit saturated")]
    Overloaded,

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Idempotency short-circuit; carries the duplicate message id.
    #[error("duplicate message {0}")]
    Duplicate(String),

    #[error("subscriber queue full")]
    BackpressureExceeded,

    /// User handler panicked or surfaced an unclassified error.
    #[error("unhandled handler failure: {message}")]
    Unhandled {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl DispatchError {
    pub fn unhandled(message: impl Into<String>) -> Self {
        DispatchError::Unhandled {
            message: message.into(),
            source: None,
        }
    }

    pub fn unhandled_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DispatchError::Unhandled {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::HandlerNotFound(_) => ErrorKind::HandlerNotFound,
            DispatchError::Validation(_) => ErrorKind::Validation,
            DispatchError::Transient(_) => ErrorKind::Transient,
            DispatchError::Terminal(_) => ErrorKind::Terminal,
            DispatchError::Timeout => ErrorKind::Timeout,
            DispatchError::Cancelled => ErrorKind::Cancelled,
            DispatchError::RateLimited => ErrorKind::RateLimited,
            DispatchError::Overloaded => ErrorKind::Overloaded,
            DispatchError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            DispatchError::Duplicate(_) => ErrorKind::Duplicate,
            DispatchError::BackpressureExceeded => ErrorKind::BackpressureExceeded,
            DispatchError::Unhandled { .. } => ErrorKind::Unhandled,
        }
    }

    /// Whether the retry behavior may re-invoke after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Terminal kinds never go back to the broker for redelivery.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Terminal
                | ErrorKind::Validation
                | ErrorKind::HandlerNotFound
                | ErrorKind::Unhandled
        )
    }
}
