//! Error types for tern-ai

use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use thiserror::Error;

/// Result type alias using tern-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when requesting a completion
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure (connection reset, DNS, TLS, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// The completion did not finish within the configured timeout
    #[error("Completion timed out after {0:?}")]
    Timeout(Duration),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::RateLimited { .. } | Error::Timeout(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
                    || msg.contains("529")
            }
            _ => false,
        }
    }

    /// Check if this error indicates a context overflow / too many tokens
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api { message, .. } => is_context_overflow(message),
            _ => false,
        }
    }
}

/// Compiled regex patterns for detecting context overflow errors across providers.
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)prompt.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)content.?too.?large",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)context.?overflow",
        r"(?i)total.?tokens?.?exceed",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check if an error message indicates a context overflow
pub fn is_context_overflow(error: &str) -> bool {
    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}
