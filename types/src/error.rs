//! Provider error taxonomy.
//!
//! The retry engine only ever retries rate-limit failures; everything else
//! propagates to the caller unchanged. Classification therefore lives here,
//! next to the error type, so adapters and the retry loop agree on it.

use std::time::Duration;

use thiserror::Error;

/// Error returned by a provider `generate` call.
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    /// The provider rejected the request due to rate limiting.
    ///
    /// `retry_after` carries the provider-suggested wait, when one was given.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The provider returned an API error (auth failure, bad request,
    /// overloaded backend, ...).
    #[error("API error{}: {message}", status.map(|s| format!(" {s}")).unwrap_or_default())]
    Api { status: Option<u16>, message: String },

    /// The provider has no usable credentials or endpoint.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// Transport or other non-API failure.
    #[error("{0}")]
    Other(String),
}

impl GenerateError {
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Provider-suggested delay before retrying, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this error should be treated as a rate limit and retried.
    ///
    /// True for the distinguished `RateLimited` variant, for any error
    /// carrying HTTP status 429, and for errors whose message mentions
    /// "rate limit", "429", or "too many requests". The message sniffing is
    /// deliberate: adapters wrap heterogeneous SDK errors and not all of
    /// them preserve structured status codes.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Api { status, message } => {
                *status == Some(429) || message_mentions_rate_limit(message)
            }
            Self::NotConfigured(_) => false,
            Self::Other(message) => message_mentions_rate_limit(message),
        }
    }
}

fn message_mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
}
