//! Typed errors for the request path.
//!
//! Configuration and startup code use `anyhow`. The request path uses the
//! enums below so the fallback controller and the pipeline can branch on
//! error kind instead of matching strings.

use thiserror::Error;

/// Whether a failed model call may be retried on another provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// A failed call to a language model provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("provider rejected credentials (HTTP {0})")]
    Auth(u16),
    #[error("provider misconfigured: {0}")]
    Config(String),
    #[error("malformed provider response: {0}")]
    Protocol(String),
}

impl LlmError {
    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 | 403 => LlmError::Auth(status),
            _ => LlmError::Http {
                status,
                body: body.into(),
            },
        }
    }

    /// Timeouts, transport failures, 408/429/5xx and garbled responses are
    /// retryable. Rejected credentials, bad configuration and other 4xx
    /// responses are not.
    pub fn classify(&self) -> ErrorClass {
        match self {
            LlmError::Timeout | LlmError::Transport(_) | LlmError::Protocol(_) => {
                ErrorClass::Retryable
            }
            LlmError::Http { status, .. } => match status {
                408 | 429 | 500..=599 => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
            LlmError::Auth(_) | LlmError::Config(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Retryable
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_decode() {
            LlmError::Protocol(e.to_string())
        } else if let Some(status) = e.status() {
            LlmError::from_status(status.as_u16(), e.to_string())
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

/// All configured providers failed.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("could not generate a response")]
    Exhausted { attempts: usize, last: LlmError },
}

impl RouterError {
    pub fn last_error(&self) -> &LlmError {
        match self {
            RouterError::Exhausted { last, .. } => last,
        }
    }
}

/// Semantic cache failures. Never surfaced to callers; the cache degrades to a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("cache backend failed: {0}")]
    Backend(String),
    #[error("payload cipher failed: {0}")]
    Crypto(String),
    #[error("payload (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache operation timed out")]
    Timeout,
}

/// Failure surfaced while producing an answer.
#[derive(Debug, Error)]
pub enum AnswerError {
    /// The stream broke after tokens were delivered. The cause is logged, not displayed.
    #[error("could not generate a response")]
    Interrupted(#[source] LlmError),
}
