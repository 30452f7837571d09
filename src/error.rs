//! Typed error channels for provider calls and vector stores.
//!
//! Application seams (config, CLI, server startup) use `anyhow`. The two
//! channels below are typed because callers branch on them: the
//! orchestrator decides whether to retry from a [`ProviderError`], and the
//! retrieval manager decides whether to fall back from a [`StoreError`].

use thiserror::Error;

/// Prefix carried by every user-presentable failure string.
pub const ERROR_PREFIX: &str = "Error: ";

/// Failure of one chat-completion call.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Network unreachable, connection reset, or timeout.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The gateway answered with a non-2xx status.
    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body lacked `choices[0]` or was not valid JSON.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The client could not be built (bad endpoint, incompatible model).
    #[error("client construction failed: {0}")]
    Construction(String),

    /// The request itself was invalid; retrying cannot help.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ProviderError {
    /// Machine-readable cause, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transport(_) => "transport",
            ProviderError::Status { .. } => "status",
            ProviderError::Malformed(_) => "malformed",
            ProviderError::Construction(_) => "construction",
            ProviderError::Invalid(_) => "validation",
        }
    }

    /// User-presentable message, distinctly prefixed from success text.
    pub fn user_message(&self) -> String {
        format!("{}{}", ERROR_PREFIX, self)
    }

    /// Whether a second attempt with identical parameters could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderError::Invalid(_) | ProviderError::Construction(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else if err.is_builder() {
            ProviderError::Construction(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Failure of a vector-store operation.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Embedding length does not match the store's configured dimension.
    /// Checked before any row is written.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("store request failed: {0}")]
    Request(String),

    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed store response: {0}")]
    Malformed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Malformed(err.to_string())
        } else {
            StoreError::Request(err.to_string())
        }
    }
}
