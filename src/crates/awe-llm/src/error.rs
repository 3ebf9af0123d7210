//! Error types for model provider implementations.

use thiserror::Error;

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when talking to a model provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API authentication failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// API key not found in the environment.
    #[error("API key not found: {0}")]
    ApiKeyNotFound(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// Response body did not parse.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Provider-side failure.
    #[error("provider error: {0}")]
    Provider(String),
}

impl From<LlmError> for awe_core::WorkflowError {
    fn from(err: LlmError) -> Self {
        awe_core::WorkflowError::Strategy {
            activity: "ai_agent".to_string(),
            reason: err.to_string(),
        }
    }
}
