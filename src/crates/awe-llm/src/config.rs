//! Provider configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LlmError, Result};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Configuration for a remote model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    /// API key for authentication.
    pub api_key: String,

    /// Base URL for the API.
    pub base_url: String,

    /// Model name/identifier.
    pub model: String,

    /// Request timeout duration.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

impl RemoteLlmConfig {
    /// Create a new remote provider configuration.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            timeout: default_timeout(),
        }
    }

    /// Load a Gemini configuration with the key taken from `env_var`.
    pub fn from_env(env_var: &str) -> Result<Self> {
        let api_key = std::env::var(env_var)
            .map_err(|_| LlmError::ApiKeyNotFound(env_var.to_string()))?;
        Ok(Self::new(api_key, GEMINI_BASE_URL, GEMINI_DEFAULT_MODEL))
    }

    /// Build a configuration from an explicit credential (e.g. the CLI's
    /// `--key` flag).
    pub fn with_key(api_key: impl Into<String>) -> Self {
        Self::new(api_key, GEMINI_BASE_URL, GEMINI_DEFAULT_MODEL)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RemoteLlmConfig::with_key("k");
        assert_eq!(config.base_url, GEMINI_BASE_URL);
        assert_eq!(config.model, GEMINI_DEFAULT_MODEL);
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_from_env_missing_key() {
        let err = RemoteLlmConfig::from_env("AWE_TEST_MISSING_KEY").unwrap_err();
        assert!(matches!(err, LlmError::ApiKeyNotFound(_)));
    }

    #[test]
    fn test_builders() {
        let config = RemoteLlmConfig::with_key("k")
            .with_model("gemini-1.5-pro")
            .with_timeout(Duration::from_secs(90));
        assert_eq!(config.model, "gemini-1.5-pro");
        assert_eq!(config.timeout, Duration::from_secs(90));
    }
}
