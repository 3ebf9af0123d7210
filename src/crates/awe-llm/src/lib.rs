//! # awe-llm - Model providers for the AI-agent strategy
//!
//! Implementations of [`awe_core::llm::ChatModel`]. The engine core only
//! knows the trait; this crate supplies the HTTP clients. Currently:
//!
//! - [`GeminiClient`] - Google Gemini over the `generateContent` API,
//!   keyed by the `GEMINI_API_KEY` environment variable
//!
//! When no credential is present the engine never reaches this crate:
//! the AI-agent strategy runs in simulation mode instead.
//!
//! ```rust,no_run
//! use awe_llm::{GeminiClient, RemoteLlmConfig};
//!
//! let config = RemoteLlmConfig::from_env("GEMINI_API_KEY")?;
//! let model = GeminiClient::new(config);
//! # Ok::<(), awe_llm::LlmError>(())
//! ```

pub mod config;
pub mod error;
pub mod gemini;

pub use config::RemoteLlmConfig;
pub use error::LlmError;
pub use gemini::GeminiClient;
