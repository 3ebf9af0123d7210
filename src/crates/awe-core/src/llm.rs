//! Language model abstraction
//!
//! The AI-agent strategy talks to a model through [`ChatModel`]; provider
//! implementations (Gemini over HTTP, test doubles) live outside this
//! crate. When no model is configured the strategy runs in simulation
//! mode and this trait is never called.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;

/// A single chat completion request composed by the AI-agent strategy.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// System guidance (actor role, output contract)
    pub system: Option<String>,
    /// Composed prompt: activity description, resolved inputs, skills
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageMetadata {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl UsageMetadata {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// A provider response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<UsageMetadata>,
    /// Provider-specific extras (model name, finish reason)
    pub metadata: HashMap<String, Value>,
}

/// Chat-completion provider contract.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    fn clone_box(&self) -> Box<dyn ChatModel>;
}

impl Clone for Box<dyn ChatModel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
