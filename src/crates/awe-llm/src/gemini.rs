//! Google Gemini client.
//!
//! Talks to the Gemini `generateContent` API. The API key is passed as a
//! query parameter, system guidance is prepended to the first user
//! message, and usage metadata is mapped onto the engine's token
//! accounting.

use async_trait::async_trait;
use awe_core::error::Result as CoreResult;
use awe_core::llm::{ChatModel, ChatRequest, ChatResponse, UsageMetadata};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::RemoteLlmConfig;
use crate::error::LlmError;

/// Google Gemini API client.
#[derive(Clone)]
pub struct GeminiClient {
    config: RemoteLlmConfig,
    client: Client,
}

impl GeminiClient {
    /// Create a new Gemini client with the given configuration.
    pub fn new(config: RemoteLlmConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("HTTP client construction cannot fail with static options");
        Self { config, client }
    }

    fn build_request(&self, request: &ChatRequest) -> GeminiRequest {
        // Gemini has no first-class system role in this API surface;
        // prepend the system text to the user turn.
        let text = match &request.system {
            Some(system) => format!("[System] {system}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        };
        GeminiRequest {
            contents: vec![GeminiMessage {
                role: "user".to_string(),
                parts: vec![GeminiPart { text }],
            }],
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            }),
        }
    }

    fn convert_response(&self, response: GeminiResponse) -> Result<ChatResponse, LlmError> {
        let candidate = response
            .candidates
            .first()
            .ok_or_else(|| LlmError::InvalidResponse("no candidates returned".into()))?;
        let text = candidate
            .content
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        let usage = response
            .usage_metadata
            .as_ref()
            .map(|u| UsageMetadata::new(u.prompt_token_count, u.candidates_token_count));

        let mut metadata = HashMap::new();
        metadata.insert(
            "model".to_string(),
            serde_json::Value::String(self.config.model.clone()),
        );
        if let Some(reason) = &candidate.finish_reason {
            metadata.insert(
                "finish_reason".to_string(),
                serde_json::Value::String(reason.clone()),
            );
        }

        Ok(ChatResponse {
            text,
            usage,
            metadata,
        })
    }
}

#[async_trait]
impl ChatModel for GeminiClient {
    async fn chat(&self, request: ChatRequest) -> CoreResult<ChatResponse> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        );
        debug!(model = %self.config.model, "dispatching chat request");

        let body = self.build_request(&request);
        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.config.api_key)])
            .json(&body)
            .send()
            .await
            .map_err(LlmError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            let err = match status.as_u16() {
                401 | 403 => LlmError::Authentication(detail),
                429 => LlmError::RateLimit(detail),
                _ => LlmError::Provider(format!("Gemini API error {status}: {detail}")),
            };
            return Err(err.into());
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(self.convert_response(parsed)?)
    }

    fn clone_box(&self) -> Box<dyn ChatModel> {
        Box::new(self.clone())
    }
}

// Gemini API wire types
#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiMessage>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiMessage {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: usize,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GeminiClient {
        GeminiClient::new(RemoteLlmConfig::with_key("test-key"))
    }

    #[test]
    fn test_system_text_is_prepended() {
        let request = ChatRequest::new("Score this claim").with_system("You are an adjuster");
        let body = client().build_request(&request);

        assert_eq!(body.contents.len(), 1);
        assert_eq!(body.contents[0].role, "user");
        let text = &body.contents[0].parts[0].text;
        assert!(text.starts_with("[System] You are an adjuster"));
        assert!(text.ends_with("Score this claim"));
    }

    #[test]
    fn test_request_without_system() {
        let body = client().build_request(&ChatRequest::new("Hello"));
        assert_eq!(body.contents[0].parts[0].text, "Hello");
    }

    #[test]
    fn test_response_conversion() {
        let response = GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: GeminiContent {
                    parts: vec![
                        GeminiPart {
                            text: "{\"score\": ".to_string(),
                        },
                        GeminiPart {
                            text: "42}".to_string(),
                        },
                    ],
                },
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: Some(GeminiUsageMetadata {
                prompt_token_count: 8,
                candidates_token_count: 15,
            }),
        };

        let converted = client().convert_response(response).unwrap();
        assert_eq!(converted.text, "{\"score\": 42}");
        assert_eq!(converted.usage, Some(UsageMetadata::new(8, 15)));
        assert_eq!(
            converted.metadata.get("finish_reason"),
            Some(&serde_json::Value::String("STOP".into()))
        );
    }

    #[test]
    fn test_empty_candidates_is_invalid() {
        let response = GeminiResponse {
            candidates: vec![],
            usage_metadata: None,
        };
        assert!(client().convert_response(response).is_err());
    }
}
