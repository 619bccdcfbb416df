//! Streaming HTTP oracle
//!
//! Talks to an OpenAI-compatible chat completions endpoint (Ollama,
//! OpenRouter, and friends expose this shape) with `stream: true`,
//! yielding delta content as chunks. Tier selection only changes which
//! model name is requested; the transport is shared.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::brain::oracle::{ChunkStream, Oracle};
use crate::brain::router::ModelTier;
use crate::core::config::LlmConfig;
use crate::core::error::{MaestroError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// OpenAI-compatible streaming chat client
pub struct HttpOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    tier_models: HashMap<ModelTier, String>,
    max_tokens: u32,
}

impl HttpOracle {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            default_model: config.model.clone(),
            tier_models: HashMap::new(),
            max_tokens: config.max_tokens,
        }
    }

    /// Override the model used for one tier.
    pub fn with_tier_model(mut self, tier: ModelTier, model: impl Into<String>) -> Self {
        self.tier_models.insert(tier, model.into());
        self
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        self.tier_models
            .get(&tier)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    async fn stream_chat(&self, prompt: &str, tier: ModelTier) -> Result<ChunkStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model_for(tier),
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_tokens,
            "stream": true,
        });

        debug!(url = %url, model = self.model_for(tier), "oracle request");

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(MaestroError::OracleTransport {
                message: format!("oracle returned HTTP {}", response.status()),
            });
        }

        let mut byte_stream = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut line_buffer = String::new();

            while let Some(chunk) = byte_stream.next().await {
                let bytes = chunk.map_err(|e| MaestroError::OracleTransport {
                    message: format!("stream interrupted: {}", e),
                })?;
                line_buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline) = line_buffer.find('\n') {
                    let line = line_buffer[..newline].trim().to_string();
                    line_buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload.is_empty() || payload == "[DONE]" {
                        continue;
                    }

                    if let Some(content) = extract_delta(payload) {
                        yield content;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Pull the delta text out of one SSE event payload.
fn extract_delta(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let choice = value.get("choices")?.get(0)?;
    // Streaming responses carry `delta`; non-streaming fallbacks `message`.
    let content = choice
        .pointer("/delta/content")
        .or_else(|| choice.pointer("/message/content"))?
        .as_str()?;
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    fn name(&self) -> &str {
        "http"
    }

    async fn translate(&self, prompt: &str, tier: ModelTier) -> Result<ChunkStream> {
        self.stream_chat(prompt, tier).await
    }

    async fn reflect(&self, prompt: &str, tier: ModelTier) -> Result<ChunkStream> {
        self.stream_chat(prompt, tier).await
    }

    async fn describe_image(&self, image_base64: &str, prompt: &str) -> Result<String> {
        // Sanity-check the payload before shipping it anywhere.
        base64::engine::general_purpose::STANDARD
            .decode(image_base64)
            .map_err(|e| MaestroError::internal("oracle", format!("invalid image data: {}", e)))?;

        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.default_model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url",
                      "image_url": { "url": format!("data:image/png;base64,{}", image_base64) } }
                ]
            }],
            "max_tokens": self.max_tokens,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response: Value = request.send().await?.json().await?;
        response
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| MaestroError::OracleTransport {
                message: "vision response had no content".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_delta_from_stream_event() {
        let payload = r#"{"choices":[{"delta":{"content":"hello"}}]}"#;
        assert_eq!(extract_delta(payload).as_deref(), Some("hello"));
    }

    #[test]
    fn test_extract_delta_from_message_fallback() {
        let payload = r#"{"choices":[{"message":{"content":"full"}}]}"#;
        assert_eq!(extract_delta(payload).as_deref(), Some("full"));
    }

    #[test]
    fn test_extract_delta_skips_empty() {
        assert!(extract_delta(r#"{"choices":[{"delta":{}}]}"#).is_none());
        assert!(extract_delta("not json").is_none());
    }

    #[test]
    fn test_tier_model_override() {
        let config = LlmConfig::default();
        let oracle = HttpOracle::new(&config).with_tier_model(ModelTier::Top, "grand-model");
        assert_eq!(oracle.model_for(ModelTier::Top), "grand-model");
        assert_eq!(oracle.model_for(ModelTier::Local), config.model);
    }
}
