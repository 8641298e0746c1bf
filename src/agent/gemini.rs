use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::provider::{ChatMessage, ChatProvider, EmbeddingsProvider};
use crate::config::AgentConfig;
use crate::core::errors::ApiError;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Thin HTTP adapter for Google's Gemini API.
///
/// Covers only what the demo needs: generateContent and embedContent.
#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    embed_model: String,
}

impl GeminiProvider {
    pub fn new(config: &AgentConfig) -> Result<Self, ApiError> {
        Self::with_base_url(config, API_BASE)
    }

    pub fn with_base_url(config: &AgentConfig, base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ApiError::internal)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            embed_model: config.embed_model.clone(),
        })
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, ApiError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        // Gemini has no system role on the contents list; system text goes
        // into systemInstruction, assistant turns become "model".
        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        for message in &messages {
            match message.role.as_str() {
                "system" => system_parts.push(json!({ "text": message.content })),
                "assistant" => contents.push(json!({
                    "role": "model",
                    "parts": [{ "text": message.content }]
                })),
                _ => contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": message.content }]
                })),
            }
        }

        let mut body = json!({ "contents": contents });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ApiError::ServiceUnavailable
                } else {
                    ApiError::internal(err)
                }
            })?;

        let status = res.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(ApiError::ServiceUnavailable);
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Internal(format!(
                "Gemini chat error ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(ApiError::internal)?;
        let content = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(content)
    }
}

#[async_trait]
impl EmbeddingsProvider for GeminiProvider {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let url = format!(
            "{}/models/{}:batchEmbedContents?key={}",
            self.base_url, self.embed_model, self.api_key
        );

        let requests: Vec<Value> = inputs
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.embed_model),
                    "content": { "parts": [{ "text": text }] }
                })
            })
            .collect();

        let res = self
            .client
            .post(&url)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(ApiError::internal)?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Internal(format!(
                "Gemini embed error ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(ApiError::internal)?;
        let embeddings = payload["embeddings"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        item["values"]
                            .as_array()
                            .map(|values| {
                                values
                                    .iter()
                                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                                    .collect::<Vec<f32>>()
                            })
                            .unwrap_or_default()
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if embeddings.len() != inputs.len() {
            return Err(ApiError::Internal(format!(
                "Gemini embed returned {} embeddings for {} inputs",
                embeddings.len(),
                inputs.len()
            )));
        }

        Ok(embeddings)
    }
}
