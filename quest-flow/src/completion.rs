//! Language-model completion service.
//!
//! Stages talk to a [`CompletionClient`]; the production implementation calls
//! an OpenAI-compatible `chat/completions` endpoint in JSON-object mode. The
//! returned text is never trusted: [`parse_json_response`] re-parses it
//! locally and turns anything unusable into a generation error.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::CompletionSettings;
use crate::error::{PipelineError, Result};
use crate::utils::extract_json;

/// Sends one system instruction plus user content, returns the raw reply text
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Parse a completion reply as JSON, tolerating markdown code fences.
pub fn parse_json_response(content: &str) -> Result<Value> {
    let body = extract_json(content);
    if body.is_empty() {
        return Err(PipelineError::generation("completion service returned no content"));
    }
    serde_json::from_str(&body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        PipelineError::generation(format!("response is not valid JSON ({}): {}", e, preview))
    })
}

/// Ask for JSON and parse the reply.
pub async fn complete_json(client: &dyn CompletionClient, system: &str, user: &str) -> Result<Value> {
    let content = client.complete(system, user).await?;
    parse_json_response(&content)
}

/// OpenAI-compatible chat completions client.
///
/// POST {base_url}/chat/completions
/// Headers:
///   Authorization: Bearer {api_key}
///   content-type: application/json
pub struct OpenAiCompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiCompletionClient {
    pub fn new(settings: &CompletionSettings, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Completion {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompletionClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ]
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Completion {
                message: format!("HTTP request failed: {}", e),
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| PipelineError::Completion {
            message: format!("failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(PipelineError::Completion {
                message: format!("API returned {}: {}", status, response_text),
            });
        }

        extract_message_content(&response_text)
    }
}

/// Pull `choices[0].message.content` out of a chat completions response.
fn extract_message_content(response_text: &str) -> Result<String> {
    let json: Value = serde_json::from_str(response_text).map_err(|e| {
        PipelineError::generation(format!("completion response is not JSON: {}", e))
    })?;

    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| PipelineError::generation("completion response has no message content"))
}
