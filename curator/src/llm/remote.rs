use anyhow::{Context, Result};
use common::ApiStyle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{LlmProvider, LlmRequest, LlmResponse, ProviderError, UsageMetadata};

/// Remote LLM provider speaking either the OpenAI-compatible chat API or Gemini
pub struct RemoteLlmProvider {
    base_url: String,
    api_key: String,
    model: String,
    style: ApiStyle,
    default_timeout: Duration,
    default_max_tokens: Option<usize>,
    default_temperature: f32,
    client: reqwest::Client,
}

impl RemoteLlmProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            style: ApiStyle::OpenaiChat,
            default_timeout: Duration::from_secs(90),
            default_max_tokens: None,
            default_temperature: 0.3,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_style(mut self, style: ApiStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_defaults(
        mut self,
        timeout_secs: u64,
        max_tokens: Option<usize>,
        temperature: f32,
    ) -> Self {
        self.default_timeout = Duration::from_secs(timeout_secs);
        self.default_max_tokens = max_tokens;
        self.default_temperature = temperature;
        self
    }

    /// Model ids advertised by an OpenAI-compatible `/models` endpoint.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        // e.g. https://fyra.im/v1/chat/completions -> https://fyra.im/v1/models
        let models_url = if self.base_url.ends_with("/chat/completions") {
            self.base_url.replace("/chat/completions", "/models")
        } else {
            format!("{}/models", self.base_url.trim_end_matches('/'))
        };

        let response = tokio::time::timeout(
            self.default_timeout,
            self.client
                .get(&models_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .send(),
        )
        .await
        .context("Model listing timed out")?
        .context("Model listing request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Model listing failed with {}: {}", status, body);
        }

        let listing: ModelListing = response
            .json()
            .await
            .context("Failed to parse model listing")?;
        Ok(listing.data.into_iter().map(|m| m.id).collect())
    }

    fn build_request(&self, request: &LlmRequest) -> reqwest::RequestBuilder {
        let max_tokens = request.max_tokens.or(self.default_max_tokens);
        let temperature = request.temperature.unwrap_or(self.default_temperature);

        match self.style {
            ApiStyle::OpenaiChat => {
                let mut messages = Vec::with_capacity(2);
                if let Some(system) = &request.system {
                    messages.push(Message {
                        role: "system".to_string(),
                        content: system.clone(),
                    });
                }
                messages.push(Message {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                });
                let body = OpenAiRequest {
                    model: self.model.clone(),
                    messages,
                    max_tokens,
                    temperature: Some(temperature),
                };
                self.client
                    .post(&self.base_url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(&body)
            }
            ApiStyle::Gemini => {
                let mut parts = Vec::with_capacity(2);
                if let Some(system) = &request.system {
                    parts.push(GeminiPartOut { text: system.clone() });
                }
                parts.push(GeminiPartOut {
                    text: request.prompt.clone(),
                });
                let body = GeminiRequest {
                    contents: vec![GeminiContentOut { parts }],
                    generation_config: GenerationConfig {
                        temperature: Some(temperature),
                        max_output_tokens: max_tokens,
                    },
                };
                let url = format!(
                    "{}/{}:generateContent",
                    self.base_url.trim_end_matches('/'),
                    self.model
                );
                self.client
                    .post(url)
                    .query(&[("key", self.api_key.as_str())])
                    .header("Content-Type", "application/json")
                    .json(&body)
            }
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, ProviderError> {
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let builder = self.build_request(request);
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => {
                return Err(ProviderError::Network(format!(
                    "LLM request timed out after {}s",
                    timeout.as_secs()
                )))
            }
            Ok(Err(e)) => return Err(ProviderError::Network(e.to_string())),
            Ok(Ok(pair)) => pair,
        };

        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let (content, usage, model) = read_reply(&body)?;
        Ok(LlmResponse {
            content,
            usage,
            model: model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

/// Pull the generated text out of a successful reply body.
///
/// Bodies in neither the chat nor the Gemini shape are returned verbatim, so
/// the extractor still gets a chance at them.
fn read_reply(body: &str) -> std::result::Result<(String, UsageMetadata, Option<String>), ProviderError> {
    let Ok(envelope) = serde_json::from_str::<ReplyEnvelope>(body) else {
        return Ok((body.trim().to_string(), UsageMetadata::default(), None));
    };

    let usage = envelope.usage_metadata();
    let gemini_text = envelope
        .candidates
        .as_ref()
        .or(envelope.outputs.as_ref())
        .and_then(|c| c.first())
        .and_then(|c| c.content.as_ref())
        .and_then(|c| c.parts.first())
        .and_then(|p| p.text.clone());
    let chat_text = envelope
        .choices
        .as_ref()
        .and_then(|c| c.first())
        .and_then(|c| c.message.as_ref())
        .and_then(|m| m.content.clone());

    if let Some(text) = gemini_text.or(chat_text) {
        return Ok((text.trim().to_string(), usage, envelope.model));
    }

    if let Some(error) = envelope.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
            .unwrap_or_else(|| error.to_string());
        return Err(ProviderError::Reported(message));
    }

    if envelope.choices.is_some() || envelope.candidates.is_some() || envelope.outputs.is_some() {
        return Err(ProviderError::Reported("reply carried no content".to_string()));
    }

    Ok((body.trim().to_string(), usage, envelope.model))
}

// OpenAI API request structures
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

// Gemini request structures
#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContentOut>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContentOut {
    parts: Vec<GeminiPartOut>,
}

#[derive(Debug, Serialize)]
struct GeminiPartOut {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
}

// Reply envelope covering both wire styles; every field is optional
#[derive(Debug, Deserialize)]
struct ReplyEnvelope {
    model: Option<String>,
    choices: Option<Vec<Choice>>,
    candidates: Option<Vec<GeminiCandidate>>,
    outputs: Option<Vec<GeminiCandidate>>,
    usage: Option<Usage>,
    #[serde(rename = "usageMetadata")]
    gemini_usage: Option<GeminiUsage>,
    error: Option<Value>,
}

impl ReplyEnvelope {
    fn usage_metadata(&self) -> UsageMetadata {
        if let Some(u) = &self.usage {
            UsageMetadata {
                prompt_tokens: u.prompt_tokens.unwrap_or(0),
                completion_tokens: u.completion_tokens.unwrap_or(0),
                total_tokens: u.total_tokens.unwrap_or(0),
            }
        } else if let Some(u) = &self.gemini_usage {
            UsageMetadata {
                prompt_tokens: u.prompt_token_count.unwrap_or(0),
                completion_tokens: u.candidates_token_count.unwrap_or(0),
                total_tokens: u.total_token_count.unwrap_or(0),
            }
        } else {
            UsageMetadata::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    total_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<usize>,
    candidates_token_count: Option<usize>,
    total_token_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    data: Vec<ListedModel>,
}

#[derive(Debug, Deserialize)]
struct ListedModel {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_chat_reply() {
        let body = r#"{"model": "m", "choices": [{"message": {"role": "assistant", "content": " [1, 2] "}}],
                       "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}}"#;
        let (content, usage, model) = read_reply(body).unwrap();
        assert_eq!(content, "[1, 2]");
        assert_eq!(usage.total_tokens, 5);
        assert_eq!(model.as_deref(), Some("m"));
    }

    #[test]
    fn reads_gemini_reply() {
        let body = r#"{"candidates": [{"content": {"parts": [{"text": "[4]"}], "role": "model"}}],
                       "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 1, "totalTokenCount": 8}}"#;
        let (content, usage, _) = read_reply(body).unwrap();
        assert_eq!(content, "[4]");
        assert_eq!(usage.prompt_tokens, 7);
    }

    #[test]
    fn in_band_error_is_reported() {
        let body = r#"{"error": {"message": "model not found", "code": 404}}"#;
        assert_eq!(
            read_reply(body).unwrap_err(),
            ProviderError::Reported("model not found".to_string())
        );
        let body = r#"{"error": "busy"}"#;
        assert_eq!(read_reply(body).unwrap_err(), ProviderError::Reported("busy".to_string()));
    }

    #[test]
    fn empty_envelope_is_reported() {
        assert!(matches!(
            read_reply(r#"{"choices": []}"#),
            Err(ProviderError::Reported(_))
        ));
    }

    #[test]
    fn unknown_bodies_pass_through() {
        let (content, _, _) = read_reply("Here you go: [1, 3]").unwrap();
        assert_eq!(content, "Here you go: [1, 3]");
        let (content, _, _) = read_reply("[5, 6]").unwrap();
        assert_eq!(content, "[5, 6]");
    }
}
