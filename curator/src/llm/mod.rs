use std::sync::Arc;

use anyhow::Result;
use common::Config;
use serde::{Deserialize, Serialize};

pub mod remote;

/// Core trait for model providers. One instance talks to one model.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier sent with every request
    fn model(&self) -> &str;

    /// Issue a single completion request. No retries happen at this level.
    async fn generate(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, ProviderError>;
}

/// Request structure for LLM generation
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl UsageMetadata {
    pub fn add(&mut self, other: &UsageMetadata) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Failure of a single provider exchange, classified for the retry policy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited (HTTP 429): {0}")]
    RateLimited(String),
    #[error("server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },
    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    /// HTTP 200 whose body carries an error object instead of content
    #[error("provider reported an error: {0}")]
    Reported(String),
}

impl ProviderError {
    /// Map a non-success HTTP status to the matching error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ProviderError::RateLimited(body),
            s if s >= 500 => ProviderError::Server { status: s, body },
            s => ProviderError::Api { status: s, body },
        }
    }
}

/// Create the provider for one model from configuration.
pub fn create_llm_provider(
    config: &Config,
    provider_key: &str,
    model: &str,
    temperature: f32,
) -> Result<Arc<dyn LlmProvider>> {
    let provider_config = config.provider(provider_key)?;
    let api_key = config.api_key(provider_key)?;
    let timeout_secs = provider_config.timeout_seconds.unwrap_or(90);

    let provider = remote::RemoteLlmProvider::new(provider_config.api_url.clone(), api_key, model)
        .with_style(provider_config.style)
        .with_defaults(timeout_secs, None, temperature);
    Ok(Arc::new(provider))
}
