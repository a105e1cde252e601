#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use curator::candidate::Candidate;
use curator::client::{RetryPolicy, RetryingClient};
use curator::llm::{LlmProvider, LlmRequest, LlmResponse, ProviderError, UsageMetadata};
use curator::scheduler::{EnsembleMember, ModelSpec};
use tokio::time::Instant;
use url::Url;

type Respond = dyn Fn(&LlmRequest) -> Result<String, ProviderError> + Send + Sync;

/// In-process provider answering from a closure and recording every call
pub struct FakeProvider {
    model: String,
    respond: Box<Respond>,
    calls: Mutex<Vec<(Instant, String)>>,
}

impl FakeProvider {
    pub fn new<F>(model: &str, respond: F) -> Arc<Self>
    where
        F: Fn(&LlmRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            model: model.to_string(),
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Replies in order; once the script runs out every call gets a 500.
    pub fn scripted(model: &str, replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        let script = Mutex::new(VecDeque::from(replies));
        Self::new(model, move |_| {
            script.lock().unwrap().pop_front().unwrap_or_else(|| {
                Err(ProviderError::Server {
                    status: 500,
                    body: "script exhausted".to_string(),
                })
            })
        })
    }

    /// Selects every prompt line whose title contains one of `keywords`.
    pub fn selecting(model: &str, keywords: &[&str]) -> Arc<Self> {
        let keywords: Vec<String> = keywords.iter().map(|k| k.to_string()).collect();
        Self::new(model, move |request| {
            let ids: Vec<String> = request
                .prompt
                .lines()
                .filter_map(|line| {
                    let (id, title) = line.split_once(": ")?;
                    keywords
                        .iter()
                        .any(|k| title.contains(k.as_str()))
                        .then(|| id.to_string())
                })
                .collect();
            Ok(format!("[{}]", ids.join(", ")))
        })
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl LlmProvider for FakeProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), request.prompt.clone()));
        let content = (self.respond)(request)?;
        Ok(LlmResponse {
            content,
            usage: UsageMetadata {
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
            },
            model: self.model.clone(),
        })
    }
}

pub fn rate_limited() -> Result<String, ProviderError> {
    Err(ProviderError::RateLimited("429 Too Many Requests".to_string()))
}

pub fn candidates(titles: &[&str]) -> Vec<Candidate> {
    titles
        .iter()
        .enumerate()
        .map(|(id, title)| Candidate {
            id,
            title: title.to_string(),
            link: Url::parse(&format!("https://news.example.com/{}", id)).unwrap(),
            description: format!("{} (full story)", title),
            published_at: Utc::now(),
        })
        .collect()
}

pub fn member(provider: Arc<FakeProvider>, provider_key: &str, batch_size: usize) -> EnsembleMember {
    let name = provider.model().to_string();
    EnsembleMember {
        spec: ModelSpec {
            name: name.clone(),
            display_name: name,
            batch_size,
            provider: provider_key.to_string(),
        },
        client: RetryingClient::new(provider, RetryPolicy::default()),
    }
}
