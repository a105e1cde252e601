//! Bounded-retry model calls.
//!
//! Every model request in a run goes through `RetryingClient`, so backoff
//! behavior is identical across providers. A call never fails the run: when
//! retries are exhausted or the provider rejects the request outright the
//! caller gets an empty report and the model simply abstains.

use std::sync::Arc;
use std::time::Duration;

use common::RetryConfig;
use tracing::{debug, warn};

use crate::decision::{parse_decisions, Decision};
use crate::extract::{extract_reply, ParsedReply};
use crate::llm::{LlmProvider, LlmRequest, ProviderError, UsageMetadata};

/// Why an attempt did not produce a usable reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimited,
    TransientServer,
    Network,
    /// HTTP 200 but no usable JSON (or an in-band error)
    Unparseable,
    NonRetryable,
}

impl FailureClass {
    fn of(error: &ProviderError) -> Self {
        match error {
            ProviderError::RateLimited(_) => FailureClass::RateLimited,
            ProviderError::Server { .. } => FailureClass::TransientServer,
            ProviderError::Network(_) => FailureClass::Network,
            ProviderError::Reported(_) => FailureClass::Unparseable,
            ProviderError::Api { .. } => FailureClass::NonRetryable,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureClass::RateLimited => "rate limited",
            FailureClass::TransientServer => "server error",
            FailureClass::Network => "network error",
            FailureClass::Unparseable => "unparseable reply",
            FailureClass::NonRetryable => "non-retryable API error",
        };
        f.write_str(label)
    }
}

/// Backoff schedule, one delay rule per failure class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_base: Duration,
    pub server_error_delay: Duration,
    pub network_delay: Duration,
    pub soft_failure_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            rate_limit_base: Duration::from_secs(config.rate_limit_base_seconds),
            server_error_delay: Duration::from_secs(config.server_error_delay_seconds),
            network_delay: Duration::from_secs(config.network_delay_seconds),
            soft_failure_delay: Duration::from_secs(config.soft_failure_delay_seconds),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before retrying after `class` on 0-based `attempt`, or `None`
    /// when the call must stop.
    pub fn delay_for(&self, class: FailureClass, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        match class {
            FailureClass::RateLimited => Some(self.rate_limit_base.saturating_mul(2u32.saturating_pow(attempt))),
            FailureClass::TransientServer => Some(self.server_error_delay),
            FailureClass::Network => Some(self.network_delay),
            FailureClass::Unparseable => Some(self.soft_failure_delay),
            FailureClass::NonRetryable => None,
        }
    }
}

/// Outcome of one logical call (all attempts)
#[derive(Debug, Clone)]
pub struct CallReport<T> {
    pub value: Option<T>,
    pub attempts: u32,
    pub backoff: Duration,
    /// Class of the last failed attempt when `value` is `None`
    pub failure: Option<FailureClass>,
    pub usage: UsageMetadata,
}

impl<T> CallReport<T> {
    fn new() -> Self {
        Self {
            value: None,
            attempts: 0,
            backoff: Duration::ZERO,
            failure: None,
            usage: UsageMetadata::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.value.is_some()
    }
}

/// A provider bound to a retry policy
#[derive(Clone)]
pub struct RetryingClient {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Ask for a selection and return the decisions found in the reply.
    /// An exhausted or rejected call yields an empty list.
    pub async fn call(&self, request: &LlmRequest) -> CallReport<Vec<Decision>> {
        self.call_with(request, |reply| {
            reply.into_list().map(|items| parse_decisions(&items))
        })
        .await
    }

    /// Run the retry loop, accepting the first reply `interpret` can make sense of.
    /// A reply `interpret` rejects counts as an unparseable attempt.
    pub async fn call_with<T, F>(&self, request: &LlmRequest, interpret: F) -> CallReport<T>
    where
        F: Fn(ParsedReply) -> Option<T>,
    {
        let mut report = CallReport::new();

        for attempt in 0..self.policy.max_attempts {
            report.attempts = attempt + 1;

            let class = match self.provider.generate(request).await {
                Ok(response) => {
                    report.usage.add(&response.usage);
                    match extract_reply(&response.content).ok().and_then(&interpret) {
                        Some(value) => {
                            report.value = Some(value);
                            report.failure = None;
                            return report;
                        }
                        None => {
                            debug!(
                                model = %self.model(),
                                attempt = attempt + 1,
                                "reply could not be interpreted: {}",
                                preview(&response.content)
                            );
                            FailureClass::Unparseable
                        }
                    }
                }
                Err(e) => {
                    let class = FailureClass::of(&e);
                    warn!(
                        model = %self.model(),
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        "model call failed: {}",
                        e
                    );
                    class
                }
            };

            report.failure = Some(class);
            match self.policy.delay_for(class, attempt) {
                Some(delay) => {
                    debug!(model = %self.model(), ?delay, %class, "backing off before retry");
                    report.backoff += delay;
                    tokio::time::sleep(delay).await;
                }
                None => break,
            }
        }

        warn!(
            model = %self.model(),
            attempts = report.attempts,
            failure = ?report.failure,
            "model call abandoned; treating as abstention"
        );
        report
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(200).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out
}
