/*!
common/src/lib.rs

Shared configuration types and helpers for the headline curator.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default file with an optional override
- Validation and credential resolution, run before any network call
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Wire format spoken by a provider endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStyle {
    /// OpenAI-compatible `/chat/completions` (Groq, OpenRouter, Fyra, Mistral)
    #[default]
    OpenaiChat,
    /// Google `models/{model}:generateContent`, key passed as query parameter
    Gemini,
}

/// One model provider endpoint (`[providers.<key>]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    #[serde(default)]
    pub style: ApiStyle,
    pub timeout_seconds: Option<u64>,
}

/// One ensemble member (`[[models]]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier sent to the provider
    pub name: String,
    /// Name used for attribution in the output ("Selected by: ...")
    pub display_name: Option<String>,
    pub batch_size: usize,
    /// Key into `[providers]`
    pub provider: String,
    pub temperature: Option<f32>,
}

impl ModelConfig {
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a Chief Information Filter.
Your task is to select headlines with structural and lasting significance.
Return only a JSON array of selected IDs (e.g. [0,5,12]).";

/// Consensus / scheduling settings (`[curation]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    /// Minimum number of distinct models that must select a headline
    pub consensus_threshold: usize,
    /// Jaccard similarity at or above which two selected titles are duplicates
    pub dedupe_threshold: f64,
    pub max_rounds: usize,
    pub inter_call_pause_seconds: u64,
    pub round_pause_seconds: u64,
    /// Wall-clock budget for the model rounds; remaining rounds are skipped once spent
    pub run_budget_seconds: Option<u64>,
    /// Run calls to distinct providers concurrently within a round
    pub parallel_providers: bool,
    pub system_prompt: String,
    pub default_category: String,
    pub default_reason: String,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: 2,
            dedupe_threshold: 0.6,
            max_rounds: 20,
            inter_call_pause_seconds: 8,
            round_pause_seconds: 20,
            run_budget_seconds: None,
            parallel_providers: false,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            default_category: "BCS/Bank/GK".to_string(),
            default_reason: "Selected by multi-model consensus".to_string(),
        }
    }
}

/// Backoff settings shared by every model call (`[retry]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub rate_limit_base_seconds: u64,
    pub server_error_delay_seconds: u64,
    pub network_delay_seconds: u64,
    pub soft_failure_delay_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rate_limit_base_seconds: 30,
            server_error_delay_seconds: 10,
            network_delay_seconds: 5,
            soft_failure_delay_seconds: 2,
        }
    }
}

/// Auxiliary clustering call (`[clustering]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub min_similarity: Option<f64>,
    pub max_output_tokens: Option<usize>,
    pub timeout_seconds: Option<u64>,
    pub max_attempts: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Upstream feeds (`[feeds]`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedsConfig {
    #[serde(default)]
    pub urls: Vec<String>,
    pub recency_hours: Option<i64>,
    pub fetch_timeout_seconds: Option<u64>,
    pub max_candidates: Option<usize>,
}

/// Output files (`[output]`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dir: Option<String>,
    /// Receives headlines written in Bangla
    pub native_file: Option<String>,
    /// Receives every other headline
    pub overflow_file: Option<String>,
    pub channel_link: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub curation: CurationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub clustering: Option<ClusteringConfig>,
    #[serde(default)]
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path).await
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            anyhow::bail!("No models configured");
        }

        for (key, provider) in &self.providers {
            url::Url::parse(&provider.api_url)
                .with_context(|| format!("Provider '{}' has an invalid api_url: {}", key, provider.api_url))?;
        }

        let mut names = HashSet::new();
        let mut displays = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                anyhow::bail!("Duplicate model name: {}", model.name);
            }
            if !displays.insert(model.display()) {
                anyhow::bail!("Duplicate model display name: {}", model.display());
            }
            if model.batch_size == 0 {
                anyhow::bail!("Model '{}' has batch_size 0", model.name);
            }
            if !self.providers.contains_key(&model.provider) {
                anyhow::bail!("Model '{}' references unknown provider '{}'", model.name, model.provider);
            }
        }

        if self.curation.consensus_threshold == 0 {
            anyhow::bail!("curation.consensus_threshold must be at least 1");
        }
        let t = self.curation.dedupe_threshold;
        if !(t > 0.0 && t <= 1.0) {
            anyhow::bail!("curation.dedupe_threshold must be in (0, 1], got {}", t);
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }

        if let Some(clustering) = &self.clustering {
            if clustering.enabled && !self.providers.contains_key(&clustering.provider) {
                anyhow::bail!("Clustering references unknown provider '{}'", clustering.provider);
            }
        }

        Ok(())
    }

    pub fn provider(&self, key: &str) -> Result<&ProviderConfig> {
        self.providers
            .get(key)
            .with_context(|| format!("Unknown provider '{}'", key))
    }

    /// Read the API key for a provider from its configured environment variable.
    pub fn api_key(&self, key: &str) -> Result<String> {
        let provider = self.provider(key)?;
        std::env::var(&provider.api_key_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .with_context(|| format!("{} environment variable is missing (provider '{}')", provider.api_key_env, key))
    }

    /// Provider keys referenced by at least one model, in declaration order.
    pub fn required_providers(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.models
            .iter()
            .map(|m| m.provider.as_str())
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// Fail fast when any credential needed by the ensemble is absent.
    pub fn check_credentials(&self) -> Result<()> {
        for key in self.required_providers() {
            self.api_key(key)?;
        }
        Ok(())
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}
