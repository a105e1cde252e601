//! Check which model ids a configured provider actually serves.
//!
//! Lists `/models`, reports whether the requested ids are advertised, then
//! sends a one-line chat to each candidate id until one answers.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use common::Config;
use tracing_subscriber::{fmt, EnvFilter};

use curator::llm::remote::RemoteLlmProvider;
use curator::llm::{LlmProvider, LlmRequest, ProviderError};

#[derive(Parser, Debug)]
#[command(name = "probe_provider", about = "Probe a configured model provider")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Provider key from the [providers] table
    #[arg(long)]
    provider: String,

    /// Model ids to try, in order
    #[arg(long = "model")]
    models: Vec<String>,

    /// Suggest listed ids containing this substring when a model is not advertised
    #[arg(long)]
    filter: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let default_path = PathBuf::from("config.default.toml");
    let config = Config::load_with_defaults(Some(default_path.as_path()), args.config.as_deref()).await?;
    let provider_config = config.provider(&args.provider)?;
    let api_key = config.api_key(&args.provider)?;

    println!("\n{}", "=".repeat(60));
    println!("Provider: {}", args.provider);
    println!("Endpoint: {}", provider_config.api_url);
    println!("{}", "=".repeat(60));

    let lister = RemoteLlmProvider::new(&provider_config.api_url, &api_key, "")
        .with_style(provider_config.style);
    let listed = match lister.list_models().await {
        Ok(ids) => {
            println!("\n[1] /models advertises {} ids", ids.len());
            for id in ids.iter().take(50) {
                println!("    - {}", id);
            }
            ids
        }
        Err(e) => {
            println!("\n[1] could not list models: {:#}", e);
            Vec::new()
        }
    };

    let mut to_try = args.models.clone();
    for model in &args.models {
        if listed.iter().any(|id| id == model) {
            println!("    ✓ {} is advertised", model);
            continue;
        }
        println!("    ✗ {} is not advertised", model);
        if let Some(suggestion) = args
            .filter
            .as_deref()
            .and_then(|f| listed.iter().find(|id| id.contains(f)))
        {
            println!("      suggestion: {}", suggestion);
            to_try.push(suggestion.clone());
        }
    }

    println!("\n[2] test chat");
    let request = LlmRequest {
        prompt: "Reply with the single word: ok".to_string(),
        max_tokens: Some(16),
        temperature: Some(0.0),
        timeout_seconds: Some(30),
        ..LlmRequest::default()
    };

    for model in &to_try {
        let provider = RemoteLlmProvider::new(&provider_config.api_url, &api_key, model)
            .with_style(provider_config.style);
        match provider.generate(&request).await {
            Ok(response) => {
                println!("    ✓ {} answered: {}", model, response.content.trim());
                return Ok(());
            }
            Err(ProviderError::Reported(message)) => {
                println!("    ✗ {} returned an error body with HTTP 200: {}", model, message);
            }
            Err(e) => println!("    ✗ {} failed: {}", model, e),
        }
    }

    anyhow::bail!("no model id answered for provider '{}'", args.provider)
}
