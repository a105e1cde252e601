/*
curator - single-run binary
Collects recent headlines, runs the model ensemble over them and writes the
curated RSS feeds.
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use curator::candidate::{renumber, Candidate};
use curator::control::RunControl;
use curator::ingestion;
use curator::output::FeedWriter;
use curator::pipeline::{CurationReport, Curator};

#[derive(Parser, Debug)]
#[command(name = "curator", about = "Ensemble headline curator")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Read candidates from a JSON array instead of fetching feeds
    #[arg(long, value_name = "FILE")]
    candidates: Option<PathBuf>,

    /// Directory for the generated feeds
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Skip the clustering call
    #[arg(long)]
    no_clustering: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let default_path = PathBuf::from("config.default.toml");
    let override_path = match args.config.clone() {
        Some(p) => {
            if !p.exists() {
                error!(path = ?p, "specified config file not found");
                return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
            }
            Some(p)
        }
        None => Some(PathBuf::from("config.toml")).filter(|p| p.exists()),
    };

    let config = match Config::load_with_defaults(
        Some(&default_path).filter(|p| p.exists()).map(PathBuf::as_path),
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load configuration: {:#}", e);
            let writer = FeedWriter::fallback(args.output_dir.as_deref());
            if let Err(write_err) = writer.write_error(&format!("{:#}", e)).await {
                error!("failed to write error feeds: {:#}", write_err);
            }
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let writer = FeedWriter::from_config(&config.output, args.output_dir.as_deref());

    match run(&args, &config).await {
        Ok(report) => {
            writer.write_stories(&report.stories).await?;
            if report.aborted {
                warn!(
                    completed = report.rounds_completed,
                    planned = report.rounds_planned,
                    "run was cut short; feeds hold partial results"
                );
            }
            info!(
                stories = report.stories.len(),
                abstentions = report.abstentions,
                tokens = report.usage.total_tokens,
                "done"
            );
            Ok(())
        }
        Err(e) => {
            error!("run failed: {:#}", e);
            if let Err(write_err) = writer.write_error(&format!("{:#}", e)).await {
                error!("failed to write error feeds: {:#}", write_err);
            }
            Err(e)
        }
    }
}

async fn run(args: &Args, config: &Config) -> Result<CurationReport> {
    config.validate()?;
    let curator = Curator::from_config(config, !args.no_clustering)?;
    info!(
        models = config.models.len(),
        clustering = curator.clustering_enabled(),
        "ensemble ready"
    );

    let candidates = match &args.candidates {
        Some(path) => load_candidates(path).await?,
        None => ingestion::collect_candidates(&config.feeds).await?,
    };

    let control = Arc::new(RunControl::with_budget(
        config.curation.run_budget_seconds.map(Duration::from_secs),
    ));
    let ctrl_c = {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, stopping after the current step");
                control.request_stop();
            }
        })
    };

    let report = curator.curate(&candidates, &control).await;
    ctrl_c.abort();
    report
}

async fn load_candidates(path: &Path) -> Result<Vec<Candidate>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read candidates file: {}", path.display()))?;
    let mut candidates: Vec<Candidate> =
        serde_json::from_str(&data).context("Failed to parse candidates JSON")?;
    renumber(&mut candidates);
    info!(count = candidates.len(), path = %path.display(), "candidates loaded from file");
    Ok(candidates)
}
