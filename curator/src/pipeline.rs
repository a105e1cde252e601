//! End-to-end curation of one candidate list.

use std::collections::HashMap;

use anyhow::{ensure, Result};
use common::Config;
use serde::Serialize;
use tracing::{info, warn};

use crate::candidate::Candidate;
use crate::client::{RetryPolicy, RetryingClient};
use crate::cluster::{singleton_clusters, ClusterRecord, ClusterSettings, Clusterer};
use crate::consensus::{select, Selected};
use crate::control::RunControl;
use crate::dedupe::dedupe;
use crate::llm::{create_llm_provider, UsageMetadata};
use crate::scheduler::{BatchScheduler, EnsembleMember, ModelSpec, SchedulerSettings};

/// A selected candidate with its pipeline annotations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CuratedItem {
    pub candidate: Candidate,
    pub category: String,
    pub reason: String,
    pub selected_by: Vec<String>,
    pub cluster_id: usize,
}

impl AsRef<Candidate> for CuratedItem {
    fn as_ref(&self) -> &Candidate {
        &self.candidate
    }
}

/// One output entry: the cluster's main item plus the other members
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CuratedStory {
    pub cluster_id: usize,
    pub main: CuratedItem,
    pub related: Vec<CuratedItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClusteringStatus {
    Applied,
    /// The clustering call failed or returned nothing usable
    Unavailable,
    /// Not configured, turned off, or missing credentials
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurationReport {
    pub stories: Vec<CuratedStory>,
    pub candidates: usize,
    pub consensus_selected: usize,
    pub after_dedupe: usize,
    pub clustering: ClusteringStatus,
    pub rounds_planned: usize,
    pub rounds_completed: usize,
    pub truncated: bool,
    pub aborted: bool,
    pub abstentions: usize,
    pub usage: UsageMetadata,
}

impl CurationReport {
    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }

    /// All curated items, main items first within each story.
    pub fn items(&self) -> impl Iterator<Item = &CuratedItem> {
        self.stories
            .iter()
            .flat_map(|s| std::iter::once(&s.main).chain(s.related.iter()))
    }
}

#[derive(Debug, Clone)]
pub struct CurationSettings {
    pub consensus_threshold: usize,
    pub dedupe_threshold: f64,
    pub default_category: String,
    pub default_reason: String,
}

impl CurationSettings {
    pub fn from_config(config: &common::CurationConfig) -> Self {
        Self {
            consensus_threshold: config.consensus_threshold,
            dedupe_threshold: config.dedupe_threshold,
            default_category: config.default_category.clone(),
            default_reason: config.default_reason.clone(),
        }
    }
}

impl Default for CurationSettings {
    fn default() -> Self {
        Self::from_config(&common::CurationConfig::default())
    }
}

pub struct Curator {
    scheduler: BatchScheduler,
    clusterer: Option<Clusterer>,
    settings: CurationSettings,
}

impl Curator {
    pub fn new(scheduler: BatchScheduler, clusterer: Option<Clusterer>, settings: CurationSettings) -> Self {
        Self {
            scheduler,
            clusterer,
            settings,
        }
    }

    /// Build the ensemble from configuration.
    ///
    /// Fails when a credential needed by any model is missing. A missing
    /// clustering credential only disables clustering.
    pub fn from_config(config: &Config, clustering_enabled: bool) -> Result<Self> {
        config.check_credentials()?;
        let policy = RetryPolicy::from_config(&config.retry);

        let mut members = Vec::with_capacity(config.models.len());
        for model in &config.models {
            let provider = create_llm_provider(
                config,
                &model.provider,
                &model.name,
                model.temperature.unwrap_or(0.3),
            )?;
            members.push(EnsembleMember {
                spec: ModelSpec {
                    name: model.name.clone(),
                    display_name: model.display().to_string(),
                    batch_size: model.batch_size,
                    provider: model.provider.clone(),
                },
                client: RetryingClient::new(provider, policy.clone()),
            });
        }

        let clusterer = match config.clustering.as_ref() {
            Some(c) if clustering_enabled && c.enabled => {
                match create_llm_provider(config, &c.provider, &c.model, 0.0) {
                    Ok(provider) => {
                        let defaults = ClusterSettings::default();
                        let settings = ClusterSettings {
                            min_similarity: c.min_similarity.unwrap_or(defaults.min_similarity),
                            max_output_tokens: c.max_output_tokens.unwrap_or(defaults.max_output_tokens),
                            timeout_seconds: c.timeout_seconds.unwrap_or(defaults.timeout_seconds),
                        };
                        let client = RetryingClient::new(
                            provider,
                            policy.clone().with_max_attempts(c.max_attempts.unwrap_or(1)),
                        );
                        Some(Clusterer::new(client, settings))
                    }
                    Err(e) => {
                        warn!("clustering disabled: {:#}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(Self::new(
            BatchScheduler::new(members, SchedulerSettings::from_config(&config.curation)),
            clusterer,
            CurationSettings::from_config(&config.curation),
        ))
    }

    pub fn clustering_enabled(&self) -> bool {
        self.clusterer.is_some()
    }

    /// Run the ensemble over `candidates`, whose ids must match their positions.
    pub async fn curate(&self, candidates: &[Candidate], control: &RunControl) -> Result<CurationReport> {
        ensure!(
            candidates.iter().enumerate().all(|(i, c)| c.id == i),
            "candidate ids must be dense and match list positions"
        );

        let schedule = self.scheduler.run(candidates, control).await?;
        let selected = select(&schedule.selections, self.settings.consensus_threshold);
        let consensus_selected = selected.len();
        if selected.is_empty() {
            info!("no candidate reached consensus");
        }

        let items: Vec<CuratedItem> = selected
            .into_iter()
            .map(|s| self.annotate(s, candidates))
            .collect();
        let items = dedupe(items, self.settings.dedupe_threshold);
        let after_dedupe = items.len();

        let (clusters, clustering) = self.cluster(&items, control).await;
        let stories = assemble(items, clusters);

        info!(
            candidates = candidates.len(),
            consensus = consensus_selected,
            kept = after_dedupe,
            stories = stories.len(),
            clustering = ?clustering,
            "curation finished"
        );

        Ok(CurationReport {
            stories,
            candidates: candidates.len(),
            consensus_selected,
            after_dedupe,
            clustering,
            rounds_planned: schedule.rounds_planned,
            rounds_completed: schedule.rounds_completed,
            truncated: schedule.truncated,
            aborted: schedule.aborted,
            abstentions: schedule.abstentions(),
            usage: schedule.usage,
        })
    }

    fn annotate(&self, selected: Selected, candidates: &[Candidate]) -> CuratedItem {
        let decision = selected.record.first_decision();
        CuratedItem {
            candidate: candidates[selected.candidate_id].clone(),
            category: decision
                .category
                .clone()
                .unwrap_or_else(|| self.settings.default_category.clone()),
            reason: decision
                .reason
                .clone()
                .unwrap_or_else(|| self.settings.default_reason.clone()),
            selected_by: selected.record.voters().to_vec(),
            cluster_id: 0,
        }
    }

    async fn cluster(&self, items: &[CuratedItem], control: &RunControl) -> (Vec<ClusterRecord>, ClusteringStatus) {
        let ids: Vec<usize> = items.iter().map(|i| i.candidate.id).collect();
        let Some(clusterer) = &self.clusterer else {
            return (singleton_clusters(&ids), ClusteringStatus::Disabled);
        };
        if items.is_empty() {
            return (Vec::new(), ClusteringStatus::Applied);
        }

        let refs: Vec<&Candidate> = items.iter().map(|i| &i.candidate).collect();
        match control.guard(clusterer.cluster(&refs)).await.flatten() {
            Some(clusters) => (clusters, ClusteringStatus::Applied),
            None => (singleton_clusters(&ids), ClusteringStatus::Unavailable),
        }
    }
}

/// Attach items to their clusters; stories follow the main item's id.
fn assemble(items: Vec<CuratedItem>, clusters: Vec<ClusterRecord>) -> Vec<CuratedStory> {
    let mut by_id: HashMap<usize, CuratedItem> = items.into_iter().map(|i| (i.candidate.id, i)).collect();
    let mut stories = Vec::with_capacity(clusters.len());

    for cluster in clusters {
        let Some(mut main) = by_id.remove(&cluster.main) else {
            continue;
        };
        main.cluster_id = cluster.cluster_id;
        let related = cluster
            .members
            .iter()
            .filter(|id| **id != cluster.main)
            .filter_map(|id| by_id.remove(id))
            .map(|mut item| {
                item.cluster_id = cluster.cluster_id;
                item
            })
            .collect();
        stories.push(CuratedStory {
            cluster_id: cluster.cluster_id,
            main,
            related,
        });
    }

    stories.sort_by_key(|s| s.main.candidate.id);
    stories
}
