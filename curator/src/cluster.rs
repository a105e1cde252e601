//! Story clustering through an auxiliary model call.
//!
//! The clustering reply is untrusted: `validate_clusters` turns whatever came
//! back into a cluster map in which every known candidate sits in exactly one
//! cluster, or reports that no clustering is available.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::candidate::Candidate;
use crate::client::RetryingClient;
use crate::extract::{coerce_int, ParsedReply};
use crate::llm::LlmRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_id: usize,
    pub main: usize,
    /// Always contains `main`; ordered as the model listed them
    pub members: Vec<usize>,
}

impl ClusterRecord {
    pub fn singleton(cluster_id: usize, id: usize) -> Self {
        Self {
            cluster_id,
            main: id,
            members: vec![id],
        }
    }

    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

/// Every id in its own cluster, cluster ids following input order.
pub fn singleton_clusters(known_ids: &[usize]) -> Vec<ClusterRecord> {
    known_ids
        .iter()
        .enumerate()
        .map(|(i, id)| ClusterRecord::singleton(i, *id))
        .collect()
}

/// Validate a clustering reply against the known candidate ids.
///
/// Returns `None` when the reply is not a (wrapped) list at all.
pub fn validate_clusters(reply: ParsedReply, known_ids: &[usize]) -> Option<Vec<ClusterRecord>> {
    let entries = reply.into_list()?;
    let known: HashSet<usize> = known_ids.iter().copied().collect();
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut used_cluster_ids: BTreeSet<usize> = BTreeSet::new();
    let mut clusters = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let Some(map) = entry.as_object() else {
            continue;
        };
        let (Some(main_value), Some(Value::Array(member_values))) = (map.get("main"), map.get("members")) else {
            continue;
        };
        let Some(main) = coerce_int(main_value) else {
            continue;
        };
        let Some(raw_members) = member_values.iter().map(coerce_int).collect::<Option<Vec<i64>>>() else {
            continue;
        };

        let mut members = Vec::with_capacity(raw_members.len());
        for id in raw_members {
            let Ok(id) = usize::try_from(id) else { continue };
            if known.contains(&id) && !claimed.contains(&id) && !members.contains(&id) {
                members.push(id);
            }
        }
        let Some(&first) = members.first() else {
            continue;
        };
        let main = usize::try_from(main)
            .ok()
            .filter(|m| members.contains(m))
            .unwrap_or(first);

        let requested = map
            .get("cluster_id")
            .and_then(coerce_int)
            .and_then(|c| usize::try_from(c).ok())
            .unwrap_or(index);
        let cluster_id = next_free(&used_cluster_ids, requested);
        used_cluster_ids.insert(cluster_id);

        claimed.extend(members.iter().copied());
        clusters.push(ClusterRecord {
            cluster_id,
            main,
            members,
        });
    }

    let mut next_id = used_cluster_ids.iter().next_back().map(|m| m + 1).unwrap_or(0);
    for id in known_ids {
        if !claimed.contains(id) {
            clusters.push(ClusterRecord::singleton(next_id, *id));
            next_id += 1;
        }
    }

    Some(clusters)
}

fn next_free(used: &BTreeSet<usize>, requested: usize) -> usize {
    let mut id = requested;
    while used.contains(&id) {
        id += 1;
    }
    id
}

/// Settings for the clustering request
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub min_similarity: f64,
    pub max_output_tokens: usize,
    pub timeout_seconds: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            min_similarity: 0.5,
            max_output_tokens: 2000,
            timeout_seconds: 120,
        }
    }
}

/// Groups selected stories with one auxiliary model call
pub struct Clusterer {
    client: RetryingClient,
    settings: ClusterSettings,
}

impl Clusterer {
    pub fn new(client: RetryingClient, settings: ClusterSettings) -> Self {
        Self { client, settings }
    }

    fn system_prompt(&self) -> String {
        let percent = (self.settings.min_similarity * 100.0).round() as i64;
        format!(
            "You are a strict clustering assistant. Input is a tab-separated list: id<TAB>title<TAB>link<TAB>description. \
             Cluster headlines that are near-duplicates or strongly about the same event/impact. \
             Only group items when similarity is approximately >= {}%. \
             Choose one main representative per cluster (prefer the clearest title). \
             Output VALID JSON only: an array of objects with fields {{\"cluster_id\":int, \"main\":id, \"members\":[ids...]}}. \
             No commentary, no markdown, no code fences.",
            percent
        )
    }

    pub fn build_request(&self, candidates: &[&Candidate]) -> LlmRequest {
        let lines: Vec<String> = candidates.iter().map(|c| c.cluster_line()).collect();
        LlmRequest {
            system: Some(self.system_prompt()),
            prompt: format!("ARTICLES:\n{}", lines.join("\n")),
            max_tokens: Some(self.settings.max_output_tokens),
            temperature: Some(0.0),
            timeout_seconds: Some(self.settings.timeout_seconds),
        }
    }

    /// Cluster the given candidates; `None` means "no clustering available".
    pub async fn cluster(&self, candidates: &[&Candidate]) -> Option<Vec<ClusterRecord>> {
        if candidates.is_empty() {
            return Some(Vec::new());
        }
        let known_ids: Vec<usize> = candidates.iter().map(|c| c.id).collect();
        let request = self.build_request(candidates);
        let report = self
            .client
            .call_with(&request, |reply| validate_clusters(reply, &known_ids))
            .await;

        match report.value {
            Some(clusters) => {
                let grouped = clusters.iter().filter(|c| !c.is_singleton()).count();
                info!(
                    model = %self.client.model(),
                    clusters = clusters.len(),
                    multi_member = grouped,
                    "clustering applied"
                );
                Some(clusters)
            }
            None => {
                warn!(
                    model = %self.client.model(),
                    failure = ?report.failure,
                    "clustering unavailable; using singleton clusters"
                );
                None
            }
        }
    }
}
