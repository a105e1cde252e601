//! Consensus voting over per-model, per-batch decisions.
//!
//! The aggregator is the only writer of the selection map. Decisions arrive
//! as `BatchOutcome`s in call order (batch index, then model declaration
//! order); the first decision recorded for a candidate supplies its canonical
//! category and reason, and every later distinct voter is only appended to
//! the attribution list.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::decision::Decision;

/// Everything one model said about one of its batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Position of the model in the configured ensemble
    pub model_index: usize,
    pub batch_index: usize,
    /// Display name used for attribution
    pub model: String,
    pub decisions: Vec<Decision>,
}

impl BatchOutcome {
    /// Merge order: round first, then model declaration order.
    pub fn order_key(&self) -> (usize, usize) {
        (self.batch_index, self.model_index)
    }
}

/// Aggregated votes for one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRecord {
    voters: Vec<String>,
    first_decision: Decision,
}

impl SelectionRecord {
    fn new(model: &str, decision: Decision) -> Self {
        Self {
            voters: vec![model.to_string()],
            first_decision: decision,
        }
    }

    /// Distinct voters in the order they voted
    pub fn voters(&self) -> &[String] {
        &self.voters
    }

    pub fn vote_count(&self) -> usize {
        self.voters.len()
    }

    pub fn first_decision(&self) -> &Decision {
        &self.first_decision
    }

    /// Returns false when `model` had already voted.
    fn add_voter(&mut self, model: &str) -> bool {
        if self.voters.iter().any(|v| v == model) {
            return false;
        }
        self.voters.push(model.to_string());
        true
    }
}

pub type SelectionMap = BTreeMap<usize, SelectionRecord>;

/// A candidate that met the consensus threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    pub candidate_id: usize,
    pub record: SelectionRecord,
}

#[derive(Debug, Default)]
pub struct ConsensusAggregator {
    records: SelectionMap,
    outcomes_seen: usize,
}

impl ConsensusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate a complete set of outcomes regardless of arrival order.
    pub fn aggregate(outcomes: &[BatchOutcome]) -> Self {
        let mut ordered: Vec<&BatchOutcome> = outcomes.iter().collect();
        ordered.sort_by_key(|o| o.order_key());
        let mut aggregator = Self::new();
        for outcome in ordered {
            aggregator.record(outcome);
        }
        aggregator
    }

    /// Record one batch outcome. Repeat votes by the same model are ignored.
    pub fn record(&mut self, outcome: &BatchOutcome) {
        self.outcomes_seen += 1;
        for decision in &outcome.decisions {
            match self.records.get_mut(&decision.candidate_id) {
                Some(record) => {
                    if !record.add_voter(&outcome.model) {
                        debug!(
                            candidate = decision.candidate_id,
                            model = %outcome.model,
                            "ignoring repeat vote"
                        );
                    }
                }
                None => {
                    self.records.insert(
                        decision.candidate_id,
                        SelectionRecord::new(&outcome.model, decision.clone()),
                    );
                }
            }
        }
    }

    /// Drain a channel of outcomes until every sender is dropped.
    pub async fn consume(mut self, mut rx: mpsc::Receiver<BatchOutcome>) -> Self {
        while let Some(outcome) = rx.recv().await {
            self.record(&outcome);
        }
        self
    }

    pub fn records(&self) -> &SelectionMap {
        &self.records
    }

    pub fn into_records(self) -> SelectionMap {
        self.records
    }

    pub fn outcomes_seen(&self) -> usize {
        self.outcomes_seen
    }

    /// Candidates with at least `threshold` distinct voters, ordered by id.
    pub fn selected(&self, threshold: usize) -> Vec<Selected> {
        select(&self.records, threshold)
    }
}

pub fn select(records: &SelectionMap, threshold: usize) -> Vec<Selected> {
    records
        .iter()
        .filter(|(_, r)| r.vote_count() >= threshold)
        .map(|(id, r)| Selected {
            candidate_id: *id,
            record: r.clone(),
        })
        .collect()
}
