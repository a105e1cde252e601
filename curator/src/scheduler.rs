//! Round-based batching of candidates across the model ensemble.
//!
//! Each model splits the candidate list into contiguous batches of its own
//! size. Round `k` sends batch `k` of every model that has one, in declaration
//! order, pausing between calls and between rounds so the shared provider
//! rate budgets are respected. Results stream to a single aggregator task.

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::Duration;

use anyhow::{Context, Result};
use common::CurationConfig;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::candidate::Candidate;
use crate::client::{FailureClass, RetryingClient};
use crate::consensus::{BatchOutcome, ConsensusAggregator, SelectionMap};
use crate::control::RunControl;
use crate::llm::{LlmRequest, UsageMetadata};

/// Static description of one ensemble member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub display_name: String,
    pub batch_size: usize,
    /// Provider key; members sharing it share a rate budget
    pub provider: String,
}

/// A model spec bound to the client that calls it
#[derive(Clone)]
pub struct EnsembleMember {
    pub spec: ModelSpec,
    pub client: RetryingClient,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_rounds: usize,
    pub inter_call_pause: Duration,
    pub round_pause: Duration,
    pub parallel_providers: bool,
    pub system_prompt: String,
    /// Overrides each provider's configured temperature when set
    pub temperature: Option<f32>,
}

impl SchedulerSettings {
    pub fn from_config(config: &CurationConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            inter_call_pause: Duration::from_secs(config.inter_call_pause_seconds),
            round_pause: Duration::from_secs(config.round_pause_seconds),
            parallel_providers: config.parallel_providers,
            system_prompt: config.system_prompt.clone(),
            temperature: None,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&CurationConfig::default())
    }
}

/// Contiguous batch ranges of `len` items for a given batch size.
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let size = batch_size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Per-model batch ranges for one candidate list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub batches: Vec<Vec<Range<usize>>>,
    /// Rounds the slowest model would need
    pub rounds_needed: usize,
    /// Rounds that will actually run
    pub rounds: usize,
}

impl BatchPlan {
    pub fn new(candidate_count: usize, specs: &[ModelSpec], max_rounds: usize) -> Self {
        let batches: Vec<Vec<Range<usize>>> = specs
            .iter()
            .map(|s| partition(candidate_count, s.batch_size))
            .collect();
        let rounds_needed = batches.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            rounds: rounds_needed.min(max_rounds),
            rounds_needed,
            batches,
        }
    }

    pub fn truncated(&self) -> bool {
        self.rounds < self.rounds_needed
    }

    /// `(model index, batch range)` pairs scheduled in round `k`, in declaration order.
    pub fn round(&self, k: usize) -> Vec<(usize, Range<usize>)> {
        self.batches
            .iter()
            .enumerate()
            .filter_map(|(m, b)| b.get(k).map(|r| (m, r.clone())))
            .collect()
    }
}

/// One model call as seen by the run report
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub model: String,
    pub batch_index: usize,
    pub batch_len: usize,
    pub attempts: u32,
    pub decisions: usize,
    pub discarded: usize,
    pub failure: Option<FailureClass>,
}

/// Result of driving every round
#[derive(Debug, Clone, Default)]
pub struct ScheduleReport {
    pub selections: SelectionMap,
    pub rounds_planned: usize,
    pub rounds_needed: usize,
    pub rounds_completed: usize,
    /// Rounds beyond `max_rounds` were skipped
    pub truncated: bool,
    /// The run budget or a stop request cut the rounds short
    pub aborted: bool,
    pub calls: Vec<CallSummary>,
    pub usage: UsageMetadata,
}

impl ScheduleReport {
    pub fn abstentions(&self) -> usize {
        self.calls.iter().filter(|c| c.failure.is_some()).count()
    }
}

pub struct BatchScheduler {
    members: Vec<EnsembleMember>,
    settings: SchedulerSettings,
}

struct CallResult {
    outcome: BatchOutcome,
    summary: CallSummary,
    usage: UsageMetadata,
}

impl BatchScheduler {
    pub fn new(members: Vec<EnsembleMember>, settings: SchedulerSettings) -> Self {
        Self { members, settings }
    }

    pub fn plan(&self, candidate_count: usize) -> BatchPlan {
        let specs: Vec<ModelSpec> = self.members.iter().map(|m| m.spec.clone()).collect();
        BatchPlan::new(candidate_count, &specs, self.settings.max_rounds)
    }

    /// Drive all rounds and return the aggregated selection map.
    pub async fn run(&self, candidates: &[Candidate], control: &RunControl) -> Result<ScheduleReport> {
        let plan = self.plan(candidates.len());
        let mut report = ScheduleReport {
            rounds_planned: plan.rounds,
            rounds_needed: plan.rounds_needed,
            truncated: plan.truncated(),
            ..ScheduleReport::default()
        };

        if plan.truncated() {
            warn!(
                needed = plan.rounds_needed,
                cap = plan.rounds,
                "round cap reached; later batches will not be sent"
            );
        }
        info!(
            candidates = candidates.len(),
            models = self.members.len(),
            rounds = plan.rounds,
            parallel = self.settings.parallel_providers,
            "starting model rounds"
        );

        let (tx, rx) = mpsc::channel::<BatchOutcome>(self.members.len().max(1) * 2);
        let aggregator = tokio::spawn(ConsensusAggregator::new().consume(rx));

        for k in 0..plan.rounds {
            if control.is_stopped() {
                report.aborted = true;
                break;
            }

            let scheduled = plan.round(k);
            let last_round = k + 1 == plan.rounds;
            let (mut results, interrupted) = if self.settings.parallel_providers {
                self.run_round_parallel(k, last_round, scheduled, candidates, control).await
            } else {
                self.run_round_sequential(k, last_round, scheduled, candidates, control).await
            };
            results.sort_by_key(|r| r.outcome.order_key());

            for result in results {
                report.usage.add(&result.usage);
                report.calls.push(result.summary);
                tx.send(result.outcome)
                    .await
                    .context("aggregator stopped before the run finished")?;
            }

            if interrupted {
                report.aborted = true;
                break;
            }
            report.rounds_completed += 1;
            info!(round = k + 1, of = plan.rounds, "round complete");

            if !last_round && !control.pause(self.settings.round_pause).await {
                report.aborted = true;
                break;
            }
        }

        drop(tx);
        let aggregator = aggregator.await.context("aggregator task failed")?;
        report.selections = aggregator.into_records();

        if report.aborted {
            warn!(
                completed = report.rounds_completed,
                planned = report.rounds_planned,
                "run stopped early; keeping partial results"
            );
        }
        Ok(report)
    }

    async fn run_round_sequential(
        &self,
        k: usize,
        last_round: bool,
        scheduled: Vec<(usize, Range<usize>)>,
        candidates: &[Candidate],
        control: &RunControl,
    ) -> (Vec<CallResult>, bool) {
        let mut results = Vec::with_capacity(scheduled.len());
        let last = scheduled.len().saturating_sub(1);
        for (i, (m, range)) in scheduled.into_iter().enumerate() {
            let member = &self.members[m];
            let Some(result) = control
                .guard(call_batch(member, m, k, &candidates[range], candidates.len(), &self.settings))
                .await
            else {
                return (results, true);
            };
            results.push(result);

            if i < last {
                if !control.pause(self.settings.inter_call_pause).await {
                    return (results, true);
                }
            } else if !last_round {
                // stop here still leaves the round complete
                control.pause(self.settings.inter_call_pause).await;
            }
        }
        (results, false)
    }

    /// Members sharing a provider run one after another; provider groups run concurrently.
    async fn run_round_parallel(
        &self,
        k: usize,
        last_round: bool,
        scheduled: Vec<(usize, Range<usize>)>,
        candidates: &[Candidate],
        control: &RunControl,
    ) -> (Vec<CallResult>, bool) {
        let mut groups: BTreeMap<String, Vec<(usize, Range<usize>)>> = BTreeMap::new();
        for (m, range) in scheduled {
            groups
                .entry(self.members[m].spec.provider.clone())
                .or_default()
                .push((m, range));
        }

        let mut set = JoinSet::new();
        for (_, group) in groups {
            let jobs: Vec<(EnsembleMember, usize, Vec<Candidate>)> = group
                .into_iter()
                .map(|(m, range)| (self.members[m].clone(), m, candidates[range].to_vec()))
                .collect();
            let settings = self.settings.clone();
            let total = candidates.len();
            set.spawn(async move {
                let mut out = Vec::with_capacity(jobs.len());
                let last = jobs.len().saturating_sub(1);
                for (i, (member, m, batch)) in jobs.into_iter().enumerate() {
                    out.push(call_batch(&member, m, k, &batch, total, &settings).await);
                    if i < last {
                        tokio::time::sleep(settings.inter_call_pause).await;
                    }
                }
                out
            });
        }

        let mut results = Vec::new();
        let collected = control
            .guard(async {
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(batch) => results.extend(batch),
                        Err(e) => warn!("provider group task failed: {}", e),
                    }
                }
            })
            .await;

        if collected.is_none() {
            set.abort_all();
            return (results, true);
        }
        if !last_round {
            control.pause(self.settings.inter_call_pause).await;
        }
        (results, false)
    }
}

/// Send one batch to one model and validate what comes back.
async fn call_batch(
    member: &EnsembleMember,
    model_index: usize,
    batch_index: usize,
    batch: &[Candidate],
    candidate_count: usize,
    settings: &SchedulerSettings,
) -> CallResult {
    let lines: Vec<String> = batch.iter().map(Candidate::prompt_line).collect();
    let request = LlmRequest {
        system: Some(settings.system_prompt.clone()),
        prompt: lines.join("\n"),
        temperature: settings.temperature,
        ..LlmRequest::default()
    };

    debug!(
        model = %member.spec.display_name,
        batch = batch_index,
        size = batch.len(),
        "sending batch"
    );
    let report = member.client.call(&request).await;

    let mut decisions = report.value.unwrap_or_default();
    let returned = decisions.len();
    decisions.retain(|d| d.candidate_id < candidate_count);
    let discarded = returned - decisions.len();
    if discarded > 0 {
        debug!(
            model = %member.spec.display_name,
            discarded,
            "discarded decisions with out-of-range ids"
        );
    }

    info!(
        model = %member.spec.display_name,
        batch = batch_index,
        selected = decisions.len(),
        attempts = report.attempts,
        "batch finished"
    );

    CallResult {
        summary: CallSummary {
            model: member.spec.display_name.clone(),
            batch_index,
            batch_len: batch.len(),
            attempts: report.attempts,
            decisions: decisions.len(),
            discarded,
            failure: report.failure,
        },
        outcome: BatchOutcome {
            model_index,
            batch_index,
            model: member.spec.display_name.clone(),
            decisions,
        },
        usage: report.usage,
    }
}
