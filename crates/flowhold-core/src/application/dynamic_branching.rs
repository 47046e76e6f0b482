//! Dynamic branch generator
//!
//! Expands one step into a runtime-computed set of child branches and
//! aggregates their outcomes in index order. Running a single branch is
//! delegated to a [`BranchRunner`], which the flow scheduler implements.

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use crate::domain::branching::{
    AggregationPolicy, BranchFactory, BranchItems, DataSelector, DynamicBranchingConfig,
    ExecutionStrategy,
};
use crate::domain::execution_context::{BranchFrame, ExecutionContext};
use crate::domain::step::BranchDefinition;
use crate::{DataPacket, EngineError, RunId, StepId};

/// Terminal state of one child branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchStatus {
    /// Every step of the branch finished
    Completed,
    /// A step failed
    Failed(String),
    /// The branch paused and timed out
    Expired,
    /// The branch was cancelled
    Cancelled,
    /// The branch never started
    Skipped,
}

impl BranchStatus {
    /// Whether the branch finished successfully
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, BranchStatus::Completed)
    }

    /// Status name
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Completed => "completed",
            BranchStatus::Failed(_) => "failed",
            BranchStatus::Expired => "expired",
            BranchStatus::Cancelled => "cancelled",
            BranchStatus::Skipped => "skipped",
        }
    }
}

/// What a runner reports back for one branch
#[derive(Debug, Clone, PartialEq)]
pub struct BranchReport {
    /// Terminal state
    pub status: BranchStatus,
    /// Child variables at the end of the branch
    pub variables: HashMap<String, DataPacket>,
}

impl BranchReport {
    /// Report with no variables
    pub fn status_only(status: BranchStatus) -> Self {
        Self {
            status,
            variables: HashMap::new(),
        }
    }
}

/// Executes one child branch to a terminal state
#[async_trait]
pub trait BranchRunner: Send + Sync {
    /// Run `branch` with the forked `context` until it completes, fails,
    /// expires or `cancel` fires. The branch may pause along the way.
    async fn run_branch(
        &self,
        context: ExecutionContext,
        branch: BranchDefinition,
        cancel: CancellationToken,
    ) -> BranchReport;
}

/// Outcome of one item
#[derive(Debug, Clone, PartialEq)]
pub struct BranchOutcome {
    /// Item index
    pub index: usize,
    /// Child run id
    pub run_id: RunId,
    /// Item the branch was built from
    pub item: DataPacket,
    /// Terminal state
    pub status: BranchStatus,
    /// Variables the branch added or changed
    pub output: DataPacket,
}

/// Aggregated fan-out result, in index order
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutResult {
    /// Per-item outcomes
    pub outcomes: Vec<BranchOutcome>,
    /// Highest number of branches in flight at once
    pub peak_concurrency: usize,
}

impl FanOutResult {
    /// Whether the parent step succeeds under `policy`
    pub fn succeeded(&self, policy: AggregationPolicy) -> bool {
        match policy {
            AggregationPolicy::AbortOnFirstFailure => {
                self.outcomes.iter().all(|o| o.status.is_success())
            }
            AggregationPolicy::BestEffort => true,
        }
    }

    /// First branch that did not complete, skipped branches aside
    pub fn first_failure(&self) -> Option<&BranchOutcome> {
        self.outcomes
            .iter()
            .find(|o| !o.status.is_success() && o.status != BranchStatus::Skipped)
    }

    /// Number of completed branches
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }

    /// Results as a packet for the parent context
    pub fn to_packet(&self) -> DataPacket {
        let results: Vec<Value> = self
            .outcomes
            .iter()
            .map(|o| {
                let mut entry = json!({
                    "index": o.index,
                    "runId": o.run_id.0,
                    "item": o.item.value,
                    "status": o.status.as_str(),
                    "output": o.output.value,
                });
                if let BranchStatus::Failed(reason) = &o.status {
                    entry["error"] = Value::String(reason.clone());
                }
                entry
            })
            .collect();
        DataPacket::new(Value::Array(results))
    }
}

/// Produces and drives the child branches of a fan-out step
#[derive(Debug, Clone)]
pub struct DynamicBranchGenerator {
    default_max_concurrency: usize,
}

impl Default for DynamicBranchGenerator {
    fn default() -> Self {
        Self::new(crate::domain::branching::DEFAULT_MAX_CONCURRENCY)
    }
}

impl DynamicBranchGenerator {
    /// Generator using `default_max_concurrency` when a step sets zero
    pub fn new(default_max_concurrency: usize) -> Self {
        Self {
            default_max_concurrency: default_max_concurrency.max(1),
        }
    }

    /// Fan out `step_id` over the items selected from `context`.
    ///
    /// Cancelling `cancel` stops admitting branches and cancels those in
    /// flight. Aborting on a failure only cancels this fan-out's children.
    pub async fn generate(
        &self,
        context: &ExecutionContext,
        step_id: &StepId,
        config: &DynamicBranchingConfig,
        runner: &dyn BranchRunner,
        cancel: &CancellationToken,
    ) -> Result<FanOutResult, EngineError> {
        let items = (config.data_selector)(context)?;

        match (config.execution_strategy, items) {
            (ExecutionStrategy::Parallel, BranchItems::Unbounded(_)) => {
                Err(EngineError::UnboundedParallelFanout(format!(
                    "step {} selects an unbounded source",
                    step_id
                )))
            }
            (ExecutionStrategy::Parallel, BranchItems::Finite(items)) => {
                let limit = if config.max_concurrency == 0 {
                    self.default_max_concurrency
                } else {
                    config.max_concurrency
                };
                Ok(self
                    .run_parallel(context, step_id, config, items, limit, runner, cancel)
                    .await)
            }
            (ExecutionStrategy::Sequential, items) => {
                let finite = items.is_finite();
                Ok(self
                    .run_sequential(context, step_id, config, items, finite, runner, cancel)
                    .await)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sequential(
        &self,
        context: &ExecutionContext,
        step_id: &StepId,
        config: &DynamicBranchingConfig,
        items: BranchItems,
        finite: bool,
        runner: &dyn BranchRunner,
        cancel: &CancellationToken,
    ) -> FanOutResult {
        let children = cancel.child_token();
        let mut stream = items.into_stream();
        let mut outcomes = Vec::new();
        let mut index = 0usize;
        let mut ran_any = false;

        loop {
            let next = if finite {
                stream.next().await
            } else {
                tokio::select! {
                    item = stream.next() => item,
                    _ = children.cancelled() => None,
                }
            };
            let Some(item) = next else { break };
            let run_id = context.run_id().child(step_id, index);
            if children.is_cancelled() {
                if !finite {
                    break;
                }
                outcomes.push(skipped(index, run_id, item));
                index += 1;
                continue;
            }

            let child = context.fork(
                run_id.clone(),
                BranchFrame {
                    step_id: step_id.clone(),
                    index,
                },
            );
            let branch = (config.branch_factory)(&item, index);
            debug!(run_id = %run_id, index, "Starting sequential branch");
            let report = runner.run_branch(child, branch, children.clone()).await;
            ran_any = true;

            if aborts_fan_out(&report.status, config.aggregation) {
                warn!(
                    run_id = %run_id,
                    status = report.status.as_str(),
                    "Branch failed, aborting fan-out"
                );
                children.cancel();
            }
            outcomes.push(outcome(context, index, run_id, item, report));
            index += 1;
        }

        info!(
            run_id = %context.run_id(),
            step_id = %step_id,
            branches = outcomes.len(),
            "Sequential fan-out finished"
        );
        FanOutResult {
            outcomes,
            peak_concurrency: usize::from(ran_any),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        context: &ExecutionContext,
        step_id: &StepId,
        config: &DynamicBranchingConfig,
        items: Vec<DataPacket>,
        limit: usize,
        runner: &dyn BranchRunner,
        cancel: &CancellationToken,
    ) -> FanOutResult {
        let children = cancel.child_token();
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let total = items.len();
        let mut outcomes = Vec::with_capacity(total);

        let mut indexed = items.into_iter().enumerate().peekable();
        let mut batch_no = 0usize;
        while indexed.peek().is_some() {
            let batch: Vec<(usize, DataPacket)> = indexed.by_ref().take(limit).collect();

            if children.is_cancelled() {
                for (index, item) in batch {
                    outcomes.push(skipped(index, context.run_id().child(step_id, index), item));
                }
                continue;
            }

            if batch_no > 0 && !config.batch_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(config.batch_delay) => {}
                    _ = children.cancelled() => {}
                }
            }
            batch_no += 1;
            debug!(
                run_id = %context.run_id(),
                step_id = %step_id,
                batch = batch_no,
                size = batch.len(),
                "Admitting branch batch"
            );

            let runs = batch.into_iter().map(|(index, item)| {
                let children = children.clone();
                let in_flight = &in_flight;
                let peak = &peak;
                async move {
                    let run_id = context.run_id().child(step_id, index);
                    if children.is_cancelled() {
                        return skipped(index, run_id, item);
                    }
                    let child = context.fork(
                        run_id.clone(),
                        BranchFrame {
                            step_id: step_id.clone(),
                            index,
                        },
                    );
                    let branch = (config.branch_factory)(&item, index);

                    let active = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(active, Ordering::SeqCst);
                    let report = runner.run_branch(child, branch, children.clone()).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);

                    if aborts_fan_out(&report.status, config.aggregation) {
                        warn!(
                            run_id = %run_id,
                            status = report.status.as_str(),
                            "Branch failed, aborting fan-out"
                        );
                        children.cancel();
                    }
                    outcome(context, index, run_id, item, report)
                }
            });
            outcomes.extend(join_all(runs).await);
        }

        outcomes.sort_by_key(|o| o.index);
        info!(
            run_id = %context.run_id(),
            step_id = %step_id,
            branches = total,
            peak_concurrency = peak.load(Ordering::SeqCst),
            "Parallel fan-out finished"
        );
        FanOutResult {
            outcomes,
            peak_concurrency: peak.load(Ordering::SeqCst),
        }
    }
}

/// A cancelled branch never aborts its siblings; it was either cancelled on
/// its own or by the abort already in progress.
fn aborts_fan_out(status: &BranchStatus, policy: AggregationPolicy) -> bool {
    policy == AggregationPolicy::AbortOnFirstFailure
        && matches!(status, BranchStatus::Failed(_) | BranchStatus::Expired)
}

fn skipped(index: usize, run_id: RunId, item: DataPacket) -> BranchOutcome {
    BranchOutcome {
        index,
        run_id,
        item,
        status: BranchStatus::Skipped,
        output: DataPacket::new(Value::Object(Map::new())),
    }
}

fn outcome(
    parent: &ExecutionContext,
    index: usize,
    run_id: RunId,
    item: DataPacket,
    report: BranchReport,
) -> BranchOutcome {
    let mut keys: Vec<&String> = report
        .variables
        .iter()
        .filter(|(k, v)| parent.get(k) != Some(*v))
        .map(|(k, _)| k)
        .collect();
    keys.sort();

    let mut output = Map::new();
    for key in keys {
        output.insert(key.clone(), report.variables[key].value.clone());
    }
    BranchOutcome {
        index,
        run_id,
        item,
        status: report.status,
        output: DataPacket::new(Value::Object(output)),
    }
}
