//! Flow scheduler
//!
//! Walks the steps of a run, consults the pause evaluator before each step,
//! fans out dynamic steps into child runs and re-enters a run at the exact
//! step it paused at once the resume manager signals it.
//!
//! Fan-out parents stay Running while they block on their children. A
//! paused child waits in-process for its own resume signal; the parent step
//! completes once every child is terminal.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dynamic_branching::{BranchReport, BranchRunner, BranchStatus, DynamicBranchGenerator};
use super::pause_evaluator::PauseEvaluator;
use super::resume_manager::{PauseTicket, ResumeManager, RunSignal, SignalKind};
use crate::config::EngineConfig;
use crate::domain::events::{LifecycleKind, RunLifecycleEvent};
use crate::domain::execution_context::{ExecutionContext, ResumeInfo};
use crate::domain::ports::{EventBus, StateStore};
use crate::domain::run::{RunRegistry, RunStatus};
use crate::domain::step::{BranchDefinition, FlowDefinition, StepDefinition};
use crate::{DataPacket, EngineError, ExecutionResult, FlowId, RunId, StepExecutor};

/// Where a top-level run stands after the scheduler stops driving it
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every step finished; carries the final context
    Completed(ExecutionContext),
    /// The run is suspended
    Paused(PauseTicket),
    /// The run failed
    Failed(String),
    /// The run was cancelled
    Cancelled,
    /// The run timed out while paused
    Expired,
}

enum Drive {
    Completed,
    Paused(PauseTicket),
    Cancelled,
}

enum WaitSlot {
    Waiting(oneshot::Sender<RunSignal>),
    Arrived(RunSignal),
}

struct SchedulerInner {
    flows: DashMap<FlowId, Arc<FlowDefinition>>,
    resume: ResumeManager,
    executor: Arc<dyn StepExecutor>,
    evaluator: Arc<dyn PauseEvaluator>,
    runs: Arc<RunRegistry>,
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
    generator: DynamicBranchGenerator,
    tokens: DashMap<RunId, CancellationToken>,
    waiters: DashMap<RunId, WaitSlot>,
    config: EngineConfig,
}

/// Drives flow runs through pauses and fan-outs
#[derive(Clone)]
pub struct FlowScheduler {
    inner: Arc<SchedulerInner>,
}

impl FlowScheduler {
    /// Create a scheduler
    pub fn new(
        resume: ResumeManager,
        executor: Arc<dyn StepExecutor>,
        evaluator: Arc<dyn PauseEvaluator>,
        runs: Arc<RunRegistry>,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                flows: DashMap::new(),
                resume,
                executor,
                evaluator,
                runs,
                store,
                bus,
                generator: DynamicBranchGenerator::new(config.default_max_concurrency),
                tokens: DashMap::new(),
                waiters: DashMap::new(),
                config,
            }),
        }
    }

    /// Register a flow definition
    pub fn register_flow(&self, flow: FlowDefinition) -> Result<(), EngineError> {
        flow.validate()?;
        info!(flow_id = %flow.id, steps = flow.steps.len(), "Flow registered");
        self.inner.flows.insert(flow.id.clone(), Arc::new(flow));
        Ok(())
    }

    /// Resume manager used by this scheduler
    pub fn resume_manager(&self) -> &ResumeManager {
        &self.inner.resume
    }

    /// Current status of a run
    pub fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.inner.runs.status(run_id)
    }

    /// Start a run with a generated id
    pub async fn start_run(
        &self,
        flow_id: &FlowId,
        variables: HashMap<String, DataPacket>,
    ) -> Result<RunOutcome, EngineError> {
        self.start_run_with_id(RunId::generate(), flow_id, variables)
            .await
    }

    /// Start a run with a caller-chosen id
    pub async fn start_run_with_id(
        &self,
        run_id: RunId,
        flow_id: &FlowId,
        variables: HashMap<String, DataPacket>,
    ) -> Result<RunOutcome, EngineError> {
        let flow = self.flow(flow_id)?;
        self.inner
            .runs
            .register(run_id.clone(), flow_id.clone(), None)?;
        info!(run_id = %run_id, flow_id = %flow_id, "Run started");

        let context = ExecutionContext::new(run_id, flow_id.clone()).with_variables(variables);
        Ok(self.execute(context, flow, false).await)
    }

    fn flow(&self, flow_id: &FlowId) -> Result<Arc<FlowDefinition>, EngineError> {
        self.inner
            .flows
            .get(flow_id)
            .map(|f| f.clone())
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.0.clone()))
    }

    async fn execute(
        &self,
        mut context: ExecutionContext,
        flow: Arc<FlowDefinition>,
        skip_guard: bool,
    ) -> RunOutcome {
        let run_id = context.run_id().clone();
        let cancel = CancellationToken::new();
        self.inner.tokens.insert(run_id.clone(), cancel.clone());

        let result = self
            .drive(&mut context, &flow.steps, &cancel, skip_guard)
            .await;
        self.inner.tokens.remove(&run_id);

        match result {
            Ok(Drive::Completed) => match self.finish(&context, RunStatus::Completed, None).await {
                Ok(()) => RunOutcome::Completed(context),
                Err(e) => RunOutcome::Failed(e.to_string()),
            },
            Ok(Drive::Paused(ticket)) => RunOutcome::Paused(ticket),
            Ok(Drive::Cancelled) => {
                if let Err(e) = self.finish(&context, RunStatus::Cancelled, None).await {
                    warn!(run_id = %run_id, error = %e, "Failed to record cancellation");
                }
                RunOutcome::Cancelled
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(e) = self
                    .finish(&context, RunStatus::Failed, Some(reason.clone()))
                    .await
                {
                    warn!(run_id = %run_id, error = %e, "Failed to record failure");
                }
                RunOutcome::Failed(reason)
            }
        }
    }

    /// Walk `steps` from the context cursor until the run completes, pauses
    /// or is cancelled
    async fn drive(
        &self,
        context: &mut ExecutionContext,
        steps: &[StepDefinition],
        cancel: &CancellationToken,
        mut skip_guard: bool,
    ) -> Result<Drive, EngineError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(Drive::Cancelled);
            }
            let Some(step) = steps.get(context.cursor().step_index()) else {
                return Ok(Drive::Completed);
            };

            if !skip_guard {
                let condition = self.inner.evaluator.evaluate(context, step).await?;
                if condition.should_pause() {
                    let detail = condition
                        .reason()
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    let ticket = self
                        .inner
                        .resume
                        .register_pause(context, &step.id, condition)
                        .await?;
                    self.publish(
                        RunLifecycleEvent::new(
                            LifecycleKind::Paused,
                            context.run_id().clone(),
                            context.flow_id().clone(),
                            RunStatus::Paused,
                        )
                        .at_step(step.id.clone())
                        .with_detail(detail),
                    )
                    .await;
                    return Ok(Drive::Paused(ticket));
                }
            }
            skip_guard = false;

            debug!(run_id = %context.run_id(), step_id = %step.id, "Executing step");
            match &step.dynamic_branching {
                Some(fan_out) => {
                    let runner = ChildRunner {
                        scheduler: self.clone(),
                        parent: context.run_id().clone(),
                    };
                    let result = self
                        .inner
                        .generator
                        .generate(context, &step.id, fan_out, &runner, cancel)
                        .await?;
                    if cancel.is_cancelled() {
                        return Ok(Drive::Cancelled);
                    }

                    let key = fan_out
                        .output_key
                        .clone()
                        .unwrap_or_else(|| step.id.0.clone());
                    context.set(key, result.to_packet());

                    if !result.succeeded(fan_out.aggregation) {
                        let cause = result
                            .first_failure()
                            .map(|o| match &o.status {
                                BranchStatus::Failed(reason) => {
                                    format!("branch {} failed: {}", o.index, reason)
                                }
                                other => format!("branch {} {}", o.index, other.as_str()),
                            })
                            .unwrap_or_else(|| "branches did not complete".to_string());
                        return Err(EngineError::StepExecutionError(format!(
                            "fan-out step {}: {}",
                            step.id, cause
                        )));
                    }
                }
                None => {
                    if let ExecutionResult::Failure(e) =
                        self.inner.executor.execute(step, context).await
                    {
                        return Err(e);
                    }
                }
            }
            context.cursor_mut().advance();
        }
    }

    /// Apply a terminal status, drop the snapshot and announce it
    async fn finish(
        &self,
        context: &ExecutionContext,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let run_id = context.run_id();
        match &reason {
            Some(reason) => self.inner.runs.fail(run_id, reason.clone())?,
            None => self.inner.runs.transition(run_id, status)?,
        };
        if let Err(e) = self.inner.store.delete_snapshot(run_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to delete snapshot");
        }

        let kind = match status {
            RunStatus::Completed => LifecycleKind::Completed,
            RunStatus::Cancelled => LifecycleKind::Cancelled,
            _ => LifecycleKind::Failed,
        };
        match &reason {
            Some(reason) => error!(run_id = %run_id, reason = %reason, "Run failed"),
            None => info!(run_id = %run_id, status = %status, "Run finished"),
        }

        let mut event =
            RunLifecycleEvent::new(kind, run_id.clone(), context.flow_id().clone(), status);
        if let Some(reason) = reason {
            event = event.with_detail(reason);
        }
        self.publish(event).await;
        Ok(())
    }

    async fn publish(&self, event: RunLifecycleEvent) {
        if !self.inner.config.publish_lifecycle_events {
            return;
        }
        let packet = match event.to_packet() {
            Ok(packet) => packet,
            Err(e) => {
                warn!(run_id = %event.run_id, error = %e, "Failed to encode lifecycle event");
                return;
            }
        };
        if let Err(e) = self.inner.bus.publish(event.kind.event_type(), packet).await {
            warn!(run_id = %event.run_id, error = %e, "Failed to publish lifecycle event");
        }
    }

    /// Act on a resolution from the resume manager.
    ///
    /// Signals for fan-out children are handed to the waiting parent and
    /// yield `None`; top-level runs are re-entered from their snapshot.
    pub async fn handle_signal(
        &self,
        signal: RunSignal,
    ) -> Result<Option<RunOutcome>, EngineError> {
        let record = self
            .inner
            .runs
            .record(&signal.run_id)
            .ok_or_else(|| EngineError::RunNotFound(signal.run_id.0.clone()))?;

        if record.parent.is_some() {
            self.route_to_waiter(signal);
            return Ok(None);
        }

        let lifecycle = |kind, status| {
            RunLifecycleEvent::new(kind, signal.run_id.clone(), record.flow_id.clone(), status)
                .at_step(signal.step_id.clone())
        };

        match signal.kind.clone() {
            SignalKind::Expire => {
                self.publish(lifecycle(LifecycleKind::Expired, RunStatus::Expired))
                    .await;
                Ok(Some(RunOutcome::Expired))
            }
            SignalKind::Fail(reason) => {
                self.publish(
                    lifecycle(LifecycleKind::Failed, RunStatus::Failed).with_detail(reason.clone()),
                )
                .await;
                Ok(Some(RunOutcome::Failed(reason)))
            }
            SignalKind::Resume(trigger) => {
                let flow = self.flow(&record.flow_id)?;
                let stored = self
                    .inner
                    .store
                    .load_snapshot(&signal.run_id)
                    .await?
                    .ok_or_else(|| EngineError::RunNotFound(signal.run_id.0.clone()))?;

                let mut context = ExecutionContext::restore(stored.snapshot);
                let at = flow.step(context.cursor().step_index()).map(|s| &s.id);
                if at != Some(&signal.step_id) {
                    let reason = format!(
                        "snapshot cursor does not point at paused step {}",
                        signal.step_id
                    );
                    if let Err(e) = self
                        .finish(&context, RunStatus::Failed, Some(reason.clone()))
                        .await
                    {
                        warn!(run_id = %signal.run_id, error = %e, "Failed to record failure");
                    }
                    return Ok(Some(RunOutcome::Failed(reason)));
                }

                let path = trigger.path_name();
                context.record_resume(ResumeInfo {
                    step_id: signal.step_id.clone(),
                    trigger,
                    resumed_at: self.inner.resume.now(),
                });
                self.publish(
                    lifecycle(LifecycleKind::Resumed, RunStatus::Running).with_detail(path),
                )
                .await;
                Ok(Some(self.execute(context, flow, true).await))
            }
        }
    }

    fn route_to_waiter(&self, signal: RunSignal) {
        let run_id = signal.run_id.clone();
        if let Some(status) = self.inner.runs.status(&run_id).filter(|s| s.is_terminal()) {
            debug!(run_id = %run_id, status = %status, "Dropping signal for finished child run");
            return;
        }
        match self.inner.waiters.entry(run_id.clone()) {
            Entry::Occupied(mut slot) => {
                if let WaitSlot::Arrived(_) = slot.get() {
                    slot.insert(WaitSlot::Arrived(signal));
                    return;
                }
                if let WaitSlot::Waiting(tx) = slot.remove() {
                    if tx.send(signal).is_err() {
                        warn!(run_id = %run_id, "Child run stopped waiting before its signal");
                    }
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(WaitSlot::Arrived(signal));
            }
        }
    }

    /// Wait for the resolution of a child pause; `None` when cancelled first
    async fn wait_for_signal(
        &self,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Option<RunSignal> {
        let rx = match self.inner.waiters.entry(run_id.clone()) {
            Entry::Occupied(mut slot) => {
                let (tx, rx) = oneshot::channel();
                match std::mem::replace(slot.get_mut(), WaitSlot::Waiting(tx)) {
                    WaitSlot::Arrived(signal) => {
                        slot.remove();
                        return Some(signal);
                    }
                    WaitSlot::Waiting(_) => rx,
                }
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(WaitSlot::Waiting(tx));
                rx
            }
        };

        tokio::select! {
            signal = rx => signal.ok(),
            _ = cancel.cancelled() => {
                self.inner.waiters.remove(run_id);
                None
            }
        }
    }

    /// Run one fan-out child to a terminal state
    async fn run_child(
        &self,
        parent: &RunId,
        mut context: ExecutionContext,
        branch: BranchDefinition,
        cancel: CancellationToken,
    ) -> BranchReport {
        let run_id = context.run_id().clone();
        if let Err(e) = self.inner.runs.register(
            run_id.clone(),
            context.flow_id().clone(),
            Some(parent.clone()),
        ) {
            return BranchReport::status_only(BranchStatus::Failed(e.to_string()));
        }

        let own = cancel.child_token();
        self.inner.tokens.insert(run_id.clone(), own.clone());
        let mut skip_guard = false;

        let status = loop {
            match self.drive(&mut context, &branch.steps, &own, skip_guard).await {
                Ok(Drive::Completed) => {
                    break match self.finish(&context, RunStatus::Completed, None).await {
                        Ok(()) => BranchStatus::Completed,
                        Err(e) => BranchStatus::Failed(e.to_string()),
                    };
                }
                Ok(Drive::Cancelled) => break self.cancel_child(&context).await,
                Ok(Drive::Paused(_)) => {
                    let Some(signal) = self.wait_for_signal(&run_id, &own).await else {
                        break self.cancel_child(&context).await;
                    };
                    match signal.kind {
                        SignalKind::Resume(trigger) => {
                            let path = trigger.path_name();
                            context.record_resume(ResumeInfo {
                                step_id: signal.step_id.clone(),
                                trigger,
                                resumed_at: self.inner.resume.now(),
                            });
                            self.publish(
                                RunLifecycleEvent::new(
                                    LifecycleKind::Resumed,
                                    run_id.clone(),
                                    context.flow_id().clone(),
                                    RunStatus::Running,
                                )
                                .at_step(signal.step_id)
                                .with_detail(path),
                            )
                            .await;
                            skip_guard = true;
                        }
                        SignalKind::Expire => {
                            self.publish(
                                RunLifecycleEvent::new(
                                    LifecycleKind::Expired,
                                    run_id.clone(),
                                    context.flow_id().clone(),
                                    RunStatus::Expired,
                                )
                                .at_step(signal.step_id),
                            )
                            .await;
                            break BranchStatus::Expired;
                        }
                        SignalKind::Fail(reason) => {
                            self.publish(
                                RunLifecycleEvent::new(
                                    LifecycleKind::Failed,
                                    run_id.clone(),
                                    context.flow_id().clone(),
                                    RunStatus::Failed,
                                )
                                .at_step(signal.step_id)
                                .with_detail(reason.clone()),
                            )
                            .await;
                            break BranchStatus::Failed(reason);
                        }
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    if let Err(e) = self
                        .finish(&context, RunStatus::Failed, Some(reason.clone()))
                        .await
                    {
                        warn!(run_id = %run_id, error = %e, "Failed to record failure");
                    }
                    break BranchStatus::Failed(reason);
                }
            }
        };

        self.inner.tokens.remove(&run_id);
        BranchReport {
            status,
            variables: context.variables().clone(),
        }
    }

    async fn cancel_child(&self, context: &ExecutionContext) -> BranchStatus {
        let run_id = context.run_id();
        self.inner.resume.disarm(run_id);

        let status = match self.inner.runs.status(run_id) {
            Some(RunStatus::Expired) => BranchStatus::Expired,
            Some(RunStatus::Failed) => BranchStatus::Failed("failed while cancelling".to_string()),
            _ => {
                if let Err(e) = self.finish(context, RunStatus::Cancelled, None).await {
                    warn!(run_id = %run_id, error = %e, "Failed to record cancellation");
                }
                BranchStatus::Cancelled
            }
        };
        // Signals routed after this point see a terminal run and are dropped
        self.inner.waiters.remove(run_id);
        status
    }

    /// Cancel a run.
    ///
    /// A paused top-level run is disarmed and marked Cancelled immediately.
    /// A running run, or a child waiting inside its parent's fan-out, is
    /// signalled and finalised by the task driving it; its own children are
    /// cancelled with it.
    pub async fn cancel(&self, run_id: &RunId) -> Result<(), EngineError> {
        let record = self
            .inner
            .runs
            .record(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.0.clone()))?;

        if let Some(token) = self.inner.tokens.get(run_id).map(|t| t.clone()) {
            info!(run_id = %run_id, "Cancelling run");
            token.cancel();
            return Ok(());
        }

        if record.status == RunStatus::Paused && self.inner.resume.disarm(run_id) {
            let context = ExecutionContext::new(run_id.clone(), record.flow_id.clone());
            self.finish(&context, RunStatus::Cancelled, None).await?;
            return Ok(());
        }

        Err(EngineError::InvalidTransition {
            run_id: run_id.0.clone(),
            from: self
                .inner
                .runs
                .status(run_id)
                .unwrap_or(record.status)
                .to_string(),
            to: RunStatus::Cancelled.to_string(),
        })
    }

    /// Re-arm a paused top-level run from the state store after a restart.
    ///
    /// The paused step's guard is evaluated again against the restored
    /// context. If it still pauses, the pause is re-registered with its
    /// original pause time; otherwise the run continues from that step.
    pub async fn recover(&self, run_id: &RunId) -> Result<RunOutcome, EngineError> {
        let stored = self
            .inner
            .store
            .load_snapshot(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.0.clone()))?;

        if stored.snapshot.cursor.depth() > 0 {
            return Err(EngineError::Other(format!(
                "run {} is a fan-out child and resumes with its parent",
                run_id
            )));
        }
        if let Some(status) = self.inner.runs.status(run_id) {
            return Err(EngineError::InvalidTransition {
                run_id: run_id.0.clone(),
                from: status.to_string(),
                to: RunStatus::Paused.to_string(),
            });
        }

        let flow = self.flow(&stored.snapshot.flow_id)?;
        let context = ExecutionContext::restore(stored.snapshot);
        let step_id = stored.pause.step_id;
        let step = flow
            .step(context.cursor().step_index())
            .filter(|s| s.id == step_id)
            .ok_or_else(|| {
                EngineError::StateStoreError(format!(
                    "snapshot of run {} does not point at step {}",
                    run_id, step_id
                ))
            })?;

        self.inner
            .runs
            .restore(run_id.clone(), flow.id.clone(), RunStatus::Running);

        let condition = match self.inner.evaluator.evaluate(&context, step).await {
            Ok(condition) => condition,
            Err(e) => {
                let reason = e.to_string();
                self.finish(&context, RunStatus::Failed, Some(reason.clone()))
                    .await?;
                return Ok(RunOutcome::Failed(reason));
            }
        };

        if !condition.should_pause() {
            info!(run_id = %run_id, step_id = %step_id, "Recovered run no longer paused");
            return Ok(self.execute(context, flow.clone(), true).await);
        }

        let ticket = self
            .inner
            .resume
            .rearm_pause(&context, &step_id, condition, stored.pause.paused_at)
            .await?;
        info!(run_id = %run_id, step_id = %step_id, "Recovered paused run");
        Ok(RunOutcome::Paused(ticket))
    }

    /// Feed resume signals to the scheduler until `shutdown` fires or the
    /// channel closes. Each signal is handled on its own task.
    pub fn spawn_signal_loop(
        &self,
        mut signals: mpsc::UnboundedReceiver<RunSignal>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = signals.recv() => {
                        let Some(signal) = signal else { break };
                        let scheduler = scheduler.clone();
                        tokio::spawn(async move {
                            let run_id = signal.run_id.clone();
                            if let Err(e) = scheduler.handle_signal(signal).await {
                                error!(run_id = %run_id, error = %e, "Failed to handle run signal");
                            }
                        });
                    }
                }
            }
            debug!("Signal loop stopped");
        })
    }
}

struct ChildRunner {
    scheduler: FlowScheduler,
    parent: RunId,
}

#[async_trait]
impl BranchRunner for ChildRunner {
    async fn run_branch(
        &self,
        context: ExecutionContext,
        branch: BranchDefinition,
        cancel: CancellationToken,
    ) -> BranchReport {
        self.scheduler
            .run_child(&self.parent, context, branch, cancel)
            .await
    }
}
