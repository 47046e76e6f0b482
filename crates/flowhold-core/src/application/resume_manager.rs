//! Resume manager
//!
//! Owns every live pause entry and the four resume paths that can resolve
//! one: manual action, a matching event, a polled condition and a timeout.
//!
//! Each pause gets a fresh token. A path resolves a pause by removing the
//! entry with `DashMap::remove_if` keyed on that token, so exactly one path
//! wins and a stale path from an earlier pause of the same run never matches
//! a later one. Every resolution is emitted as a [`RunSignal`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::domain::execution_context::ExecutionContext;
use crate::domain::pause::{
    add_duration, PauseCondition, PauseRecord, ResumeCondition, ResumeConfig, ResumeTrigger,
};
use crate::domain::ports::{Clock, EventBus, EventHandler, StateStore};
use crate::domain::run::{RunRegistry, RunStatus};
use crate::{DataPacket, EngineError, RunId, StepId};

/// Handle for a registered pause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseTicket {
    /// Paused run
    pub run_id: RunId,
    /// Step the run is paused at
    pub step_id: StepId,
    /// Token of this pause
    pub token: u64,
    /// When the pause was registered
    pub paused_at: DateTime<Utc>,
    /// Absolute timeout, if any
    pub deadline: Option<DateTime<Utc>>,
}

/// How a pause was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    /// The run is Running again
    Resume(ResumeTrigger),
    /// The run timed out without `resume_on_timeout`
    Expire,
    /// The polled predicate kept failing
    Fail(String),
}

/// Resolution of one pause, delivered to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct RunSignal {
    /// Resolved run
    pub run_id: RunId,
    /// Step the run was paused at
    pub step_id: StepId,
    /// Token of the resolved pause
    pub token: u64,
    /// Outcome
    pub kind: SignalKind,
}

/// Resume paths still armed for a paused run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedPaths {
    /// Manual resume enabled
    pub manual: bool,
    /// Event types with armed triggers
    pub event_types: Vec<String>,
    /// Polled condition still armed
    pub condition: bool,
    /// Timeout deadline
    pub timeout: Option<DateTime<Utc>>,
}

/// Outcome of one condition polling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Runs resumed by their condition
    pub resumed: Vec<RunId>,
    /// Runs whose condition path ran out of retries
    pub disarmed: Vec<RunId>,
    /// Runs failed by repeated predicate errors
    pub failed: Vec<RunId>,
}

/// Outcome of one timeout pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutReport {
    /// Runs resumed on timeout
    pub resumed: Vec<RunId>,
    /// Runs expired
    pub expired: Vec<RunId>,
}

struct PausedRun {
    token: u64,
    run_id: RunId,
    step_id: StepId,
    context: ExecutionContext,
    config: ResumeConfig,
    deadline: Option<DateTime<Utc>>,
    condition: Mutex<Option<ResumeCondition>>,
    checking: AtomicBool,
}

struct ResumeInner {
    entries: DashMap<RunId, Arc<PausedRun>>,
    runs: Arc<RunRegistry>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    signals: mpsc::UnboundedSender<RunSignal>,
    subscribed: DashMap<String, ()>,
    next_token: AtomicU64,
    config: EngineConfig,
}

/// Registers pauses and resolves them exactly once
#[derive(Clone)]
pub struct ResumeManager {
    inner: Arc<ResumeInner>,
    bus: Arc<dyn EventBus>,
}

impl ResumeManager {
    /// Create a manager and the receiving end of its signal channel
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        runs: Arc<RunRegistry>,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RunSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ResumeInner {
            entries: DashMap::with_capacity(64),
            runs,
            store,
            clock,
            signals,
            subscribed: DashMap::new(),
            next_token: AtomicU64::new(1),
            config,
        });
        (Self { inner, bus }, rx)
    }

    /// Suspend a Running run at `step_id` and arm every configured path.
    ///
    /// The snapshot is persisted before the run becomes Paused; a pause with
    /// no resume path is rejected before anything is persisted.
    pub async fn register_pause(
        &self,
        context: &ExecutionContext,
        step_id: &StepId,
        condition: PauseCondition,
    ) -> Result<PauseTicket, EngineError> {
        let paused_at = self.inner.clock.now();
        self.arm(context, step_id, condition, paused_at).await
    }

    /// Re-arm a pause restored from the state store, keeping its original
    /// pause time so the deadline is unchanged
    pub async fn rearm_pause(
        &self,
        context: &ExecutionContext,
        step_id: &StepId,
        condition: PauseCondition,
        paused_at: DateTime<Utc>,
    ) -> Result<PauseTicket, EngineError> {
        self.arm(context, step_id, condition, paused_at).await
    }

    async fn arm(
        &self,
        context: &ExecutionContext,
        step_id: &StepId,
        condition: PauseCondition,
        paused_at: DateTime<Utc>,
    ) -> Result<PauseTicket, EngineError> {
        let run_id = context.run_id().clone();
        let mut config = validate_condition(&run_id, step_id, &condition)?;
        if config.condition_check_interval.is_zero() {
            config.condition_check_interval = self.inner.config.default_condition_check_interval();
        }

        match self.inner.runs.status(&run_id) {
            Some(RunStatus::Running) => {}
            Some(status) => {
                return Err(EngineError::InvalidTransition {
                    run_id: run_id.0,
                    from: status.to_string(),
                    to: RunStatus::Paused.to_string(),
                })
            }
            None => return Err(EngineError::RunNotFound(run_id.0)),
        }

        self.ensure_subscriptions(&config).await?;

        let deadline = config.timeout_duration.map(|d| add_duration(paused_at, d));
        let record = PauseRecord::from_condition(
            step_id.clone(),
            &condition,
            &config,
            paused_at,
            deadline,
        );
        self.inner
            .store
            .save_snapshot(&run_id, &context.snapshot(), &record)
            .await?;

        let now = self.inner.clock.now();
        let poll = config.auto_resume_condition.as_ref().map(|predicate| {
            ResumeCondition::new(
                run_id.clone(),
                predicate.clone(),
                config.condition_check_interval,
                config.max_condition_retries,
                now,
            )
        });

        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(PausedRun {
            token,
            run_id: run_id.clone(),
            step_id: step_id.clone(),
            context: context.clone(),
            config,
            deadline,
            condition: Mutex::new(poll),
            checking: AtomicBool::new(false),
        });

        // Paused and the entry become visible together under the shard lock
        let paused = {
            let slot = self.inner.entries.entry(run_id.clone());
            self.inner
                .runs
                .transition(&run_id, RunStatus::Paused)
                .map(|_| {
                    slot.insert(entry);
                })
        };
        if let Err(e) = paused {
            if let Err(cleanup) = self.inner.store.delete_snapshot(&run_id).await {
                warn!(run_id = %run_id, error = %cleanup, "Failed to remove orphaned snapshot");
            }
            return Err(e);
        }

        info!(
            run_id = %run_id,
            step_id = %step_id,
            reason = %record.reason,
            token,
            "Run paused"
        );

        Ok(PauseTicket {
            run_id,
            step_id: step_id.clone(),
            token,
            paused_at,
            deadline,
        })
    }

    async fn ensure_subscriptions(&self, config: &ResumeConfig) -> Result<(), EngineError> {
        for trigger in &config.event_triggers {
            let event_type = trigger.event_type();
            if self
                .inner
                .subscribed
                .insert(event_type.to_string(), ())
                .is_some()
            {
                continue;
            }

            let handler: Arc<dyn EventHandler> = Arc::new(ResumeOnEvent {
                inner: self.inner.clone(),
            });
            if let Err(e) = self.bus.subscribe(event_type, handler).await {
                self.inner.subscribed.remove(event_type);
                return Err(match e {
                    EngineError::EventBusError(_) => e,
                    other => EngineError::EventBusError(other.to_string()),
                });
            }
            debug!(event_type = %event_type, "Subscribed to resume events");
        }
        Ok(())
    }

    /// Resume a paused run on behalf of an actor holding `roles`
    pub async fn try_manual_resume<S: AsRef<str>>(
        &self,
        run_id: &RunId,
        roles: &[S],
        payload: DataPacket,
    ) -> Result<(), EngineError> {
        let entry = self.inner.live_entry(run_id)?;

        if !entry.config.permits_manual(roles) {
            let reason = if entry.config.allow_manual_resume {
                let mut required: Vec<&str> =
                    entry.config.allowed_roles.iter().map(String::as_str).collect();
                required.sort_unstable();
                format!("requires one of roles [{}]", required.join(", "))
            } else {
                "manual resume is not enabled".to_string()
            };
            warn!(run_id = %run_id, reason = %reason, "Manual resume rejected");
            return Err(EngineError::Unauthorized {
                run_id: run_id.0.clone(),
                reason,
            });
        }

        let claimed = self
            .inner
            .claim(run_id, entry.token)
            .ok_or_else(|| EngineError::AlreadyResumed(run_id.0.clone()))?;

        let trigger = ResumeTrigger::Manual {
            roles: roles.iter().map(|r| r.as_ref().to_string()).collect(),
            payload,
        };
        self.inner.finish_resume(&claimed, trigger)
    }

    /// Deliver an event; returns the runs it resumed
    pub fn on_event(&self, event_type: &str, payload: &DataPacket) -> Vec<RunId> {
        self.inner.on_event(event_type, payload)
    }

    /// Check every due condition once
    pub async fn poll_conditions(&self) -> PollReport {
        self.inner.poll_conditions().await
    }

    /// Resolve every pause whose deadline has passed
    pub async fn check_timeouts(&self) -> TimeoutReport {
        self.inner.check_timeouts().await
    }

    /// Drop every armed path of a run; returns whether it was paused
    pub fn disarm(&self, run_id: &RunId) -> bool {
        let removed = self.inner.entries.remove(run_id).is_some();
        if removed {
            debug!(run_id = %run_id, "Resume paths disarmed");
        }
        removed
    }

    /// Paths still armed for a paused run
    pub fn armed_paths(&self, run_id: &RunId) -> Option<ArmedPaths> {
        let entry = self.inner.entries.get(run_id)?.clone();
        let condition = entry.condition.lock().is_some();
        Some(ArmedPaths {
            manual: entry.config.allow_manual_resume,
            event_types: entry
                .config
                .event_triggers
                .iter()
                .map(|t| t.event_type().to_string())
                .collect(),
            condition,
            timeout: entry.deadline,
        })
    }

    /// Current time on the manager's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Whether a pause entry is live for `run_id`
    pub fn is_paused(&self, run_id: &RunId) -> bool {
        self.inner.entries.contains_key(run_id)
    }

    /// Run the timeout checker and the condition poller until `shutdown`
    /// fires. Each runs on its own task so a slow predicate never delays a
    /// deadline.
    pub fn spawn_watchers(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let timeouts = spawn_watcher(self.inner.clone(), shutdown.clone(), "timeout", |inner| {
            async move {
                inner.check_timeouts().await;
            }
        });
        let conditions = spawn_watcher(self.inner.clone(), shutdown, "condition", |inner| {
            async move {
                inner.poll_conditions().await;
            }
        });

        tokio::spawn(async move {
            let (timeouts, conditions) = tokio::join!(timeouts, conditions);
            for result in [timeouts, conditions] {
                if let Err(e) = result {
                    error!(error = %e, "Resume watcher task failed");
                }
            }
        })
    }
}

fn spawn_watcher<F, Fut>(
    inner: Arc<ResumeInner>,
    shutdown: CancellationToken,
    watcher: &'static str,
    pass: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<ResumeInner>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = inner.config.watch_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(watcher, interval_ms = period.as_millis() as u64, "Resume watcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => pass(inner.clone()).await,
            }
        }
        debug!(watcher, "Resume watcher stopped");
    })
}

impl ResumeInner {
    fn live_entry(&self, run_id: &RunId) -> Result<Arc<PausedRun>, EngineError> {
        if let Some(entry) = self.entries.get(run_id) {
            return Ok(entry.clone());
        }
        let record = self
            .runs
            .record(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.0.clone()))?;
        // A pause that was published after the first lookup is visible now
        if let Some(entry) = self.entries.get(run_id) {
            return Ok(entry.clone());
        }

        match record.status {
            // Paused without an entry: claimed by another path, not yet Running
            RunStatus::Paused => Err(EngineError::AlreadyResumed(run_id.0.clone())),
            RunStatus::Running if record.resumes > 0 => {
                Err(EngineError::AlreadyResumed(run_id.0.clone()))
            }
            _ => Err(EngineError::RunNotPaused(run_id.0.clone())),
        }
    }

    /// Remove the entry if it still belongs to the pause identified by `token`
    fn claim(&self, run_id: &RunId, token: u64) -> Option<Arc<PausedRun>> {
        self.entries
            .remove_if(run_id, |_, entry| entry.token == token)
            .map(|(_, entry)| entry)
    }

    fn finish_resume(&self, entry: &PausedRun, trigger: ResumeTrigger) -> Result<(), EngineError> {
        self.runs.transition(&entry.run_id, RunStatus::Running)?;
        info!(
            run_id = %entry.run_id,
            step_id = %entry.step_id,
            path = trigger.path_name(),
            "Run resumed"
        );
        self.emit(entry, SignalKind::Resume(trigger));
        Ok(())
    }

    fn emit(&self, entry: &PausedRun, kind: SignalKind) {
        let signal = RunSignal {
            run_id: entry.run_id.clone(),
            step_id: entry.step_id.clone(),
            token: entry.token,
            kind,
        };
        if self.signals.send(signal).is_err() {
            warn!(run_id = %entry.run_id, "Run signal dropped, no scheduler listening");
        }
    }

    fn on_event(&self, event_type: &str, payload: &DataPacket) -> Vec<RunId> {
        let candidates: Vec<Arc<PausedRun>> = self
            .entries
            .iter()
            .filter(|e| {
                e.config
                    .event_triggers
                    .iter()
                    .any(|t| t.event_type() == event_type)
            })
            .map(|e| e.value().clone())
            .collect();

        let mut resumed = Vec::new();
        for entry in candidates {
            let accepted = entry.config.event_triggers.iter().any(|trigger| {
                match trigger.matches(event_type, &entry.context, payload) {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(
                            run_id = %entry.run_id,
                            event_type = %event_type,
                            error = %e,
                            "Event filter failed, treating as no match"
                        );
                        false
                    }
                }
            });
            if !accepted {
                continue;
            }

            let Some(claimed) = self.claim(&entry.run_id, entry.token) else {
                debug!(run_id = %entry.run_id, event_type = %event_type, "Run already resumed");
                continue;
            };
            let trigger = ResumeTrigger::Event {
                event_type: event_type.to_string(),
                payload: payload.clone(),
            };
            match self.finish_resume(&claimed, trigger) {
                Ok(()) => resumed.push(claimed.run_id.clone()),
                Err(e) => error!(run_id = %claimed.run_id, error = %e, "Event resume failed"),
            }
        }
        resumed.sort();
        resumed
    }

    async fn poll_conditions(&self) -> PollReport {
        let now = self.clock.now();
        let due: Vec<Arc<PausedRun>> = self
            .entries
            .iter()
            .filter(|e| {
                e.condition
                    .lock()
                    .as_ref()
                    .map(|c| c.is_due(now))
                    .unwrap_or(false)
            })
            .map(|e| e.value().clone())
            .collect();

        let mut report = PollReport::default();
        for entry in due {
            if entry
                .checking
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            self.poll_one(&entry, now, &mut report).await;
            entry.checking.store(false, Ordering::SeqCst);
        }
        report
    }

    async fn poll_one(&self, entry: &Arc<PausedRun>, now: DateTime<Utc>, report: &mut PollReport) {
        let Some(predicate) = entry.condition.lock().as_ref().map(|c| c.predicate.clone()) else {
            return;
        };
        let limit = self.config.predicate_timeout();
        let outcome = match tokio::time::timeout(limit, predicate.check(&entry.context)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::PredicateError(format!(
                "check timed out after {}ms",
                limit.as_millis()
            ))),
        };

        match outcome {
            Ok(true) => {
                let Some(claimed) = self.claim(&entry.run_id, entry.token) else {
                    return;
                };
                match self.finish_resume(&claimed, ResumeTrigger::Condition) {
                    Ok(()) => report.resumed.push(claimed.run_id.clone()),
                    Err(e) => {
                        error!(run_id = %claimed.run_id, error = %e, "Condition resume failed")
                    }
                }
            }
            Ok(false) => {
                let exhausted = {
                    let mut slot = entry.condition.lock();
                    match slot.as_mut() {
                        Some(condition) => {
                            condition.consecutive_errors = 0;
                            let exhausted = condition.record_miss(now);
                            if exhausted {
                                *slot = None;
                            }
                            exhausted
                        }
                        None => false,
                    }
                };
                if exhausted {
                    info!(run_id = %entry.run_id, "Condition retries exhausted, path disarmed");
                    report.disarmed.push(entry.run_id.clone());
                }
            }
            Err(e) => {
                let threshold = self.config.max_predicate_failures;
                let (errors, exhausted) = {
                    let mut slot = entry.condition.lock();
                    match slot.as_mut() {
                        Some(condition) => {
                            condition.consecutive_errors += 1;
                            let errors = condition.consecutive_errors;
                            let exhausted = errors < threshold && condition.record_miss(now);
                            if exhausted {
                                *slot = None;
                            }
                            (errors, exhausted)
                        }
                        None => (0, false),
                    }
                };
                warn!(
                    run_id = %entry.run_id,
                    error = %e,
                    consecutive_errors = errors,
                    "Resume predicate failed"
                );

                if errors >= threshold {
                    let reason = format!("resume predicate failed {} times: {}", errors, e);
                    if self.fail_paused(entry, reason).await {
                        report.failed.push(entry.run_id.clone());
                    }
                } else if exhausted {
                    info!(run_id = %entry.run_id, "Condition retries exhausted, path disarmed");
                    report.disarmed.push(entry.run_id.clone());
                }
            }
        }
    }

    async fn fail_paused(&self, entry: &Arc<PausedRun>, reason: String) -> bool {
        let Some(claimed) = self.claim(&entry.run_id, entry.token) else {
            return false;
        };
        if let Err(e) = self.runs.fail(&claimed.run_id, reason.clone()) {
            error!(run_id = %claimed.run_id, error = %e, "Failed to fail paused run");
            return false;
        }
        if let Err(e) = self.store.delete_snapshot(&claimed.run_id).await {
            warn!(run_id = %claimed.run_id, error = %e, "Failed to delete snapshot");
        }
        error!(run_id = %claimed.run_id, reason = %reason, "Paused run failed");
        self.emit(&claimed, SignalKind::Fail(reason));
        true
    }

    async fn check_timeouts(&self) -> TimeoutReport {
        let now = self.clock.now();
        let expired: Vec<Arc<PausedRun>> = self
            .entries
            .iter()
            .filter(|e| matches!(e.deadline, Some(deadline) if deadline <= now))
            .map(|e| e.value().clone())
            .collect();

        let mut report = TimeoutReport::default();
        for entry in expired {
            let Some(claimed) = self.claim(&entry.run_id, entry.token) else {
                continue;
            };

            if claimed.config.resume_on_timeout {
                match self.finish_resume(&claimed, ResumeTrigger::Timeout) {
                    Ok(()) => report.resumed.push(claimed.run_id.clone()),
                    Err(e) => error!(run_id = %claimed.run_id, error = %e, "Timeout resume failed"),
                }
                continue;
            }

            if let Err(e) = self.runs.transition(&claimed.run_id, RunStatus::Expired) {
                error!(run_id = %claimed.run_id, error = %e, "Failed to expire run");
                continue;
            }
            if let Err(e) = self.store.delete_snapshot(&claimed.run_id).await {
                warn!(run_id = %claimed.run_id, error = %e, "Failed to delete snapshot");
            }
            info!(run_id = %claimed.run_id, step_id = %claimed.step_id, "Run expired");
            self.emit(&claimed, SignalKind::Expire);
            report.expired.push(claimed.run_id.clone());
        }
        report.resumed.sort();
        report.expired.sort();
        report
    }
}

fn validate_condition(
    run_id: &RunId,
    step_id: &StepId,
    condition: &PauseCondition,
) -> Result<ResumeConfig, EngineError> {
    if !condition.should_pause() {
        return Err(EngineError::InvalidResumeConfig(format!(
            "run {} step {}: condition does not pause",
            run_id, step_id
        )));
    }
    match condition.resume_config() {
        Some(config) if config.has_resume_path() => Ok(config.clone()),
        _ => Err(EngineError::InvalidResumeConfig(format!(
            "run {} step {}: no resume path configured",
            run_id, step_id
        ))),
    }
}

struct ResumeOnEvent {
    inner: Arc<ResumeInner>,
}

#[async_trait::async_trait]
impl EventHandler for ResumeOnEvent {
    async fn handle(&self, event_type: &str, payload: &DataPacket) -> Result<(), EngineError> {
        self.inner.on_event(event_type, payload);
        Ok(())
    }
}
