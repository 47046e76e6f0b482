#![allow(dead_code)]

use async_trait::async_trait;
use flowhold_core::application::resume_manager::RunSignal;
use flowhold_core::domain::ports::memory::{ManualClock, MemoryEventBus, MemoryStateStore};
use flowhold_core::{
    DataPacket, EngineConfig, EngineError, ExecutionContext, ExecutionResult, FlowScheduler,
    ResumeManager, RunRegistry, StepDefinition, StepExecutor, StepGuardEvaluator,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Executor that records what ran.
///
/// Step config keys: `item` is recorded alongside the step id, `delay_ms`
/// holds the step open, `fail` makes it fail.
#[derive(Default)]
pub struct RecordingExecutor {
    pub executed: Mutex<Vec<String>>,
    pub items: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl RecordingExecutor {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn items(&self) -> Vec<Value> {
        self.items.lock().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    async fn execute(
        &self,
        step: &StepDefinition,
        context: &mut ExecutionContext,
    ) -> ExecutionResult {
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.executed.lock().push(step.id.0.clone());
        if let Some(item) = step.config.get("item") {
            self.items.lock().push(item.clone());
        }

        if let Some(ms) = step.config.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if step.config.get("fail") == Some(&json!(true)) {
            return ExecutionResult::Failure(EngineError::StepExecutionError(format!(
                "{} refused",
                step.id
            )));
        }
        context.set(format!("{}_done", step.id), DataPacket::new(json!(true)));
        ExecutionResult::Success
    }
}

/// A scheduler wired to in-memory ports and a manual clock
pub struct Engine {
    pub scheduler: FlowScheduler,
    pub signals: Option<mpsc::UnboundedReceiver<RunSignal>>,
    pub store: Arc<MemoryStateStore>,
    pub bus: Arc<MemoryEventBus>,
    pub clock: Arc<ManualClock>,
    pub runs: Arc<RunRegistry>,
    pub executor: Arc<RecordingExecutor>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStateStore::new()))
    }

    /// Fresh engine sharing a state store, as after a process restart
    pub fn with_store(store: Arc<MemoryStateStore>) -> Self {
        let bus = Arc::new(MemoryEventBus::new());
        let clock = Arc::new(ManualClock::starting_now());
        let runs = Arc::new(RunRegistry::new());
        let executor = Arc::new(RecordingExecutor::default());
        let (resume, signals) = ResumeManager::new(
            store.clone(),
            bus.clone(),
            clock.clone(),
            runs.clone(),
            EngineConfig::default(),
        );
        let scheduler = FlowScheduler::new(
            resume,
            executor.clone(),
            Arc::new(StepGuardEvaluator),
            runs.clone(),
            store.clone(),
            bus.clone(),
            EngineConfig::default(),
        );
        Self {
            scheduler,
            signals: Some(signals),
            store,
            bus,
            clock,
            runs,
            executor,
        }
    }

    pub fn resume(&self) -> &ResumeManager {
        self.scheduler.resume_manager()
    }

    /// Next signal from the resume manager; panics after one second
    pub async fn next_signal(&mut self) -> RunSignal {
        let signals = self.signals.as_mut().expect("signal loop already started");
        tokio::time::timeout(Duration::from_secs(1), signals.recv())
            .await
            .expect("timed out waiting for a run signal")
            .expect("signal channel closed")
    }

    /// Signals already queued
    pub fn drain_signals(&mut self) -> Vec<RunSignal> {
        let mut drained = Vec::new();
        if let Some(signals) = self.signals.as_mut() {
            while let Ok(signal) = signals.try_recv() {
                drained.push(signal);
            }
        }
        drained
    }

    /// Hand the signal channel to the scheduler's own loop
    pub fn start_signal_loop(&mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        let signals = self.signals.take().expect("signal loop already started");
        self.scheduler.spawn_signal_loop(signals, shutdown)
    }
}

/// Poll `check` until it holds; panics after two seconds
pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
