//! Run lifecycle observation.
//!
//! [`LifecycleRecorder`] subscribes to the `flow_run.*` events the scheduler
//! publishes, logs each transition and keeps per-kind counters plus the last
//! event seen for every run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use flowhold_core::domain::ports::SubscriptionId;
use flowhold_core::{
    DataPacket, EngineError, EventBus, EventHandler, LifecycleKind, RunId, RunLifecycleEvent,
    RunStatus,
};

/// Counters by lifecycle kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleSummary {
    /// Events seen per kind, keyed by event type
    pub counts: BTreeMap<String, u64>,
    /// Runs currently paused according to the events seen
    pub paused_runs: usize,
}

#[derive(Debug, Clone)]
struct LastSeen {
    kind: LifecycleKind,
    status: RunStatus,
    at: DateTime<Utc>,
}

/// Event handler recording run lifecycle transitions
#[derive(Debug, Default)]
pub struct LifecycleRecorder {
    counts: DashMap<LifecycleKind, u64>,
    runs: DashMap<RunId, LastSeen>,
}

impl LifecycleRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `recorder` to every lifecycle event type on `bus`
    pub async fn subscribe(
        recorder: Arc<Self>,
        bus: &dyn EventBus,
    ) -> Result<Vec<SubscriptionId>, EngineError> {
        let mut subscriptions = Vec::with_capacity(LifecycleKind::ALL.len());
        for kind in LifecycleKind::ALL {
            let handler: Arc<dyn EventHandler> = recorder.clone();
            subscriptions.push(bus.subscribe(kind.event_type(), handler).await?);
        }
        debug!(subscriptions = subscriptions.len(), "Lifecycle recorder subscribed");
        Ok(subscriptions)
    }

    /// Number of events seen of `kind`
    pub fn count(&self, kind: LifecycleKind) -> u64 {
        self.counts.get(&kind).map(|c| *c).unwrap_or(0)
    }

    /// Status carried by the last event seen for `run_id`
    pub fn last_status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.runs.get(run_id).map(|seen| seen.status)
    }

    /// When the last event for `run_id` happened
    pub fn last_seen_at(&self, run_id: &RunId) -> Option<DateTime<Utc>> {
        self.runs.get(run_id).map(|seen| seen.at)
    }

    /// Snapshot of the counters
    pub fn summary(&self) -> LifecycleSummary {
        let counts = self
            .counts
            .iter()
            .map(|entry| (entry.key().event_type().to_string(), *entry.value()))
            .collect();
        let paused_runs = self
            .runs
            .iter()
            .filter(|seen| seen.kind == LifecycleKind::Paused)
            .count();
        LifecycleSummary {
            counts,
            paused_runs,
        }
    }

    fn record(&self, event: &RunLifecycleEvent) {
        *self.counts.entry(event.kind).or_insert(0) += 1;
        self.runs.insert(
            event.run_id.clone(),
            LastSeen {
                kind: event.kind,
                status: event.status,
                at: event.timestamp,
            },
        );

        let step = event.step_id.as_ref().map(|s| s.0.as_str()).unwrap_or("-");
        let detail = event.detail.as_deref().unwrap_or("");
        match event.kind {
            LifecycleKind::Failed | LifecycleKind::Expired => warn!(
                run_id = %event.run_id,
                flow_id = %event.flow_id,
                step_id = step,
                detail = detail,
                "Run {}",
                event.status
            ),
            _ => info!(
                run_id = %event.run_id,
                flow_id = %event.flow_id,
                step_id = step,
                detail = detail,
                "Run {}",
                event.status
            ),
        }
    }
}

#[async_trait]
impl EventHandler for LifecycleRecorder {
    async fn handle(&self, event_type: &str, payload: &DataPacket) -> Result<(), EngineError> {
        if LifecycleKind::from_event_type(event_type).is_none() {
            debug!(event_type = %event_type, "Ignoring non-lifecycle event");
            return Ok(());
        }
        let event = RunLifecycleEvent::from_packet(payload)?;
        self.record(&event);
        Ok(())
    }
}
