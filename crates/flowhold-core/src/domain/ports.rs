//! Collaborator ports for the flowhold engine
//!
//! The engine stays agnostic of how paused runs are persisted, how events are
//! delivered and where time comes from. External crates implement these
//! traits; in-memory versions live in [`memory`] behind the `testing`
//! feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::execution_context::ContextSnapshot;
use super::pause::PauseRecord;
use crate::{DataPacket, EngineError, RunId};

/// Snapshot and pause record persisted for a paused run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    /// Context at the moment of suspension
    pub snapshot: ContextSnapshot,
    /// Why and how the run is paused
    pub pause: PauseRecord,
}

/// Durable storage for paused runs
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the snapshot of a paused run, replacing any previous one
    async fn save_snapshot(
        &self,
        run_id: &RunId,
        snapshot: &ContextSnapshot,
        pause: &PauseRecord,
    ) -> Result<(), EngineError>;

    /// Load the snapshot of a paused run
    async fn load_snapshot(&self, run_id: &RunId) -> Result<Option<StoredRun>, EngineError>;

    /// Delete the snapshot of a run; deleting a missing snapshot is not an error
    async fn delete_snapshot(&self, run_id: &RunId) -> Result<(), EngineError>;
}

/// Receives events from an [`EventBus`]
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one delivery. Deliveries are at-least-once.
    async fn handle(&self, event_type: &str, payload: &DataPacket) -> Result<(), EngineError>;
}

/// Subscription handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Event delivery used by event-triggered resumes
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Register `handler` for `event_type`
    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, EngineError>;

    /// Deliver `payload` to every handler of `event_type`
    async fn publish(&self, event_type: &str, payload: DataPacket) -> Result<(), EngineError>;
}

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;
    use tracing::warn;

    /// In-memory state store keyed by run id
    #[derive(Default)]
    pub struct MemoryStateStore {
        runs: DashMap<RunId, StoredRun>,
        unavailable: AtomicBool,
    }

    impl MemoryStateStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of persisted snapshots
        pub fn len(&self) -> usize {
            self.runs.len()
        }

        /// Whether nothing is persisted
        pub fn is_empty(&self) -> bool {
            self.runs.is_empty()
        }

        /// Whether a snapshot exists for `run_id`
        pub fn contains(&self, run_id: &RunId) -> bool {
            self.runs.contains_key(run_id)
        }

        /// Make every call fail, simulating an outage
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        fn check_available(&self) -> Result<(), EngineError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(EngineError::StateStoreError("store unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StateStore for MemoryStateStore {
        async fn save_snapshot(
            &self,
            run_id: &RunId,
            snapshot: &ContextSnapshot,
            pause: &PauseRecord,
        ) -> Result<(), EngineError> {
            self.check_available()?;
            self.runs.insert(
                run_id.clone(),
                StoredRun {
                    snapshot: snapshot.clone(),
                    pause: pause.clone(),
                },
            );
            Ok(())
        }

        async fn load_snapshot(&self, run_id: &RunId) -> Result<Option<StoredRun>, EngineError> {
            self.check_available()?;
            Ok(self.runs.get(run_id).map(|stored| stored.clone()))
        }

        async fn delete_snapshot(&self, run_id: &RunId) -> Result<(), EngineError> {
            self.check_available()?;
            self.runs.remove(run_id);
            Ok(())
        }
    }

    /// In-process event bus delivering synchronously to every subscriber
    #[derive(Default)]
    pub struct MemoryEventBus {
        handlers: DashMap<String, Vec<(SubscriptionId, Arc<dyn EventHandler>)>>,
        published: Mutex<Vec<(String, DataPacket)>>,
        next_id: AtomicU64,
    }

    impl MemoryEventBus {
        /// Create a bus with no subscribers
        pub fn new() -> Self {
            Self::default()
        }

        /// Every event published so far, in order
        pub fn published(&self) -> Vec<(String, DataPacket)> {
            self.published.lock().clone()
        }

        /// Published event types, in order
        pub fn published_types(&self) -> Vec<String> {
            self.published.lock().iter().map(|(t, _)| t.clone()).collect()
        }

        /// Number of handlers subscribed to `event_type`
        pub fn subscriber_count(&self, event_type: &str) -> usize {
            self.handlers.get(event_type).map(|h| h.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl EventBus for MemoryEventBus {
        async fn subscribe(
            &self,
            event_type: &str,
            handler: Arc<dyn EventHandler>,
        ) -> Result<SubscriptionId, EngineError> {
            let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.handlers
                .entry(event_type.to_string())
                .or_default()
                .push((id, handler));
            Ok(id)
        }

        async fn publish(&self, event_type: &str, payload: DataPacket) -> Result<(), EngineError> {
            self.published
                .lock()
                .push((event_type.to_string(), payload.clone()));

            // Clone the handler list so no map lock is held across awaits
            let handlers: Vec<Arc<dyn EventHandler>> = self
                .handlers
                .get(event_type)
                .map(|h| h.iter().map(|(_, handler)| handler.clone()).collect())
                .unwrap_or_default();

            for handler in handlers {
                if let Err(e) = handler.handle(event_type, &payload).await {
                    warn!(event_type = %event_type, error = %e, "Event handler failed");
                }
            }
            Ok(())
        }
    }

    /// Controlled clock that only moves when told to
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start the clock at `start`
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        /// Start the clock at the current wall time
        pub fn starting_now() -> Self {
            Self::new(Utc::now())
        }

        /// Move time forward
        pub fn advance(&self, duration: Duration) {
            let mut now = self.now.lock();
            *now = crate::domain::pause::add_duration(*now, duration);
        }

        /// Jump to an absolute time
        pub fn set(&self, at: DateTime<Utc>) {
            *self.now.lock() = at;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::memory::*;
    use super::*;
    use crate::domain::execution_context::ExecutionContext;
    use crate::domain::pause::{PauseCondition, PauseReason, ResumeConfig};
    use crate::{FlowId, StepId};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(
            &self,
            _event_type: &str,
            _payload: &DataPacket,
        ) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pause_record() -> PauseRecord {
        let config = ResumeConfig::new().allow_manual(["ops"]);
        let condition = PauseCondition::pause(
            PauseReason::ManualReview,
            "m",
            DataPacket::null(),
            config.clone(),
        );
        PauseRecord::from_condition(StepId::from("s"), &condition, &config, Utc::now(), None)
    }

    #[tokio::test]
    async fn test_memory_state_store_round_trip() {
        let store = MemoryStateStore::new();
        let run_id = RunId::from("run-1");
        let mut ctx = ExecutionContext::new(run_id.clone(), FlowId::from("flow"));
        ctx.set("k", DataPacket::new(json!("v")));

        store
            .save_snapshot(&run_id, &ctx.snapshot(), &pause_record())
            .await
            .unwrap();
        assert!(store.contains(&run_id));

        let stored = store.load_snapshot(&run_id).await.unwrap().unwrap();
        assert_eq!(ExecutionContext::restore(stored.snapshot), ctx);

        store.delete_snapshot(&run_id).await.unwrap();
        assert!(store.load_snapshot(&run_id).await.unwrap().is_none());
        store.delete_snapshot(&run_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_state_store_outage() {
        let store = MemoryStateStore::new();
        store.set_unavailable(true);
        let result = store.load_snapshot(&RunId::from("run-1")).await;
        assert!(matches!(result, Err(EngineError::StateStoreError(_))));
    }

    #[tokio::test]
    async fn test_memory_event_bus_routes_by_type() {
        let bus = MemoryEventBus::new();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        bus.subscribe("doc.uploaded", handler.clone()).await.unwrap();

        bus.publish("doc.uploaded", DataPacket::null()).await.unwrap();
        bus.publish("doc.rejected", DataPacket::null()).await.unwrap();
        bus.publish("doc.uploaded", DataPacket::null()).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriber_count("doc.uploaded"), 1);
        assert_eq!(
            bus.published_types(),
            vec!["doc.uploaded", "doc.rejected", "doc.uploaded"]
        );
    }

    #[test]
    fn test_manual_clock_advances_only_when_told() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(600));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(10));
    }
}
