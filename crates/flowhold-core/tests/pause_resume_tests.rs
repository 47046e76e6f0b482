mod common;

use common::Engine;
use flowhold_core::{
    condition_fn, guard_fn, DataPacket, EngineError, EventBus, EventTrigger, ExecutionContext,
    FlowDefinition, FlowId, PauseCondition, PauseReason, ResumeConfig, ResumeTrigger, RunId,
    RunOutcome, RunStatus, StateStore, StepDefinition, StepId,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn paused_at(guarded: &str, config: ResumeConfig) -> FlowDefinition {
    let guard = guard_fn(move |_| {
        Ok(PauseCondition::pause(
            PauseReason::AwaitingApproval,
            "waiting",
            DataPacket::null(),
            config.clone(),
        ))
    });
    FlowDefinition::new("flow")
        .with_step(StepDefinition::new("collect"))
        .with_step(StepDefinition::new(guarded).with_guard(guard))
        .with_step(StepDefinition::new("activate"))
}

async fn start(engine: &Engine, run: &str) -> RunOutcome {
    start_with(engine, run, HashMap::new()).await
}

async fn start_with(
    engine: &Engine,
    run: &str,
    variables: HashMap<String, DataPacket>,
) -> RunOutcome {
    engine
        .scheduler
        .start_run_with_id(RunId::from(run), &FlowId::from("flow"), variables)
        .await
        .unwrap()
}

fn expect_completed(outcome: Option<RunOutcome>) -> ExecutionContext {
    match outcome {
        Some(RunOutcome::Completed(context)) => context,
        other => panic!("Expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pause_without_resume_path_persists_nothing() {
    let engine = Engine::new();
    engine
        .scheduler
        .register_flow(paused_at("review", ResumeConfig::new()))
        .unwrap();

    let outcome = start(&engine, "run-1").await;

    assert!(matches!(outcome, RunOutcome::Failed(reason) if reason.contains("no resume path")));
    assert!(engine.store.is_empty());
    assert!(!engine.resume().is_paused(&RunId::from("run-1")));
    assert_eq!(engine.scheduler.status(&RunId::from("run-1")), Some(RunStatus::Failed));
    assert_eq!(engine.executor.executed(), vec!["collect"]);
}

#[tokio::test]
async fn test_paused_snapshot_restores_variables_and_cursor() {
    let engine = Engine::new();
    engine
        .scheduler
        .register_flow(paused_at("review", ResumeConfig::new().allow_manual(["reviewer"])))
        .unwrap();
    let mut variables = HashMap::new();
    variables.insert("customer".to_string(), DataPacket::new(json!({"id": "c-1", "tier": 2})));

    start_with(&engine, "run-1", variables).await;

    let stored = engine
        .store
        .load_snapshot(&RunId::from("run-1"))
        .await
        .unwrap()
        .expect("snapshot persisted on pause");
    assert_eq!(stored.pause.step_id, StepId::from("review"));
    assert_eq!(stored.pause.allowed_roles, vec!["reviewer".to_string()]);

    let encoded = serde_json::to_string(&stored).unwrap();
    let decoded: flowhold_core::domain::ports::StoredRun = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, stored);

    let context = ExecutionContext::restore(decoded.snapshot);
    assert_eq!(context.cursor().step_index(), 1);
    assert_eq!(
        context.get("customer").and_then(|c| c.field("tier")),
        Some(&json!(2))
    );
    assert_eq!(context.get("collect_done"), Some(&DataPacket::new(json!(true))));
}

#[tokio::test]
async fn test_reviewer_role_is_required_for_manual_resume() {
    let mut engine = Engine::new();
    engine
        .scheduler
        .register_flow(paused_at("review", ResumeConfig::new().allow_manual(["reviewer"])))
        .unwrap();
    start(&engine, "run-1").await;
    let run_id = RunId::from("run-1");

    let denied = engine
        .resume()
        .try_manual_resume(&run_id, &["user"], DataPacket::null())
        .await;
    match denied {
        Err(EngineError::Unauthorized { reason, .. }) => assert!(reason.contains("reviewer")),
        other => panic!("Expected Unauthorized, got {:?}", other),
    }
    assert!(engine.resume().is_paused(&run_id));

    engine
        .resume()
        .try_manual_resume(&run_id, &["reviewer"], DataPacket::new(json!({"verdict": "ok"})))
        .await
        .unwrap();
    let again = engine
        .resume()
        .try_manual_resume(&run_id, &["reviewer"], DataPacket::null())
        .await;
    assert_eq!(again, Err(EngineError::AlreadyResumed("run-1".to_string())));

    let signal = engine.next_signal().await;
    let context = expect_completed(engine.scheduler.handle_signal(signal).await.unwrap());
    assert_eq!(engine.executor.executed(), vec!["collect", "review", "activate"]);
    match &context.resume_info().unwrap().trigger {
        ResumeTrigger::Manual { roles, payload } => {
            assert_eq!(roles, &vec!["reviewer".to_string()]);
            assert_eq!(payload.field("verdict"), Some(&json!("ok")));
        }
        other => panic!("Expected manual trigger, got {:?}", other),
    }
    assert_eq!(engine.scheduler.status(&run_id), Some(RunStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_resume_paths_resolve_exactly_once() {
    let mut engine = Engine::new();
    let config = ResumeConfig::new()
        .allow_manual(["approver"])
        .on_event(EventTrigger::any("approval.granted"))
        .with_timeout(Duration::from_secs(60), true);
    engine
        .scheduler
        .register_flow(paused_at("approve", config))
        .unwrap();

    for round in 0..25 {
        let run = format!("run-{}", round);
        let run_id = RunId::from(run.as_str());
        start(&engine, &run).await;
        engine.clock.advance(Duration::from_secs(61));

        let manual = {
            let resume = engine.resume().clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                resume
                    .try_manual_resume(&run_id, &["approver"], DataPacket::null())
                    .await
            })
        };
        let event = {
            let resume = engine.resume().clone();
            tokio::spawn(async move { resume.on_event("approval.granted", &DataPacket::null()) })
        };
        let timeout = {
            let resume = engine.resume().clone();
            tokio::spawn(async move { resume.check_timeouts().await })
        };

        let manual = manual.await.unwrap();
        let event = event.await.unwrap();
        let timeout = timeout.await.unwrap();

        let winners = usize::from(manual.is_ok()) + event.len() + timeout.resumed.len();
        assert_eq!(winners, 1, "round {}: {:?} {:?} {:?}", round, manual, event, timeout);
        if let Err(e) = manual {
            assert_eq!(e, EngineError::AlreadyResumed(run.clone()));
        }
        assert!(timeout.expired.is_empty());

        let signals = engine.drain_signals();
        assert_eq!(signals.len(), 1, "round {}", round);
        assert_eq!(signals[0].run_id, run_id);
        assert_eq!(engine.scheduler.status(&run_id), Some(RunStatus::Running));
    }
}

#[tokio::test]
async fn test_event_filter_selects_the_matching_run() {
    let mut engine = Engine::new();
    let same_customer = |ctx: &ExecutionContext, payload: &DataPacket| {
        Ok(payload.field("customer") == ctx.get("customer").map(|c| c.as_value()))
    };
    let trigger = EventTrigger::new("document.uploaded", same_customer);
    engine
        .scheduler
        .register_flow(paused_at("await_docs", ResumeConfig::new().on_event(trigger)))
        .unwrap();

    for (run, customer) in [("run-a", "c-1"), ("run-b", "c-2")] {
        let mut variables = HashMap::new();
        variables.insert("customer".to_string(), DataPacket::new(json!(customer)));
        start_with(&engine, run, variables).await;
    }
    assert_eq!(engine.bus.subscriber_count("document.uploaded"), 1);

    engine
        .bus
        .publish("document.uploaded", DataPacket::new(json!({"customer": "c-2"})))
        .await
        .unwrap();

    assert!(engine.resume().is_paused(&RunId::from("run-a")));
    assert!(!engine.resume().is_paused(&RunId::from("run-b")));

    let signal = engine.next_signal().await;
    assert_eq!(signal.run_id, RunId::from("run-b"));
    let context = expect_completed(engine.scheduler.handle_signal(signal).await.unwrap());
    assert!(matches!(
        &context.resume_info().unwrap().trigger,
        ResumeTrigger::Event { event_type, .. } if event_type == "document.uploaded"
    ));
}

#[tokio::test]
async fn test_condition_retries_exhaust_then_timeout_resumes() {
    let mut engine = Engine::new();
    let checks = Arc::new(AtomicU32::new(0));
    let predicate = {
        let checks = checks.clone();
        condition_fn(move |_| {
            let checks = checks.clone();
            async move {
                checks.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
    };
    let config = ResumeConfig::new()
        .auto_resume_when(predicate, Duration::from_secs(1))
        .with_max_condition_retries(3)
        .with_timeout(Duration::from_secs(10), true);
    engine
        .scheduler
        .register_flow(paused_at("settle", config))
        .unwrap();
    start(&engine, "run-1").await;
    let run_id = RunId::from("run-1");

    let report = engine.resume().poll_conditions().await;
    assert!(report.resumed.is_empty());
    assert_eq!(checks.load(Ordering::SeqCst), 0);

    for attempt in 1..=3 {
        engine.clock.advance(Duration::from_secs(1));
        let report = engine.resume().poll_conditions().await;
        assert_eq!(checks.load(Ordering::SeqCst), attempt);
        if attempt < 3 {
            assert!(report.disarmed.is_empty());
        } else {
            assert_eq!(report.disarmed, vec![run_id.clone()]);
        }
    }

    let armed = engine.resume().armed_paths(&run_id).unwrap();
    assert!(!armed.condition);
    assert!(armed.timeout.is_some());

    engine.clock.advance(Duration::from_secs(1));
    engine.resume().poll_conditions().await;
    assert_eq!(checks.load(Ordering::SeqCst), 3);

    engine.clock.advance(Duration::from_secs(10));
    let report = engine.resume().check_timeouts().await;
    assert_eq!(report.resumed, vec![run_id.clone()]);

    let signal = engine.next_signal().await;
    let context = expect_completed(engine.scheduler.handle_signal(signal).await.unwrap());
    assert_eq!(context.resume_info().unwrap().trigger, ResumeTrigger::Timeout);
}

#[tokio::test]
async fn test_satisfied_condition_resumes_run() {
    let mut engine = Engine::new();
    let ready = Arc::new(AtomicBool::new(false));
    let predicate = {
        let ready = ready.clone();
        condition_fn(move |_| {
            let ready = ready.clone();
            async move { Ok(ready.load(Ordering::SeqCst)) }
        })
    };
    engine
        .scheduler
        .register_flow(paused_at(
            "settle",
            ResumeConfig::new().auto_resume_when(predicate, Duration::from_secs(5)),
        ))
        .unwrap();
    start(&engine, "run-1").await;

    engine.clock.advance(Duration::from_secs(5));
    assert!(engine.resume().poll_conditions().await.resumed.is_empty());

    ready.store(true, Ordering::SeqCst);
    engine.clock.advance(Duration::from_secs(5));
    let report = engine.resume().poll_conditions().await;
    assert_eq!(report.resumed, vec![RunId::from("run-1")]);

    let signal = engine.next_signal().await;
    let context = expect_completed(engine.scheduler.handle_signal(signal).await.unwrap());
    assert_eq!(context.resume_info().unwrap().trigger, ResumeTrigger::Condition);
}

#[tokio::test]
async fn test_ten_minute_timeout_resumes_without_action() {
    let mut engine = Engine::new();
    engine
        .scheduler
        .register_flow(paused_at(
            "cool_down",
            ResumeConfig::new().with_timeout(Duration::from_secs(600), true),
        ))
        .unwrap();
    start(&engine, "run-1").await;

    engine.clock.advance(Duration::from_secs(9 * 60));
    let early = engine.resume().check_timeouts().await;
    assert!(early.resumed.is_empty());
    assert!(engine.resume().is_paused(&RunId::from("run-1")));

    engine.clock.advance(Duration::from_secs(2 * 60));
    let due = engine.resume().check_timeouts().await;
    assert_eq!(due.resumed, vec![RunId::from("run-1")]);

    let signal = engine.next_signal().await;
    expect_completed(engine.scheduler.handle_signal(signal).await.unwrap());
    assert_eq!(engine.executor.executed(), vec!["collect", "cool_down", "activate"]);
}

#[tokio::test]
async fn test_timeout_without_resume_expires_run() {
    let mut engine = Engine::new();
    engine
        .scheduler
        .register_flow(paused_at(
            "approve",
            ResumeConfig::new()
                .allow_manual(["approver"])
                .with_timeout(Duration::from_secs(60), false),
        ))
        .unwrap();
    start(&engine, "run-1").await;
    let run_id = RunId::from("run-1");

    engine.clock.advance(Duration::from_secs(60));
    let report = engine.resume().check_timeouts().await;
    assert_eq!(report.expired, vec![run_id.clone()]);

    let signal = engine.next_signal().await;
    assert_eq!(
        engine.scheduler.handle_signal(signal).await.unwrap(),
        Some(RunOutcome::Expired)
    );
    assert_eq!(engine.scheduler.status(&run_id), Some(RunStatus::Expired));
    assert!(!engine.store.contains(&run_id));

    let late = engine
        .resume()
        .try_manual_resume(&run_id, &["approver"], DataPacket::null())
        .await;
    assert_eq!(late, Err(EngineError::RunNotPaused("run-1".to_string())));
}

#[tokio::test]
async fn test_recovered_run_keeps_its_deadline() {
    let first = Engine::new();
    let config = ResumeConfig::new()
        .allow_manual(["reviewer"])
        .with_timeout(Duration::from_secs(3600), false);
    first
        .scheduler
        .register_flow(paused_at("review", config.clone()))
        .unwrap();
    let original = match start(&first, "run-1").await {
        RunOutcome::Paused(ticket) => ticket,
        other => panic!("Expected pause, got {:?}", other),
    };
    drop(first.scheduler);

    let mut second = Engine::with_store(first.store.clone());
    second
        .scheduler
        .register_flow(paused_at("review", config))
        .unwrap();
    let run_id = RunId::from("run-1");

    let ticket = match second.scheduler.recover(&run_id).await.unwrap() {
        RunOutcome::Paused(ticket) => ticket,
        other => panic!("Expected pause, got {:?}", other),
    };
    assert_eq!(ticket.step_id, StepId::from("review"));
    assert_eq!(ticket.paused_at, original.paused_at);
    assert_eq!(ticket.deadline, original.deadline);
    assert_eq!(second.scheduler.status(&run_id), Some(RunStatus::Paused));

    let twice = second.scheduler.recover(&run_id).await;
    assert!(matches!(twice, Err(EngineError::InvalidTransition { .. })));
    let missing = second.scheduler.recover(&RunId::from("ghost")).await;
    assert_eq!(missing, Err(EngineError::RunNotFound("ghost".to_string())));

    second
        .resume()
        .try_manual_resume(&run_id, &["reviewer"], DataPacket::null())
        .await
        .unwrap();
    let signal = second.next_signal().await;
    expect_completed(second.scheduler.handle_signal(signal).await.unwrap());
    assert_eq!(second.executor.executed(), vec!["review", "activate"]);
    assert!(second.store.is_empty());
}

#[tokio::test]
async fn test_cancelled_paused_run_cannot_resume() {
    let engine = Engine::new();
    engine
        .scheduler
        .register_flow(paused_at(
            "review",
            ResumeConfig::new()
                .allow_manual(["reviewer"])
                .on_event(EventTrigger::any("review.done")),
        ))
        .unwrap();
    start(&engine, "run-1").await;
    let run_id = RunId::from("run-1");

    engine.scheduler.cancel(&run_id).await.unwrap();

    assert_eq!(engine.scheduler.status(&run_id), Some(RunStatus::Cancelled));
    assert!(engine.store.is_empty());
    assert!(engine.resume().on_event("review.done", &DataPacket::null()).is_empty());
    assert!(engine
        .bus
        .published_types()
        .contains(&"flow_run.cancelled".to_string()));
}
