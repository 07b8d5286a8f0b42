//! Lifecycle controls: terminate, pause/resume, tracking, shutdown,
//! health and readiness.

mod common;

use common::{allow_context, counting_handler, engine_with_audit, register};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cognigate::{
    handler_fn, EngineConfig, ExecutionEngine, ExecutionStatus, HandlerOutput, HealthStatus,
};

#[tokio::test]
async fn terminate_cancels_a_running_execution() {
    let (engine, _sink) = engine_with_audit();
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), Duration::from_secs(10));
    register(&engine, "h", "x", handler);

    let run_engine = engine.clone();
    let run =
        tokio::spawn(async move { run_engine.execute(allow_context("exec-1", "i-1", "x")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(engine.terminate("exec-1", "operator request"));
    assert!(!engine.terminate("missing", "nope"));

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("terminate unblocks execution")
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Terminated);
    let error = result.error.expect("error record");
    assert_eq!(error.code, "EXECUTION_TERMINATED");
    assert!(error.message.contains("operator request"));
    assert!(engine.active_executions().is_empty());
}

#[tokio::test]
async fn pause_is_observable_by_a_cooperative_handler() {
    let (engine, _sink) = engine_with_audit();
    let saw_pause = Arc::new(AtomicBool::new(false));
    let saw_pause_clone = Arc::clone(&saw_pause);
    let handler = handler_fn(move |_intent, ctx| {
        let saw_pause = Arc::clone(&saw_pause_clone);
        async move {
            for _ in 0..20 {
                if ctx.is_paused() {
                    saw_pause.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(HandlerOutput::new())
        }
    });
    register(&engine, "h", "x", handler);

    let run_engine = engine.clone();
    let run =
        tokio::spawn(async move { run_engine.execute(allow_context("exec-1", "i-1", "x")).await });
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(engine.pause("exec-1"));
    assert!(!engine.pause("exec-1"), "pause only accepted while running");
    assert_eq!(engine.status("exec-1").unwrap().state, ExecutionStatus::Paused);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(engine.resume("exec-1"));
    assert!(!engine.resume("exec-1"), "resume only accepted while paused");

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(saw_pause.load(Ordering::SeqCst), "handler observed the pause flag");
}

#[tokio::test]
async fn tracking_snapshot_reflects_running_state() {
    let (engine, _sink) = engine_with_audit();
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), Duration::from_millis(200));
    register(&engine, "h", "x", handler);

    let run_engine = engine.clone();
    let run =
        tokio::spawn(async move { run_engine.execute(allow_context("exec-1", "i-1", "x")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = engine.status("exec-1").expect("tracked");
    assert_eq!(snapshot.state, ExecutionStatus::Running);
    assert_eq!(snapshot.handler_name, "h");
    assert_eq!(snapshot.tenant_id, "acme");
    assert_eq!(engine.active_executions().len(), 1);

    run.await.unwrap().unwrap();
    assert!(engine.active_executions().is_empty());
    assert!(engine.status("exec-1").is_none());
}

#[tokio::test]
async fn duplicate_in_flight_execution_id_conflicts() {
    let (engine, _sink) = engine_with_audit();
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), Duration::from_millis(200));
    register(&engine, "h", "x", handler);

    let run_engine = engine.clone();
    let run =
        tokio::spawn(async move { run_engine.execute(allow_context("exec-1", "i-1", "x")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = engine.execute(allow_context("exec-1", "i-1", "x")).await.unwrap_err();
    assert_eq!(err.kind(), cognigate::ErrorKind::Conflict);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_terminates_stragglers_and_rejects_new_work() {
    let config =
        EngineConfig { graceful_shutdown_timeout: Duration::from_millis(200), ..Default::default() };
    let engine = ExecutionEngine::builder().config(config).build();
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), Duration::from_secs(30));
    register(&engine, "h", "x", handler);

    let run_engine = engine.clone();
    let run =
        tokio::spawn(async move { run_engine.execute(allow_context("exec-1", "i-1", "x")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .expect("shutdown completes within the grace budget");

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Terminated);
    assert!(result.error.unwrap().message.contains("service shutdown"));

    assert!(engine.active_executions().is_empty(), "active set empty after shutdown");
    let err = engine.execute(allow_context("exec-2", "i-2", "x")).await.unwrap_err();
    assert_eq!(err.kind(), cognigate::ErrorKind::Conflict);
    assert!(!engine.readiness().ready);
}

#[tokio::test]
async fn health_reflects_handler_population() {
    let (engine, _sink) = engine_with_audit();
    assert_eq!(engine.health().status, HealthStatus::Unhealthy, "no handlers yet");
    assert!(!engine.readiness().ready);

    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), Duration::from_millis(1));
    register(&engine, "h", "x", handler);
    assert_eq!(engine.health().status, HealthStatus::Healthy);
    assert!(engine.readiness().ready);

    engine.registry().mark_degraded("h");
    assert_eq!(engine.health().status, HealthStatus::Degraded);
}

#[tokio::test]
async fn drained_handler_refuses_new_work() {
    let (engine, _sink) = engine_with_audit();
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), Duration::from_millis(1));
    register(&engine, "h", "x", handler);

    engine.registry().drain("h").await.unwrap();

    let err = engine.execute(allow_context("exec-1", "i-1", "x")).await.unwrap_err();
    assert!(err.is_not_found(), "no active handler resolves for the intent type");

    let explicit = cognigate::ExecutionContext::builder(
        "exec-2",
        cognigate::Intent::new("i-2", "acme").with_type("x"),
        cognigate::Decision::allow(0.9, cognigate::TrustLevel::High),
    )
    .handler("h")
    .build();
    let err = engine.execute(explicit).await.unwrap_err();
    assert_eq!(err.kind(), cognigate::ErrorKind::Conflict);
}
