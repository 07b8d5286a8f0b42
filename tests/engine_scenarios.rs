//! End-to-end scenarios: one engine, real handlers, observable audit.

mod common;

use common::{allow_context, counting_handler, engine_with_audit, register};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cognigate::{
    handler_fn, AuditEventType, BulkheadConfig, EngineConfig, ExecutionEngine, ExecutionStatus,
    GroupLimits, HandlerDefinition, HandlerError, HandlerOutput, LimitOverrides, MemoryAuditSink,
    RetryPolicy, TrackingSleeper,
};

#[tokio::test]
async fn happy_path_produces_completed_result_and_audit_pair() {
    let (engine, sink) = engine_with_audit();
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(Arc::clone(&invocations), Duration::from_millis(10));
    engine
        .register_handler(
            HandlerDefinition::new("h", "1.0.0", handler)
                .intent_type("x")
                .resource_defaults(LimitOverrides::default().timeout_ms(500)),
        )
        .unwrap();

    let result = engine.execute(allow_context("exec-1", "intent-1", "x")).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.outputs.get("ok"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(result.retry_count, 0);
    assert!(result.wall_time_ms >= 10, "wall time at least the handler sleep");
    assert!(result.wall_time_ms < 450, "wall time close to the handler sleep");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    engine.audit().flush().await;
    let entries = sink.entries_for_execution("exec-1");
    let started =
        entries.iter().filter(|e| e.event_type == AuditEventType::ExecutionStarted).count();
    let completed =
        entries.iter().filter(|e| e.event_type == AuditEventType::ExecutionCompleted).count();
    assert_eq!(started, 1);
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn timeout_maps_to_timed_out_with_stable_code() {
    let (engine, _sink) = engine_with_audit();
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(Arc::clone(&invocations), Duration::from_millis(300));
    register(&engine, "h", "x", handler);

    let ctx = cognigate::ExecutionContext::builder(
        "exec-1",
        cognigate::Intent::new("intent-1", "acme").with_type("x"),
        cognigate::Decision::allow(0.9, cognigate::TrustLevel::High),
    )
    .limits(LimitOverrides::default().timeout_ms(100))
    .build();

    let result = engine.execute(ctx).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::TimedOut);
    let error = result.error.expect("error record");
    assert_eq!(error.code, "EXECUTION_TIMEOUT");
    assert_eq!(result.retry_count, 0);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_then_succeeds_with_exponential_backoff() {
    let sink = MemoryAuditSink::new();
    let sleeper = TrackingSleeper::new();
    let engine = ExecutionEngine::builder()
        .audit_sink(Arc::new(sink.clone()))
        .sleeper(sleeper.clone())
        .build();

    let invocations = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&invocations);
    let flaky = handler_fn(move |_intent, _ctx| {
        let attempts = Arc::clone(&attempts);
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(HandlerError::with_code("ECONNRESET", "connection reset by peer"))
            } else {
                let mut out = HandlerOutput::new();
                out.insert("k".into(), serde_json::json!(1));
                Ok(out)
            }
        }
    });
    engine
        .register_handler(
            HandlerDefinition::new("flaky", "1.0.0", flaky).intent_type("x").retry_policy(
                RetryPolicy {
                    max_retries: 3,
                    backoff_ms: 10,
                    backoff_multiplier: 2.0,
                    max_backoff_ms: 1_000,
                    retryable_errors: vec!["ECONNRESET".into()],
                },
            ),
        )
        .unwrap();

    let result = engine.execute(allow_context("exec-1", "intent-1", "x")).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.outputs.get("k"), Some(&serde_json::json!(1)));
    assert_eq!(result.retry_count, 2);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // Backoff ~10ms then ~20ms, each with up to 25% additive jitter.
    let delays = sleeper.calls();
    assert_eq!(delays.len(), 2);
    assert!(delays[0] >= Duration::from_millis(10) && delays[0] <= Duration::from_millis(13));
    assert!(delays[1] >= Duration::from_millis(20) && delays[1] <= Duration::from_millis(25));

    engine.audit().flush().await;
    let entries = sink.entries_for_execution("exec-1");
    let retries =
        entries.iter().filter(|e| e.event_type == AuditEventType::RetryAttempted).count();
    let completed =
        entries.iter().filter(|e| e.event_type == AuditEventType::ExecutionCompleted).count();
    assert_eq!(retries, 2);
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn retry_budget_is_clamped_by_limit_overrides() {
    let engine = ExecutionEngine::builder().sleeper(TrackingSleeper::new()).build();
    let invocations = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&invocations);
    let failing = handler_fn(move |_intent, _ctx| {
        let attempts = Arc::clone(&attempts);
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<HandlerOutput, _>(HandlerError::with_code("ECONNRESET", "reset"))
        }
    });
    engine
        .register_handler(
            HandlerDefinition::new("failing", "1.0.0", failing).intent_type("x").retry_policy(
                RetryPolicy { max_retries: 5, backoff_ms: 1, ..Default::default() },
            ),
        )
        .unwrap();

    let ctx = cognigate::ExecutionContext::builder(
        "exec-1",
        cognigate::Intent::new("intent-1", "acme").with_type("x"),
        cognigate::Decision::allow(0.9, cognigate::TrustLevel::High),
    )
    .limits(LimitOverrides::default().max_retries(1))
    .build();

    let result = engine.execute(ctx).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    // min(policy 5, limits 1) retries → 2 attempts total.
    assert_eq!(result.retry_count, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn saturated_bulkhead_rejects_the_second_execution() {
    let config = EngineConfig {
        bulkhead: BulkheadConfig {
            global: GroupLimits::new(1, 0, Duration::from_millis(100)),
            per_tenant: None,
            per_handler: None,
        },
        ..Default::default()
    };
    let engine = ExecutionEngine::builder().config(config).build();
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(Arc::clone(&invocations), Duration::from_millis(200));
    register(&engine, "h", "x", handler);

    let first_engine = engine.clone();
    let first =
        tokio::spawn(
            async move { first_engine.execute(allow_context("exec-1", "i-1", "x")).await },
        );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.bulkhead_stats().global.active, 1, "one active during overlap");
    let second = engine.execute(allow_context("exec-2", "i-2", "x")).await;
    let err = second.unwrap_err();
    assert!(err.is_bulkhead_rejected());

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(engine.bulkhead_stats().global.rejected, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn denied_decision_is_rejected_before_any_side_effect() {
    let (engine, sink) = engine_with_audit();
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(Arc::clone(&invocations), Duration::from_millis(5));
    register(&engine, "h", "x", handler);

    let ctx = cognigate::ExecutionContext::builder(
        "exec-1",
        cognigate::Intent::new("intent-1", "acme").with_type("x"),
        cognigate::Decision::deny(),
    )
    .build();

    let err = engine.execute(ctx).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(err.code(), "EXECUTION_DENIED");

    assert_eq!(invocations.load(Ordering::SeqCst), 0, "handler must not run");
    assert_eq!(engine.bulkhead_stats().global.active, 0);
    assert_eq!(engine.bulkhead_stats().global.rejected, 0, "no bulkhead acquire attempted");

    engine.audit().flush().await;
    assert!(sink.entries().is_empty(), "no audit entries for a denied context");
}

#[tokio::test]
async fn cache_hit_skips_the_second_handler_invocation() {
    let (engine, _sink) = engine_with_audit();
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(Arc::clone(&invocations), Duration::from_millis(5));
    register(&engine, "h", "x", handler);

    let first = engine.execute_with_cache(allow_context("exec-1", "intent-1", "x")).await.unwrap();
    let second = engine.execute_with_cache(allow_context("exec-1", "intent-1", "x")).await.unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 1, "second call served from cache");
    assert_eq!(second.outputs, first.outputs);
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert!(engine.cache().stats().hits >= 1);
}
