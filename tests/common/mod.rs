//! Shared fixtures for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cognigate::{
    handler_fn, Decision, ExecutionContext, ExecutionEngine, Handler, HandlerDefinition,
    HandlerOutput, Intent, MemoryAuditSink, TrustLevel,
};

pub fn allow_context(execution_id: &str, intent_id: &str, intent_type: &str) -> ExecutionContext {
    ExecutionContext::builder(
        execution_id,
        Intent::new(intent_id, "acme").with_type(intent_type),
        Decision::allow(0.9, TrustLevel::High),
    )
    .build()
}

/// Engine wired to an inspectable audit sink.
pub fn engine_with_audit() -> (ExecutionEngine, MemoryAuditSink) {
    let sink = MemoryAuditSink::new();
    let engine = ExecutionEngine::builder().audit_sink(Arc::new(sink.clone())).build();
    (engine, sink)
}

/// Handler that counts invocations, sleeps, then returns `{"ok": true}`.
pub fn counting_handler(invocations: Arc<AtomicUsize>, delay: Duration) -> Arc<dyn Handler> {
    handler_fn(move |_intent, _ctx| {
        let invocations = Arc::clone(&invocations);
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            let mut out = HandlerOutput::new();
            out.insert("ok".into(), serde_json::Value::Bool(true));
            Ok(out)
        }
    })
}

pub fn register(engine: &ExecutionEngine, name: &str, intent_type: &str, handler: Arc<dyn Handler>) {
    engine
        .register_handler(HandlerDefinition::new(name, "1.0.0", handler).intent_type(intent_type))
        .expect("register handler");
}
