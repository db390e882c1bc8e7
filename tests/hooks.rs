//! Hook Pipeline Integration Tests
//!
//! Ordering, around chains, error hooks, the circuit breaker and the
//! performance-based reorder.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use opguard::core::{HookRegistry, HookSettings};
use opguard::domain::{Hook, OperationContext};
use parking_lot::Mutex;
use serde_json::{json, Value};

type Trace = Arc<Mutex<Vec<String>>>;

fn tracing_pre(id: &str, priority: i32, trace: &Trace) -> Hook {
    let trace = trace.clone();
    let name = id.to_string();
    Hook::pre(id, priority, move |ctx| {
        let trace = trace.clone();
        let name = name.clone();
        async move {
            trace.lock().push(name);
            Ok(ctx)
        }
    })
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let registry = HookRegistry::default();
    let trace: Trace = Arc::default();

    registry.register(tracing_pre("charge:b", 5, &trace)).unwrap();
    registry.register(tracing_pre("charge:a", 10, &trace)).unwrap();

    let mut ctx = OperationContext::new("m1");
    registry
        .execute_with_hooks("charge", &mut ctx, |_| async { Ok(Value::Null) })
        .await
        .unwrap();

    assert_eq!(*trace.lock(), vec!["charge:a", "charge:b"]);
}

#[tokio::test]
async fn test_hooks_of_other_operations_do_not_run() {
    let registry = HookRegistry::default();
    let trace: Trace = Arc::default();
    registry.register(tracing_pre("refund:audit", 1, &trace)).unwrap();

    let mut ctx = OperationContext::new("m1");
    registry
        .execute_with_hooks("charge", &mut ctx, |_| async { Ok(Value::Null) })
        .await
        .unwrap();

    assert!(trace.lock().is_empty());
}

#[tokio::test]
async fn test_around_hooks_nest_by_priority() {
    let registry = HookRegistry::default();
    let trace: Trace = Arc::default();

    for (id, priority) in [("charge:outer", 10), ("charge:inner", 1)] {
        let trace = trace.clone();
        let name = id.to_string();
        registry
            .register(Hook::around(id, priority, move |ctx, next| {
                let trace = trace.clone();
                let name = name.clone();
                async move {
                    trace.lock().push(format!("enter {}", name));
                    let result = next(ctx).await;
                    trace.lock().push(format!("exit {}", name));
                    result
                }
            }))
            .unwrap();
    }

    let main_trace = trace.clone();
    let mut ctx = OperationContext::new("m1");
    let value = registry
        .execute_with_hooks("charge", &mut ctx, move |_| async move {
            main_trace.lock().push("main".to_string());
            Ok(json!(7))
        })
        .await
        .unwrap();

    assert_eq!(value, json!(7));
    assert_eq!(
        *trace.lock(),
        vec![
            "enter charge:outer",
            "enter charge:inner",
            "main",
            "exit charge:inner",
            "exit charge:outer"
        ]
    );
}

#[tokio::test]
async fn test_around_hook_can_short_circuit() {
    let registry = HookRegistry::default();
    registry
        .register(Hook::around("charge:cache", 1, |_ctx, _next| async {
            Ok(json!("cached"))
        }))
        .unwrap();

    let called = Arc::new(AtomicU32::new(0));
    let counter = called.clone();
    let mut ctx = OperationContext::new("m1");
    let value = registry
        .execute_with_hooks("charge", &mut ctx, move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("fresh"))
        })
        .await
        .unwrap();

    assert_eq!(value, json!("cached"));
    assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_error_hooks_see_error_and_original_error_is_returned() {
    let registry = HookRegistry::default();
    let seen: Arc<Mutex<Option<String>>> = Arc::default();
    let sink = seen.clone();

    registry
        .register(Hook::error("charge:report", 1, move |ctx| {
            let sink = sink.clone();
            async move {
                *sink.lock() = ctx.error.clone();
                Ok(ctx)
            }
        }))
        .unwrap();
    registry
        .register(Hook::post("charge:never", 1, |_ctx| async {
            Err(anyhow!("post hook must not run on failure"))
        }))
        .unwrap();

    let mut ctx = OperationContext::new("m1");
    let err = registry
        .execute_with_hooks("charge", &mut ctx, |_| async { Err(anyhow!("card declined")) })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "card declined");
    assert_eq!(seen.lock().as_deref(), Some("card declined"));
    assert_eq!(registry.performance("charge:never").unwrap().call_count, 0);
}

#[tokio::test]
async fn test_failing_post_hook_is_isolated_and_keeps_context() {
    let registry = HookRegistry::default();
    registry
        .register(Hook::post("charge:broken", 10, |mut ctx| async move {
            ctx.set_extension("broken", true);
            Err(anyhow!("metrics backend down"))
        }))
        .unwrap();

    let mut ctx = OperationContext::new("m1");
    let value = registry
        .execute_with_hooks("charge", &mut ctx, |_| async { Ok(json!("ok")) })
        .await
        .unwrap();

    assert_eq!(value, json!("ok"));
    // The failed hook's rewrite is discarded
    assert!(ctx.extension("broken").is_none());
    assert_eq!(ctx.result, Some(json!("ok")));
    assert_eq!(registry.performance("charge:broken").unwrap().failure_count, 1);
}

#[tokio::test]
async fn test_circuit_breaker_disables_after_five_failures() {
    let registry = HookRegistry::default();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    registry
        .register(Hook::post("charge:flaky", 1, move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("always fails"))
            }
        }))
        .unwrap();

    for _ in 0..8 {
        let mut ctx = OperationContext::new("m1");
        let result = registry
            .execute_with_hooks("charge", &mut ctx, |_| async { Ok(Value::Null) })
            .await;
        assert!(result.is_ok());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(registry.is_disabled("charge:flaky"));
    let perf = registry.performance("charge:flaky").unwrap();
    assert_eq!(perf.failure_count, 5);
    assert!(perf.disabled);
}

#[tokio::test]
async fn test_reorder_by_performance_after_threshold() {
    let registry = HookRegistry::new(HookSettings {
        optimization_threshold: 20,
        ..Default::default()
    });

    registry
        .register(Hook::pre("charge:slow", 10, |ctx| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(ctx)
        }))
        .unwrap();
    registry
        .register(Hook::pre("charge:fast", 5, |ctx| async move { Ok(ctx) }))
        .unwrap();

    for i in 0..19 {
        let mut ctx = OperationContext::new("m1");
        registry
            .execute_with_hooks("charge", &mut ctx, |_| async { Ok(Value::Null) })
            .await
            .unwrap();
        if i == 0 {
            assert_eq!(registry.hooks_for("charge"), vec!["charge:slow", "charge:fast"]);
        }
    }
    assert_eq!(registry.hooks_for("charge"), vec!["charge:slow", "charge:fast"]);

    let mut ctx = OperationContext::new("m1");
    registry
        .execute_with_hooks("charge", &mut ctx, |_| async { Ok(Value::Null) })
        .await
        .unwrap();

    assert_eq!(registry.hooks_for("charge"), vec!["charge:fast", "charge:slow"]);
    assert_eq!(registry.performance("charge:slow").unwrap().call_count, 20);
}
