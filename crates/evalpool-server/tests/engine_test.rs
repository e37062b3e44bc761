// Engine integration tests
//
// Each test builds its own engine; engines share nothing, so tests run in
// parallel safely.

use evalpool_common::protocol::error::EvalError;
use evalpool_common::protocol::{ExecuteRequest, ExecuteResponse};
use evalpool_metrics::{ExecutionStatus, LabelSet};
use evalpool_server::{Engine, EngineConfig, ExecuteHandler, JsonConfigSource};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

fn start_engine(config: EngineConfig) -> (Arc<Engine>, ExecuteHandler) {
    let engine = Engine::with_config(config).expect("valid config");
    let _errors = engine.start().expect("engine starts");
    let handler = engine.rpc().expect("engine is started");
    (Arc::new(engine), handler)
}

fn pool_available(engine: &Engine) -> u64 {
    engine.metrics().registry().pool_available()
}

/// Polls the pool-available gauge until it reaches `expected`.
async fn wait_for_available(engine: &Engine, expected: u64, within: Duration) {
    let deadline = Instant::now() + within;
    while pool_available(engine) != expected {
        assert!(
            Instant::now() < deadline,
            "pool-available stuck at {} (expected {})",
            pool_available(engine),
            expected
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Busy-waits inside the script for `ms` milliseconds.
fn busy_script(ms: u64) -> String {
    format!("var s = Date.now(); while (Date.now() - s < {}) {{}} 'done'", ms)
}

async fn run(handler: &ExecuteHandler, code: &str) -> ExecuteResponse {
    handler.execute(ExecuteRequest::new(code)).await
}

// ============================================================================
// Results and faults
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_deterministic_result() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let response = run(&handler, "var result = 2 + 2; result;").await;
    assert_eq!(response.result, json!(4));
    assert_eq!(response.error, "");
    assert!(response.is_success());

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_id_is_echoed() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let response = handler
        .execute(ExecuteRequest::new("'hi'").with_request_id("req-42").with_timeout_ms(-5))
        .await;
    assert_eq!(response.result, json!("hi"));
    assert_eq!(response.request_id.as_deref(), Some("req-42"));

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fault_isolation() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let response = run(&handler, "throw new Error('boom')").await;
    assert!(response.error.contains("boom"), "{}", response.error);
    assert_eq!(response.result, json!(null));

    // The same interpreter keeps working.
    let response = run(&handler, "[1, 2, 3].map(x => x * 2)").await;
    assert_eq!(response.result, json!([2, 4, 6]));
    assert_eq!(pool_available(&engine), 1);

    let registry = engine.metrics().registry();
    assert_eq!(registry.status_count(ExecutionStatus::Error), 1);
    assert_eq!(registry.status_count(ExecutionStatus::Success), 1);

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_promise_result() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let response = run(&handler, "Promise.resolve(40).then(v => v + 2)").await;
    assert_eq!(response.result, json!(42));

    let response = run(&handler, "(async () => { throw new Error('async boom'); })()").await;
    assert!(response.error.contains("async boom"));

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unexportable_result() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let response = run(&handler, "(function () { return 1; })").await;
    assert!(response.error.contains("export"), "{}", response.error);

    let response = run(&handler, "var a = {}; a.self = a; a").await;
    assert!(!response.is_success());

    let response = run(&handler, "({ n: NaN })").await;
    assert!(!response.is_success());

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_log_bindings_do_not_throw() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let response = run(
        &handler,
        r#"
        log.info('starting', {user: 'alice', attempt: 1});
        log.debug();
        log.warn('odd fields', 'not an object');
        log.error('done');
        'ok'
        "#,
    )
    .await;
    assert_eq!(response.result, json!("ok"));

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_code_short_circuits() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(2));
    let before = pool_available(&engine);

    let response = run(&handler, "").await;
    assert_eq!(response.error, EvalError::EmptyCode.to_string());
    assert_eq!(response.result, json!(null));

    assert_eq!(pool_available(&engine), before);
    assert_eq!(engine.metrics().registry().total_executions(), 0);

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_enforcement() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let response = handler
        .execute(ExecuteRequest::new("while (true) {}").with_timeout_ms(100))
        .await;

    assert!(response.error.contains("timeout"), "{}", response.error);
    assert!(response.duration_ms >= 100, "{}ms", response.duration_ms);
    assert!(response.duration_ms < 600, "{}ms", response.duration_ms);

    // The interpreter comes back once it honors the interrupt.
    wait_for_available(&engine, 1, Duration::from_secs(3)).await;
    let response = run(&handler, "'recovered'").await;
    assert_eq!(response.result, json!("recovered"));

    assert_eq!(
        engine.metrics().registry().status_count(ExecutionStatus::Timeout),
        1
    );

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_default_timeout_applies() {
    let config = EngineConfig::new()
        .with_pool_size(1)
        .with_default_timeout(Duration::from_millis(150));
    let (engine, handler) = start_engine(config);

    let response = run(&handler, "for (;;) {}").await;
    assert!(response.error.contains("150ms"), "{}", response.error);

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unresponsive_interpreter_is_replaced() {
    let config = EngineConfig::new()
        .with_pool_size(1)
        .with_interrupt_grace(Duration::from_millis(50));
    let (engine, handler) = start_engine(config);

    // Promise reactions run to completion without check-points, so this one
    // only sees the interrupt long after the grace period.
    let response = handler
        .execute(
            ExecuteRequest::new(format!(
                "Promise.resolve().then(() => {{ {} }})",
                busy_script(500)
            ))
            .with_timeout_ms(100),
        )
        .await;
    assert!(response.error.contains("timeout"));

    wait_for_available(&engine, 1, Duration::from_secs(5)).await;
    let response = run(&handler, "typeof log").await;
    assert_eq!(response.result, json!("object"));

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_caller_giving_up_does_not_leak_interpreter() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let gave_up = tokio::time::timeout(
        Duration::from_millis(50),
        handler.execute(ExecuteRequest::new("while (true) {}").with_timeout_ms(200)),
    )
    .await;
    assert!(gave_up.is_err());

    wait_for_available(&engine, 1, Duration::from_secs(5)).await;
    assert_eq!(engine.metrics().registry().active_executions(), 0);

    let response = run(&handler, "'after'").await;
    assert_eq!(response.result, json!("after"));

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

// ============================================================================
// Pool behaviour
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_pool_saturation() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(2));

    let runners: Vec<_> = (0..2)
        .map(|_| {
            let handler = handler.clone();
            tokio::spawn(async move { run(&handler, &busy_script(400)).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool_available(&engine), 0);

    let started = Instant::now();
    let queued = run(&handler, "'third'").await;
    assert_eq!(queued.result, json!("third"));
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "third execution did not wait: {:?}",
        started.elapsed()
    );

    for runner in futures::future::join_all(runners).await {
        assert_eq!(runner.unwrap().result, json!("done"));
    }

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quiescence_after_mixed_load() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(4));

    let scripts = ["1 + 1", "throw new Error('x')", "while (true) {}", "({a: [1]})", ""];
    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let handler = handler.clone();
            let code = scripts[i % scripts.len()].to_string();
            tokio::spawn(async move {
                handler
                    .execute(ExecuteRequest::new(code).with_timeout_ms(100))
                    .await
            })
        })
        .collect();

    let responses: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(responses.len(), 20);
    assert_eq!(responses.iter().filter(|r| r.is_success()).count(), 8);

    wait_for_available(&engine, 4, Duration::from_secs(5)).await;
    assert_eq!(engine.metrics().registry().active_executions(), 0);
    assert_eq!(engine.metrics().registry().total_executions(), 16);

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_acquisition() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let runner = {
        let handler = handler.clone();
        tokio::spawn(async move { run(&handler, &busy_script(300)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = handler
        .execute_with_cancel(
            ExecuteRequest::new("'never'"),
            tokio::time::sleep(Duration::from_millis(30)),
        )
        .await;
    assert!(response.error.contains("cancelled"), "{}", response.error);

    // Cancelling the wait does not disturb the running execution.
    assert_eq!(runner.await.unwrap().result, json!("done"));
    assert_eq!(
        engine.metrics().registry().status_count(ExecutionStatus::Unavailable),
        1
    );

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_custom_counters_add_up() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(4));

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let handler = handler.clone();
            tokio::spawn(async move {
                run(
                    &handler,
                    "metrics.increment('hits', {route: 'a'}); metrics.add('hits', 2, {route: 'a'}); 1",
                )
                .await
            })
        })
        .collect();

    for response in futures::future::join_all(tasks).await {
        assert!(response.unwrap().is_success());
    }

    let labels = LabelSet::from([("route".to_string(), "a".to_string())]);
    let hits = engine.custom_metrics().lookup("hits").expect("registered");
    assert_eq!(hits.value(&labels), Some(120.0));
    assert_eq!(hits.name(), "script_hits");

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_globals_persist_between_executions() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    run(&handler, "var visits = (typeof visits === 'number' ? visits : 0) + 1;").await;
    let response = run(&handler, "visits").await;
    assert_eq!(response.result, json!(1));

    engine.stop(Duration::from_secs(1)).await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_init_from_config_source() {
    let source = JsonConfigSource::from_value(json!({"evalpool": {"pool_size": 3}}));
    let engine = Engine::init(&source).unwrap();
    let _errors = engine.start().unwrap();
    assert_eq!(pool_available(&engine), 3);
    assert_eq!(engine.rpc().unwrap().info().pool_size, 3);
    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_rejects_new_work() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(2));
    engine.stop(Duration::from_secs(1)).await.unwrap();

    let started = Instant::now();
    let response = run(&handler, "1").await;
    assert!(response.error.contains("shutting down"), "{}", response.error);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(engine.rpc().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_fails_blocked_acquirers() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let runner = {
        let handler = handler.clone();
        tokio::spawn(async move { run(&handler, &busy_script(300)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiter = {
        let handler = handler.clone();
        tokio::spawn(async move { run(&handler, "'late'").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.stop(Duration::from_secs(2)).await.unwrap();

    let waiter = waiter.await.unwrap();
    assert!(waiter.error.contains("shutting down"), "{}", waiter.error);

    // In-flight work was allowed to finish within the grace period.
    assert_eq!(runner.await.unwrap().result, json!("done"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_degraded_shutdown_does_not_hang() {
    let (engine, handler) = start_engine(EngineConfig::new().with_pool_size(1));

    let runner = {
        let handler = handler.clone();
        tokio::spawn(async move {
            handler
                .execute(ExecuteRequest::new("while (true) {}").with_timeout_ms(2_000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    engine.stop(Duration::from_millis(200)).await.unwrap();
    let took = started.elapsed();
    assert!(took >= Duration::from_millis(200), "{:?}", took);
    assert!(took < Duration::from_secs(1), "{:?}", took);

    // The abandoned execution still ends with its own timeout.
    let response = runner.await.unwrap();
    assert!(response.error.contains("timeout"));
}
