#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use baton_core::{BatonError, BatonResult, RetryPolicy};
use baton_governor::{ConnectionGovernor, EndpointConfig, ToolEndpoint, ToolRequest};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

// ---------------------------------------------------------------------------
// 1. 200 concurrent callers against max-concurrency 10 / queue depth 50
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_saturation_is_bounded_and_excess_is_throttled() {
    let governor = Arc::new(
        ConnectionGovernor::new([EndpointConfig::new("reviewer")
            .with_limits(10, 50)
            .with_rate(0, Duration::from_secs(1))])
        .unwrap(),
    );
    let live = Arc::new(AtomicUsize::new(0));
    let max_live = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(200));

    let mut handles = Vec::new();
    for _ in 0..200 {
        let governor = governor.clone();
        let live = live.clone();
        let max_live = max_live.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            governor
                .call("reviewer", Duration::from_secs(30), || async {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    max_live.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BatonError>(())
                })
                .await
        }));
    }

    let mut ok = 0;
    let mut throttled = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => ok += 1,
            Err(BatonError::Throttled { .. }) => throttled += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }

    let stats = governor.endpoint_stats("reviewer").unwrap();
    assert_eq!(ok + throttled, 200);
    assert!(max_live.load(Ordering::SeqCst) <= 10);
    assert!(stats.peak_in_flight <= 10);
    assert!(stats.peak_queued <= 50);
    assert!(ok >= 60, "ok = {ok}");
    assert!(throttled >= 100, "throttled = {throttled}");
    assert_eq!(stats.throttled, throttled as u64);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
}

// ---------------------------------------------------------------------------
// 2. Queued callers are admitted in arrival order
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_callers_are_admitted_fifo() {
    let governor = Arc::new(
        ConnectionGovernor::new([EndpointConfig::new("planner")
            .with_limits(1, 10)
            .with_rate(0, Duration::from_secs(1))])
        .unwrap(),
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    let held = governor
        .acquire("planner", Duration::from_secs(5))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let governor = governor.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let permit = governor
                .acquire("planner", Duration::from_secs(10))
                .await
                .unwrap();
            order.lock().push(i);
            tokio::time::sleep(Duration::from_millis(5)).await;
            permit.succeed();
        }));
        // Let each caller reach the queue before the next one arrives.
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    assert_eq!(governor.endpoint_stats("planner").unwrap().queued, 5);
    drop(held);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

// ---------------------------------------------------------------------------
// 3. Retried invocation through a registered tool
// ---------------------------------------------------------------------------

struct FlakyTool {
    calls: AtomicUsize,
    fail_first: usize,
}

#[async_trait]
impl ToolEndpoint for FlakyTool {
    async fn invoke(&self, request: &ToolRequest) -> BatonResult<serde_json::Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            Err(BatonError::Http("503 Service Unavailable".into()))
        } else {
            Ok(serde_json::json!({"echo": request.payload.clone()}))
        }
    }
}

#[tokio::test]
async fn test_invoke_with_retry_recovers_and_tracks_health() {
    let governor = ConnectionGovernor::new([EndpointConfig::new("search")
        .with_limits(2, 2)
        .with_health_alpha(0.5)])
    .unwrap();
    let tool = Arc::new(FlakyTool {
        calls: AtomicUsize::new(0),
        fail_first: 2,
    });
    governor.register_tool("search", tool.clone()).unwrap();

    let policy = RetryPolicy {
        max_attempts: 4,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        jitter: 0.0,
    };
    let request = ToolRequest::new("search", "query", serde_json::json!("rust"));
    let out = governor
        .invoke_with_retry(&request, Duration::from_secs(2), &policy)
        .await
        .unwrap();
    assert_eq!(out["echo"], "rust");
    assert_eq!(tool.calls.load(Ordering::SeqCst), 3);

    let stats = governor.endpoint_stats("search").unwrap();
    assert_eq!((stats.successes, stats.failures), (1, 2));
    assert!((stats.health - 0.625).abs() < 1e-9);
}

#[tokio::test]
async fn test_invoke_without_registered_tool_fails() {
    let governor = ConnectionGovernor::new([EndpointConfig::new("search")]).unwrap();
    let err = governor
        .invoke(
            &ToolRequest::new("search", "query", serde_json::Value::Null),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatonError::UnknownEndpoint(_)));
    assert!(governor
        .register_tool("missing", Arc::new(FlakyTool {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        }))
        .is_err());
}
