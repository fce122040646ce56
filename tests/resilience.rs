//! End-to-end resilience scenarios: retry, retry under a deadline, breaker
//! trip and recovery, and rate-limit shaping, driven through composed
//! chains with scripted handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rampart::breaker::{BreakerConfig, CircuitBreakerLayer, State};
use rampart::ratelimit::RateLimitLayer;
use rampart::retry::{Jitter, RetryLayer, RetryPolicy};
use rampart::timeout::TimeoutLayer;
use rampart::{unary_handler, Chain, Code, RpcRequest, RpcResponse, Status, UnaryRpc};
use serde_json::{json, Value};
use tower::{Layer, ServiceExt};

fn unavailable_only_policy(max_attempts: u32, initial_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(initial_ms),
        max_backoff: Duration::from_secs(10),
        multiplier: 2.0,
        jitter: Jitter::None,
        retryable_codes: [Code::Unavailable].into_iter().collect(),
    }
}

fn request() -> RpcRequest {
    RpcRequest::new("/orders.Orders/Place", json!({"order": 1}))
}

#[tokio::test]
async fn retry_recovers_from_two_transient_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler: UnaryRpc = unary_handler(move |_req: RpcRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(Status::unavailable("replica catching up"))
            } else {
                Ok(RpcResponse::new(Value::String("ok".into())))
            }
        }
    });

    let chain = Chain::new().layer(RetryLayer::new(unavailable_only_policy(3, 10)).unwrap());
    let started = Instant::now();
    let resp = chain.compose(handler).oneshot(request()).await.unwrap();

    assert_eq!(resp.message, Value::String("ok".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Two backoffs: 10ms then 20ms.
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn non_retryable_error_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler: UnaryRpc = unary_handler(move |_req: RpcRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<RpcResponse, _>(Status::invalid_argument("malformed order")) }
    });

    let chain = Chain::new().layer(RetryLayer::new(unavailable_only_policy(3, 10)).unwrap());
    let started = Instant::now();
    let err = chain.compose(handler).oneshot(request()).await.unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // No backoff sleep happened.
    assert!(started.elapsed() < Duration::from_millis(10));
}

#[tokio::test]
async fn deadline_cuts_a_retry_loop_short() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler: UnaryRpc = unary_handler(move |_req: RpcRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err::<RpcResponse, _>(Status::unavailable("always down"))
        }
    });

    // Deadline outside, retry inside.
    let chain = Chain::new()
        .layer(TimeoutLayer::from_duration(Duration::from_millis(150)).unwrap())
        .layer(RetryLayer::new(unavailable_only_policy(5, 10)).unwrap());

    let err = chain.compose(handler).oneshot(request()).await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);

    let attempts = calls.load(Ordering::SeqCst);
    assert!(attempts >= 1, "at least one attempt ran");
    assert!(attempts < 5, "deadline prevented exhausting the budget");
}

#[tokio::test]
async fn breaker_trips_recovers_through_probes() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let counter = handler_calls.clone();
    let health = healthy.clone();
    let handler: UnaryRpc = unary_handler(move |_req: RpcRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        let healthy_now = health.load(Ordering::SeqCst);
        async move {
            if healthy_now || n % 5 == 4 {
                Ok(RpcResponse::empty())
            } else {
                Err(Status::unavailable("downstream down"))
            }
        }
    });

    let layer = CircuitBreakerLayer::new(BreakerConfig {
        failure_threshold: 0.5,
        minimum_requests: 10,
        open_timeout: Duration::from_millis(100),
        max_probes: 2,
        success_threshold: 2,
        ..BreakerConfig::default()
    })
    .unwrap();
    let breaker = layer.breaker();
    let svc = layer.layer(handler);

    // 20 submissions at an 80% failure rate trip the breaker.
    for _ in 0..20 {
        let _ = svc.clone().oneshot(request()).await;
    }
    assert_eq!(breaker.state(), State::Open);

    // While open and before the timeout, calls are rejected without
    // reaching the handler.
    let invoked_before = handler_calls.load(Ordering::SeqCst);
    let err = svc.clone().oneshot(request()).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.message().starts_with("circuit breaker: "));
    assert_eq!(handler_calls.load(Ordering::SeqCst), invoked_before);

    // After the open timeout the downstream has recovered; two successful
    // probes close the breaker.
    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(110)).await;

    svc.clone().oneshot(request()).await.unwrap();
    assert_eq!(breaker.state(), State::HalfOpen);
    svc.clone().oneshot(request()).await.unwrap();
    assert_eq!(breaker.state(), State::Closed);
}

#[tokio::test]
async fn rate_limiter_shapes_burst_and_steady_traffic() {
    let handler: UnaryRpc =
        unary_handler(|_req: RpcRequest| async move { Ok(RpcResponse::empty()) });

    let chain = Chain::new().layer(RateLimitLayer::new(100.0, 10).unwrap());
    let svc = chain.compose(handler);

    // A burst of 50 back-to-back calls: the 10-token burst is admitted,
    // the rest are rejected.
    let mut admitted = 0;
    let mut rejected = 0;
    for _ in 0..50 {
        match svc.clone().oneshot(request()).await {
            Ok(_) => admitted += 1,
            Err(status) => {
                assert_eq!(status.code(), Code::ResourceExhausted);
                rejected += 1;
            }
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(rejected, 40);

    // Steady traffic at the refill rate is almost entirely admitted.
    let mut steady_admitted = 0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if svc.clone().oneshot(request()).await.is_ok() {
            steady_admitted += 1;
        }
    }
    assert!(
        steady_admitted >= 95,
        "expected >= 95 admissions, got {steady_admitted}"
    );
}

#[tokio::test]
async fn recommended_ordering_composes_end_to_end() {
    use rampart::cache::{CacheConfig, CacheLayer, MemoryBackend};
    use rampart::trace::TracingLayer;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler: UnaryRpc = unary_handler(move |req: RpcRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(RpcResponse::new(req.message)) }
    });

    let backend = Arc::new(MemoryBackend::with_defaults().unwrap());
    let chain = Chain::new()
        .layer(TracingLayer::new())
        .layer(RateLimitLayer::new(1000.0, 100).unwrap())
        .layer(CacheLayer::new(CacheConfig::new(backend)))
        .layer(
            CircuitBreakerLayer::new(BreakerConfig {
                open_timeout: Duration::from_millis(100),
                ..BreakerConfig::default()
            })
            .unwrap(),
        )
        .layer(TimeoutLayer::from_duration(Duration::from_secs(1)).unwrap())
        .layer(RetryLayer::new(unavailable_only_policy(3, 5)).unwrap());

    chain.validate().await.unwrap();
    let svc = chain.compose(handler);

    let resp = svc.clone().oneshot(request()).await.unwrap();
    assert_eq!(resp.message, json!({"order": 1}));

    // Second identical call is a cache hit; the handler is not re-invoked.
    svc.clone().oneshot(request()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
