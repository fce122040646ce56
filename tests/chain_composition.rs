//! Chain composition semantics: ordering, identity, associativity, and the
//! re-invocation validator, verified with probe layers that record their
//! entry and exit points.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use rampart::{
    unary_handler, Chain, ConfigError, MiddlewareInfo, RpcRequest, RpcResponse, Status, UnaryRpc,
};
use serde_json::{json, Value};
use tower::{Layer, Service, ServiceExt};

type ProbeLog = Arc<Mutex<Vec<String>>>;

/// Records "<tag>:enter" / "<tag>:exit" around the inner call.
#[derive(Clone)]
struct ProbeLayer {
    tag: &'static str,
    log: ProbeLog,
}

impl ProbeLayer {
    fn new(tag: &'static str, log: &ProbeLog) -> Self {
        Self {
            tag,
            log: log.clone(),
        }
    }
}

#[derive(Clone)]
struct ProbeService<S> {
    inner: S,
    tag: &'static str,
    log: ProbeLog,
}

impl<S> Layer<S> for ProbeLayer {
    type Service = ProbeService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        ProbeService {
            inner,
            tag: self.tag,
            log: self.log.clone(),
        }
    }
}

impl<S> Service<RpcRequest> for ProbeService<S>
where
    S: Service<RpcRequest, Response = RpcResponse, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = RpcResponse;
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<RpcResponse, Status>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RpcRequest) -> Self::Future {
        let mut inner = self.inner.clone();
        let tag = self.tag;
        let log = self.log.clone();
        Box::pin(async move {
            log.lock().unwrap().push(format!("{tag}:enter"));
            let result = inner.call(req).await;
            log.lock().unwrap().push(format!("{tag}:exit"));
            result
        })
    }
}

impl MiddlewareInfo for ProbeLayer {
    fn middleware_name(&self) -> &'static str {
        "probe"
    }
}

/// Invokes its handler twice per call; the validator must reject it.
#[derive(Clone, Copy)]
struct GreedyLayer;

#[derive(Clone)]
struct GreedyService<S> {
    inner: S,
}

impl<S> Layer<S> for GreedyLayer {
    type Service = GreedyService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        GreedyService { inner }
    }
}

impl<S> Service<RpcRequest> for GreedyService<S>
where
    S: Service<RpcRequest, Response = RpcResponse, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = RpcResponse;
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<RpcResponse, Status>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RpcRequest) -> Self::Future {
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let _ = inner.call(req.clone()).await;
            inner.call(req).await
        })
    }
}

impl MiddlewareInfo for GreedyLayer {
    fn middleware_name(&self) -> &'static str {
        "greedy"
    }
}

fn echo() -> UnaryRpc {
    unary_handler(|req: RpcRequest| async move { Ok(RpcResponse::new(req.message)) })
}

fn request() -> RpcRequest {
    RpcRequest::new("/compose.T/Echo", json!({"n": 1}))
}

#[tokio::test]
async fn layers_run_outside_in_then_inside_out() {
    let log: ProbeLog = Arc::new(Mutex::new(Vec::new()));
    let chain = Chain::new()
        .layer(ProbeLayer::new("a", &log))
        .layer(ProbeLayer::new("b", &log))
        .layer(ProbeLayer::new("c", &log));

    chain.compose(echo()).oneshot(request()).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["a:enter", "b:enter", "c:enter", "c:exit", "b:exit", "a:exit"]
    );
}

#[tokio::test]
async fn empty_chain_is_the_identity() {
    let via_chain = Chain::new()
        .compose(echo())
        .oneshot(request())
        .await
        .unwrap();
    let direct = echo().oneshot(request()).await.unwrap();
    assert_eq!(via_chain, direct);
}

#[tokio::test]
async fn composition_is_associative() {
    // Compose(Compose(A, B), C, H) vs Compose(A, Compose(B, C), H): the
    // observable entry/exit sequences and responses must match.
    let left_log: ProbeLog = Arc::new(Mutex::new(Vec::new()));
    let ab = Chain::new()
        .layer(ProbeLayer::new("a", &left_log))
        .layer(ProbeLayer::new("b", &left_log));
    let c = Chain::new().layer(ProbeLayer::new("c", &left_log));
    let left = ab.compose(c.compose(echo()));

    let right_log: ProbeLog = Arc::new(Mutex::new(Vec::new()));
    let a = Chain::new().layer(ProbeLayer::new("a", &right_log));
    let bc = Chain::new()
        .layer(ProbeLayer::new("b", &right_log))
        .layer(ProbeLayer::new("c", &right_log));
    let right = a.compose(bc.compose(echo()));

    let left_resp = left.oneshot(request()).await.unwrap();
    let right_resp = right.oneshot(request()).await.unwrap();

    assert_eq!(left_resp, right_resp);
    assert_eq!(*left_log.lock().unwrap(), *right_log.lock().unwrap());
}

#[tokio::test]
async fn short_circuiting_layers_skip_the_handler() {
    let log: ProbeLog = Arc::new(Mutex::new(Vec::new()));

    // A layer that rejects without calling next still yields a well-formed
    // error, and inner layers never run.
    #[derive(Clone, Copy)]
    struct RejectLayer;

    #[derive(Clone)]
    struct RejectService<S> {
        _inner: S,
    }

    impl<S> Layer<S> for RejectLayer {
        type Service = RejectService<S>;
        fn layer(&self, inner: S) -> Self::Service {
            RejectService { _inner: inner }
        }
    }

    impl<S> Service<RpcRequest> for RejectService<S>
    where
        S: Service<RpcRequest, Response = RpcResponse, Error = Status> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        type Response = RpcResponse;
        type Error = Status;
        type Future = Pin<Box<dyn Future<Output = Result<RpcResponse, Status>> + Send>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: RpcRequest) -> Self::Future {
            Box::pin(async move { Err(Status::resource_exhausted("rejected")) })
        }
    }

    impl MiddlewareInfo for RejectLayer {
        fn middleware_name(&self) -> &'static str {
            "reject"
        }
    }

    let chain = Chain::new()
        .layer(ProbeLayer::new("outer", &log))
        .layer(RejectLayer)
        .layer(ProbeLayer::new("inner", &log));

    let err = chain.compose(echo()).oneshot(request()).await.unwrap_err();
    assert_eq!(err.code(), rampart::Code::ResourceExhausted);
    assert_eq!(*log.lock().unwrap(), vec!["outer:enter", "outer:exit"]);
}

#[tokio::test]
async fn validator_flags_greedy_middleware_by_name() {
    let chain = Chain::new().layer(GreedyLayer);
    match chain.validate().await.unwrap_err() {
        ConfigError::ReinvokedHandler { name, calls } => {
            assert_eq!(name, "greedy");
            assert!(calls > 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn validator_accepts_a_retrying_policy() {
    use rampart::retry::{Jitter, RetryLayer, RetryPolicy};

    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: std::time::Duration::from_millis(1),
        jitter: Jitter::None,
        ..RetryPolicy::default()
    };
    let chain = Chain::new()
        .layer(RetryLayer::new(policy).unwrap())
        .layer(GreedyLayer);

    // The retry entry passes; the greedy entry is still caught.
    let err = chain.validate().await.unwrap_err();
    assert!(matches!(
        err,
        ConfigError::ReinvokedHandler { ref name, .. } if name == "greedy"
    ));
}

#[tokio::test]
async fn body_agnostic_layers_also_serve_streams() {
    use rampart::timeout::TimeoutLayer;
    use rampart::trace::{current_trace, TracingLayer};
    use rampart::{stream_handler, CallInfo, StreamRequest};
    use std::time::Duration;

    let observed = Arc::new(Mutex::new(false));
    let sink = observed.clone();
    let handler = stream_handler(move |req: StreamRequest| {
        let sink = sink.clone();
        async move {
            // The stream observes the context the layers installed.
            *sink.lock().unwrap() =
                current_trace(&req.context).is_some() && req.context.deadline().is_some();
            Ok(())
        }
    });

    let chain = Chain::new()
        .stream_layer(TracingLayer::new())
        .stream_layer(TimeoutLayer::from_duration(Duration::from_secs(1)).unwrap());
    chain.validate().await.unwrap();

    chain
        .compose_stream(handler)
        .oneshot(StreamRequest::new(CallInfo::streaming(
            "/feed.Feed/Watch",
            false,
            true,
        )))
        .await
        .unwrap();

    assert!(*observed.lock().unwrap());
}

#[tokio::test]
async fn two_equal_chains_compose_equal_services() {
    let build = || {
        let log: ProbeLog = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .layer(ProbeLayer::new("x", &log))
            .layer(ProbeLayer::new("y", &log));
        (chain, log)
    };

    let (first, first_log) = build();
    let (second, second_log) = build();

    let a = first
        .compose(echo())
        .oneshot(RpcRequest::new("/t.T/Echo", Value::Bool(true)))
        .await
        .unwrap();
    let b = second
        .compose(echo())
        .oneshot(RpcRequest::new("/t.T/Echo", Value::Bool(true)))
        .await
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(*first_log.lock().unwrap(), *second_log.lock().unwrap());
}
