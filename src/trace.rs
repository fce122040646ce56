//! # Trace Propagation and Spans
//!
//! Links each call into a distributed trace. The middleware extracts the
//! parent trace context from inbound metadata with a [`Propagator`]
//! (W3C `traceparent` + `baggage` by default), derives a child
//! [`TraceContext`], stores it as a typed extension on the ambient context,
//! and runs the handler inside a `tracing` span named after the call. On
//! return it records the status code on the span, plus the error itself
//! when error recording is enabled.
//!
//! For streaming calls the same layer applies: the derived trace context is
//! written into the request's context before `next`, so everything
//! downstream (including the stream body) observes it.
//!
//! Outbound calls made on behalf of a request use [`inject_outbound`] to
//! write the current trace context into their metadata.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tower::{Layer, Service};
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

use crate::chain::MiddlewareInfo;
use crate::context::RpcContext;
use crate::error::Status;
use crate::metadata::Metadata;
use crate::request::Call;

/// W3C trace-context header carrying ids and flags.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// W3C baggage header carrying key-value annotations.
pub const BAGGAGE_HEADER: &str = "baggage";

/// The propagated identity of a trace: ids, sampling flag, and baggage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex characters; never all zeros.
    pub trace_id: String,
    /// 16 lowercase hex characters identifying the current span.
    pub span_id: String,
    /// Whether the trace is sampled.
    pub sampled: bool,
    /// Propagated key-value annotations.
    pub baggage: Vec<(String, String)>,
}

impl TraceContext {
    /// Starts a brand-new sampled trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            sampled: true,
            baggage: Vec::new(),
        }
    }

    /// Derives a child context: same trace, fresh span id, inherited
    /// sampling decision and baggage.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            sampled: self.sampled,
            baggage: self.baggage.clone(),
        }
    }

    /// Looks up a baggage value.
    pub fn baggage_value(&self, key: &str) -> Option<&str> {
        self.baggage
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn new_span_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..16].to_string()
}

/// Reads and writes trace context on the metadata carrier.
pub trait Propagator: Send + Sync {
    /// Extracts a trace context from inbound metadata, if one is present
    /// and well formed.
    fn extract(&self, metadata: &Metadata) -> Option<TraceContext>;

    /// Injects `trace` into outbound metadata.
    fn inject(&self, trace: &TraceContext, metadata: &mut Metadata);
}

/// The W3C Trace Context + Baggage propagator.
///
/// `traceparent` is `00-{trace-id}-{parent-id}-{flags}`; malformed or
/// all-zero ids are rejected and treated as absent. `baggage` is a comma
/// separated list of `key=value` pairs, carried opaquely.
#[derive(Debug, Clone, Copy, Default)]
pub struct W3cPropagator;

impl W3cPropagator {
    /// Creates the propagator.
    pub fn new() -> Self {
        Self
    }
}

impl Propagator for W3cPropagator {
    fn extract(&self, metadata: &Metadata) -> Option<TraceContext> {
        let header = metadata.get(TRACEPARENT_HEADER)?;
        let mut parts = header.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() && version == "00" {
            return None;
        }

        if version.len() != 2 || !is_lower_hex(version) || version == "ff" {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || is_all_zero(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || is_all_zero(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }
        let sampled = u8::from_str_radix(flags, 16).ok()? & 0x01 == 0x01;

        let mut baggage = Vec::new();
        if let Some(raw) = metadata.get(BAGGAGE_HEADER) {
            for item in raw.split(',') {
                if let Some((key, value)) = item.split_once('=') {
                    let key = key.trim();
                    if !key.is_empty() {
                        baggage.push((key.to_string(), value.trim().to_string()));
                    }
                }
            }
        }

        Some(TraceContext {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled,
            baggage,
        })
    }

    fn inject(&self, trace: &TraceContext, metadata: &mut Metadata) {
        let flags = if trace.sampled { "01" } else { "00" };
        metadata.set(
            TRACEPARENT_HEADER,
            format!("00-{}-{}-{flags}", trace.trace_id, trace.span_id),
        );
        if trace.baggage.is_empty() {
            metadata.remove(BAGGAGE_HEADER);
        } else {
            let encoded = trace
                .baggage
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",");
            metadata.set(BAGGAGE_HEADER, encoded);
        }
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_all_zero(s: &str) -> bool {
    s.chars().all(|c| c == '0')
}

/// Configuration for the tracing middleware.
#[derive(Clone)]
pub struct TracingConfig {
    propagator: Arc<dyn Propagator>,
    record_errors: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            propagator: Arc::new(W3cPropagator::new()),
            record_errors: true,
        }
    }
}

impl TracingConfig {
    /// Creates the default configuration (W3C propagation, errors
    /// recorded).
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the propagator.
    pub fn with_propagator(mut self, propagator: Arc<dyn Propagator>) -> Self {
        self.propagator = propagator;
        self
    }

    /// Toggles error recording on spans.
    pub fn with_record_errors(mut self, record_errors: bool) -> Self {
        self.record_errors = record_errors;
        self
    }
}

impl fmt::Debug for TracingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingConfig")
            .field("record_errors", &self.record_errors)
            .finish()
    }
}

/// Middleware enriching each call with a trace span and propagated
/// context.
#[derive(Debug, Clone, Default)]
pub struct TracingLayer {
    config: TracingConfig,
}

impl TracingLayer {
    /// Creates the layer with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the layer with the given configuration.
    pub fn with_config(config: TracingConfig) -> Self {
        Self { config }
    }
}

impl MiddlewareInfo for TracingLayer {
    fn middleware_name(&self) -> &'static str {
        "tracing"
    }
}

/// The service produced by [`TracingLayer`].
#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
    config: TracingConfig,
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            config: self.config.clone(),
        }
    }
}

impl<S, R> Service<R> for TracingService<S>
where
    R: Call,
    S: Service<R, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, Status>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: R) -> Self::Future {
        let mut inner = self.inner.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let trace = match config.propagator.extract(req.metadata()) {
                Some(parent) => parent.child(),
                None => TraceContext::new_root(),
            };

            let span = info_span!(
                "rpc.server",
                rpc.method = %req.info().full_method,
                rpc.service = %req.info().service_name(),
                trace_id = %trace.trace_id,
                span_id = %trace.span_id,
            );
            req.context_mut().extensions_mut().insert(trace);

            let result = inner.call(req).instrument(span.clone()).await;

            span.in_scope(|| match &result {
                Ok(_) => debug!(status = "ok", "rpc complete"),
                Err(status) => {
                    if config.record_errors {
                        error!(code = %status.code(), message = %status.message(), "rpc failed");
                    } else {
                        debug!(code = %status.code(), "rpc failed");
                    }
                }
            });

            result
        })
    }
}

/// Returns the trace context established for this call, if tracing ran.
pub fn current_trace(ctx: &RpcContext) -> Option<&TraceContext> {
    ctx.extensions().get::<TraceContext>()
}

/// Injects the current trace context into outbound metadata, for calls made
/// downstream on behalf of this request.
pub fn inject_outbound(propagator: &dyn Propagator, ctx: &RpcContext, metadata: &mut Metadata) {
    if let Some(trace) = current_trace(ctx) {
        propagator.inject(trace, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{unary_handler, RpcRequest, RpcResponse};
    use serde_json::Value;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[test]
    fn traceparent_round_trips() {
        let trace = TraceContext {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            sampled: true,
            baggage: vec![("tenant".to_string(), "acme".to_string())],
        };

        let mut metadata = Metadata::new();
        W3cPropagator::new().inject(&trace, &mut metadata);
        assert_eq!(
            metadata.get(TRACEPARENT_HEADER),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );

        let extracted = W3cPropagator::new().extract(&metadata).unwrap();
        assert_eq!(extracted, trace);
    }

    #[test]
    fn malformed_traceparent_is_rejected() {
        let propagator = W3cPropagator::new();
        let cases = [
            "",
            "00",
            "00-short-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-short-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        ];
        for case in cases {
            let mut metadata = Metadata::new();
            metadata.set(TRACEPARENT_HEADER, case);
            assert!(propagator.extract(&metadata).is_none(), "accepted {case:?}");
        }
    }

    #[test]
    fn unsampled_flag_is_preserved() {
        let mut metadata = Metadata::new();
        metadata.set(
            TRACEPARENT_HEADER,
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00",
        );
        let extracted = W3cPropagator::new().extract(&metadata).unwrap();
        assert!(!extracted.sampled);
    }

    #[test]
    fn child_keeps_trace_id_and_renews_span_id() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.span_id.len(), 16);
    }

    #[tokio::test]
    async fn handler_observes_propagated_trace() {
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let handler = unary_handler(move |req: RpcRequest| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = current_trace(&req.context).cloned();
                Ok(RpcResponse::empty())
            }
        });

        let svc = TracingLayer::new().layer(handler);
        let mut req = RpcRequest::new("/billing.Invoices/Get", Value::Null);
        req.metadata.set(
            TRACEPARENT_HEADER,
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        );
        req.metadata.set(BAGGAGE_HEADER, "tenant=acme");

        svc.oneshot(req).await.unwrap();

        let trace = observed.lock().unwrap().clone().expect("trace installed");
        assert_eq!(trace.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        // The middleware starts a child span, not the parent itself.
        assert_ne!(trace.span_id, "00f067aa0ba902b7");
        assert_eq!(trace.baggage_value("tenant"), Some("acme"));
    }

    #[tokio::test]
    async fn missing_parent_starts_new_root() {
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let handler = unary_handler(move |req: RpcRequest| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = current_trace(&req.context).cloned();
                Ok(RpcResponse::empty())
            }
        });

        TracingLayer::new()
            .layer(handler)
            .oneshot(RpcRequest::new("/t.T/Get", Value::Null))
            .await
            .unwrap();

        let trace = observed.lock().unwrap().clone().expect("trace installed");
        assert_eq!(trace.trace_id.len(), 32);
        assert!(trace.sampled);
    }

    #[test]
    fn outbound_injection_uses_current_trace() {
        let mut ctx = RpcContext::new();
        let trace = TraceContext::new_root();
        ctx.extensions_mut().insert(trace.clone());

        let mut outbound = Metadata::new();
        inject_outbound(&W3cPropagator::new(), &ctx, &mut outbound);

        let header = outbound.get(TRACEPARENT_HEADER).unwrap();
        assert!(header.contains(&trace.trace_id));
    }
}
