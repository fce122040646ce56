//! Middleware chain composition.
//!
//! A [`Chain`] is an ordered list of erased policy layers reduced into a
//! single boxed service. Layers apply left-to-right on entry: the first
//! layer added runs outermost. An empty chain is the identity.
//!
//! Concrete layers implement [`tower::Layer`] and are erased through
//! [`ErasedUnaryLayer`] / [`ErasedStreamLayer`], which a blanket
//! implementation provides for every layer whose service accepts the boxed
//! request shape. [`MiddlewareInfo`] supplies the name and the
//! may-reinvoke-the-handler flag the chain validator relies on.
//!
//! ## The validator
//!
//! Within a single invocation, a middleware must call its inner handler at
//! most once: short-circuiting (cache hit, rate-limit rejection, open
//! breaker) is fine, while re-invoking is reserved for retrying policies.
//! [`Chain::validate`] probes each entry in isolation with counting
//! handlers (one succeeding, one failing with a retryable status) and
//! rejects entries that invoke the handler more than once without declaring
//! [`MiddlewareInfo::reinvokes_handler`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

use crate::error::{ConfigError, Status};
use crate::request::{
    stream_handler, unary_handler, CallInfo, RpcRequest, RpcResponse, StreamRequest, StreamRpc,
    UnaryRpc,
};

/// Descriptive facts about a middleware, consumed by the chain validator.
pub trait MiddlewareInfo {
    /// Short name used in diagnostics.
    fn middleware_name(&self) -> &'static str;

    /// Whether this middleware may legitimately invoke its inner handler
    /// more than once per call. Only retrying policies return `true`.
    fn reinvokes_handler(&self) -> bool {
        false
    }
}

/// A unary layer erased to operate on boxed services.
pub trait ErasedUnaryLayer: Send + Sync {
    /// Wraps the boxed inner service.
    fn layer_boxed(&self, inner: UnaryRpc) -> UnaryRpc;
}

impl<L> ErasedUnaryLayer for L
where
    L: Layer<UnaryRpc> + Send + Sync,
    L::Service: Service<RpcRequest, Response = RpcResponse, Error = Status>
        + Clone
        + Send
        + 'static,
    <L::Service as Service<RpcRequest>>::Future: Send + 'static,
{
    fn layer_boxed(&self, inner: UnaryRpc) -> UnaryRpc {
        BoxCloneService::new(self.layer(inner))
    }
}

/// A stream layer erased to operate on boxed services.
pub trait ErasedStreamLayer: Send + Sync {
    /// Wraps the boxed inner service.
    fn layer_boxed(&self, inner: StreamRpc) -> StreamRpc;
}

impl<L> ErasedStreamLayer for L
where
    L: Layer<StreamRpc> + Send + Sync,
    L::Service: Service<StreamRequest, Response = (), Error = Status> + Clone + Send + 'static,
    <L::Service as Service<StreamRequest>>::Future: Send + 'static,
{
    fn layer_boxed(&self, inner: StreamRpc) -> StreamRpc {
        BoxCloneService::new(self.layer(inner))
    }
}

struct ChainEntry<L: ?Sized> {
    layer: Arc<L>,
    name: &'static str,
    reinvokes: bool,
}

impl<L: ?Sized> Clone for ChainEntry<L> {
    fn clone(&self) -> Self {
        Self {
            layer: Arc::clone(&self.layer),
            name: self.name,
            reinvokes: self.reinvokes,
        }
    }
}

/// An ordered middleware chain for unary and streaming calls.
///
/// Two chains holding equal sequences compose observationally equal
/// services; the chain itself carries no identity.
#[derive(Clone, Default)]
pub struct Chain {
    unary: Vec<ChainEntry<dyn ErasedUnaryLayer>>,
    stream: Vec<ChainEntry<dyn ErasedStreamLayer>>,
}

impl Chain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a unary layer; it will run inside all previously added ones.
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: ErasedUnaryLayer + MiddlewareInfo + 'static,
    {
        self.unary.push(ChainEntry {
            name: layer.middleware_name(),
            reinvokes: layer.reinvokes_handler(),
            layer: Arc::new(layer),
        });
        self
    }

    /// Prepends a unary layer; it will run outside all previously added ones.
    pub fn prepend<L>(mut self, layer: L) -> Self
    where
        L: ErasedUnaryLayer + MiddlewareInfo + 'static,
    {
        self.unary.insert(
            0,
            ChainEntry {
                name: layer.middleware_name(),
                reinvokes: layer.reinvokes_handler(),
                layer: Arc::new(layer),
            },
        );
        self
    }

    /// Appends a streaming layer.
    pub fn stream_layer<L>(mut self, layer: L) -> Self
    where
        L: ErasedStreamLayer + MiddlewareInfo + 'static,
    {
        self.stream.push(ChainEntry {
            name: layer.middleware_name(),
            reinvokes: layer.reinvokes_handler(),
            layer: Arc::new(layer),
        });
        self
    }

    /// Number of unary layers.
    pub fn unary_len(&self) -> usize {
        self.unary.len()
    }

    /// Number of streaming layers.
    pub fn stream_len(&self) -> usize {
        self.stream.len()
    }

    /// Returns `true` if the chain holds no layers of either shape.
    pub fn is_empty(&self) -> bool {
        self.unary.is_empty() && self.stream.is_empty()
    }

    /// Reduces the unary layers around `handler` into a single service.
    ///
    /// The first-added layer runs outermost; an empty chain returns the
    /// handler unchanged.
    pub fn compose(&self, handler: UnaryRpc) -> UnaryRpc {
        let mut composed = handler;
        for entry in self.unary.iter().rev() {
            composed = entry.layer.layer_boxed(composed);
        }
        composed
    }

    /// Reduces the streaming layers around `handler` into a single service.
    pub fn compose_stream(&self, handler: StreamRpc) -> StreamRpc {
        let mut composed = handler;
        for entry in self.stream.iter().rev() {
            composed = entry.layer.layer_boxed(composed);
        }
        composed
    }

    /// Probes every entry for handler re-invocation.
    ///
    /// Each layer is applied in isolation around counting probe handlers and
    /// invoked once. A layer that calls the handler more than once without
    /// declaring [`MiddlewareInfo::reinvokes_handler`] fails validation.
    /// Probe outcomes (including injected or short-circuited errors) are
    /// otherwise ignored.
    pub async fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.unary {
            let calls = Arc::new(AtomicUsize::new(0));

            let counter = calls.clone();
            let ok_probe = unary_handler(move |_req: RpcRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(RpcResponse::empty()) }
            });
            let _ = entry
                .layer
                .layer_boxed(ok_probe)
                .oneshot(probe_request())
                .await;

            if !entry.reinvokes {
                let counter = calls.clone();
                let failing_probe = unary_handler(move |_req: RpcRequest| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<RpcResponse, _>(Status::unavailable("probe failure")) }
                });
                let _ = entry
                    .layer
                    .layer_boxed(failing_probe)
                    .oneshot(probe_request())
                    .await;
            }

            // One invocation per probe is the ceiling for anything that is
            // not a retrying policy.
            let observed = calls.load(Ordering::SeqCst);
            if !entry.reinvokes && observed > 2 {
                return Err(ConfigError::ReinvokedHandler {
                    name: entry.name.to_string(),
                    calls: observed,
                });
            }
        }

        for entry in &self.stream {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let probe = stream_handler(move |_req: StreamRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(()) }
            });
            let _ = entry
                .layer
                .layer_boxed(probe)
                .oneshot(StreamRequest::new(CallInfo::streaming(
                    probe_method(),
                    false,
                    true,
                )))
                .await;

            let observed = calls.load(Ordering::SeqCst);
            if observed > 1 && !entry.reinvokes {
                return Err(ConfigError::ReinvokedHandler {
                    name: entry.name.to_string(),
                    calls: observed,
                });
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("unary", &self.unary.iter().map(|e| e.name).collect::<Vec<_>>())
            .field(
                "stream",
                &self.stream.iter().map(|e| e.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Probe methods are randomized so validation never collides with real
/// cached entries or per-method state.
fn probe_method() -> String {
    format!("/rampart.probe/P{}", uuid::Uuid::new_v4().simple())
}

fn probe_request() -> RpcRequest {
    RpcRequest::new(probe_method(), Value::Null)
}
