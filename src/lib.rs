//! # Rampart
//!
//! Composable resilience middleware for RPC server runtimes. Rampart
//! interposes reusable policies (retry with exponential backoff, circuit
//! breaking, deadline enforcement, rate limiting, response caching, trace
//! propagation, and fault injection) between inbound invocations and user
//! handlers. Each policy is a [`tower::Layer`] over the canonical handler
//! signature, and a [`Chain`] combines any number of them into a single
//! interceptor.
//!
//! ## Core Concepts
//!
//! - **[`RpcRequest`] / [`RpcResponse`]**: the unary handler signature.
//!   A handler is any `tower::Service<RpcRequest, Response = RpcResponse,
//!   Error = Status>`; [`unary_handler`] adapts an async closure.
//! - **[`RpcContext`]**: the ambient context carried by every call:
//!   deadline, cancellation, and typed request-scoped extensions. Every
//!   suspension point in the crate aborts promptly when it fires.
//! - **[`Chain`]**: an ordered list of policy layers reduced into one
//!   service. The first layer added runs outermost; an empty chain is the
//!   identity. A validator rejects middlewares that re-invoke their
//!   handler without being retrying policies.
//! - **[`Status`] / [`Code`]**: the one error shape on the wire. Policy
//!   rejections use fixed codes (`ResourceExhausted` for rate limits,
//!   `Unavailable` for an open breaker, `DeadlineExceeded` for expired
//!   deadlines); handler errors pass through verbatim.
//!
//! ## Ordering
//!
//! Any ordering works; the recommended one, outermost first, is tracing
//! (observe even rejected requests), rate limiting (cheap reject), cache
//! (serve before expensive work), circuit breaker (skip a known-bad
//! downstream), deadline, then retry around the handler.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use rampart::retry::{RetryLayer, RetryPolicy};
//! use rampart::timeout::TimeoutLayer;
//! use rampart::{unary_handler, Chain, RpcRequest, RpcResponse};
//! use tower::ServiceExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let chain = Chain::new()
//!         .layer(TimeoutLayer::from_duration(Duration::from_secs(1))?)
//!         .layer(RetryLayer::new(RetryPolicy::default())?);
//!
//!     let handler =
//!         unary_handler(|req: RpcRequest| async move { Ok(RpcResponse::new(req.message)) });
//!
//!     let svc = chain.compose(handler);
//!     let resp = svc
//!         .oneshot(RpcRequest::new("/demo.Echo/Echo", serde_json::json!("hi")))
//!         .await?;
//!     assert_eq!(resp.message, serde_json::json!("hi"));
//!     Ok(())
//! }
//! ```
//!
//! All state is in-memory and process-local: nothing persists across
//! restarts and instances do not coordinate.

pub mod breaker;
pub mod cache;
pub mod chain;
pub mod chaos;
pub mod context;
pub mod error;
pub mod metadata;
pub mod ratelimit;
pub mod request;
pub mod retry;
pub mod timeout;
pub mod trace;

// Re-export core types for convenience
pub use chain::{Chain, ErasedStreamLayer, ErasedUnaryLayer, MiddlewareInfo};
pub use context::{CallerIdentity, CancelToken, Extensions, RpcContext};
pub use error::{Code, ConfigError, Result, Status};
pub use metadata::Metadata;
pub use request::{
    stream_handler, unary_handler, Call, CallInfo, RpcRequest, RpcResponse, StreamRequest,
    StreamRpc, UnaryRpc,
};

/// Every policy layer in one place.
pub mod layers {
    pub use crate::breaker::CircuitBreakerLayer;
    pub use crate::cache::CacheLayer;
    pub use crate::chaos::ChaosLayer;
    pub use crate::ratelimit::{
        AdaptiveRateLimitLayer, PerKeyRateLimitLayer, PerMethodRateLimitLayer, RateLimitLayer,
    };
    pub use crate::retry::RetryLayer;
    pub use crate::timeout::TimeoutLayer;
    pub use crate::trace::TracingLayer;
}
