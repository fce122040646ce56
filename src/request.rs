//! Request and response shapes for the middleware stack.
//!
//! A middleware is a [`tower::Service`] over one of two request shapes:
//!
//! - [`RpcRequest`] for unary calls, producing an [`RpcResponse`];
//! - [`StreamRequest`] for streaming calls, producing `()`; the stream
//!   itself flows outside the policy layer, which only governs the call.
//!
//! Policies that never touch the message body (deadlines, rate limiting,
//! circuit breaking, tracing, fault injection) are generic over the
//! [`Call`] trait, which both shapes implement, so one service definition
//! covers unary and streaming. Because a [`StreamRequest`] carries its
//! [`RpcContext`] by value, a stream middleware overrides the context seen
//! downstream simply by replacing it before calling `next`.

use std::future::Future;

use serde_json::Value;
use tower::util::BoxCloneService;
use tower::service_fn;

use crate::context::RpcContext;
use crate::error::Status;
use crate::metadata::Metadata;

/// Static facts about the invoked RPC method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    /// Full method path, `"/package.Service/Method"`.
    pub full_method: String,
    /// Whether the client sends a stream of messages.
    pub is_client_streaming: bool,
    /// Whether the server sends a stream of messages.
    pub is_server_streaming: bool,
}

impl CallInfo {
    /// Describes a unary method.
    pub fn unary(full_method: impl Into<String>) -> Self {
        Self {
            full_method: full_method.into(),
            is_client_streaming: false,
            is_server_streaming: false,
        }
    }

    /// Describes a streaming method.
    pub fn streaming(
        full_method: impl Into<String>,
        is_client_streaming: bool,
        is_server_streaming: bool,
    ) -> Self {
        Self {
            full_method: full_method.into(),
            is_client_streaming,
            is_server_streaming,
        }
    }

    /// The service part of `"/package.Service/Method"`.
    pub fn service_name(&self) -> &str {
        let path = self.full_method.trim_start_matches('/');
        path.split('/').next().unwrap_or(path)
    }

    /// The method part of `"/package.Service/Method"`.
    pub fn method_name(&self) -> &str {
        self.full_method
            .rsplit('/')
            .next()
            .unwrap_or(&self.full_method)
    }
}

/// A unary RPC invocation as seen by the middleware stack.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Ambient context: deadline, cancellation, typed extensions.
    pub context: RpcContext,
    /// Inbound call metadata (headers).
    pub metadata: Metadata,
    /// Static facts about the invoked method.
    pub info: CallInfo,
    /// The request message, canonically representable.
    pub message: Value,
}

impl RpcRequest {
    /// Creates a unary request with a fresh context and empty metadata.
    pub fn new(full_method: impl Into<String>, message: Value) -> Self {
        Self {
            context: RpcContext::new(),
            metadata: Metadata::new(),
            info: CallInfo::unary(full_method),
            message,
        }
    }
}

/// The response to a unary RPC invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    /// The response message.
    pub message: Value,
    /// Outbound metadata (trailers / headers to send back).
    pub metadata: Metadata,
}

impl RpcResponse {
    /// Creates a response carrying `message`.
    pub fn new(message: Value) -> Self {
        Self {
            message,
            metadata: Metadata::new(),
        }
    }

    /// Creates an empty (`null`-message) response.
    pub fn empty() -> Self {
        Self::new(Value::Null)
    }
}

/// A streaming RPC invocation as seen by the middleware stack.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Ambient context; replace it before calling `next` to override the
    /// context the stream observes.
    pub context: RpcContext,
    /// Inbound call metadata (headers).
    pub metadata: Metadata,
    /// Static facts about the invoked method.
    pub info: CallInfo,
}

impl StreamRequest {
    /// Creates a stream request with a fresh context and empty metadata.
    pub fn new(info: CallInfo) -> Self {
        Self {
            context: RpcContext::new(),
            metadata: Metadata::new(),
            info,
        }
    }
}

/// Common surface of [`RpcRequest`] and [`StreamRequest`], letting
/// body-agnostic policies serve both shapes with one implementation.
pub trait Call: Send + 'static {
    /// The ambient context.
    fn context(&self) -> &RpcContext;
    /// Mutable access to the ambient context.
    fn context_mut(&mut self) -> &mut RpcContext;
    /// Inbound call metadata.
    fn metadata(&self) -> &Metadata;
    /// Mutable access to the inbound metadata.
    fn metadata_mut(&mut self) -> &mut Metadata;
    /// Static facts about the invoked method.
    fn info(&self) -> &CallInfo;
}

impl Call for RpcRequest {
    fn context(&self) -> &RpcContext {
        &self.context
    }
    fn context_mut(&mut self) -> &mut RpcContext {
        &mut self.context
    }
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
    fn info(&self) -> &CallInfo {
        &self.info
    }
}

impl Call for StreamRequest {
    fn context(&self) -> &RpcContext {
        &self.context
    }
    fn context_mut(&mut self) -> &mut RpcContext {
        &mut self.context
    }
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
    fn info(&self) -> &CallInfo {
        &self.info
    }
}

/// Boxed, cloneable unary service: the erased shape chains compose.
pub type UnaryRpc = BoxCloneService<RpcRequest, RpcResponse, Status>;

/// Boxed, cloneable streaming service.
pub type StreamRpc = BoxCloneService<StreamRequest, (), Status>;

/// Adapts an async function into a boxed unary handler.
pub fn unary_handler<F, Fut>(f: F) -> UnaryRpc
where
    F: FnMut(RpcRequest) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<RpcResponse, Status>> + Send + 'static,
{
    BoxCloneService::new(service_fn(f))
}

/// Adapts an async function into a boxed stream handler.
pub fn stream_handler<F, Fut>(f: F) -> StreamRpc
where
    F: FnMut(StreamRequest) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    BoxCloneService::new(service_fn(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[test]
    fn call_info_splits_service_and_method() {
        let info = CallInfo::unary("/inventory.Catalog/GetItem");
        assert_eq!(info.service_name(), "inventory.Catalog");
        assert_eq!(info.method_name(), "GetItem");
        assert!(!info.is_client_streaming);
    }

    #[test]
    fn call_info_tolerates_bare_names() {
        let info = CallInfo::unary("Ping");
        assert_eq!(info.service_name(), "Ping");
        assert_eq!(info.method_name(), "Ping");
    }

    #[tokio::test]
    async fn unary_handler_round_trip() {
        let handler = unary_handler(|req: RpcRequest| async move {
            Ok(RpcResponse::new(serde_json::json!({
                "echo": req.message,
            })))
        });

        let resp = handler
            .oneshot(RpcRequest::new("/t.T/Echo", serde_json::json!("hi")))
            .await
            .unwrap();
        assert_eq!(resp.message, serde_json::json!({"echo": "hi"}));
    }

    #[tokio::test]
    async fn stream_handler_round_trip() {
        let handler = stream_handler(|req: StreamRequest| async move {
            assert!(req.info.is_server_streaming);
            Ok(())
        });

        handler
            .oneshot(StreamRequest::new(CallInfo::streaming("/t.T/Watch", false, true)))
            .await
            .unwrap();
    }
}
