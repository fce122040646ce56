//! # Response Caching
//!
//! Serves repeated unary requests from a content-addressed cache instead of
//! re-running the handler. A request is fingerprinted by method and message
//! (see [`key`]), looked up in a pluggable [`Backend`], and on a hit the
//! chain short-circuits with the decoded response. On a miss the handler
//! runs and an eligible result is stored with the method's TTL.
//!
//! - Positive entries hold the canonically serialized response message.
//! - Negative entries (enabled by [`CacheConfig::with_cache_errors`]) hold
//!   the error's code and message and are replayed as that status.
//! - Store failures are non-fatal: they are logged and the response is
//!   returned as if caching were off.
//!
//! ## Single-flight
//!
//! With single-flight enabled (the default), concurrent misses on one key
//! elect a leader; followers wait and re-check the cache once the leader
//! finishes, so a cache-miss burst runs the handler once. Disable it with
//! [`CacheConfig::with_single_flight`] if leaders must not serialize
//! followers; each concurrent miss then invokes the handler itself.

pub mod backend;
pub mod key;
pub mod memory;

pub use backend::{Backend, Entry, Stats};
pub use key::{
    FingerprintKeyGenerator, FnKeyGenerator, KeyGenerator, MethodOnlyKeyGenerator,
    PerMethodKeyGenerator,
};
pub use memory::{MemoryBackend, MemoryConfig};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::chain::MiddlewareInfo;
use crate::context::CallerIdentity;
use crate::error::{Code, Status};
use crate::request::{RpcRequest, RpcResponse};

/// Policy for the caching middleware.
#[derive(Clone)]
pub struct CacheConfig {
    backend: Arc<dyn Backend>,
    key_generator: Arc<dyn KeyGenerator>,
    default_ttl: Option<Duration>,
    method_ttls: HashMap<String, Duration>,
    skip_methods: HashSet<String>,
    only_methods: HashSet<String>,
    cache_errors: bool,
    skip_authenticated: bool,
    single_flight: bool,
}

impl CacheConfig {
    /// Creates a policy over `backend` with the fingerprint key strategy,
    /// a five-minute default TTL, no negative caching, authenticated
    /// requests bypassed, and single-flight on.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            key_generator: Arc::new(FingerprintKeyGenerator::new()),
            default_ttl: Some(Duration::from_secs(300)),
            method_ttls: HashMap::new(),
            skip_methods: HashSet::new(),
            only_methods: HashSet::new(),
            cache_errors: false,
            skip_authenticated: true,
            single_flight: true,
        }
    }

    /// Replaces the key derivation strategy.
    pub fn with_key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = generator;
        self
    }

    /// Sets the default TTL; `None` caches forever.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Overrides the TTL for one method.
    pub fn with_method_ttl(mut self, method: impl Into<String>, ttl: Duration) -> Self {
        self.method_ttls.insert(method.into(), ttl);
        self
    }

    /// Never cache this method.
    pub fn with_skip_method(mut self, method: impl Into<String>) -> Self {
        self.skip_methods.insert(method.into());
        self
    }

    /// Cache only listed methods (once any are listed).
    pub fn with_only_method(mut self, method: impl Into<String>) -> Self {
        self.only_methods.insert(method.into());
        self
    }

    /// Enables negative caching of error responses.
    pub fn with_cache_errors(mut self, cache_errors: bool) -> Self {
        self.cache_errors = cache_errors;
        self
    }

    /// Whether requests with a [`CallerIdentity`] bypass the cache
    /// (default `true`).
    pub fn with_skip_authenticated(mut self, skip: bool) -> Self {
        self.skip_authenticated = skip;
        self
    }

    /// Toggles single-flight miss coalescing (default on).
    pub fn with_single_flight(mut self, single_flight: bool) -> Self {
        self.single_flight = single_flight;
        self
    }

    fn should_cache(&self, method: &str) -> bool {
        if !self.only_methods.is_empty() {
            return self.only_methods.contains(method);
        }
        !self.skip_methods.contains(method)
    }

    fn ttl_for(&self, method: &str) -> Option<Duration> {
        self.method_ttls
            .get(method)
            .copied()
            .or(self.default_ttl)
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("default_ttl", &self.default_ttl)
            .field("method_ttls", &self.method_ttls)
            .field("skip_methods", &self.skip_methods)
            .field("only_methods", &self.only_methods)
            .field("cache_errors", &self.cache_errors)
            .field("skip_authenticated", &self.skip_authenticated)
            .field("single_flight", &self.single_flight)
            .finish()
    }
}

/// The serialized form of a cached outcome.
#[derive(Debug, Serialize, Deserialize)]
struct CachedRpc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<CachedStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedStatus {
    code: Code,
    message: String,
}

type FlightMap = Arc<tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Middleware applying a [`CacheConfig`] to a unary service.
#[derive(Debug, Clone)]
pub struct CacheLayer {
    config: CacheConfig,
    in_flight: FlightMap,
}

impl CacheLayer {
    /// Creates the layer.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            in_flight: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Shared handle to the backend, e.g. for stats or invalidation.
    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.config.backend)
    }
}

impl MiddlewareInfo for CacheLayer {
    fn middleware_name(&self) -> &'static str {
        "cache"
    }
}

/// The service produced by [`CacheLayer`].
#[derive(Clone)]
pub struct CacheService<S> {
    inner: S,
    config: CacheConfig,
    in_flight: FlightMap,
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            config: self.config.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S> Service<RpcRequest> for CacheService<S>
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
        let config = self.config.clone();
        let in_flight = Arc::clone(&self.in_flight);

        Box::pin(async move {
            let method = req.info.full_method.clone();
            if !config.should_cache(&method) {
                return inner.call(req).await;
            }
            if config.skip_authenticated
                && req.context.extensions().contains::<CallerIdentity>()
            {
                return inner.call(req).await;
            }

            let key = match config.key_generator.key(&method, &req.message) {
                Ok(key) => key,
                Err(status) => {
                    // Without a key there is nothing to look up or store.
                    debug!(method = %method, error = %status, "cache key derivation failed");
                    return inner.call(req).await;
                }
            };

            if let Some(response) = lookup(&config, &key).await? {
                return response;
            }

            if !config.single_flight {
                return fill(&mut inner, req, &config, &method, &key).await;
            }

            let gate = {
                let mut map = in_flight.lock().await;
                Arc::clone(map.entry(key.clone()).or_default())
            };
            let result = {
                let _leader = gate.lock().await;
                // A leader may have filled the cache while we queued.
                match lookup(&config, &key).await? {
                    Some(response) => response,
                    None => fill(&mut inner, req, &config, &method, &key).await,
                }
            };

            // Last flight out removes the gate.
            drop(gate);
            let mut map = in_flight.lock().await;
            if let Some(entry) = map.get(&key) {
                if Arc::strong_count(entry) == 1 {
                    map.remove(&key);
                }
            }

            result
        })
    }
}

/// Decodes a backend hit into the final outcome. `Ok(None)` is a miss; a
/// corrupt entry is treated as a miss.
async fn lookup(
    config: &CacheConfig,
    key: &str,
) -> Result<Option<Result<RpcResponse, Status>>, Status> {
    let bytes = match config.backend.get(key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(None),
        Err(status) => {
            warn!(key = %key, error = %status, "cache lookup failed");
            return Ok(None);
        }
    };

    match serde_json::from_slice::<CachedRpc>(&bytes) {
        Ok(CachedRpc {
            error: Some(cached),
            ..
        }) => Ok(Some(Err(Status::new(cached.code, cached.message)))),
        Ok(CachedRpc {
            message: Some(message),
            ..
        }) => Ok(Some(Ok(RpcResponse::new(message)))),
        Ok(_) | Err(_) => {
            debug!(key = %key, "discarding undecodable cache entry");
            Ok(None)
        }
    }
}

/// Runs the handler and stores an eligible outcome.
async fn fill<S>(
    inner: &mut S,
    req: RpcRequest,
    config: &CacheConfig,
    method: &str,
    key: &str,
) -> Result<RpcResponse, Status>
where
    S: Service<RpcRequest, Response = RpcResponse, Error = Status>,
{
    let result = inner.call(req).await;

    let envelope = match &result {
        Ok(response) => Some(CachedRpc {
            message: Some(response.message.clone()),
            error: None,
        }),
        Err(status) if config.cache_errors => Some(CachedRpc {
            message: None,
            error: Some(CachedStatus {
                code: status.code(),
                message: status.message().to_string(),
            }),
        }),
        Err(_) => None,
    };

    if let Some(envelope) = envelope {
        match serde_json::to_vec(&envelope) {
            Ok(bytes) => {
                let ttl = config.ttl_for(method);
                if let Err(status) = config.backend.set(key, bytes, ttl).await {
                    // Non-fatal: the response is still served.
                    warn!(key = %key, error = %status, "cache store failed");
                }
            }
            Err(err) => warn!(key = %key, error = %err, "cache serialization failed"),
        }
    }

    result
}

/// Removes the cached outcome for one `(method, message)` pair.
pub async fn invalidate(
    backend: &dyn Backend,
    key_generator: &dyn KeyGenerator,
    method: &str,
    message: &Value,
) -> Result<(), Status> {
    let key = key_generator.key(method, message)?;
    backend.delete(&key).await
}

/// Removes every cached outcome.
pub async fn clear(backend: &dyn Backend) -> Result<(), Status> {
    backend.clear().await
}
