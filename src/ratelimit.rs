//! # Token-Bucket Rate Limiting
//!
//! One algorithm, the lazy-refill token bucket, in four arrangements:
//!
//! - **Global** ([`RateLimitLayer`]): one bucket shared by every caller,
//!   with either reject or wait admission.
//! - **Per-key** ([`PerKeyRateLimitLayer`]): a bucket per key produced by
//!   an extractor (client IP, caller identity, ...). Buckets are allocated
//!   lazily and can be evicted after an idle period.
//! - **Per-method** ([`PerMethodRateLimitLayer`]): a bucket per configured
//!   method, with a default bucket for everything else.
//! - **Adaptive** ([`AdaptiveRateLimiter`]): a governor scales the
//!   effective rate from a periodic load signal in `[0, 1]`.
//!
//! Rejections carry [`ResourceExhausted`]; waits are cancellation-aware
//! and return the cancellation cause when the ambient context fires.
//!
//! [`ResourceExhausted`]: crate::error::Code::ResourceExhausted

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tower::{Layer, Service};
use tracing::debug;

use crate::chain::MiddlewareInfo;
use crate::context::{CallerIdentity, RpcContext};
use crate::error::{ConfigError, Status};
use crate::metadata::Metadata;
use crate::request::Call;

/// A token bucket with lazy refill.
///
/// Holds up to `burst` tokens, refilled continuously at `rate` tokens per
/// second; refill is computed at admission time, never by a background
/// task. Tokens are clamped to `[0, burst]`.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    burst: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TokenBucket")
            .field("rate", &state.rate)
            .field("burst", &self.burst)
            .field("tokens", &state.tokens)
            .finish()
    }
}

impl TokenBucket {
    /// Creates a bucket admitting `rate` requests per second with bursts of
    /// up to `burst`. The bucket starts full.
    pub fn new(rate: f64, burst: u32) -> Result<Self, ConfigError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(ConfigError::invalid("rate", "must be non-negative"));
        }
        if burst == 0 {
            return Err(ConfigError::invalid("burst", "must be at least 1"));
        }
        Ok(Self::new_unchecked(rate, burst))
    }

    fn new_unchecked(rate: f64, burst: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                rate,
                last_refill: Instant::now(),
            }),
            burst: f64::from(burst),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate).min(self.burst);
        state.last_refill = now;
    }

    /// Non-blocking admission: takes a token if one is available.
    pub fn allow(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Blocks until a token is available or the context aborts, returning
    /// the abort cause in the latter case.
    pub async fn wait(&self, ctx: &RpcContext) -> Result<(), Status> {
        loop {
            if let Some(cause) = ctx.error() {
                return Err(cause);
            }

            let deficit = {
                let mut state = self.lock();
                self.refill(&mut state, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                if state.rate <= 0.0 {
                    return Err(Status::resource_exhausted(
                        "rate limiter has zero refill rate",
                    ));
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
            };

            tokio::select! {
                _ = tokio::time::sleep(deficit) => {}
                cause = ctx.done() => return Err(cause),
            }
        }
    }

    /// Replaces the refill rate, settling accrued tokens at the old rate
    /// first.
    pub fn set_rate(&self, rate: f64) {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.rate = rate.max(0.0);
    }

    /// Current refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.lock().rate
    }

    /// Maximum burst size.
    pub fn burst(&self) -> u32 {
        self.burst as u32
    }
}

/// How the global limiter treats a caller when no token is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Reject immediately with `ResourceExhausted`.
    Reject,
    /// Wait for a token, honoring context cancellation.
    Wait,
}

/// Middleware enforcing one shared token bucket across all callers.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    bucket: Arc<TokenBucket>,
    mode: AdmissionMode,
}

impl RateLimitLayer {
    /// A rejecting limiter at `rate` requests per second, bursting to
    /// `burst`.
    pub fn new(rate: f64, burst: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            bucket: Arc::new(TokenBucket::new(rate, burst)?),
            mode: AdmissionMode::Reject,
        })
    }

    /// A waiting limiter: callers queue for a token instead of being
    /// rejected.
    pub fn waiting(rate: f64, burst: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            bucket: Arc::new(TokenBucket::new(rate, burst)?),
            mode: AdmissionMode::Wait,
        })
    }

    /// Wraps an existing bucket (e.g. one governed adaptively).
    pub fn from_bucket(bucket: Arc<TokenBucket>, mode: AdmissionMode) -> Self {
        Self { bucket, mode }
    }

    /// Shared handle to the bucket.
    pub fn bucket(&self) -> Arc<TokenBucket> {
        Arc::clone(&self.bucket)
    }
}

impl MiddlewareInfo for RateLimitLayer {
    fn middleware_name(&self) -> &'static str {
        "rate-limit"
    }
}

/// The service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
    mode: AdmissionMode,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            bucket: Arc::clone(&self.bucket),
            mode: self.mode,
        }
    }
}

impl<S, R> Service<R> for RateLimitService<S>
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

    fn call(&mut self, req: R) -> Self::Future {
        let mut inner = self.inner.clone();
        let bucket = Arc::clone(&self.bucket);
        let mode = self.mode;

        Box::pin(async move {
            match mode {
                AdmissionMode::Reject => {
                    if !bucket.allow() {
                        debug!(method = %req.info().full_method, "rate limit exceeded");
                        return Err(Status::resource_exhausted("rate limit exceeded"));
                    }
                }
                AdmissionMode::Wait => bucket.wait(req.context()).await?,
            }
            inner.call(req).await
        })
    }
}

/// Produces the bucketing key for a call.
pub type KeyExtractor = Arc<dyn Fn(&RpcContext, &Metadata) -> String + Send + Sync>;

/// Keys callers by forwarded client address (`x-forwarded-for`, then
/// `x-real-ip`), falling back to `"unknown"`.
pub fn client_ip_extractor() -> KeyExtractor {
    Arc::new(|_ctx, metadata| {
        metadata
            .get("x-forwarded-for")
            .or_else(|| metadata.get("x-real-ip"))
            .unwrap_or("unknown")
            .to_string()
    })
}

/// Keys callers by authenticated subject, falling back to `"anonymous"`.
pub fn caller_identity_extractor() -> KeyExtractor {
    Arc::new(|ctx, _metadata| {
        ctx.extensions()
            .get::<CallerIdentity>()
            .map(|identity| identity.subject.clone())
            .unwrap_or_else(|| "anonymous".to_string())
    })
}

struct KeyedBucket {
    bucket: Arc<TokenBucket>,
    last_seen_ms: AtomicU64,
}

/// Lazily allocates one bucket per key.
///
/// The map is read-mostly after warm-up: lookups take the read lock and
/// only a first-seen key takes the write lock, with a double-check under
/// it. Idle buckets can be reclaimed with
/// [`PerKeyRateLimiter::evict_idle`].
pub struct PerKeyRateLimiter {
    buckets: RwLock<HashMap<String, Arc<KeyedBucket>>>,
    rate: f64,
    burst: u32,
    epoch: Instant,
}

impl fmt::Debug for PerKeyRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerKeyRateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("keys", &self.len())
            .finish()
    }
}

impl PerKeyRateLimiter {
    /// Creates a limiter issuing `(rate, burst)` buckets per key.
    pub fn new(rate: f64, burst: u32) -> Result<Self, ConfigError> {
        // Validate eagerly so later lazy allocations cannot fail.
        TokenBucket::new(rate, burst)?;
        Ok(Self {
            buckets: RwLock::new(HashMap::new()),
            rate,
            burst,
            epoch: Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Returns the bucket for `key`, allocating it on first use.
    pub fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        let now_ms = self.now_ms();
        {
            let buckets = self.read();
            if let Some(entry) = buckets.get(key) {
                entry.last_seen_ms.store(now_ms, Ordering::Relaxed);
                return Arc::clone(&entry.bucket);
            }
        }

        let mut buckets = self.write();
        if let Some(entry) = buckets.get(key) {
            entry.last_seen_ms.store(now_ms, Ordering::Relaxed);
            return Arc::clone(&entry.bucket);
        }

        // Parameters were validated when the limiter was built.
        let entry = Arc::new(KeyedBucket {
            bucket: Arc::new(TokenBucket::new_unchecked(self.rate, self.burst)),
            last_seen_ms: AtomicU64::new(now_ms),
        });
        let bucket = Arc::clone(&entry.bucket);
        buckets.insert(key.to_string(), entry);
        bucket
    }

    /// Drops buckets not used for at least `idle`; returns how many were
    /// removed.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let cutoff = self.now_ms().saturating_sub(idle.as_millis() as u64);
        let mut buckets = self.write();
        let before = buckets.len();
        buckets.retain(|_, entry| entry.last_seen_ms.load(Ordering::Relaxed) >= cutoff);
        before - buckets.len()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no bucket has been allocated yet.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<KeyedBucket>>> {
        self.buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<KeyedBucket>>> {
        self.buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Middleware enforcing a token bucket per extracted key.
#[derive(Clone)]
pub struct PerKeyRateLimitLayer {
    limiter: Arc<PerKeyRateLimiter>,
    extractor: KeyExtractor,
}

impl fmt::Debug for PerKeyRateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerKeyRateLimitLayer")
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl PerKeyRateLimitLayer {
    /// Creates the layer with `(rate, burst)` per key.
    pub fn new(rate: f64, burst: u32, extractor: KeyExtractor) -> Result<Self, ConfigError> {
        Ok(Self {
            limiter: Arc::new(PerKeyRateLimiter::new(rate, burst)?),
            extractor,
        })
    }

    /// Shared handle to the limiter, e.g. for idle eviction.
    pub fn limiter(&self) -> Arc<PerKeyRateLimiter> {
        Arc::clone(&self.limiter)
    }
}

impl MiddlewareInfo for PerKeyRateLimitLayer {
    fn middleware_name(&self) -> &'static str {
        "rate-limit-per-key"
    }
}

/// The service produced by [`PerKeyRateLimitLayer`].
#[derive(Clone)]
pub struct PerKeyRateLimitService<S> {
    inner: S,
    limiter: Arc<PerKeyRateLimiter>,
    extractor: KeyExtractor,
}

impl<S> Layer<S> for PerKeyRateLimitLayer {
    type Service = PerKeyRateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PerKeyRateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            extractor: Arc::clone(&self.extractor),
        }
    }
}

impl<S, R> Service<R> for PerKeyRateLimitService<S>
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

    fn call(&mut self, req: R) -> Self::Future {
        let mut inner = self.inner.clone();
        let limiter = Arc::clone(&self.limiter);
        let extractor = Arc::clone(&self.extractor);

        Box::pin(async move {
            let mut key = (extractor)(req.context(), req.metadata());
            if key.is_empty() {
                key = "unknown".to_string();
            }
            if !limiter.bucket(&key).allow() {
                debug!(method = %req.info().full_method, key = %key, "rate limit exceeded");
                return Err(Status::resource_exhausted(format!(
                    "rate limit exceeded for key: {key}"
                )));
            }
            inner.call(req).await
        })
    }
}

/// One bucket per configured method, with a default for the rest.
pub struct PerMethodRateLimiter {
    buckets: HashMap<String, Arc<TokenBucket>>,
    default_bucket: Arc<TokenBucket>,
}

impl fmt::Debug for PerMethodRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerMethodRateLimiter")
            .field("methods", &self.buckets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PerMethodRateLimiter {
    /// Creates a limiter with the given default and per-method overrides as
    /// `(rate, burst)` pairs.
    pub fn new(
        default_rate: f64,
        default_burst: u32,
        overrides: HashMap<String, (f64, u32)>,
    ) -> Result<Self, ConfigError> {
        let mut buckets = HashMap::new();
        for (method, (rate, burst)) in overrides {
            buckets.insert(method, Arc::new(TokenBucket::new(rate, burst)?));
        }
        Ok(Self {
            buckets,
            default_bucket: Arc::new(TokenBucket::new(default_rate, default_burst)?),
        })
    }

    /// The bucket governing `method`. O(1); unlisted methods share the
    /// default bucket.
    pub fn bucket_for(&self, method: &str) -> &Arc<TokenBucket> {
        self.buckets.get(method).unwrap_or(&self.default_bucket)
    }
}

/// Middleware enforcing per-method token buckets.
#[derive(Debug, Clone)]
pub struct PerMethodRateLimitLayer {
    limiter: Arc<PerMethodRateLimiter>,
}

impl PerMethodRateLimitLayer {
    /// Creates the layer; see [`PerMethodRateLimiter::new`].
    pub fn new(
        default_rate: f64,
        default_burst: u32,
        overrides: HashMap<String, (f64, u32)>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            limiter: Arc::new(PerMethodRateLimiter::new(
                default_rate,
                default_burst,
                overrides,
            )?),
        })
    }

    /// Shared handle to the limiter.
    pub fn limiter(&self) -> Arc<PerMethodRateLimiter> {
        Arc::clone(&self.limiter)
    }
}

impl MiddlewareInfo for PerMethodRateLimitLayer {
    fn middleware_name(&self) -> &'static str {
        "rate-limit-per-method"
    }
}

/// The service produced by [`PerMethodRateLimitLayer`].
#[derive(Clone)]
pub struct PerMethodRateLimitService<S> {
    inner: S,
    limiter: Arc<PerMethodRateLimiter>,
}

impl<S> Layer<S> for PerMethodRateLimitLayer {
    type Service = PerMethodRateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PerMethodRateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<S, R> Service<R> for PerMethodRateLimitService<S>
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

    fn call(&mut self, req: R) -> Self::Future {
        let mut inner = self.inner.clone();
        let limiter = Arc::clone(&self.limiter);

        Box::pin(async move {
            let method = &req.info().full_method;
            if !limiter.bucket_for(method).allow() {
                debug!(method = %method, "rate limit exceeded");
                return Err(Status::resource_exhausted(format!(
                    "rate limit exceeded for method: {method}"
                )));
            }
            inner.call(req).await
        })
    }
}

/// A token bucket whose rate tracks a load signal.
///
/// Feed [`AdaptiveRateLimiter::adjust_rate`] a load factor in `[0, 1]`
/// periodically:
///
/// - below 0.5 the rate grows by 20%, capped at twice the base rate;
/// - above 0.8 it shrinks by 20%, floored at half the base rate;
/// - in between it drifts back toward the base rate by 5% steps.
pub struct AdaptiveRateLimiter {
    bucket: Arc<TokenBucket>,
    base_rate: f64,
}

impl fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("base_rate", &self.base_rate)
            .field("current_rate", &self.current_rate())
            .finish()
    }
}

impl AdaptiveRateLimiter {
    /// Creates a governor around a fresh bucket at `base_rate`.
    pub fn new(base_rate: f64, burst: u32) -> Result<Self, ConfigError> {
        if base_rate <= 0.0 {
            return Err(ConfigError::invalid("base_rate", "must be positive"));
        }
        Ok(Self {
            bucket: Arc::new(TokenBucket::new(base_rate, burst)?),
            base_rate,
        })
    }

    /// Applies one load observation, `load_factor` in `[0, 1]`.
    pub fn adjust_rate(&self, load_factor: f64) {
        let current = self.bucket.rate();
        let new_rate = if load_factor < 0.5 {
            (current * 1.2).min(self.base_rate * 2.0)
        } else if load_factor > 0.8 {
            (current * 0.8).max(self.base_rate * 0.5)
        } else if current > self.base_rate {
            (current * 0.95).max(self.base_rate)
        } else if current < self.base_rate {
            (current * 1.05).min(self.base_rate)
        } else {
            return;
        };
        debug!(load_factor, new_rate, "adaptive rate adjusted");
        self.bucket.set_rate(new_rate);
    }

    /// Non-blocking admission against the governed bucket.
    pub fn allow(&self) -> bool {
        self.bucket.allow()
    }

    /// The effective rate right now.
    pub fn current_rate(&self) -> f64 {
        self.bucket.rate()
    }

    /// The configured base rate.
    pub fn base_rate(&self) -> f64 {
        self.base_rate
    }

    /// Shared handle to the governed bucket, e.g. for
    /// [`RateLimitLayer::from_bucket`].
    pub fn bucket(&self) -> Arc<TokenBucket> {
        Arc::clone(&self.bucket)
    }
}

/// Middleware admitting through an adaptively governed bucket.
#[derive(Debug, Clone)]
pub struct AdaptiveRateLimitLayer {
    limiter: Arc<AdaptiveRateLimiter>,
}

impl AdaptiveRateLimitLayer {
    /// Creates the layer around `limiter` so the caller can keep feeding it
    /// load observations.
    pub fn new(limiter: Arc<AdaptiveRateLimiter>) -> Self {
        Self { limiter }
    }
}

impl MiddlewareInfo for AdaptiveRateLimitLayer {
    fn middleware_name(&self) -> &'static str {
        "rate-limit-adaptive"
    }
}

impl<S> Layer<S> for AdaptiveRateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            bucket: self.limiter.bucket(),
            mode: AdmissionMode::Reject,
        }
    }
}
