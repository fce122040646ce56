//! # Retry with Exponential Backoff
//!
//! Re-invokes a failing handler for transient errors, sleeping between
//! attempts with capped exponential backoff and optional jitter to avoid
//! synchronized retry storms.
//!
//! ## Core Components
//!
//! - **[`RetryPolicy`]**: pure configuration: attempt budget, backoff
//!   shape, jitter mode, and the set of retryable status codes.
//! - **[`RetryLayer`]**: the middleware form, wrapping a unary service. It
//!   also tracks [`RetryStats`] and exposes an optional per-retry callback.
//! - **[`establish_with_retry`]**: the streaming form. Retry for streams
//!   covers *establishment only*; once bytes flow, replay is unsafe and no
//!   re-invocation happens.
//!
//! ## Cancellation
//!
//! The ambient context is observed before every attempt and during every
//! backoff sleep. When it fires, the engine returns the cancellation cause
//! (not the last handler error) without further attempts. Total elapsed
//! time is deliberately not a stop criterion; bounding the whole call is
//! the deadline middleware's job.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::chain::MiddlewareInfo;
use crate::context::RpcContext;
use crate::error::{Code, ConfigError, Status};
use crate::request::{RpcRequest, RpcResponse};

/// Jitter applied to computed backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Sleep the raw computed delay.
    None,
    /// Sleep a uniformly random duration in `[0, raw]`.
    Full,
}

/// Configuration for the retry engine. Pure data; validated at
/// construction of the layer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total invocation budget, including the first attempt. At least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling applied to computed delays.
    pub max_backoff: Duration,
    /// Exponential growth factor, strictly greater than 1.
    pub multiplier: f64,
    /// Jitter mode.
    pub jitter: Jitter,
    /// Status codes that warrant a retry.
    pub retryable_codes: HashSet<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: Jitter::Full,
            retryable_codes: [
                Code::Unavailable,
                Code::ResourceExhausted,
                Code::Aborted,
                Code::DeadlineExceeded,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// Checks the policy invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::invalid("initial_backoff", "must be positive"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::invalid(
                "max_backoff",
                "must be at least initial_backoff",
            ));
        }
        if self.multiplier <= 1.0 {
            return Err(ConfigError::invalid(
                "multiplier",
                "must be greater than 1",
            ));
        }
        Ok(())
    }

    /// Returns `true` if `status` warrants another attempt.
    pub fn is_retryable(&self, status: &Status) -> bool {
        self.retryable_codes.contains(&status.code())
    }

    /// Raw (pre-jitter) backoff before retry number `attempt` (1-based):
    /// `initial * multiplier^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Backoff with the configured jitter applied.
    fn sleep_for(&self, attempt: u32) -> Duration {
        let raw = self.backoff(attempt);
        match self.jitter {
            Jitter::None => raw,
            Jitter::Full => {
                use rand::Rng;
                raw.mul_f64(rand::thread_rng().gen::<f64>())
            }
        }
    }
}

/// Counters describing the retry engine's activity.
///
/// Readable at any time through [`RetryStats::snapshot`] and resettable
/// through [`RetryStats::reset`]; everything else about a constructed layer
/// is immutable.
#[derive(Debug, Default)]
pub struct RetryStats {
    total_requests: AtomicU64,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
}

/// A point-in-time copy of [`RetryStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetrySnapshot {
    /// Requests that entered the retry engine.
    pub total_requests: u64,
    /// Individual re-invocations performed.
    pub total_retries: u64,
    /// Requests that succeeded after at least one retry.
    pub successful_retries: u64,
    /// Requests that exhausted their attempt budget.
    pub failed_retries: u64,
}

impl RetryStats {
    /// Copies the current counter values.
    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_retries: self.failed_retries.load(Ordering::Relaxed),
        }
    }

    /// Zeroes all counters.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_retries.store(0, Ordering::Relaxed);
        self.successful_retries.store(0, Ordering::Relaxed);
        self.failed_retries.store(0, Ordering::Relaxed);
    }
}

type OnRetry = Arc<dyn Fn(u32, &Status, Duration) + Send + Sync>;

/// Middleware applying [`RetryPolicy`] to a unary service.
#[derive(Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
    stats: Arc<RetryStats>,
    on_retry: Option<OnRetry>,
}

impl RetryLayer {
    /// Creates the layer, validating the policy.
    pub fn new(policy: RetryPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self {
            policy,
            stats: Arc::new(RetryStats::default()),
            on_retry: None,
        })
    }

    /// Registers a callback invoked before each backoff sleep with
    /// `(attempt, error, next_backoff)`.
    pub fn with_on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &Status, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Shared handle to this layer's statistics.
    pub fn stats(&self) -> Arc<RetryStats> {
        Arc::clone(&self.stats)
    }
}

impl std::fmt::Debug for RetryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryLayer")
            .field("policy", &self.policy)
            .finish()
    }
}

impl MiddlewareInfo for RetryLayer {
    fn middleware_name(&self) -> &'static str {
        "retry"
    }

    fn reinvokes_handler(&self) -> bool {
        true
    }
}

/// The service produced by [`RetryLayer`].
#[derive(Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
    stats: Arc<RetryStats>,
    on_retry: Option<OnRetry>,
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
            stats: Arc::clone(&self.stats),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<S> Service<RpcRequest> for RetryService<S>
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

    fn call(&mut self, req: RpcRequest) -> Self::Future {
        let mut inner = self.inner.clone();
        let policy = self.policy.clone();
        let stats = Arc::clone(&self.stats);
        let on_retry = self.on_retry.clone();

        Box::pin(async move {
            stats.total_requests.fetch_add(1, Ordering::Relaxed);
            let mut last_error: Option<Status> = None;

            for attempt in 1..=policy.max_attempts {
                if let Some(cause) = req.context.error() {
                    return Err(cause);
                }

                match inner.call(req.clone()).await {
                    Ok(resp) => {
                        if attempt > 1 {
                            stats.successful_retries.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                method = %req.info.full_method,
                                attempt,
                                "request succeeded after retry"
                            );
                        }
                        return Ok(resp);
                    }
                    Err(status) => {
                        if !policy.is_retryable(&status) {
                            debug!(
                                method = %req.info.full_method,
                                code = %status.code(),
                                "non-retryable error"
                            );
                            return Err(status);
                        }

                        if attempt >= policy.max_attempts {
                            last_error = Some(status);
                            break;
                        }

                        let delay = policy.sleep_for(attempt);
                        if let Some(callback) = &on_retry {
                            callback(attempt, &status, delay);
                        }
                        stats.total_retries.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            method = %req.info.full_method,
                            attempt,
                            code = %status.code(),
                            delay_ms = delay.as_millis() as u64,
                            "attempt failed, backing off"
                        );
                        last_error = Some(status);

                        tokio::select! {
                            _ = sleep(delay) => {}
                            cause = req.context.done() => return Err(cause),
                        }
                    }
                }
            }

            stats.failed_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                method = %req.info.full_method,
                max_attempts = policy.max_attempts,
                "retry budget exhausted"
            );
            // The last attempt's error is surfaced verbatim.
            Err(last_error.unwrap_or_else(|| Status::internal("retry budget exhausted")))
        })
    }
}

/// Retries a stream *establishment* closure under `policy`.
///
/// Once a stream is established, bytes may have flowed and replay is
/// unsafe, so this is the only retry surface for streaming calls.
pub async fn establish_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &RpcContext,
    mut establish: F,
) -> Result<T, Status>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    policy
        .validate()
        .map_err(|err| Status::invalid_argument(err.to_string()))?;

    let mut last_error: Option<Status> = None;
    for attempt in 1..=policy.max_attempts {
        if let Some(cause) = ctx.error() {
            return Err(cause);
        }

        match establish().await {
            Ok(stream) => return Ok(stream),
            Err(status) => {
                if !policy.is_retryable(&status) {
                    return Err(status);
                }
                if attempt >= policy.max_attempts {
                    last_error = Some(status);
                    break;
                }
                let delay = policy.sleep_for(attempt);
                last_error = Some(status);
                tokio::select! {
                    _ = sleep(delay) => {}
                    cause = ctx.done() => return Err(cause),
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Status::internal("retry budget exhausted")))
}
