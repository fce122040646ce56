//! # Deadline Enforcement
//!
//! Bounds handler execution time. The layer derives a child context with
//! deadline `now + T`, where `T` is the per-method override or the
//! default, and races the handler against it. If the ambient context
//! already has an earlier deadline, the earlier one wins.
//!
//! On expiry the handler's future is dropped, the derived context is
//! cancelled with a [`DeadlineExceeded`] cause so that any work spawned on
//! its behalf observes the abort, the optional `on_timeout` callback fires,
//! and the call returns [`DeadlineExceeded`]. On early handler return, the
//! derived scope is simply released.
//!
//! [`DeadlineExceeded`]: crate::error::Code::DeadlineExceeded

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tower::{Layer, Service};
use tracing::debug;

use crate::chain::MiddlewareInfo;
use crate::error::{ConfigError, Status};
use crate::request::Call;

type OnTimeout = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Deadline configuration: one default and per-method overrides.
#[derive(Clone)]
pub struct TimeoutConfig {
    /// Applied to methods without an override.
    pub default_timeout: Duration,
    per_method: HashMap<String, Duration>,
    on_timeout: Option<OnTimeout>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            per_method: HashMap::new(),
            on_timeout: None,
        }
    }
}

impl TimeoutConfig {
    /// Creates a configuration with the given default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            ..Self::default()
        }
    }

    /// Overrides the timeout for one full method path.
    pub fn with_method_timeout(mut self, method: impl Into<String>, timeout: Duration) -> Self {
        self.per_method.insert(method.into(), timeout);
        self
    }

    /// Registers a callback fired on expiry with `(method, elapsed)`.
    pub fn with_on_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(callback));
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::invalid("default_timeout", "must be positive"));
        }
        if let Some((method, _)) = self
            .per_method
            .iter()
            .find(|(_, timeout)| timeout.is_zero())
        {
            return Err(ConfigError::invalid(
                "per_method",
                format!("timeout for {method:?} must be positive"),
            ));
        }
        Ok(())
    }

    /// The timeout for `method`: its override or the default.
    fn timeout_for(&self, method: &str) -> Duration {
        self.per_method
            .get(method)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

impl fmt::Debug for TimeoutConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutConfig")
            .field("default_timeout", &self.default_timeout)
            .field("per_method", &self.per_method)
            .finish()
    }
}

/// Middleware enforcing deadlines on each call.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    config: TimeoutConfig,
}

impl TimeoutLayer {
    /// Creates the layer, validating the configuration.
    pub fn new(config: TimeoutConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Shorthand for a fixed default timeout.
    pub fn from_duration(timeout: Duration) -> Result<Self, ConfigError> {
        Self::new(TimeoutConfig::new(timeout))
    }
}

impl MiddlewareInfo for TimeoutLayer {
    fn middleware_name(&self) -> &'static str {
        "timeout"
    }
}

/// The service produced by [`TimeoutLayer`].
#[derive(Clone)]
pub struct TimeoutService<S> {
    inner: S,
    config: TimeoutConfig,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            config: self.config.clone(),
        }
    }
}

impl<S, R> Service<R> for TimeoutService<S>
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
            let method = req.info().full_method.clone();
            let timeout = config.timeout_for(&method);
            let started = Instant::now();

            let scoped = req.context().with_deadline(started + timeout);
            let deadline = match scoped.deadline() {
                Some(deadline) => deadline,
                // Unreachable: with_deadline always sets one.
                None => started + timeout,
            };
            *req.context_mut() = scoped.clone();

            tokio::select! {
                result = inner.call(req) => result,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    let elapsed = started.elapsed();
                    let status =
                        Status::deadline_exceeded(format!("request timeout after {timeout:?}"));
                    scoped.cancel(status.clone());
                    debug!(method = %method, elapsed_ms = elapsed.as_millis() as u64, "deadline expired");
                    if let Some(callback) = &config.on_timeout {
                        callback(&method, elapsed);
                    }
                    Err(status)
                }
            }
        })
    }
}
