//! # Fault Injection
//!
//! Probabilistic faults for exercising the resilience layers under test
//! and in staging: added latency, injected status errors, and shortened
//! deadlines, each sampled independently per call, plus a gating predicate
//! that switches the whole module on or off.
//!
//! Injected latency honors the ambient context: a call cancelled mid-delay
//! returns the cancellation cause immediately.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tower::{Layer, Service};
use tracing::debug;

use crate::chain::MiddlewareInfo;
use crate::error::{Code, ConfigError, Status};
use crate::request::Call;

/// Added latency, uniform in `[min, max]`, applied with `probability`.
#[derive(Debug, Clone, Copy)]
pub struct LatencyFault {
    /// Minimum injected delay.
    pub min: Duration,
    /// Maximum injected delay.
    pub max: Duration,
    /// Sampling probability in `[0, 1]`.
    pub probability: f64,
}

/// An error drawn from `codes`, injected with `probability`.
#[derive(Debug, Clone)]
pub struct ErrorFault {
    /// Candidate status codes.
    pub codes: Vec<Code>,
    /// Sampling probability in `[0, 1]`.
    pub probability: f64,
}

/// A shortened deadline of `timeout`, applied with `probability`.
///
/// Only the ambient context is tightened; enforcement is up to whatever
/// observes the deadline downstream, exactly as with a real client-imposed
/// deadline.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineFault {
    /// The shortened deadline.
    pub timeout: Duration,
    /// Sampling probability in `[0, 1]`.
    pub probability: f64,
}

type Gate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Composable fault configuration.
#[derive(Clone, Default)]
pub struct ChaosConfig {
    latency: Option<LatencyFault>,
    error: Option<ErrorFault>,
    deadline: Option<DeadlineFault>,
    gate: Option<Gate>,
}

impl ChaosConfig {
    /// Creates a configuration with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables latency injection.
    pub fn with_latency(mut self, min: Duration, max: Duration, probability: f64) -> Self {
        self.latency = Some(LatencyFault {
            min,
            max,
            probability,
        });
        self
    }

    /// Enables error injection from `codes`.
    pub fn with_errors(mut self, codes: Vec<Code>, probability: f64) -> Self {
        self.error = Some(ErrorFault { codes, probability });
        self
    }

    /// Enables deadline shortening.
    pub fn with_shortened_deadline(mut self, timeout: Duration, probability: f64) -> Self {
        self.deadline = Some(DeadlineFault {
            timeout,
            probability,
        });
        self
    }

    /// Gates the whole module: faults are only considered while `gate`
    /// returns `true`.
    pub fn with_gate<F>(mut self, gate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.gate = Some(Arc::new(gate));
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(latency) = &self.latency {
            check_probability("latency.probability", latency.probability)?;
            if latency.min > latency.max {
                return Err(ConfigError::invalid("latency", "min must not exceed max"));
            }
        }
        if let Some(error) = &self.error {
            check_probability("error.probability", error.probability)?;
            if error.codes.is_empty() {
                return Err(ConfigError::invalid(
                    "error.codes",
                    "must name at least one status code",
                ));
            }
        }
        if let Some(deadline) = &self.deadline {
            check_probability("deadline.probability", deadline.probability)?;
            if deadline.timeout.is_zero() {
                return Err(ConfigError::invalid("deadline.timeout", "must be positive"));
            }
        }
        Ok(())
    }
}

fn check_probability(field: &'static str, probability: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&probability) || probability.is_nan() {
        return Err(ConfigError::invalid(field, "must be in [0, 1]"));
    }
    Ok(())
}

impl fmt::Debug for ChaosConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaosConfig")
            .field("latency", &self.latency)
            .field("error", &self.error)
            .field("deadline", &self.deadline)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

/// Middleware injecting the configured faults.
#[derive(Debug, Clone)]
pub struct ChaosLayer {
    config: ChaosConfig,
}

impl ChaosLayer {
    /// Creates the layer, validating the configuration.
    pub fn new(config: ChaosConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Flaky network: moderate added latency plus occasional
    /// `Unavailable`/`DeadlineExceeded` errors.
    pub fn flaky(probability: f64) -> Result<Self, ConfigError> {
        Self::new(
            ChaosConfig::new()
                .with_latency(
                    Duration::from_millis(50),
                    Duration::from_millis(500),
                    probability,
                )
                .with_errors(
                    vec![Code::Unavailable, Code::DeadlineExceeded],
                    probability / 2.0,
                ),
        )
    }

    /// Network partition: hard failures, no latency.
    pub fn partition(probability: f64) -> Result<Self, ConfigError> {
        Self::new(
            ChaosConfig::new()
                .with_errors(vec![Code::Unavailable, Code::DeadlineExceeded], probability),
        )
    }

    /// Overloaded service: long delays plus exhaustion errors.
    pub fn overloaded(probability: f64) -> Result<Self, ConfigError> {
        Self::new(
            ChaosConfig::new()
                .with_latency(Duration::from_secs(1), Duration::from_secs(5), probability)
                .with_errors(
                    vec![Code::ResourceExhausted, Code::Unavailable],
                    probability / 2.0,
                ),
        )
    }

    /// High-latency network with no errors.
    pub fn high_latency(probability: f64) -> Result<Self, ConfigError> {
        Self::new(ChaosConfig::new().with_latency(
            Duration::from_millis(500),
            Duration::from_secs(2),
            probability,
        ))
    }
}

impl MiddlewareInfo for ChaosLayer {
    fn middleware_name(&self) -> &'static str {
        "chaos"
    }
}

/// The service produced by [`ChaosLayer`].
#[derive(Clone)]
pub struct ChaosService<S> {
    inner: S,
    config: ChaosConfig,
}

impl<S> Layer<S> for ChaosLayer {
    type Service = ChaosService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ChaosService {
            inner,
            config: self.config.clone(),
        }
    }
}

fn roll(probability: f64) -> bool {
    probability > 0.0 && rand::thread_rng().gen::<f64>() < probability
}

impl<S, R> Service<R> for ChaosService<S>
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
            if let Some(gate) = &config.gate {
                if !gate() {
                    return inner.call(req).await;
                }
            }

            if let Some(latency) = &config.latency {
                if roll(latency.probability) {
                    let spread = latency.max.saturating_sub(latency.min);
                    let delay = latency.min + spread.mul_f64(rand::thread_rng().gen::<f64>());
                    debug!(method = %req.info().full_method, delay_ms = delay.as_millis() as u64, "injecting latency");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        cause = req.context().done() => return Err(cause),
                    }
                }
            }

            if let Some(error) = &config.error {
                if roll(error.probability) {
                    let index = rand::thread_rng().gen_range(0..error.codes.len());
                    let code = error.codes[index];
                    debug!(method = %req.info().full_method, code = %code, "injecting error");
                    return Err(Status::new(code, format!("injected {code} fault")));
                }
            }

            if let Some(deadline) = &config.deadline {
                if roll(deadline.probability) {
                    let scoped = req
                        .context()
                        .with_deadline(Instant::now() + deadline.timeout);
                    debug!(method = %req.info().full_method, timeout_ms = deadline.timeout.as_millis() as u64, "shortening deadline");
                    *req.context_mut() = scoped;
                }
            }

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{unary_handler, RpcRequest, RpcResponse};
    use serde_json::Value;
    use tower::ServiceExt;

    fn ok_handler() -> crate::request::UnaryRpc {
        unary_handler(|_req: RpcRequest| async move { Ok(RpcResponse::empty()) })
    }

    #[test]
    fn probabilities_outside_unit_interval_are_rejected() {
        let config = ChaosConfig::new().with_errors(vec![Code::Unavailable], 1.5);
        assert!(ChaosLayer::new(config).is_err());

        let config = ChaosConfig::new().with_errors(vec![Code::Unavailable], -0.1);
        assert!(ChaosLayer::new(config).is_err());

        let config = ChaosConfig::new().with_errors(vec![], 0.5);
        assert!(ChaosLayer::new(config).is_err());

        let config = ChaosConfig::new().with_latency(
            Duration::from_millis(100),
            Duration::from_millis(10),
            0.5,
        );
        assert!(ChaosLayer::new(config).is_err());
    }

    #[tokio::test]
    async fn probability_zero_never_fires() {
        let config = ChaosConfig::new()
            .with_errors(vec![Code::Unavailable], 0.0)
            .with_latency(Duration::from_secs(5), Duration::from_secs(5), 0.0);
        let svc = ChaosLayer::new(config).unwrap().layer(ok_handler());

        for _ in 0..20 {
            assert!(svc
                .clone()
                .oneshot(RpcRequest::new("/t.T/Get", Value::Null))
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn probability_one_always_injects_error() {
        let config = ChaosConfig::new().with_errors(vec![Code::Unavailable], 1.0);
        let svc = ChaosLayer::new(config).unwrap().layer(ok_handler());

        for _ in 0..5 {
            let err = svc
                .clone()
                .oneshot(RpcRequest::new("/t.T/Get", Value::Null))
                .await
                .unwrap_err();
            assert_eq!(err.code(), Code::Unavailable);
            assert!(err.message().contains("injected"));
        }
    }

    #[tokio::test]
    async fn latency_is_injected_within_bounds() {
        let config = ChaosConfig::new().with_latency(
            Duration::from_millis(20),
            Duration::from_millis(40),
            1.0,
        );
        let svc = ChaosLayer::new(config).unwrap().layer(ok_handler());

        let started = std::time::Instant::now();
        svc.oneshot(RpcRequest::new("/t.T/Get", Value::Null))
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn closed_gate_disables_all_faults() {
        let config = ChaosConfig::new()
            .with_errors(vec![Code::Unavailable], 1.0)
            .with_gate(|| false);
        let svc = ChaosLayer::new(config).unwrap().layer(ok_handler());

        assert!(svc
            .oneshot(RpcRequest::new("/t.T/Get", Value::Null))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn shortened_deadline_reaches_handler() {
        let handler = unary_handler(|req: RpcRequest| async move {
            assert!(req.context.deadline().is_some());
            Ok(RpcResponse::empty())
        });
        let config =
            ChaosConfig::new().with_shortened_deadline(Duration::from_millis(10), 1.0);
        let svc = ChaosLayer::new(config).unwrap().layer(handler);

        svc.oneshot(RpcRequest::new("/t.T/Get", Value::Null))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_during_injected_latency_wins() {
        let config = ChaosConfig::new().with_latency(
            Duration::from_secs(5),
            Duration::from_secs(5),
            1.0,
        );
        let svc = ChaosLayer::new(config).unwrap().layer(ok_handler());

        let req = RpcRequest::new("/t.T/Get", Value::Null);
        let ctx = req.context.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.cancel(Status::cancelled("test teardown"));
        });

        let started = std::time::Instant::now();
        let err = svc.oneshot(req).await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
