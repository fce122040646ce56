//! # Circuit Breaker
//!
//! Tracks failure ratios over a tumbling window and short-circuits calls to
//! a downstream that is known to be failing.
//!
//! ## States
//!
//! - **Closed**: all requests are admitted and their outcomes counted. When
//!   the failure ratio over at least `minimum_requests` samples reaches
//!   `failure_threshold`, the breaker opens. Counts reset when
//!   `rolling_interval` elapses without a transition.
//! - **Open**: every admission is rejected until `open_timeout` elapses,
//!   then the next admission moves the breaker to half-open.
//! - **HalfOpen**: at most `max_probes` requests are in flight at once.
//!   A single failed probe reopens the breaker; `success_threshold`
//!   consecutive successes close it.
//!
//! ## Generations
//!
//! Every state transition bumps a generation counter. Outcomes are recorded
//! against the generation that admitted them; a sample arriving after a
//! transition carries a stale generation and is silently discarded, so a
//! request admitted under an old state can never taint the counts of a new
//! one.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tower::{Layer, Service};
use tracing::debug;

use crate::chain::MiddlewareInfo;
use crate::error::{Code, ConfigError, Status};
use crate::request::Call;

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Normal operation; outcomes are counted.
    Closed,
    /// All admissions rejected until the open timeout elapses.
    Open,
    /// Limited probing to see whether the downstream recovered.
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Closed => f.write_str("closed"),
            State::Open => f.write_str("open"),
            State::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// Outcome counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Admitted requests.
    pub requests: u32,
    /// Recorded successes.
    pub successes: u32,
    /// Recorded failures.
    pub failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl Counts {
    fn record_success(&mut self) {
        self.successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Callback observing `(from, to)` state transitions.
pub type StateChangeHook = Arc<dyn Fn(State, State) + Send + Sync>;
/// Decides whether a status counts as a failure.
pub type FailurePredicate = Arc<dyn Fn(&Status) -> bool + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct BreakerConfig {
    /// Failure ratio in `(0, 1]` that opens the breaker.
    pub failure_threshold: f64,
    /// Samples required before the threshold is consulted.
    pub minimum_requests: u32,
    /// Tumbling window: counts reset when this elapses while closed.
    pub rolling_interval: Duration,
    /// Time spent open before probing begins.
    pub open_timeout: Duration,
    /// Maximum concurrent half-open probes.
    pub max_probes: u32,
    /// Consecutive successes required to close from half-open.
    pub success_threshold: u32,
    /// Transition callback; see [`BreakerConfig::with_on_state_change`].
    pub on_state_change: Option<StateChangeHook>,
    /// Failure classifier; see [`BreakerConfig::with_is_failure`].
    pub is_failure: Option<FailurePredicate>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.6,
            minimum_requests: 10,
            rolling_interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(60),
            max_probes: 1,
            success_threshold: 1,
            on_state_change: None,
            is_failure: None,
        }
    }
}

impl BreakerConfig {
    /// Registers a callback fired synchronously on every transition with
    /// `(from, to)`. Callbacks run under the breaker mutex and must be
    /// short and non-blocking.
    pub fn with_on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(State, State) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    /// Overrides which statuses count as failures. The default counts
    /// `Internal`, `Unavailable`, `DataLoss`, `DeadlineExceeded`, and
    /// `Unknown` (errors with no classifiable status).
    pub fn with_is_failure<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Status) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Some(Arc::new(predicate));
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "failure_threshold",
                "must be in (0, 1]",
            ));
        }
        if self.max_probes == 0 {
            return Err(ConfigError::invalid("max_probes", "must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "success_threshold",
                "must be at least 1",
            ));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::invalid("open_timeout", "must be positive"));
        }
        Ok(())
    }
}

impl fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("minimum_requests", &self.minimum_requests)
            .field("rolling_interval", &self.rolling_interval)
            .field("open_timeout", &self.open_timeout)
            .field("max_probes", &self.max_probes)
            .field("success_threshold", &self.success_threshold)
            .finish()
    }
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    /// The breaker is open.
    Open,
    /// The half-open probe budget is already in flight.
    TooManyProbes,
}

impl fmt::Display for BreakerRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerRejection::Open => f.write_str("circuit open"),
            BreakerRejection::TooManyProbes => f.write_str("too many probes"),
        }
    }
}

/// A point-in-time view of the breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    /// Current state.
    pub state: State,
    /// Counters for the current generation.
    pub counts: Counts,
    /// Current generation number.
    pub generation: u64,
    /// When the current state was entered.
    pub state_changed_at: Instant,
}

#[derive(Debug)]
struct Shared {
    state: State,
    generation: u64,
    state_changed_at: Instant,
    counts: Counts,
    half_open_in_flight: u32,
}

/// The breaker state machine. Usable directly or through
/// [`CircuitBreakerLayer`].
pub struct CircuitBreaker {
    shared: Mutex<Shared>,
    config: BreakerConfig,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a breaker, validating the configuration.
    pub fn new(config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Mutex::new(Shared {
                state: State::Closed,
                generation: 0,
                state_changed_at: Instant::now(),
                counts: Counts::default(),
                half_open_in_flight: 0,
            }),
            config,
        })
    }

    /// Asks for admission. On success returns the generation the outcome
    /// must be reported against via [`CircuitBreaker::after_request`].
    pub fn before_request(&self) -> Result<u64, BreakerRejection> {
        let mut shared = self.lock();
        let now = Instant::now();
        self.refresh_state(&mut shared, now);

        match shared.state {
            State::Open => Err(BreakerRejection::Open),
            State::HalfOpen if shared.half_open_in_flight >= self.config.max_probes => {
                Err(BreakerRejection::TooManyProbes)
            }
            State::HalfOpen => {
                shared.half_open_in_flight += 1;
                shared.counts.requests += 1;
                Ok(shared.generation)
            }
            State::Closed => {
                shared.counts.requests += 1;
                Ok(shared.generation)
            }
        }
    }

    /// Records an outcome for a previously admitted request. Samples from a
    /// generation older than the current one are discarded.
    pub fn after_request(&self, generation: u64, failed: bool) {
        let mut shared = self.lock();
        let now = Instant::now();
        self.refresh_state(&mut shared, now);

        if generation != shared.generation {
            return;
        }

        if shared.state == State::HalfOpen {
            shared.half_open_in_flight = shared.half_open_in_flight.saturating_sub(1);
        }

        if failed {
            shared.counts.record_failure();
            match shared.state {
                State::HalfOpen => self.set_state(&mut shared, State::Open, now),
                State::Closed if self.should_open(&shared.counts) => {
                    self.set_state(&mut shared, State::Open, now);
                }
                _ => {}
            }
        } else {
            shared.counts.record_success();
            if shared.state == State::HalfOpen
                && shared.counts.consecutive_successes >= self.config.success_threshold
            {
                self.set_state(&mut shared, State::Closed, now);
            }
        }
    }

    /// Returns `true` if `status` counts as a failure for this breaker.
    pub fn is_failure(&self, status: &Status) -> bool {
        match &self.config.is_failure {
            Some(predicate) => predicate(status),
            None => matches!(
                status.code(),
                Code::Internal
                    | Code::Unavailable
                    | Code::DataLoss
                    | Code::DeadlineExceeded
                    | Code::Unknown
            ),
        }
    }

    /// Current state, applying any due timed transition first.
    pub fn state(&self) -> State {
        let mut shared = self.lock();
        self.refresh_state(&mut shared, Instant::now());
        shared.state
    }

    /// Counters for the current generation.
    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// A consistent snapshot of state, counts, and generation.
    pub fn stats(&self) -> BreakerStats {
        let mut shared = self.lock();
        self.refresh_state(&mut shared, Instant::now());
        BreakerStats {
            state: shared.state,
            counts: shared.counts,
            generation: shared.generation,
            state_changed_at: shared.state_changed_at,
        }
    }

    /// Forces the breaker back to closed, resetting counts and bumping the
    /// generation.
    pub fn reset(&self) {
        let mut shared = self.lock();
        let now = Instant::now();
        self.set_state(&mut shared, State::Closed, now);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies timed transitions: the tumbling count reset while closed and
    /// the open -> half-open move after the open timeout.
    fn refresh_state(&self, shared: &mut Shared, now: Instant) {
        match shared.state {
            State::Closed => {
                if !self.config.rolling_interval.is_zero()
                    && now.duration_since(shared.state_changed_at) > self.config.rolling_interval
                {
                    shared.counts = Counts::default();
                    shared.state_changed_at = now;
                }
            }
            State::Open => {
                if now.duration_since(shared.state_changed_at) >= self.config.open_timeout {
                    self.set_state(shared, State::HalfOpen, now);
                }
            }
            State::HalfOpen => {}
        }
    }

    fn should_open(&self, counts: &Counts) -> bool {
        if counts.requests < self.config.minimum_requests {
            return false;
        }
        let failure_rate = f64::from(counts.failures) / f64::from(counts.requests);
        failure_rate >= self.config.failure_threshold
    }

    fn set_state(&self, shared: &mut Shared, new_state: State, now: Instant) {
        if shared.state == new_state {
            return;
        }
        let old_state = shared.state;
        shared.state = new_state;
        shared.state_changed_at = now;
        shared.generation += 1;
        shared.counts = Counts::default();
        shared.half_open_in_flight = 0;

        debug!(from = %old_state, to = %new_state, generation = shared.generation, "breaker transition");
        if let Some(callback) = &self.config.on_state_change {
            callback(old_state, new_state);
        }
    }
}

/// Middleware guarding a service with a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    /// Creates a layer with its own breaker.
    pub fn new(config: BreakerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            breaker: Arc::new(CircuitBreaker::new(config)?),
        })
    }

    /// Wraps an existing breaker, e.g. one shared for observability.
    pub fn from_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    /// Shared handle to the underlying breaker.
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }
}

impl MiddlewareInfo for CircuitBreakerLayer {
    fn middleware_name(&self) -> &'static str {
        "circuit-breaker"
    }
}

/// The service produced by [`CircuitBreakerLayer`].
#[derive(Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

impl<S, R> Service<R> for CircuitBreakerService<S>
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
        let breaker = Arc::clone(&self.breaker);

        Box::pin(async move {
            let generation = match breaker.before_request() {
                Ok(generation) => generation,
                Err(rejection) => {
                    return Err(Status::unavailable(format!("circuit breaker: {rejection}")));
                }
            };

            let result = inner.call(req).await;
            let failed = match &result {
                Ok(_) => false,
                Err(status) => breaker.is_failure(status),
            };
            breaker.after_request(generation, failed);
            result
        })
    }
}
