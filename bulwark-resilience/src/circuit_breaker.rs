//! Circuit breaker pattern implementation

use bulwark_core::{wrap, BoxError, ErrorContext, ManagedError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::events::{
    BreakerCounters, BreakerEvent, BreakerEventKind, BreakerListener, EventDispatcher,
};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, limited requests allowed to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,

    /// Number of consecutive successes in half-open state before closing
    pub success_threshold: u32,

    /// Time to wait after the last failure before probing again
    #[serde(with = "humantime_serde", alias = "timeout")]
    pub reset_timeout: Duration,

    /// Concurrent probe calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Decides whether a failed call counts against the breaker.
///
/// Errors the predicate rejects are still returned to the caller but are
/// accounted as successes. The default counts every error.
#[derive(Clone)]
pub struct FailurePredicate(Arc<dyn Fn(&ManagedError) -> bool + Send + Sync>);

impl FailurePredicate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&ManagedError) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    pub fn any_error() -> Self {
        Self::new(|_| true)
    }

    pub fn is_failure(&self, error: &ManagedError) -> bool {
        (self.0)(error)
    }
}

impl Default for FailurePredicate {
    fn default() -> Self {
        Self::any_error()
    }
}

impl std::fmt::Debug for FailurePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FailurePredicate(..)")
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    /// Total number of completed requests
    pub total_requests: u64,
    /// Number of successful requests
    pub total_successes: u64,
    /// Number of failed requests
    pub total_failures: u64,
    /// Number of requests rejected due to open circuit
    pub total_rejected: u64,
    /// Current consecutive failures
    pub consecutive_failures: u32,
    /// Current consecutive successes
    pub consecutive_successes: u32,
    /// Last failure time
    pub last_failure_time: Option<Instant>,
    /// Last success time
    pub last_success_time: Option<Instant>,
    /// Last state change time
    pub last_state_change: Option<Instant>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    // Bumped on every transition; results of calls admitted under an older
    // generation update totals only.
    generation: u64,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    metrics: CircuitMetrics,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            generation: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
            metrics: CircuitMetrics::default(),
        }
    }
}

/// Admission ticket for one call. Dropping an unsettled probe ticket frees
/// its half-open slot, so an abandoned probe cannot wedge the breaker.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut state = self.breaker.state.lock();
            release_probe(&mut state, self.generation);
        }
    }
}

fn release_probe(state: &mut BreakerState, generation: u64) {
    if state.generation == generation && state.state == CircuitState::HalfOpen {
        state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
    }
}

/// Thread-safe circuit breaker guarding one named resource.
///
/// Cloning yields another handle to the same breaker. All state lives behind a
/// single mutex, so the lazy OPEN → HALF_OPEN transition happens exactly once
/// no matter how many callers observe the expired window together. Listeners
/// are notified after the lock is released, in the order the state changed.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
    events: Arc<EventDispatcher>,
    is_failure: FailurePredicate,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state.lock().state)
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState::new())),
            events: Arc::new(EventDispatcher::default()),
            is_failure: FailurePredicate::default(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn builder(name: impl Into<String>) -> CircuitBreakerBuilder {
        CircuitBreakerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register a listener for this breaker's events
    pub fn add_listener(&self, listener: Arc<dyn BreakerListener>) {
        self.events.add_listener(listener);
    }

    /// Run `op` through the breaker.
    ///
    /// While the circuit is open the operation is not invoked and a
    /// CIRCUIT_OPEN error is returned immediately.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ManagedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let permit = self.try_acquire()?;
        self.run(permit, op).await
    }

    /// Run `op` through the breaker, substituting `fallback` while the
    /// circuit is open.
    pub async fn execute_with_fallback<F, Fut, T, E, FB, FBFut>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, ManagedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        FB: FnOnce() -> FBFut,
        FBFut: Future<Output = T>,
    {
        match self.try_acquire() {
            Ok(permit) => self.run(permit, op).await,
            Err(rejection) => {
                log::debug!(
                    "Circuit breaker '{}' serving fallback: {}",
                    self.name,
                    rejection
                );
                Ok(fallback().await)
            }
        }
    }

    /// Check if the circuit breaker is open (requests should be blocked)
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Get the current state, applying a due OPEN → HALF_OPEN transition
    pub fn state(&self) -> CircuitState {
        self.with_state(|this, state, events| {
            this.update_state(state, events);
            state.state
        })
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.state.lock().success_count
    }

    /// Time left before an open circuit admits a probe
    pub fn time_until_reset(&self) -> Option<Duration> {
        let state = self.state.lock();
        (state.state == CircuitState::Open).then(|| self.remaining_open_time(&state))
    }

    /// Time of the last state transition
    pub fn last_state_change(&self) -> Instant {
        self.state.lock().last_state_change
    }

    /// Get current metrics
    pub fn metrics(&self) -> CircuitMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn counters(&self) -> BreakerCounters {
        counters(&self.state.lock())
    }

    /// Record a successful operation performed outside [`execute`](Self::execute)
    pub fn record_success(&self) {
        self.with_state(|this, state, events| {
            this.update_state(state, events);
            this.apply_success(state, events);
        })
    }

    /// Record a failed operation performed outside [`execute`](Self::execute)
    pub fn record_failure(&self) {
        self.with_state(|this, state, events| {
            this.update_state(state, events);
            this.apply_failure(state, events);
        })
    }

    /// Open the circuit now and restart the reset window
    pub fn force_open(&self) {
        self.with_state(|this, state, events| {
            if state.state != CircuitState::Open {
                this.transition_to(state, CircuitState::Open, events);
            }
            state.last_failure_time = Some(Instant::now());
        })
    }

    /// Close the circuit now, clearing the failure and success counters
    pub fn force_close(&self) {
        self.with_state(|this, state, events| {
            if state.state != CircuitState::Closed {
                this.transition_to(state, CircuitState::Closed, events);
            }
            state.failure_count = 0;
            state.success_count = 0;
            state.metrics.consecutive_failures = 0;
            state.metrics.consecutive_successes = 0;
        })
    }

    /// Reset the circuit breaker to closed state with all counters cleared
    pub fn reset(&self) {
        self.with_state(|this, state, events| {
            if state.state != CircuitState::Closed {
                this.transition_to(state, CircuitState::Closed, events);
            }
            state.failure_count = 0;
            state.success_count = 0;
            state.last_failure_time = None;
            state.metrics = CircuitMetrics {
                last_state_change: Some(state.last_state_change),
                ..CircuitMetrics::default()
            };
        })
    }

    // Internal methods

    fn with_state<R>(
        &self,
        f: impl FnOnce(&Self, &mut BreakerState, &mut Vec<BreakerEvent>) -> R,
    ) -> R {
        let result = {
            let mut state = self.state.lock();
            let mut events = Vec::new();
            let result = f(self, &mut state, &mut events);
            self.events.enqueue(events);
            result
        };
        self.events.drain();
        result
    }

    fn try_acquire(&self) -> Result<CallPermit<'_>, ManagedError> {
        let admitted = self.with_state(|this, state, events| {
            this.update_state(state, events);
            match state.state {
                CircuitState::Closed => Ok((state.generation, false)),
                CircuitState::HalfOpen
                    if state.half_open_in_flight < this.config.half_open_max_calls.max(1) =>
                {
                    state.half_open_in_flight += 1;
                    Ok((state.generation, true))
                }
                _ => {
                    state.metrics.total_rejected += 1;
                    events.push(this.event(BreakerEventKind::Rejected, state));
                    Err(ManagedError::circuit_open(
                        this.name.as_ref(),
                        state.state.as_str(),
                        state.failure_count,
                        this.remaining_open_time(state),
                    ))
                }
            }
        });

        admitted.map(|(generation, probe)| CallPermit {
            breaker: self,
            generation,
            probe,
            settled: false,
        })
    }

    async fn run<F, Fut, T, E>(&self, permit: CallPermit<'_>, op: F) -> Result<T, ManagedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        match op().await {
            Ok(value) => {
                self.settle(permit, true);
                Ok(value)
            }
            Err(error) => {
                let error = wrap(error, ErrorContext::new().with("circuit", self.name.as_ref()));
                self.settle(permit, !self.is_failure.is_failure(&error));
                Err(error)
            }
        }
    }

    fn settle(&self, mut permit: CallPermit<'_>, success: bool) {
        permit.settled = true;
        self.with_state(|this, state, events| {
            if permit.probe {
                release_probe(state, permit.generation);
            }
            if state.generation != permit.generation {
                // Admitted under a previous state; only the totals move.
                record_totals(state, success);
                return;
            }
            if success {
                this.apply_success(state, events);
            } else {
                this.apply_failure(state, events);
            }
        })
    }

    fn apply_success(&self, state: &mut BreakerState, events: &mut Vec<BreakerEvent>) {
        record_totals(state, true);
        state.metrics.consecutive_successes += 1;
        state.metrics.consecutive_failures = 0;

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                events.push(self.event(BreakerEventKind::Success, state));
                if state.success_count >= self.config.success_threshold {
                    self.transition_to(state, CircuitState::Closed, events);
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
                events.push(self.event(BreakerEventKind::Success, state));
            }
            CircuitState::Open => {
                // Late result of a call admitted before the circuit opened
            }
        }
    }

    fn apply_failure(&self, state: &mut BreakerState, events: &mut Vec<BreakerEvent>) {
        record_totals(state, false);
        state.metrics.consecutive_failures += 1;
        state.metrics.consecutive_successes = 0;

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                state.last_failure_time = Some(Instant::now());
                events.push(self.event(BreakerEventKind::Failure, state));
                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to(state, CircuitState::Open, events);
                }
            }
            CircuitState::HalfOpen => {
                state.failure_count += 1;
                state.last_failure_time = Some(Instant::now());
                events.push(self.event(BreakerEventKind::Failure, state));
                self.transition_to(state, CircuitState::Open, events);
            }
            CircuitState::Open => {
                // Already open, no action needed
            }
        }
    }

    fn update_state(&self, state: &mut BreakerState, events: &mut Vec<BreakerEvent>) {
        if state.state == CircuitState::Open && self.remaining_open_time(state).is_zero() {
            self.transition_to(state, CircuitState::HalfOpen, events);
        }
    }

    fn remaining_open_time(&self, state: &BreakerState) -> Duration {
        let opened_at = state.last_failure_time.unwrap_or(state.last_state_change);
        self.config.reset_timeout.saturating_sub(opened_at.elapsed())
    }

    fn transition_to(
        &self,
        state: &mut BreakerState,
        new_state: CircuitState,
        events: &mut Vec<BreakerEvent>,
    ) {
        let now = Instant::now();
        let previous = state.state;
        state.state = new_state;
        state.generation += 1;
        state.half_open_in_flight = 0;
        state.success_count = 0;
        state.last_state_change = now;
        state.metrics.last_state_change = Some(now);

        let kind = match new_state {
            CircuitState::Open => {
                log::warn!(
                    "Circuit breaker '{}' opened after {} failures (was {})",
                    self.name,
                    state.failure_count,
                    previous
                );
                BreakerEventKind::Open
            }
            CircuitState::HalfOpen => {
                log::info!("Circuit breaker '{}' transitioned to half-open state", self.name);
                BreakerEventKind::HalfOpen
            }
            CircuitState::Closed => {
                state.failure_count = 0;
                state.metrics.consecutive_failures = 0;
                state.metrics.consecutive_successes = 0;
                log::info!("Circuit breaker '{}' closed after successful recovery", self.name);
                BreakerEventKind::Close
            }
        };

        events.push(self.event(kind, state));
    }

    fn event(&self, kind: BreakerEventKind, state: &BreakerState) -> BreakerEvent {
        BreakerEvent::new(kind, self.name.as_ref(), counters(state))
    }
}

fn record_totals(state: &mut BreakerState, success: bool) {
    let now = Instant::now();
    state.metrics.total_requests += 1;
    if success {
        state.metrics.total_successes += 1;
        state.metrics.last_success_time = Some(now);
    } else {
        state.metrics.total_failures += 1;
        state.metrics.last_failure_time = Some(now);
    }
}

fn counters(state: &BreakerState) -> BreakerCounters {
    BreakerCounters {
        failure_count: state.failure_count,
        success_count: state.success_count,
        consecutive_failures: state.metrics.consecutive_failures,
        total_requests: state.metrics.total_requests,
        total_failures: state.metrics.total_failures,
        total_rejected: state.metrics.total_rejected,
    }
}

/// Builder for circuit breakers
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    is_failure: FailurePredicate,
    listeners: Vec<Arc<dyn BreakerListener>>,
}

impl CircuitBreakerBuilder {
    /// Create a new builder with default config
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            is_failure: FailurePredicate::default(),
            listeners: Vec::new(),
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set success threshold for recovery
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set the wait before attempting recovery
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    /// Set how many probes may run at once while half-open
    pub fn half_open_max_calls(mut self, calls: u32) -> Self {
        self.config.half_open_max_calls = calls;
        self
    }

    /// Classify which errors count as breaker failures
    pub fn is_failure<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ManagedError) -> bool + Send + Sync + 'static,
    {
        self.is_failure = FailurePredicate::new(predicate);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        let mut breaker = CircuitBreaker::new(self.name, self.config);
        breaker.is_failure = self.is_failure;
        breaker.events.set_listeners(self.listeners);
        breaker
    }
}
