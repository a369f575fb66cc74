//! Retry policy and executor

use bulwark_core::{wrap, BoxError, ErrorContext, ErrorKind, ManagedError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffCalculator, BackoffStrategy};
use crate::timeout::TimeoutGuard;

/// Decides whether a failed attempt is retried.
///
/// Receives the classified error and the 0-based index of the attempt that
/// failed.
#[derive(Clone)]
pub struct RetryPredicate(Arc<dyn Fn(&ManagedError, u32) -> bool + Send + Sync>);

impl RetryPredicate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&ManagedError, u32) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Retry transient kinds only. SYSTEM and CIRCUIT_OPEN errors are never
    /// retried.
    pub fn transient() -> Self {
        Self::new(|error, _| {
            error.is_retryable()
                && !matches!(error.kind(), ErrorKind::System | ErrorKind::CircuitOpen)
        })
    }

    pub fn always() -> Self {
        Self::new(|_, _| true)
    }

    pub fn never() -> Self {
        Self::new(|_, _| false)
    }

    pub fn should_retry(&self, error: &ManagedError, attempt: u32) -> bool {
        (self.0)(error, attempt)
    }
}

impl Default for RetryPredicate {
    fn default() -> Self {
        Self::transient()
    }
}

impl std::fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_attempts: u32,

    /// Initial delay between retries
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,

    /// Relative jitter applied to each delay, in [0, 1]
    pub jitter_factor: f64,

    /// Bound on each individual attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Which failures are retried
    #[serde(skip)]
    pub should_retry: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_factor: 0.1,
            timeout: None,
            should_retry: RetryPredicate::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a conservative retry policy for critical operations
    pub fn conservative() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Create an aggressive retry policy for fast operations
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Create a linear retry policy
    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay.saturating_mul(max_attempts.max(1)),
            backoff_strategy: BackoffStrategy::Linear,
            jitter_factor: 0.0,
            ..Self::default()
        }
    }

    /// Run once, never retry
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy, initial: Duration, max: Duration) -> Self {
        self.backoff_strategy = strategy;
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Bound each attempt by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ManagedError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = RetryPredicate::new(predicate);
        self
    }

    /// Also retry CIRCUIT_OPEN rejections, e.g. to wait out a short reset window
    pub fn retry_on_open_circuit(mut self) -> Self {
        let inner = self.should_retry.clone();
        self.should_retry = RetryPredicate::new(move |error, attempt| {
            error.kind() == ErrorKind::CircuitOpen || inner.should_retry(error, attempt)
        });
        self
    }

    pub fn calculator(&self) -> BackoffCalculator {
        BackoffCalculator::new(
            self.backoff_strategy,
            self.initial_delay,
            self.max_delay,
            self.jitter_factor,
        )
    }

    /// Calculate delay after the failed `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.calculator().calculate_delay(attempt)
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    name: String,
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            name: "operation".to_string(),
            policy,
        }
    }

    /// Create with default policy
    pub fn with_default_policy() -> Self {
        Self::new(RetryPolicy::default())
    }

    /// Name used in log lines and timeout errors
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, ManagedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(|_| f(), None).await
    }

    /// Execute a function with retry logic and the 0-based attempt index
    pub async fn execute_with_context<F, Fut, T, E>(&self, f: F) -> Result<T, ManagedError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(f, None).await
    }

    /// Execute with retry logic, giving up between attempts once `token` is
    /// cancelled. An attempt already in flight is not interrupted.
    pub async fn execute_with_cancellation<F, Fut, T, E>(
        &self,
        mut f: F,
        token: &CancellationToken,
    ) -> Result<T, ManagedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(|_| f(), Some(token)).await
    }

    async fn run<F, Fut, T, E>(
        &self,
        mut f: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ManagedError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let guard = self
            .policy
            .timeout
            .map(|limit| TimeoutGuard::named(self.name.as_str(), limit));
        let mut attempt = 0;

        loop {
            let result = match &guard {
                Some(guard) => guard.run(f(attempt)).await,
                None => f(attempt)
                    .await
                    .map_err(|error| wrap(error, ErrorContext::new())),
            };

            match self.after_attempt(attempt, result, cancel).await {
                ControlFlow::Break(outcome) => return outcome,
                ControlFlow::Continue(()) => attempt += 1,
            }
        }
    }

    /// Decide what follows `attempt`: return its outcome, or wait out the
    /// backoff delay so the caller can try again.
    pub(crate) async fn after_attempt<T>(
        &self,
        attempt: u32,
        result: Result<T, ManagedError>,
        cancel: Option<&CancellationToken>,
    ) -> ControlFlow<Result<T, ManagedError>> {
        let error = match result {
            Ok(value) => {
                if attempt > 0 {
                    info!("{} succeeded after {} attempts", self.name, attempt + 1);
                }
                return ControlFlow::Break(Ok(value));
            }
            Err(error) => error,
        };

        if attempt >= self.policy.max_attempts {
            if self.policy.max_attempts > 0 {
                warn!(
                    "{} failed after {} attempts: {}",
                    self.name,
                    attempt + 1,
                    error
                );
            }
            return ControlFlow::Break(Err(error.with_context("attempts", attempt + 1)));
        }

        if !self.policy.should_retry.should_retry(&error, attempt) {
            debug!("{} failed with non-retryable error: {}", self.name, error);
            return ControlFlow::Break(Err(error));
        }

        let delay = self.policy.delay_for_attempt(attempt);
        warn!(
            "{} attempt {} failed: {}. Retrying in {:?}",
            self.name,
            attempt + 1,
            error,
            delay
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!("{} cancelled after {} attempts", self.name, attempt + 1);
                        ControlFlow::Break(Err(error
                            .with_context("attempts", attempt + 1)
                            .with_context("cancelled", true)))
                    }
                    _ = sleep(delay) => ControlFlow::Continue(()),
                }
            }
            None => {
                sleep(delay).await;
                ControlFlow::Continue(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_strategy: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(3));

        let result = executor
            .execute(|| {
                let count = counter.fetch_add(1, Ordering::Relaxed);
                async move {
                    if count < 2 {
                        Err(ManagedError::network("temporary failure"))
                    } else {
                        Ok("Success".to_string())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "Success");
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_max_attempts_exceeded() {
        let counter = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(2));

        let err = executor
            .execute(|| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), _>(ManagedError::network("always fails")) }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.context_value("attempts").and_then(|v| v.as_u64()), Some(3));
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let counter = AtomicU32::new(0);
        let executor = RetryExecutor::with_default_policy();

        let err = executor
            .execute(|| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), _>(ManagedError::validation("bad request")) }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_predicate_false_runs_once() {
        let counter = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(5).with_should_retry(|_, _| false));

        let _ = executor
            .execute(|| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), _>(ManagedError::network("flaky")) }
            })
            .await;

        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_system_and_open_circuit_not_retried_by_default() {
        let executor = RetryExecutor::new(fixed_policy(3));

        for error in [
            ManagedError::system("disk full"),
            ManagedError::circuit_open("db", "open", 5, Duration::from_secs(1)),
        ] {
            let counter = AtomicU32::new(0);
            let _ = executor
                .execute(|| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    let error = error.clone();
                    async move { Err::<(), _>(error) }
                })
                .await;
            assert_eq!(counter.load(Ordering::Relaxed), 1);
        }
    }

    #[tokio::test]
    async fn test_retry_on_open_circuit_opt_in() {
        let counter = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(2).retry_on_open_circuit());

        let _ = executor
            .execute(|| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), _>(ManagedError::circuit_open("db", "open", 5, Duration::ZERO)) }
            })
            .await;

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_raw_errors_are_classified() {
        let executor = RetryExecutor::new(fixed_policy(1));

        let err = executor
            .execute(|| async { "abc".parse::<u32>() })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.cause().is_some());
    }

    #[tokio::test]
    async fn test_execute_with_context() {
        let executor = RetryExecutor::new(fixed_policy(3));

        let result = executor
            .execute_with_context(|attempt| async move {
                if attempt < 2 {
                    Err(ManagedError::network(format!("attempt {}", attempt)))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout() {
        let counter = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(1).with_timeout(Duration::from_millis(50)))
            .with_name("inventory.lookup");

        let err = executor
            .execute(|| {
                counter.fetch_add(1, Ordering::Relaxed);
                async {
                    sleep(Duration::from_millis(200)).await;
                    Ok::<_, ManagedError>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.operation_name(), Some("inventory.lookup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_attempts() {
        let counter = AtomicU32::new(0);
        let token = CancellationToken::new();
        let executor = RetryExecutor::new(RetryPolicy::linear(10, Duration::from_secs(1)));

        let err = executor
            .execute_with_cancellation(
                || {
                    if counter.fetch_add(1, Ordering::Relaxed) == 1 {
                        token.cancel();
                    }
                    async { Err::<(), _>(ManagedError::network("unreachable")) }
                },
                &token,
            )
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert_eq!(err.context_value("cancelled").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn test_policy_delays() {
        let policy = RetryPolicy::default()
            .with_backoff(
                BackoffStrategy::Exponential,
                Duration::from_millis(100),
                Duration::from_secs(10),
            )
            .with_jitter(0.0);

        let delays: Vec<_> = (0..4).map(|a| policy.delay_for_attempt(a)).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn test_policy_deserializes_humantime() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 4, "initial_delay": "250ms", "backoff_strategy": "linear", "timeout": "2s"}"#,
        )
        .unwrap();

        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(policy.timeout, Some(Duration::from_secs(2)));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
