//! Composition of retry, circuit breaker and timeout
//!
//! [`ResilientExecutor`] always applies the patterns in the same order:
//!
//! ```text
//! Retry(CircuitBreaker(Timeout(op)))
//! ```
//!
//! The timeout bounds each attempt, the breaker accounts for each attempt,
//! and the retry loop governs how many attempts run and how they are spaced.
//! A per-attempt timeout set on the retry policy is moved to the innermost
//! position so this order holds however the executor was configured.

use bulwark_core::{wrap, BoxError, ErrorContext, ManagedError};
use std::future::{Future, Ready};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::registry::BreakerRegistry;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::settings::ResilienceSettings;
use crate::timeout::TimeoutGuard;

type NoFallback<T> = fn() -> Ready<T>;

/// Runs operations through retry, a shared circuit breaker and a timeout
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    name: String,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    timeout: Option<TimeoutGuard>,
}

impl ResilientExecutor {
    pub fn builder(name: impl Into<String>) -> ResilientExecutorBuilder {
        ResilientExecutorBuilder::new(name)
    }

    /// Executor for resource `name` whose breaker is shared through `registry`
    pub fn from_settings(
        name: &str,
        settings: &ResilienceSettings,
        registry: &BreakerRegistry,
    ) -> Self {
        let breaker = registry.get_or_create_with(name, settings.circuit_breaker.clone());
        Self::builder(name)
            .breaker(breaker)
            .retry_policy(settings.retry.clone())
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_ref().map(TimeoutGuard::limit)
    }

    /// Run `op` with retries, breaker accounting and the per-attempt timeout
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ManagedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(op, None::<NoFallback<T>>, None).await
    }

    /// Like [`execute`](Self::execute), but serve `fallback` instead of a
    /// CIRCUIT_OPEN error once the breaker rejects an attempt
    pub async fn execute_with_fallback<F, Fut, T, E, FB, FBFut>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, ManagedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        FB: FnOnce() -> FBFut,
        FBFut: Future<Output = T>,
    {
        self.run(op, Some(fallback), None).await
    }

    /// Like [`execute`](Self::execute), but stop retrying once `token` is
    /// cancelled. The attempt in flight is allowed to finish.
    pub async fn execute_with_cancellation<F, Fut, T, E>(
        &self,
        op: F,
        token: &CancellationToken,
    ) -> Result<T, ManagedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(op, None::<NoFallback<T>>, Some(token)).await
    }

    /// Bind `op` to this executor, producing a reusable callable
    pub fn wrap<F>(&self, op: F) -> Wrapped<F> {
        Wrapped {
            executor: self.clone(),
            op,
        }
    }

    async fn run<F, Fut, T, E, FB, FBFut>(
        &self,
        mut op: F,
        mut fallback: Option<FB>,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ManagedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        FB: FnOnce() -> FBFut,
        FBFut: Future<Output = T>,
    {
        let mut attempt = 0;

        loop {
            // op is only invoked once the breaker has admitted the attempt
            let result = self.breaker.execute(|| self.attempt(op())).await;

            let result = match result {
                Err(error) if error.did_not_execute() => match fallback.take() {
                    Some(fallback) => {
                        log::debug!("{} serving fallback: {}", self.name, error);
                        return Ok(fallback().await);
                    }
                    None => Err(error),
                },
                other => other,
            };

            match self.retry.after_attempt(attempt, result, cancel).await {
                ControlFlow::Break(outcome) => {
                    return outcome.map_err(|mut error| {
                        error.merge_context(ErrorContext::new().component(self.name.as_str()));
                        error
                    })
                }
                ControlFlow::Continue(()) => attempt += 1,
            }
        }
    }

    async fn attempt<Fut, T, E>(&self, fut: Fut) -> Result<T, ManagedError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        match &self.timeout {
            Some(guard) => guard.run(fut).await,
            None => fut.await.map_err(|error| wrap(error, ErrorContext::new())),
        }
    }
}

/// An operation bound to a [`ResilientExecutor`]
#[derive(Debug, Clone)]
pub struct Wrapped<F> {
    executor: ResilientExecutor,
    op: F,
}

impl<F> Wrapped<F> {
    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    /// Invoke the bound operation through the executor
    pub async fn call<Fut, T, E>(&mut self) -> Result<T, ManagedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.executor.execute(&mut self.op).await
    }
}

/// Builder for [`ResilientExecutor`]
pub struct ResilientExecutorBuilder {
    name: String,
    breaker: Option<CircuitBreaker>,
    breaker_config: CircuitBreakerConfig,
    policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl ResilientExecutorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            breaker: None,
            breaker_config: CircuitBreakerConfig::default(),
            policy: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Use an existing, possibly shared, breaker
    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Configuration for a private breaker. Ignored when a breaker is supplied.
    pub fn breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Per-attempt timeout. Takes precedence over the policy's timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ResilientExecutor {
        let mut policy = self.policy;
        let timeout = self.timeout.or(policy.timeout.take());
        let breaker = self
            .breaker
            .unwrap_or_else(|| CircuitBreaker::new(self.name.as_str(), self.breaker_config));

        ResilientExecutor {
            timeout: timeout.map(|limit| TimeoutGuard::named(self.name.as_str(), limit)),
            retry: RetryExecutor::new(policy).with_name(self.name.as_str()),
            breaker,
            name: self.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffStrategy;
    use crate::circuit_breaker::CircuitState;
    use bulwark_core::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_backoff(
                BackoffStrategy::Fixed,
                Duration::from_millis(5),
                Duration::from_millis(5),
            )
            .with_jitter(0.0)
    }

    #[test]
    fn test_policy_timeout_moves_innermost() {
        let executor = ResilientExecutor::builder("search")
            .retry_policy(quick_policy(2).with_timeout(Duration::from_millis(75)))
            .build();

        assert_eq!(executor.timeout(), Some(Duration::from_millis(75)));
        assert_eq!(executor.retry_policy().timeout, None);
    }

    #[tokio::test]
    async fn test_breaker_counts_every_attempt() {
        let executor = ResilientExecutor::builder("inventory")
            .breaker_config(CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(60),
                ..Default::default()
            })
            .retry_policy(quick_policy(5))
            .build();
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ManagedError::network("connection reset")) }
            })
            .await
            .unwrap_err();

        // Third attempt is rejected by the open breaker and not retried
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(err.component(), Some("inventory"));
        assert_eq!(executor.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_fallback_when_circuit_open() {
        let executor = ResilientExecutor::builder("pricing")
            .retry_policy(quick_policy(0))
            .build();
        executor.breaker().force_open();

        let price = executor
            .execute_with_fallback(|| async { Ok::<_, ManagedError>(10) }, || async { 0 })
            .await
            .unwrap();

        assert_eq!(price, 0);
    }

    #[tokio::test]
    async fn test_wrapped_callable_is_reusable() {
        let executor = ResilientExecutor::builder("counter")
            .retry_policy(quick_policy(0))
            .build();
        let mut next = 0u32;
        let mut wrapped = executor.wrap(move || {
            next += 1;
            let value = next;
            async move { Ok::<_, ManagedError>(value) }
        });

        assert_eq!(wrapped.call().await.unwrap(), 1);
        assert_eq!(wrapped.call().await.unwrap(), 2);
        assert_eq!(wrapped.executor().breaker().metrics().total_successes, 2);
    }

    #[tokio::test]
    async fn test_from_settings_shares_registry_breaker() {
        let registry = BreakerRegistry::new();
        let settings = ResilienceSettings::default();

        let first = ResilientExecutor::from_settings("ledger", &settings, &registry);
        let second = settings.executor("ledger", &registry);

        first.breaker().force_open();
        assert!(second.breaker().is_open());
    }
}
