//! Resilience patterns for Bulwark
//!
//! This crate provides a circuit breaker, a retry executor with backoff and
//! jitter, a cooperative timeout guard, and [`ResilientExecutor`], which
//! composes them around an operation as `Retry(CircuitBreaker(Timeout(op)))`.

pub mod backoff;
pub mod circuit_breaker;
pub mod events;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod timeout;

// Re-export commonly used types
pub use backoff::{BackoffCalculator, BackoffStrategy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitMetrics, CircuitState,
    FailurePredicate,
};
pub use events::{BreakerCounters, BreakerEvent, BreakerEventKind, BreakerListener, LogListener};
pub use executor::{ResilientExecutor, ResilientExecutorBuilder, Wrapped};
pub use registry::BreakerRegistry;
pub use retry::{RetryExecutor, RetryPolicy, RetryPredicate};
pub use settings::ResilienceSettings;
pub use timeout::{with_timeout, TimeoutGuard};

pub use bulwark_core::{ErrorKind, ManagedError};
