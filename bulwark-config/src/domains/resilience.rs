//! Validation of circuit breaker and retry settings

use bulwark_resilience::{BackoffStrategy, CircuitBreakerConfig, ResilienceSettings, RetryPolicy};

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_range, Validatable};

impl Validatable for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.failure_threshold, "failure_threshold", self.domain_name())?;
        validate_positive(self.success_threshold, "success_threshold", self.domain_name())?;
        validate_positive(self.half_open_max_calls, "half_open_max_calls", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "circuit_breaker"
    }
}

impl Validatable for RetryPolicy {
    fn validate(&self) -> ConfigResult<()> {
        validate_range(self.jitter_factor, 0.0, 1.0, "jitter_factor", self.domain_name())?;

        if self.backoff_strategy != BackoffStrategy::Fixed && self.initial_delay > self.max_delay {
            return Err(self.validation_error(format!(
                "initial_delay ({:?}) cannot exceed max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }

        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(self.validation_error("timeout must be greater than 0 when set"));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "retry"
    }
}

impl Validatable for ResilienceSettings {
    fn validate(&self) -> ConfigResult<()> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ResilienceSettings::default().validate().is_ok());
        assert!(RetryPolicy::conservative().validate().is_ok());
        assert!(RetryPolicy::linear(4, Duration::from_millis(20)).validate().is_ok());
    }

    #[test]
    fn test_zero_failure_threshold_rejected() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };

        match config.validate() {
            Err(ConfigError::DomainError { domain, message }) => {
                assert_eq!(domain, "circuit_breaker");
                assert!(message.contains("failure_threshold"));
            }
            other => panic!("expected domain error, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_bounds() {
        assert!(RetryPolicy::default().with_jitter(1.2).validate().is_err());
        assert!(RetryPolicy::default()
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RetryPolicy::default()
            .with_backoff(
                BackoffStrategy::Exponential,
                Duration::from_secs(5),
                Duration::from_secs(1)
            )
            .validate()
            .is_err());
        // Fixed backoff ignores max_delay
        assert!(RetryPolicy::default()
            .with_backoff(BackoffStrategy::Fixed, Duration::from_secs(5), Duration::from_secs(1))
            .validate()
            .is_ok());
    }
}
