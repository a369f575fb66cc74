//! Per-resource resilience settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::executor::ResilientExecutor;
use crate::registry::BreakerRegistry;
use crate::retry::RetryPolicy;

/// Everything needed to protect calls to one resource
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

impl ResilienceSettings {
    pub fn new(circuit_breaker: CircuitBreakerConfig, retry: RetryPolicy) -> Self {
        Self {
            circuit_breaker,
            retry,
        }
    }

    /// Per-attempt timeout, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.retry.timeout
    }

    /// Build an executor for `name`, sharing its breaker through `registry`
    pub fn executor(&self, name: &str, registry: &BreakerRegistry) -> ResilientExecutor {
        ResilientExecutor::from_settings(name, self, registry)
    }
}
