//! Backoff strategies for retry policies

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Doubling delay: initial_delay * 2^attempt
    #[default]
    Exponential,

    /// Linear increase: initial_delay * (attempt + 1)
    Linear,

    /// Fixed delay between retries
    Fixed,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "fixed" => Ok(BackoffStrategy::Fixed),
            _ => Err(format!("Invalid backoff strategy: {}", s)),
        }
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Exponential => write!(f, "exponential"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Fixed => write!(f, "fixed"),
        }
    }
}

/// Backoff delay calculator
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    strategy: BackoffStrategy,
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl BackoffCalculator {
    /// Create a new backoff calculator. `jitter_factor` is clamped to [0, 1].
    pub fn new(
        strategy: BackoffStrategy,
        initial_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Self {
        let jitter_factor = if jitter_factor.is_finite() {
            jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            strategy,
            initial_delay,
            max_delay,
            jitter_factor,
        }
    }

    /// Calculate the jittered delay to wait after the failed `attempt` (0-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.base_delay(attempt))
    }

    /// Delay before jitter is applied
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,

            BackoffStrategy::Linear => attempt
                .checked_add(1)
                .and_then(|factor| self.initial_delay.checked_mul(factor))
                .unwrap_or(self.max_delay)
                .min(self.max_delay),

            BackoffStrategy::Exponential => 2u32
                .checked_pow(attempt)
                .and_then(|factor| self.initial_delay.checked_mul(factor))
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let offset = rng.gen_range(-self.jitter_factor..=self.jitter_factor);
        let scaled = (delay.as_secs_f64() * (1.0 + offset)).max(0.0);
        Duration::try_from_secs_f64(scaled).unwrap_or(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator(strategy: BackoffStrategy, max_ms: u64) -> BackoffCalculator {
        BackoffCalculator::new(
            strategy,
            Duration::from_millis(100),
            Duration::from_millis(max_ms),
            0.0,
        )
    }

    #[test]
    fn test_fixed_backoff() {
        let calc = calculator(BackoffStrategy::Fixed, 1_000);

        assert_eq!(calc.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(calc.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(calc.calculate_delay(10), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_backoff() {
        let calc = calculator(BackoffStrategy::Linear, 1_000);

        assert_eq!(calc.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(calc.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(calc.calculate_delay(4), Duration::from_millis(500));
        assert_eq!(calc.calculate_delay(20), Duration::from_secs(1)); // Capped at max
    }

    #[test]
    fn test_exponential_backoff() {
        let calc = calculator(BackoffStrategy::Exponential, 10_000);

        assert_eq!(calc.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(calc.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(calc.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(calc.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_cap() {
        let calc = calculator(BackoffStrategy::Exponential, 500);

        assert_eq!(calc.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(calc.calculate_delay(3), Duration::from_millis(500)); // Capped
        assert_eq!(calc.calculate_delay(64), Duration::from_millis(500)); // No overflow
    }

    #[test]
    fn test_jitter_bounds() {
        let calc = BackoffCalculator::new(
            BackoffStrategy::Fixed,
            Duration::from_millis(1000),
            Duration::from_secs(10),
            0.2,
        );

        for _ in 0..50 {
            let delay = calc.calculate_delay(0);
            assert!(delay >= Duration::from_millis(799));
            assert!(delay <= Duration::from_millis(1201));
        }
    }

    #[test]
    fn test_full_jitter_never_negative() {
        let calc = BackoffCalculator::new(
            BackoffStrategy::Fixed,
            Duration::from_millis(10),
            Duration::from_secs(1),
            7.5, // clamped to 1.0
        );

        for _ in 0..50 {
            assert!(calc.calculate_delay(0) <= Duration::from_millis(21));
        }
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("LINEAR".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Linear));
        assert!("fibonacci".parse::<BackoffStrategy>().is_err());
    }
}
