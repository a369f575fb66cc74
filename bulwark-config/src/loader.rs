//! Configuration loading and environment variable handling

use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::utils::parse_millis;
use crate::domains::BulwarkConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::validation::validate_enum_choice;
use bulwark_resilience::{BackoffStrategy, ResilienceSettings};
use std::path::Path;
use std::str::FromStr;

const BACKOFF_STRATEGIES: [&str; 3] = ["exponential", "linear", "fixed"];

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "BULWARK".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<BulwarkConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: BulwarkConfig = serde_yaml::from_str(&content)?;
        log::debug!("Loaded configuration from {}", path.display());

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<BulwarkConfig> {
        let mut config = BulwarkConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<BulwarkConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut BulwarkConfig) -> ConfigResult<()> {
        self.apply_breaker_overrides(&mut config.defaults)?;
        self.apply_retry_overrides(&mut config.defaults)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply circuit breaker overrides to the default settings
    fn apply_breaker_overrides(&self, settings: &mut ResilienceSettings) -> ConfigResult<()> {
        let breaker = &mut settings.circuit_breaker;

        if let Some(threshold) = self.parse_var("FAILURE_THRESHOLD")? {
            breaker.failure_threshold = threshold;
        }

        if let Some(threshold) = self.parse_var("SUCCESS_THRESHOLD")? {
            breaker.success_threshold = threshold;
        }

        if let Some(timeout) = self.millis_var("RESET_TIMEOUT_MS")? {
            breaker.reset_timeout = timeout;
        }

        Ok(())
    }

    /// Apply retry overrides to the default settings
    fn apply_retry_overrides(&self, settings: &mut ResilienceSettings) -> ConfigResult<()> {
        let retry = &mut settings.retry;

        if let Some(max_attempts) = self.parse_var("MAX_ATTEMPTS")? {
            retry.max_attempts = max_attempts;
        }

        if let Some(delay) = self.millis_var("INITIAL_DELAY_MS")? {
            retry.initial_delay = delay;
        }

        if let Some(delay) = self.millis_var("MAX_DELAY_MS")? {
            retry.max_delay = delay;
        }

        if let Ok(strategy) = self.get_env_var("BACKOFF_STRATEGY") {
            validate_enum_choice(&strategy, &BACKOFF_STRATEGIES, "BACKOFF_STRATEGY", "env")?;
            retry.backoff_strategy = BackoffStrategy::from_str(&strategy)
                .map_err(|e| ConfigError::EnvError(format!("Invalid BACKOFF_STRATEGY: {}", e)))?;
        }

        if let Some(jitter) = self.parse_var("JITTER_FACTOR")? {
            retry.jitter_factor = jitter;
        }

        if let Some(timeout) = self.millis_var("TIMEOUT_MS")? {
            retry.timeout = (!timeout.is_zero()).then_some(timeout);
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Parse an optional variable with `FromStr`
    fn parse_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    fn millis_var(&self, name: &str) -> ConfigResult<Option<std::time::Duration>> {
        match self.get_env_var(name) {
            Ok(value) => parse_millis(&value)
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
