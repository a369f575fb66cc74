//! Domain-specific configuration modules

pub mod logging;
pub mod resilience;
pub mod utils;

use bulwark_resilience::{BreakerRegistry, ResilienceSettings, ResilientExecutor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};

/// Main Bulwark configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BulwarkConfig {
    /// Settings for any resource without its own entry
    pub defaults: ResilienceSettings,

    /// Per-resource settings, keyed by resource name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResilienceSettings>,

    /// Logging configuration
    pub logging: logging::LoggingConfig,
}

impl BulwarkConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.defaults.validate()?;

        for (name, settings) in &self.resources {
            validate_required_string(name, "resource name", "resources")?;
            settings.validate().map_err(|e| {
                crate::error::ConfigError::ValidationError(format!("resource '{}': {}", name, e))
            })?;
        }

        self.logging.validate()?;
        Ok(())
    }

    /// Settings for `resource`, falling back to the defaults
    pub fn settings_for(&self, resource: &str) -> &ResilienceSettings {
        self.resources.get(resource).unwrap_or(&self.defaults)
    }

    /// Registry with every configured resource's breaker settings installed
    pub fn registry(&self) -> BreakerRegistry {
        let registry = BreakerRegistry::with_defaults(self.defaults.circuit_breaker.clone());
        for (name, settings) in &self.resources {
            registry.configure(name.as_str(), settings.circuit_breaker.clone());
        }
        registry
    }

    /// Executor for `resource` whose breaker is shared through `registry`
    pub fn executor(&self, resource: &str, registry: &BreakerRegistry) -> ResilientExecutor {
        self.settings_for(resource).executor(resource, registry)
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = BulwarkConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
