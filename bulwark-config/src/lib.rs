//! Configuration management for Bulwark
//!
//! Resilience settings are read from YAML, overridden from `BULWARK_`
//! environment variables and validated before use. Settings apply per
//! resource name, falling back to a shared set of defaults.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    BulwarkConfig,
};
