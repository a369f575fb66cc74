//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate that a float lies within `[min, max]`
pub fn validate_range(value: f64, min: f64, max: f64, field_name: &str, domain: &str) -> ConfigResult<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!(
                "{} must be between {} and {}, got {}",
                field_name, min, max, value
            ),
        });
    }
    Ok(())
}

/// Validate an enum choice
pub fn validate_enum_choice<T>(value: &str, valid_choices: &[T], field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: AsRef<str>,
{
    let valid: Vec<&str> = valid_choices.iter().map(|c| c.as_ref()).collect();

    if !valid.iter().any(|&v| v.eq_ignore_ascii_case(value)) {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!(
                "{} has invalid value '{}'. Valid choices: {}",
                field_name,
                value,
                valid.join(", ")
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive(1u32, "failure_threshold", "circuit_breaker").is_ok());

        let err = validate_positive(0u32, "failure_threshold", "circuit_breaker").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Domain configuration error in circuit_breaker: failure_threshold must be greater than 0, got 0"
        );
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(0.0, 0.0, 1.0, "jitter_factor", "retry").is_ok());
        assert!(validate_range(1.0, 0.0, 1.0, "jitter_factor", "retry").is_ok());
        assert!(validate_range(1.5, 0.0, 1.0, "jitter_factor", "retry").is_err());
        assert!(validate_range(f64::NAN, 0.0, 1.0, "jitter_factor", "retry").is_err());
    }

    #[test]
    fn test_validate_enum_choice() {
        let choices = ["exponential", "linear", "fixed"];
        assert!(validate_enum_choice("LINEAR", &choices, "backoff_strategy", "retry").is_ok());
        assert!(validate_enum_choice("fibonacci", &choices, "backoff_strategy", "retry").is_err());
    }
}
