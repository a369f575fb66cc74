//! Utility functions and helpers for configuration

use std::time::Duration;

/// Default functions for serde
pub fn default_true() -> bool {
    true
}

pub fn default_false() -> bool {
    false
}

/// Parse a whole number of milliseconds, as used by `*_MS` variables
pub fn parse_millis(value: &str) -> Result<Duration, std::num::ParseIntError> {
    value.trim().parse::<u64>().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_millis() {
        assert_eq!(parse_millis(" 250 "), Ok(Duration::from_millis(250)));
        assert!(parse_millis("1.5s").is_err());
    }
}
