//! Emitting managed error records

use bulwark_core::{ManagedError, Severity};
use tracing::Level;

/// Tracing level for an error of the given severity
pub fn severity_level(severity: Severity) -> Level {
    match severity {
        Severity::Info => Level::INFO,
        Severity::Warning => Level::WARN,
        Severity::Error | Severity::Critical => Level::ERROR,
    }
}

macro_rules! error_event {
    ($level:expr, $error:expr, $record:expr) => {
        tracing::event!(
            $level,
            kind = %$error.kind(),
            code = %$error.code(),
            severity = %$error.severity(),
            component = $error.component().unwrap_or("-"),
            retryable = $error.is_retryable(),
            alert = $error.severity().should_alert(),
            record = %$record,
            "{}",
            $error.message()
        )
    };
}

/// Emit `error` as a structured event, with its serialised record attached.
///
/// The level follows the error's severity, so SYSTEM errors always log at
/// ERROR.
pub fn log_error_record(error: &ManagedError) {
    let record = serde_json::to_string(&error.to_record())
        .unwrap_or_else(|e| format!("{{\"unserialisable\":\"{}\"}}", e));

    match error.severity() {
        Severity::Error | Severity::Critical => error_event!(Level::ERROR, error, record),
        Severity::Warning => error_event!(Level::WARN, error, record),
        Severity::Info => error_event!(Level::INFO, error, record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::ErrorKind;

    #[test]
    fn test_severity_levels() {
        assert_eq!(severity_level(Severity::Info), Level::INFO);
        assert_eq!(severity_level(Severity::Warning), Level::WARN);
        assert_eq!(severity_level(Severity::Critical), Level::ERROR);
    }

    #[test]
    fn test_system_errors_log_at_error() {
        let error = ManagedError::new(ErrorKind::System, "heap exhausted")
            .with_severity(Severity::Info);
        assert_eq!(severity_level(error.severity()), Level::ERROR);
    }
}
