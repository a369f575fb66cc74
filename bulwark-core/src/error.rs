//! Managed error record and the closed error taxonomy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::classify::ErrorContext;
use crate::severity::Severity;

/// Boxed raw error accepted by every wrapping entry point
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type alias for Bulwark
pub type Result<T> = std::result::Result<T, ManagedError>;

type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Closed error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Input or data failed validation
    Validation,
    /// Missing or inconsistent configuration
    Configuration,
    /// An operation did not finish within its time budget
    Timeout,
    /// A circuit breaker refused to run the operation
    CircuitOpen,
    /// Connectivity or transport failure
    Network,
    /// Fatal failure of the process or its environment
    System,
    /// A referenced resource does not exist
    NotFound,
    /// Anything the classification table could not place
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Validation,
        ErrorKind::Configuration,
        ErrorKind::Timeout,
        ErrorKind::CircuitOpen,
        ErrorKind::Network,
        ErrorKind::System,
        ErrorKind::NotFound,
        ErrorKind::Unknown,
    ];

    /// Severity assigned when the caller does not override it
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::Validation => Severity::Warning,
            ErrorKind::Configuration => Severity::Error,
            ErrorKind::Timeout => Severity::Warning,
            ErrorKind::CircuitOpen => Severity::Warning,
            ErrorKind::Network => Severity::Error,
            ErrorKind::System => Severity::Critical,
            ErrorKind::NotFound => Severity::Warning,
            ErrorKind::Unknown => Severity::Error,
        }
    }

    /// Whether errors of this kind are retryable unless overridden
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Unknown
        )
    }

    /// Machine-readable code used in error records
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Configuration => "CONFIG_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::System => "SYSTEM_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Network => "network",
            ErrorKind::System => "system",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure.
///
/// Every layer of the resilience stack reports failures as a `ManagedError`.
/// The record is immutable once built except for [`merge_context`], which
/// adds or overwrites keys but never removes one. The optional cause is an owned link to the error that
/// produced this one, so the full chain stays available through
/// [`std::error::Error::source`]. [`chain`] walks the same links with each
/// cause exposed as its concrete type, ready for downcasting.
///
/// [`merge_context`]: ManagedError::merge_context
/// [`chain`]: ManagedError::chain
#[derive(Debug, Clone, Error)]
#[error("[{}] {message}", display_code(.code, .kind))]
pub struct ManagedError {
    kind: ErrorKind,
    message: String,
    code: Option<String>,
    severity: Severity,
    component: Option<String>,
    context: HashMap<String, JsonValue>,
    timestamp: DateTime<Utc>,
    retryable: bool,
    synthesized: bool,
    #[source]
    cause: Option<Cause>,
}

impl ManagedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            severity: kind.default_severity(),
            component: None,
            context: HashMap::new(),
            timestamp: Utc::now(),
            retryable: kind.is_retryable(),
            synthesized: false,
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Timeout raised by a timeout guard rather than by the operation itself.
    ///
    /// The guard is cooperative, which is recorded in the `cooperative`
    /// context key: the operation may still be running when this is returned.
    pub fn timeout(operation_name: impl Into<String>, limit: Duration) -> Self {
        let operation_name = operation_name.into();
        let timeout_ms = saturating_millis(limit);
        let mut error = Self::new(
            ErrorKind::Timeout,
            format!("{} timed out after {}ms", operation_name, timeout_ms),
        )
        .with_context("timeout_ms", timeout_ms)
        .with_context("operation_name", &operation_name)
        .with_context("cooperative", true);
        error.synthesized = true;
        error
    }

    /// Rejection raised by an open circuit breaker; the operation never ran.
    pub fn circuit_open(
        circuit: impl Into<String>,
        state: &str,
        failure_count: u32,
        time_until_reset: Duration,
    ) -> Self {
        let circuit = circuit.into();
        let remaining_ms = saturating_millis(time_until_reset);
        let mut error = Self::new(
            ErrorKind::CircuitOpen,
            format!(
                "circuit breaker '{}' is {}; next probe allowed in {}ms",
                circuit, state, remaining_ms
            ),
        )
        .with_context("circuit", &circuit)
        .with_context("state", state)
        .with_context("failure_count", failure_count)
        .with_context("time_until_reset_ms", remaining_ms);
        error.synthesized = true;
        error
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Override the severity. SYSTEM errors always stay CRITICAL.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        if self.kind != ErrorKind::System {
            self.severity = severity;
        }
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Set a context value, replacing any previous value under `key`
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.context.insert(key.into(), json_value);
        }
        self
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(Arc::from(cause.into()));
        self
    }

    pub(crate) fn with_shared_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Fold additional context into this error.
    ///
    /// Incoming keys are added or overwrite the current value. The component
    /// is only filled in when missing.
    pub fn merge_context(&mut self, context: ErrorContext) {
        let (component, fields) = context.into_parts();
        self.context.extend(fields);
        if self.component.is_none() {
            self.component = component;
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Explicit code if one was set, otherwise the code of the kind
    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or_else(|| self.kind.error_code())
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    pub fn context(&self) -> &HashMap<String, JsonValue> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&JsonValue> {
        self.context.get(key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Whether the resilience layer produced this error itself
    pub fn is_synthesized(&self) -> bool {
        self.synthesized
    }

    /// True when the operation was never invoked (open circuit)
    pub fn did_not_execute(&self) -> bool {
        self.synthesized && self.kind == ErrorKind::CircuitOpen
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.context_value("timeout_ms").and_then(JsonValue::as_u64)
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.context_value("operation_name").and_then(JsonValue::as_str)
    }

    pub fn failure_count(&self) -> Option<u32> {
        self.context_value("failure_count")
            .and_then(JsonValue::as_u64)
            .map(|count| count as u32)
    }

    pub fn time_until_reset(&self) -> Option<Duration> {
        self.context_value("time_until_reset_ms")
            .and_then(JsonValue::as_u64)
            .map(Duration::from_millis)
    }

    /// Direct cause of this error
    pub fn cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }

    /// Iterate over the cause chain, nearest cause first
    pub fn chain(&self) -> impl Iterator<Item = &(dyn StdError + 'static)> {
        std::iter::successors(self.cause(), |&error| error.source())
    }

    /// Deepest error in the cause chain
    pub fn root_cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.chain().last()
    }

    /// Structured record for external logging
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind,
            message: self.message.clone(),
            code: self.code().to_string(),
            severity: self.severity,
            component: self.component.clone(),
            context: self.context.clone(),
            timestamp: self.timestamp,
            retryable: self.retryable,
            cause: self.cause().map(|cause| Box::new(CauseRecord::from_error(cause))),
        }
    }
}

fn display_code<'a>(code: &'a Option<String>, kind: &ErrorKind) -> &'a str {
    code.as_deref().unwrap_or_else(|| kind.error_code())
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serializable view of a [`ManagedError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub code: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, JsonValue>,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<CauseRecord>>,
}

/// Cause entry of an [`ErrorRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CauseRecord {
    Managed(Box<ErrorRecord>),
    Raw {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<Box<CauseRecord>>,
    },
}

impl CauseRecord {
    fn from_error(error: &(dyn StdError + 'static)) -> Self {
        match error.downcast_ref::<ManagedError>() {
            Some(managed) => CauseRecord::Managed(Box::new(managed.to_record())),
            None => CauseRecord::Raw {
                message: error.to_string(),
                cause: error
                    .source()
                    .map(|source| Box::new(CauseRecord::from_error(source))),
            },
        }
    }
}
