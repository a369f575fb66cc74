//! Classification of raw failures into the error taxonomy
//!
//! All classification goes through one dispatch table, [`RULES`], evaluated in
//! order against signals extracted from each error of a `source()` chain. The
//! first error in the chain that matches any rule decides the kind.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

use crate::error::{BoxError, ErrorKind, ManagedError};

/// Diagnostic context attached while wrapping a failure
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    component: Option<String>,
    fields: HashMap<String, JsonValue>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.fields.insert(key.into(), json_value);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.component.is_none() && self.fields.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Option<String>, HashMap<String, JsonValue>) {
        (self.component, self.fields)
    }
}

/// Raw failure carrying a machine code, for collaborators that report one
/// (an HTTP status, a driver error code, an errno name).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct CodedError {
    code: String,
    message: String,
}

impl CodedError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Structural signals read off a single error
struct Signals {
    io_kind: Option<io::ErrorKind>,
    parse_failure: bool,
    code: Option<String>,
    message: String,
}

impl Signals {
    fn extract(error: &(dyn StdError + 'static)) -> Self {
        let parse_failure = error.is::<serde_json::Error>()
            || error.is::<std::num::ParseIntError>()
            || error.is::<std::num::ParseFloatError>()
            || error.is::<std::str::Utf8Error>()
            || error.is::<std::string::FromUtf8Error>();

        Self {
            io_kind: error.downcast_ref::<io::Error>().map(io::Error::kind),
            parse_failure,
            code: error
                .downcast_ref::<CodedError>()
                .map(|coded| coded.code.to_ascii_uppercase()),
            message: error.to_string().to_lowercase(),
        }
    }

    fn io_is(&self, kinds: &[io::ErrorKind]) -> bool {
        self.io_kind.map_or(false, |kind| kinds.contains(&kind))
    }

    fn code_is(&self, codes: &[&str]) -> bool {
        self.code
            .as_deref()
            .map_or(false, |code| codes.contains(&code))
    }

    fn message_has(&self, needles: &[&str]) -> bool {
        needles.iter().any(|needle| self.message.contains(needle))
    }
}

struct Rule {
    kind: ErrorKind,
    matches: fn(&Signals) -> bool,
}

const RULES: &[Rule] = &[
    Rule { kind: ErrorKind::System, matches: is_system },
    Rule { kind: ErrorKind::Timeout, matches: is_timeout },
    Rule { kind: ErrorKind::Network, matches: is_network },
    Rule { kind: ErrorKind::NotFound, matches: is_not_found },
    Rule { kind: ErrorKind::Configuration, matches: is_configuration },
    Rule { kind: ErrorKind::Validation, matches: is_validation },
];

fn is_system(s: &Signals) -> bool {
    s.io_is(&[io::ErrorKind::OutOfMemory])
        || s.code_is(&["ENOMEM", "ENOSPC", "EMFILE"])
        || s.message_has(&["out of memory", "panicked", "stack overflow", "no space left"])
}

fn is_timeout(s: &Signals) -> bool {
    s.io_is(&[io::ErrorKind::TimedOut])
        || s.code_is(&["ETIMEDOUT", "ESOCKETTIMEDOUT", "408", "504"])
        || s.message_has(&["timed out", "timeout", "deadline has elapsed", "deadline exceeded"])
}

fn is_network(s: &Signals) -> bool {
    s.io_is(&[
        io::ErrorKind::ConnectionRefused,
        io::ErrorKind::ConnectionReset,
        io::ErrorKind::ConnectionAborted,
        io::ErrorKind::NotConnected,
        io::ErrorKind::AddrInUse,
        io::ErrorKind::AddrNotAvailable,
        io::ErrorKind::BrokenPipe,
        io::ErrorKind::UnexpectedEof,
    ]) || s.code_is(&[
        "ECONNREFUSED",
        "ECONNRESET",
        "ECONNABORTED",
        "ENOTFOUND",
        "EHOSTUNREACH",
        "ENETUNREACH",
        "EPIPE",
        "EAI_AGAIN",
        "502",
        "503",
    ]) || s.message_has(&[
        "econnrefused",
        "econnreset",
        "enotfound",
        "connection refused",
        "connection reset",
        "connection closed",
        "broken pipe",
        "network",
        "unreachable",
        "dns",
    ])
}

fn is_not_found(s: &Signals) -> bool {
    s.io_is(&[io::ErrorKind::NotFound])
        || s.code_is(&["ENOENT", "404"])
        || s.message_has(&["not found", "no such", "does not exist"])
}

fn is_configuration(s: &Signals) -> bool {
    s.code_is(&["ECONFIG"])
        || s.message_has(&["configuration", "config ", "environment variable"])
}

fn is_validation(s: &Signals) -> bool {
    s.parse_failure
        || s.io_is(&[io::ErrorKind::InvalidInput, io::ErrorKind::InvalidData])
        || s.code_is(&["400", "422", "EINVAL"])
        || s.message_has(&["invalid", "validation", "malformed", "failed to parse"])
}

fn classify_single(error: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    if let Some(managed) = error.downcast_ref::<ManagedError>() {
        return Some(managed.kind());
    }

    let signals = Signals::extract(error);
    RULES
        .iter()
        .find(|rule| (rule.matches)(&signals))
        .map(|rule| rule.kind)
}

/// Map a raw error onto the closed taxonomy. Defaults to [`ErrorKind::Unknown`].
pub fn classify(error: &(dyn StdError + 'static)) -> ErrorKind {
    std::iter::successors(Some(error), |&current| current.source())
        .find_map(classify_single)
        .unwrap_or(ErrorKind::Unknown)
}

/// Turn any failure into a [`ManagedError`].
///
/// Wrapping is idempotent: an error that already is a `ManagedError` only has
/// `context` merged into it and keeps its kind and severity. Anything else is
/// classified and becomes the cause of a new record.
pub fn wrap(error: impl Into<BoxError>, context: ErrorContext) -> ManagedError {
    match error.into().downcast::<ManagedError>() {
        Ok(managed) => {
            let mut managed = *managed;
            managed.merge_context(context);
            managed
        }
        Err(raw) => {
            let kind = classify(&*raw);
            let code = raw
                .downcast_ref::<CodedError>()
                .map(|coded| coded.code().to_string());
            let mut managed = ManagedError::new(kind, raw.to_string()).with_shared_cause(raw.into());
            if let Some(code) = code {
                managed = managed.with_code(code);
            }
            managed.merge_context(context);
            managed
        }
    }
}

/// Extension trait for converting fallible results into managed errors
pub trait ResultExt<T> {
    /// Wrap the error with an empty context
    fn managed(self) -> Result<T, ManagedError>;

    /// Wrap the error with lazily built context
    fn managed_with<F>(self, f: F) -> Result<T, ManagedError>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn managed(self) -> Result<T, ManagedError> {
        self.map_err(|e| wrap(e, ErrorContext::new()))
    }

    fn managed_with<F>(self, f: F) -> Result<T, ManagedError>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| wrap(e, f()))
    }
}
