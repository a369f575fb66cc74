//! Core error model for Bulwark
//!
//! This crate contains the closed error taxonomy, the [`ManagedError`]
//! record every resilience layer reports, and the classification table that
//! turns arbitrary failures into managed errors. It performs no I/O.

pub mod classify;
pub mod error;
pub mod severity;

// Re-export commonly used types at the crate root
pub use classify::{classify, wrap, CodedError, ErrorContext, ResultExt};
pub use error::{BoxError, CauseRecord, ErrorKind, ErrorRecord, ManagedError, Result};
pub use severity::Severity;
