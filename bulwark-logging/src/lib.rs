//! Logging infrastructure for Bulwark
//!
//! The library crates emit through the `log` facade and report breaker
//! activity as [`BreakerEvent`](bulwark_resilience::BreakerEvent)s. This crate
//! installs a `tracing` subscriber that captures both, and provides sinks that
//! turn breaker events and error records into structured tracing events.

pub mod init;
pub mod record;
pub mod sink;

pub use init::{init_logging_from_config, init_simple_tracing};
pub use record::{log_error_record, severity_level};
pub use sink::TracingEventSink;
