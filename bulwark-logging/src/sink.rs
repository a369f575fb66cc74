//! Breaker listener that emits structured tracing events

use bulwark_resilience::{BreakerEvent, BreakerEventKind, BreakerListener};

/// Forwards breaker events to `tracing` with their counters as fields.
///
/// Transitions to open are warnings, other transitions info, rejections
/// debug, and per-call outcomes trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl TracingEventSink {
    pub fn new() -> Self {
        Self
    }
}

macro_rules! breaker_event {
    ($level:expr, $event:expr, $message:literal) => {
        tracing::event!(
            $level,
            breaker = %$event.name,
            event = %$event.kind,
            failure_count = $event.counters.failure_count,
            success_count = $event.counters.success_count,
            consecutive_failures = $event.counters.consecutive_failures,
            total_requests = $event.counters.total_requests,
            total_failures = $event.counters.total_failures,
            total_rejected = $event.counters.total_rejected,
            timestamp = %$event.timestamp.to_rfc3339(),
            $message
        )
    };
}

impl BreakerListener for TracingEventSink {
    fn on_event(&self, event: &BreakerEvent) {
        use tracing::Level;

        match event.kind {
            BreakerEventKind::Open => breaker_event!(Level::WARN, event, "circuit opened"),
            BreakerEventKind::Close => breaker_event!(Level::INFO, event, "circuit closed"),
            BreakerEventKind::HalfOpen => {
                breaker_event!(Level::INFO, event, "circuit half-open")
            }
            BreakerEventKind::Rejected => {
                breaker_event!(Level::DEBUG, event, "call rejected by open circuit")
            }
            BreakerEventKind::Success => breaker_event!(Level::TRACE, event, "call succeeded"),
            BreakerEventKind::Failure => breaker_event!(Level::TRACE, event, "call failed"),
        }
    }
}
