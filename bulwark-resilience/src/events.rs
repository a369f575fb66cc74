//! Structured circuit breaker events and listeners

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Type of a breaker event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerEventKind {
    /// Circuit transitioned to open
    Open,
    /// Circuit transitioned to closed
    Close,
    /// Circuit transitioned to half-open
    HalfOpen,
    /// A call completed and counted as a success
    Success,
    /// A call completed and counted as a failure
    Failure,
    /// A call was short-circuited without running the operation
    Rejected,
}

impl std::fmt::Display for BreakerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerEventKind::Open => write!(f, "open"),
            BreakerEventKind::Close => write!(f, "close"),
            BreakerEventKind::HalfOpen => write!(f, "half-open"),
            BreakerEventKind::Success => write!(f, "success"),
            BreakerEventKind::Failure => write!(f, "failure"),
            BreakerEventKind::Rejected => write!(f, "rejected"),
        }
    }
}

/// Counter snapshot taken when an event is emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BreakerCounters {
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

/// Event emitted by a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerEvent {
    #[serde(rename = "type")]
    pub kind: BreakerEventKind,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub counters: BreakerCounters,
}

impl BreakerEvent {
    pub fn new(kind: BreakerEventKind, name: impl Into<String>, counters: BreakerCounters) -> Self {
        Self {
            kind,
            name: name.into(),
            timestamp: Utc::now(),
            counters,
        }
    }

    /// Whether this event reports a state transition
    pub fn is_transition(&self) -> bool {
        matches!(
            self.kind,
            BreakerEventKind::Open | BreakerEventKind::Close | BreakerEventKind::HalfOpen
        )
    }
}

/// Receiver of breaker events.
///
/// Listeners are invoked synchronously after the breaker has released its
/// state lock, so a listener may query the breaker that notified it. Events
/// reach every listener in the order the breaker produced them, even when
/// several threads drive the breaker at once.
pub trait BreakerListener: Send + Sync {
    fn on_event(&self, event: &BreakerEvent);
}

impl<F> BreakerListener for F
where
    F: Fn(&BreakerEvent) + Send + Sync,
{
    fn on_event(&self, event: &BreakerEvent) {
        self(event)
    }
}

/// Ordered fan-out of breaker events to listeners.
///
/// Events are queued while the breaker still holds its state lock, so the
/// queue order is the order of state changes. Delivery happens outside that
/// lock, one thread at a time: whichever caller finds the queue idle drains
/// it, and everyone else leaves their events to that drainer. Events a
/// listener causes by calling back into the breaker are delivered after the
/// listener returns.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn BreakerListener>>>,
    pending: Mutex<VecDeque<BreakerEvent>>,
    draining: AtomicBool,
}

/// Clears the drain flag even if a listener panics
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EventDispatcher {
    pub(crate) fn add_listener(&self, listener: Arc<dyn BreakerListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn set_listeners(&self, listeners: Vec<Arc<dyn BreakerListener>>) {
        *self.listeners.write() = listeners;
    }

    /// Queue events. Call while holding the lock that ordered them.
    pub(crate) fn enqueue(&self, events: Vec<BreakerEvent>) {
        if !events.is_empty() {
            self.pending.lock().extend(events);
        }
    }

    /// Deliver queued events unless another caller is already doing so
    pub(crate) fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            {
                let _guard = DrainGuard(&self.draining);
                loop {
                    let next = self.pending.lock().pop_front();
                    let Some(event) = next else { break };
                    let listeners = self.listeners.read().clone();
                    for listener in listeners.iter() {
                        listener.on_event(&event);
                    }
                }
            }
            // An event queued after the last pop but before the flag cleared
            // found the drainer busy and is still waiting.
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }
}

/// Listener that forwards events to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl BreakerListener for LogListener {
    fn on_event(&self, event: &BreakerEvent) {
        match event.kind {
            BreakerEventKind::Open => log::warn!(
                "Circuit breaker '{}' opened after {} failures",
                event.name,
                event.counters.failure_count
            ),
            BreakerEventKind::Close => {
                log::info!("Circuit breaker '{}' closed", event.name)
            }
            BreakerEventKind::HalfOpen => {
                log::info!("Circuit breaker '{}' half-open, probing", event.name)
            }
            BreakerEventKind::Rejected => log::debug!(
                "Circuit breaker '{}' rejected call ({} rejected so far)",
                event.name,
                event.counters.total_rejected
            ),
            BreakerEventKind::Success | BreakerEventKind::Failure => log::trace!(
                "Circuit breaker '{}' recorded {}",
                event.name,
                event.kind
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = BreakerEvent::new(
            BreakerEventKind::HalfOpen,
            "warehouse",
            BreakerCounters {
                failure_count: 2,
                ..Default::default()
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "half-open");
        assert_eq!(json["name"], "warehouse");
        assert_eq!(json["counters"]["failure_count"], 2);
        assert!(event.is_transition());
    }

    #[test]
    fn test_closure_listener() {
        let seen = std::sync::Mutex::new(Vec::new());
        let listener = |event: &BreakerEvent| seen.lock().unwrap().push(event.kind);

        listener.on_event(&BreakerEvent::new(
            BreakerEventKind::Failure,
            "db",
            BreakerCounters::default(),
        ));

        assert_eq!(*seen.lock().unwrap(), vec![BreakerEventKind::Failure]);
    }

    #[test]
    fn test_dispatcher_delivers_listener_raised_events_afterwards() {
        let dispatcher = Arc::new(EventDispatcher::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner = dispatcher.clone();
        let seen = log.clone();
        dispatcher.add_listener(Arc::new(move |event: &BreakerEvent| {
            seen.lock().push(format!("enter {}", event.kind));
            if event.kind == BreakerEventKind::Failure {
                inner.enqueue(vec![BreakerEvent::new(
                    BreakerEventKind::Open,
                    "db",
                    BreakerCounters::default(),
                )]);
                inner.drain();
            }
            seen.lock().push(format!("exit {}", event.kind));
        }));

        dispatcher.enqueue(vec![BreakerEvent::new(
            BreakerEventKind::Failure,
            "db",
            BreakerCounters::default(),
        )]);
        dispatcher.drain();

        assert_eq!(
            *log.lock(),
            vec!["enter failure", "exit failure", "enter open", "exit open"]
        );
    }
}
