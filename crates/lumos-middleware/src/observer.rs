//! [`BusObserver`] – publishes every [`ExecutionObserver`] callback onto the
//! [`EventBus`].
//!
//! The kernel and the engine only know the observer trait; wiring a
//! `BusObserver` at the composition root turns their notifications into
//! routable, serialisable [`Event`]s for the audit recorder and any UI.

use std::time::Duration;

use chrono::{DateTime, Utc};
use lumos_types::{
    Event, EventPayload, ExecutionObserver, InterlockSet, ProtocolOutcome, SafetyState, Severity,
};

use crate::bus::EventBus;

pub struct BusObserver {
    bus: EventBus,
    source: String,
}

impl BusObserver {
    /// Publish on `bus` with `source` stamped on every event.
    pub fn new(bus: EventBus, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
        }
    }

    fn publish(&self, payload: EventPayload) {
        self.bus.publish(Event::new(self.source.as_str(), payload));
    }
}

impl ExecutionObserver for BusObserver {
    fn on_state_changed(&self, state: SafetyState) {
        self.publish(EventPayload::StateChanged { state });
    }

    fn on_interlock_changed(&self, interlocks: &InterlockSet) {
        self.publish(EventPayload::InterlockChanged {
            interlocks: *interlocks,
            unsatisfied: interlocks.unsatisfied(),
        });
    }

    fn on_protocol_progress(&self, line_index: usize, loop_index: u32, elapsed: Duration) {
        self.publish(EventPayload::ProtocolProgress {
            line_index,
            loop_index,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        });
    }

    fn on_protocol_terminal(&self, outcome: &ProtocolOutcome) {
        self.publish(EventPayload::ProtocolTerminal {
            outcome: outcome.clone(),
        });
    }

    fn on_safety_event(&self, severity: Severity, message: &str, timestamp: DateTime<Utc>) {
        self.publish(EventPayload::SafetyEvent {
            severity,
            message: message.to_string(),
            occurred_at: timestamp,
        });
    }
}
