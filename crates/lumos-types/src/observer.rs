//! [`ExecutionObserver`] – the outward notification contract.
//!
//! The kernel and the protocol engine report every state change, interlock
//! change, progress tick, terminal outcome and safety event through this
//! trait.  Implementations must be cheap and non-blocking: the safety
//! coordinator notifies while holding its state lock so that notifications
//! arrive in transition order.  Observers must never call back into the
//! component that is notifying them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{InterlockSet, ProtocolOutcome, SafetyState, Severity};

/// Sink for safety and execution notifications.
pub trait ExecutionObserver: Send + Sync {
    fn on_state_changed(&self, state: SafetyState);

    fn on_interlock_changed(&self, interlocks: &InterlockSet);

    /// Called after every completed line.  Indices are zero-based; `elapsed`
    /// is measured from the start of the run.
    fn on_protocol_progress(&self, line_index: usize, loop_index: u32, elapsed: Duration);

    /// Called exactly once per run.
    fn on_protocol_terminal(&self, outcome: &ProtocolOutcome);

    fn on_safety_event(&self, severity: Severity, message: &str, timestamp: DateTime<Utc>);
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ExecutionObserver for NullObserver {
    fn on_state_changed(&self, _state: SafetyState) {}
    fn on_interlock_changed(&self, _interlocks: &InterlockSet) {}
    fn on_protocol_progress(&self, _line_index: usize, _loop_index: u32, _elapsed: Duration) {}
    fn on_protocol_terminal(&self, _outcome: &ProtocolOutcome) {}
    fn on_safety_event(&self, _severity: Severity, _message: &str, _timestamp: DateTime<Utc>) {}
}

/// Fan-out to several observers, in registration order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ExecutionObserver for ObserverSet {
    fn on_state_changed(&self, state: SafetyState) {
        for o in &self.observers {
            o.on_state_changed(state);
        }
    }

    fn on_interlock_changed(&self, interlocks: &InterlockSet) {
        for o in &self.observers {
            o.on_interlock_changed(interlocks);
        }
    }

    fn on_protocol_progress(&self, line_index: usize, loop_index: u32, elapsed: Duration) {
        for o in &self.observers {
            o.on_protocol_progress(line_index, loop_index, elapsed);
        }
    }

    fn on_protocol_terminal(&self, outcome: &ProtocolOutcome) {
        for o in &self.observers {
            o.on_protocol_terminal(outcome);
        }
    }

    fn on_safety_event(&self, severity: Severity, message: &str, timestamp: DateTime<Utc>) {
        for o in &self.observers {
            o.on_safety_event(severity, message, timestamp);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Recording observer
// ────────────────────────────────────────────────────────────────────────────

/// One notification captured by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    State(SafetyState),
    Interlocks(InterlockSet),
    Progress { line_index: usize, loop_index: u32 },
    Terminal(ProtocolOutcome),
    Safety { severity: Severity, message: String },
}

/// Observer that keeps every notification in memory.  Used by tests and by
/// headless tooling that wants to inspect a run afterwards.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of everything recorded so far, in arrival order.
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn states(&self) -> Vec<SafetyState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn terminals(&self) -> Vec<ProtocolOutcome> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Terminal(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<(usize, u32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Progress {
                    line_index,
                    loop_index,
                } => Some((line_index, loop_index)),
                _ => None,
            })
            .collect()
    }

    pub fn safety_events(&self) -> Vec<(Severity, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Safety { severity, message } => Some((severity, message)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut e) = self.events.lock() {
            e.clear();
        }
    }

    fn push(&self, event: ObservedEvent) {
        if let Ok(mut e) = self.events.lock() {
            e.push(event);
        }
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_state_changed(&self, state: SafetyState) {
        self.push(ObservedEvent::State(state));
    }

    fn on_interlock_changed(&self, interlocks: &InterlockSet) {
        self.push(ObservedEvent::Interlocks(*interlocks));
    }

    fn on_protocol_progress(&self, line_index: usize, loop_index: u32, _elapsed: Duration) {
        self.push(ObservedEvent::Progress {
            line_index,
            loop_index,
        });
    }

    fn on_protocol_terminal(&self, outcome: &ProtocolOutcome) {
        self.push(ObservedEvent::Terminal(outcome.clone()));
    }

    fn on_safety_event(&self, severity: Severity, message: &str, _timestamp: DateTime<Utc>) {
        self.push(ObservedEvent::Safety {
            severity,
            message: message.to_string(),
        });
    }
}
