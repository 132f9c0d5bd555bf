//! `lumos-types` – shared vocabulary for the Lumos treatment safety core.
//!
//! Every other crate in the workspace depends on this one.  It owns the data
//! model (safety states, interlock facts, device status), the error taxonomy,
//! the bus event envelope, the declarative [`protocol`] model and the
//! [`observer`] notification contract.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod observer;
pub mod protocol;

pub use observer::{ExecutionObserver, NullObserver, ObservedEvent, ObserverSet, RecordingObserver};
pub use protocol::{DwellAction, LaserAction, LineBasedProtocol, MovementAction, ProtocolLine};

// ────────────────────────────────────────────────────────────────────────────
// Safety state
// ────────────────────────────────────────────────────────────────────────────

/// Authoritative safety state of the treatment system.
///
/// Owned and mutated exclusively by the kernel's `SafetyCoordinator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyState {
    /// Energy output disabled; the power-on default.
    #[default]
    Safe,
    /// Operator has armed the system; laser commands are permitted.
    Armed,
    /// A treatment run is in progress.
    Treating,
    /// An interlock or subsystem failure disabled energy output.
    Unsafe,
    /// Sticky operator/hardware emergency stop.  Exits only via reset.
    EmergencyStop,
}

impl SafetyState {
    /// `true` for the states in which the laser may emit, interlocks
    /// permitting.
    pub fn laser_capable(self) -> bool {
        matches!(self, SafetyState::Armed | SafetyState::Treating)
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyState::Safe => "SAFE",
            SafetyState::Armed => "ARMED",
            SafetyState::Treating => "TREATING",
            SafetyState::Unsafe => "UNSAFE",
            SafetyState::EmergencyStop => "EMERGENCY_STOP",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Interlocks
// ────────────────────────────────────────────────────────────────────────────

/// One independent safety fact reported by its owning subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockFact {
    /// Hardware interlock line (door switch, key switch) is closed.
    HardwareInterlock,
    /// A treatment session is open and valid.
    SessionValid,
    /// Commanded laser output is at or below the configured ceiling.
    PowerWithinLimit,
    /// Physical emergency-stop button is pressed.  Asserted means *deny*.
    EmergencyStopAsserted,
}

impl InterlockFact {
    /// All facts, in reporting order.
    pub const ALL: [InterlockFact; 4] = [
        InterlockFact::HardwareInterlock,
        InterlockFact::SessionValid,
        InterlockFact::PowerWithinLimit,
        InterlockFact::EmergencyStopAsserted,
    ];
}

impl fmt::Display for InterlockFact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterlockFact::HardwareInterlock => "hardware_interlock",
            InterlockFact::SessionValid => "session_valid",
            InterlockFact::PowerWithinLimit => "power_within_limit",
            InterlockFact::EmergencyStopAsserted => "emergency_stop_asserted",
        };
        f.write_str(s)
    }
}

/// Snapshot of every interlock fact.
///
/// The [`Default`] value is fail-safe: no hardware interlock, no session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterlockSet {
    pub hardware_interlock_satisfied: bool,
    pub session_valid: bool,
    pub power_within_limit: bool,
    pub emergency_stop_asserted: bool,
}

impl Default for InterlockSet {
    fn default() -> Self {
        Self {
            hardware_interlock_satisfied: false,
            session_valid: false,
            power_within_limit: true,
            emergency_stop_asserted: false,
        }
    }
}

impl InterlockSet {
    /// Every fact in its permitting position.
    pub fn all_satisfied() -> Self {
        Self {
            hardware_interlock_satisfied: true,
            session_valid: true,
            power_within_limit: true,
            emergency_stop_asserted: false,
        }
    }

    /// Aggregate permit: AND of the three required facts, with an asserted
    /// emergency stop short-circuiting to deny.
    pub fn permits(&self) -> bool {
        !self.emergency_stop_asserted
            && self.hardware_interlock_satisfied
            && self.session_valid
            && self.power_within_limit
    }

    /// Raw value of `fact`.
    pub fn get(&self, fact: InterlockFact) -> bool {
        match fact {
            InterlockFact::HardwareInterlock => self.hardware_interlock_satisfied,
            InterlockFact::SessionValid => self.session_valid,
            InterlockFact::PowerWithinLimit => self.power_within_limit,
            InterlockFact::EmergencyStopAsserted => self.emergency_stop_asserted,
        }
    }

    /// Set `fact` to `value`, returning `true` when the value changed.
    pub fn set(&mut self, fact: InterlockFact, value: bool) -> bool {
        let slot = match fact {
            InterlockFact::HardwareInterlock => &mut self.hardware_interlock_satisfied,
            InterlockFact::SessionValid => &mut self.session_valid,
            InterlockFact::PowerWithinLimit => &mut self.power_within_limit,
            InterlockFact::EmergencyStopAsserted => &mut self.emergency_stop_asserted,
        };
        let changed = *slot != value;
        *slot = value;
        changed
    }

    /// Facts currently denying permission (per-fact breakdown).
    pub fn unsatisfied(&self) -> Vec<InterlockFact> {
        InterlockFact::ALL
            .into_iter()
            .filter(|fact| match fact {
                InterlockFact::EmergencyStopAsserted => self.emergency_stop_asserted,
                other => !self.get(*other),
            })
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Hardware errors and status
// ────────────────────────────────────────────────────────────────────────────

/// Classification of a device-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareErrorKind {
    /// Transient I/O hiccup; worth retrying.
    Transient,
    /// Device did not answer in time.
    Timeout,
    /// Link to the device is down.
    Disconnected,
    /// The device family does not implement this command.
    Unsupported,
    /// Device reported a hard fault.
    Fault,
    /// Command was interrupted by `abort()`.
    Aborted,
}

impl HardwareErrorKind {
    /// Whether the engine should retry a command that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            HardwareErrorKind::Transient | HardwareErrorKind::Timeout | HardwareErrorKind::Disconnected
        )
    }
}

impl fmt::Display for HardwareErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HardwareErrorKind::Transient => "transient",
            HardwareErrorKind::Timeout => "timeout",
            HardwareErrorKind::Disconnected => "disconnected",
            HardwareErrorKind::Unsupported => "unsupported",
            HardwareErrorKind::Fault => "fault",
            HardwareErrorKind::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Failure surfaced by a hardware contract.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} hardware error: {message}")]
pub struct HardwareError {
    pub kind: HardwareErrorKind,
    pub message: String,
}

impl HardwareError {
    pub fn new(kind: HardwareErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(HardwareErrorKind::Transient, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(HardwareErrorKind::Unsupported, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(HardwareErrorKind::Aborted, message)
    }
}

/// Point-in-time status reported by a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub device: String,
    pub connected: bool,
    /// A long-running command (move, ramp) is in flight.
    pub busy: bool,
    pub position_mm: Option<f64>,
    pub laser_power_w: Option<f64>,
    /// State of the device's own interlock input, if it has one.
    pub interlock_ok: Option<bool>,
    pub fault: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Outcomes and severities
// ────────────────────────────────────────────────────────────────────────────

/// Severity attached to a safety event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Why a protocol run ended in the faulted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FaultReason {
    EmergencyStop,
    SafetyViolation(String),
    Timeout(String),
    RetriesExhausted { action: String, error: String },
    Hardware(String),
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::EmergencyStop => f.write_str("emergency stop"),
            FaultReason::SafetyViolation(msg) => write!(f, "safety violation: {msg}"),
            FaultReason::Timeout(msg) => write!(f, "timeout: {msg}"),
            FaultReason::RetriesExhausted { action, error } => {
                write!(f, "retries exhausted on {action}: {error}")
            }
            FaultReason::Hardware(msg) => write!(f, "hardware fault: {msg}"),
        }
    }
}

/// Terminal outcome of a protocol run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "fault", rename_all = "snake_case")]
pub enum ProtocolOutcome {
    Completed,
    Faulted(FaultReason),
    Cancelled,
}

impl ProtocolOutcome {
    /// Severity of the safety event that accompanies this outcome.
    pub fn severity(&self) -> Severity {
        match self {
            ProtocolOutcome::Completed => Severity::Info,
            ProtocolOutcome::Cancelled => Severity::Warning,
            ProtocolOutcome::Faulted(_) => Severity::Critical,
        }
    }
}

impl fmt::Display for ProtocolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolOutcome::Completed => f.write_str("completed"),
            ProtocolOutcome::Faulted(reason) => write!(f, "faulted ({reason})"),
            ProtocolOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the event bus and the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"lumos-kernel::safety"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current wall-clock time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Everything an [`ExecutionObserver`] can be told, in routable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    StateChanged {
        state: SafetyState,
    },
    InterlockChanged {
        interlocks: InterlockSet,
        unsatisfied: Vec<InterlockFact>,
    },
    ProtocolProgress {
        line_index: usize,
        loop_index: u32,
        elapsed_ms: u64,
    },
    ProtocolTerminal {
        outcome: ProtocolOutcome,
    },
    SafetyEvent {
        severity: Severity,
        message: String,
        occurred_at: DateTime<Utc>,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LumosError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Invalid transition: cannot {action} while {from}")]
    InvalidTransition { from: SafetyState, action: String },

    #[error("Interlocks unsatisfied: {0:?}")]
    InterlocksUnsatisfied(Vec<InterlockFact>),

    #[error("Timed out after {after:?}: {what}")]
    Timeout { what: String, after: Duration },

    #[error("Cancellation requested")]
    Cancelled,

    #[error("A protocol run is already active")]
    Busy,

    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Audit log error: {0}")]
    Audit(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_safe() {
        assert_eq!(SafetyState::default(), SafetyState::Safe);
        assert!(!SafetyState::Safe.laser_capable());
        assert!(SafetyState::Armed.laser_capable());
        assert!(SafetyState::Treating.laser_capable());
        assert!(!SafetyState::Unsafe.laser_capable());
        assert!(!SafetyState::EmergencyStop.laser_capable());
    }

    #[test]
    fn default_interlocks_deny() {
        let set = InterlockSet::default();
        assert!(!set.permits());
        assert_eq!(
            set.unsatisfied(),
            vec![InterlockFact::HardwareInterlock, InterlockFact::SessionValid]
        );
    }

    #[test]
    fn emergency_stop_short_circuits_permit() {
        let mut set = InterlockSet::all_satisfied();
        assert!(set.permits());
        assert!(set.set(InterlockFact::EmergencyStopAsserted, true));
        assert!(!set.permits());
        assert_eq!(set.unsatisfied(), vec![InterlockFact::EmergencyStopAsserted]);
    }

    #[test]
    fn set_reports_change_only_once() {
        let mut set = InterlockSet::all_satisfied();
        assert!(set.set(InterlockFact::SessionValid, false));
        assert!(!set.set(InterlockFact::SessionValid, false));
        assert!(!set.get(InterlockFact::SessionValid));
    }

    #[test]
    fn retryable_kinds() {
        assert!(HardwareErrorKind::Transient.is_retryable());
        assert!(HardwareErrorKind::Timeout.is_retryable());
        assert!(HardwareErrorKind::Disconnected.is_retryable());
        assert!(!HardwareErrorKind::Unsupported.is_retryable());
        assert!(!HardwareErrorKind::Fault.is_retryable());
        assert!(!HardwareErrorKind::Aborted.is_retryable());
    }

    #[test]
    fn outcome_severity() {
        assert_eq!(ProtocolOutcome::Completed.severity(), Severity::Info);
        assert_eq!(ProtocolOutcome::Cancelled.severity(), Severity::Warning);
        assert_eq!(
            ProtocolOutcome::Faulted(FaultReason::EmergencyStop).severity(),
            Severity::Critical
        );
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let event = Event::new(
            "lumos-kernel::safety",
            EventPayload::StateChanged {
                state: SafetyState::EmergencyStop,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"state_changed\""));
        assert!(json.contains("EMERGENCY_STOP"));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.payload, event.payload);
    }

    #[test]
    fn lumos_error_display() {
        let err = LumosError::InvalidTransition {
            from: SafetyState::Safe,
            action: "start_treatment".into(),
        };
        assert!(err.to_string().contains("start_treatment"));
        assert!(err.to_string().contains("SAFE"));

        let hw: LumosError = HardwareError::transient("serial timeout").into();
        assert!(hw.to_string().contains("serial timeout"));
    }
}
