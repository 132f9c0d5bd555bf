//! [`SafetyCoordinator`] – the authoritative laser-permission state machine.
//!
//! All reads and writes of the [`SafetyState`] serialise through one mutex,
//! so no caller ever observes a torn state.  Observer notifications for a
//! transition are emitted while that lock is held, which keeps their order
//! identical to the transition order.
//!
//! ```text
//!            arm()              start_treatment()
//!   SAFE ───────────► ARMED ─────────────────────► TREATING
//!    ▲  ◄───────────   │  ◄─────────────────────      │
//!    │    disarm()     │      stop_treatment()        │
//!    │                 └────── interlock lost ────────┤
//!    │ interlocks ok                                  ▼
//!    └──────────────────────────────────────────── UNSAFE
//!
//!   any ── emergency_stop() ──► EMERGENCY_STOP ── reset_from_emergency() ──► SAFE
//! ```
//!
//! Entering UNSAFE or EMERGENCY_STOP issues a *selective shutdown*: every
//! energy-emitting controller receives `abort()`.  Motion and imaging devices
//! are left alone.  The aborts run after the state lock is released so a slow
//! driver cannot stall other transitions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use lumos_hal::{HardwareController, HardwareRegistry};
use lumos_types::{
    ExecutionObserver, InterlockSet, LumosError, NullObserver, SafetyState, Severity,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

struct Inner {
    state: SafetyState,
    interlocks: InterlockSet,
    trip_reason: Option<String>,
}

/// Outcome of a locked transition step: whether a selective shutdown is
/// owed.  Hand it to [`SafetyCoordinator::finish`] once no lock is held.
#[must_use = "a pending selective shutdown must be passed to `finish`"]
#[derive(Debug)]
pub struct PendingShutdown(bool);

/// The single gate on energy-emitting operations.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lumos_kernel::SafetyCoordinator;
/// use lumos_types::{InterlockSet, NullObserver, SafetyState};
///
/// let safety = SafetyCoordinator::new(Arc::new(NullObserver), Vec::new());
/// assert!(!safety.query_laser_permitted());
///
/// safety.apply_interlocks(InterlockSet::all_satisfied());
/// safety.arm().unwrap();
/// assert_eq!(safety.state(), SafetyState::Armed);
/// assert!(safety.query_laser_permitted());
/// ```
pub struct SafetyCoordinator {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SafetyState>,
    observer: Arc<dyn ExecutionObserver>,
    energy_emitters: Vec<Arc<dyn HardwareController>>,
}

impl SafetyCoordinator {
    /// Create a coordinator in [`SafetyState::Safe`] with fail-safe interlocks.
    ///
    /// `energy_emitters` are the controllers a selective shutdown aborts.
    pub fn new(
        observer: Arc<dyn ExecutionObserver>,
        energy_emitters: Vec<Arc<dyn HardwareController>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SafetyState::Safe);
        Self {
            inner: Mutex::new(Inner {
                state: SafetyState::Safe,
                interlocks: InterlockSet::default(),
                trip_reason: None,
            }),
            state_tx,
            observer,
            energy_emitters,
        }
    }

    /// Create a coordinator that shuts down the registry's energy emitters.
    pub fn from_registry(registry: &HardwareRegistry, observer: Arc<dyn ExecutionObserver>) -> Self {
        Self::new(observer, registry.energy_emitters())
    }

    /// Coordinator with no observer and no emitters, for tests and tools.
    pub fn detached() -> Self {
        Self::new(Arc::new(NullObserver), Vec::new())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation is a plain field assignment, so a poisoned guard
        // still holds a consistent state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// `true` iff the state is ARMED or TREATING and every interlock fact is
    /// satisfied with no emergency stop asserted.
    pub fn query_laser_permitted(&self) -> bool {
        let inner = self.lock();
        inner.state.laser_capable() && inner.interlocks.permits()
    }

    pub fn state(&self) -> SafetyState {
        self.lock().state
    }

    /// Last interlock set pushed by the interlock coordinator.
    pub fn interlocks(&self) -> InterlockSet {
        self.lock().interlocks
    }

    /// Reason of the most recent trip to UNSAFE, cleared on recovery.
    pub fn trip_reason(&self) -> Option<String> {
        self.lock().trip_reason.clone()
    }

    /// Change notifications of the safety state.
    pub fn subscribe(&self) -> watch::Receiver<SafetyState> {
        self.state_tx.subscribe()
    }

    // ── Operator transitions ─────────────────────────────────────────────

    /// SAFE → ARMED.  A no-op while already ARMED.
    ///
    /// # Errors
    ///
    /// - [`LumosError::InterlocksUnsatisfied`] when any fact denies permission.
    /// - [`LumosError::InvalidTransition`] from any other state.
    pub fn arm(&self) -> Result<(), LumosError> {
        let mut inner = self.lock();
        match inner.state {
            SafetyState::Armed => Ok(()),
            SafetyState::Safe => {
                if !inner.interlocks.permits() {
                    let unsatisfied = inner.interlocks.unsatisfied();
                    warn!(?unsatisfied, "arm rejected: interlocks unsatisfied");
                    return Err(LumosError::InterlocksUnsatisfied(unsatisfied));
                }
                self.transition(&mut inner, SafetyState::Armed, Severity::Info, "system armed");
                Ok(())
            }
            from => Err(rejected(from, "arm")),
        }
    }

    /// ARMED → TREATING.
    ///
    /// # Errors
    ///
    /// - [`LumosError::InterlocksUnsatisfied`] when any fact denies permission.
    /// - [`LumosError::InvalidTransition`] from any state but ARMED.
    pub fn start_treatment(&self) -> Result<(), LumosError> {
        let mut inner = self.lock();
        match inner.state {
            SafetyState::Armed => {
                if !inner.interlocks.permits() {
                    return Err(LumosError::InterlocksUnsatisfied(inner.interlocks.unsatisfied()));
                }
                self.transition(
                    &mut inner,
                    SafetyState::Treating,
                    Severity::Info,
                    "treatment started",
                );
                Ok(())
            }
            from => Err(rejected(from, "start treatment")),
        }
    }

    /// TREATING → ARMED.
    ///
    /// # Errors
    ///
    /// [`LumosError::InvalidTransition`] from any state but TREATING.
    pub fn stop_treatment(&self) -> Result<(), LumosError> {
        let mut inner = self.lock();
        match inner.state {
            SafetyState::Treating => {
                self.transition(&mut inner, SafetyState::Armed, Severity::Info, "treatment stopped");
                Ok(())
            }
            from => Err(rejected(from, "stop treatment")),
        }
    }

    /// ARMED/TREATING → SAFE.  Leaving TREATING also shuts down energy output.
    ///
    /// From UNSAFE this is the operator acknowledgement and succeeds once the
    /// interlocks are satisfied again.  A no-op while SAFE.
    ///
    /// # Errors
    ///
    /// - [`LumosError::InterlocksUnsatisfied`] when acknowledging UNSAFE while
    ///   a fact still denies permission.
    /// - [`LumosError::InvalidTransition`] from EMERGENCY_STOP.
    pub fn disarm(&self) -> Result<(), LumosError> {
        let shutdown = {
            let mut inner = self.lock();
            match inner.state {
                SafetyState::Safe => PendingShutdown(false),
                SafetyState::Armed => {
                    self.transition(&mut inner, SafetyState::Safe, Severity::Info, "system disarmed");
                    PendingShutdown(false)
                }
                SafetyState::Treating => {
                    self.transition(
                        &mut inner,
                        SafetyState::Safe,
                        Severity::Info,
                        "system disarmed during treatment",
                    );
                    PendingShutdown(true)
                }
                SafetyState::Unsafe => {
                    if !inner.interlocks.permits() {
                        return Err(LumosError::InterlocksUnsatisfied(
                            inner.interlocks.unsatisfied(),
                        ));
                    }
                    inner.trip_reason = None;
                    self.transition(
                        &mut inner,
                        SafetyState::Safe,
                        Severity::Info,
                        "unsafe condition acknowledged",
                    );
                    PendingShutdown(false)
                }
                from @ SafetyState::EmergencyStop => return Err(rejected(from, "disarm")),
            }
        };
        self.finish(shutdown);
        Ok(())
    }

    /// Any state → UNSAFE, with a selective shutdown.
    ///
    /// Absorbed while in EMERGENCY_STOP.  A repeated trip while UNSAFE only
    /// records the new reason.
    pub fn trip_unsafe(&self, reason: &str) {
        let shutdown = {
            let mut inner = self.lock();
            match inner.state {
                SafetyState::EmergencyStop => {
                    warn!(reason, "trip absorbed by emergency stop");
                    PendingShutdown(false)
                }
                SafetyState::Unsafe => {
                    inner.trip_reason = Some(reason.to_string());
                    PendingShutdown(false)
                }
                _ => {
                    error!(reason, from = %inner.state, "tripping to UNSAFE");
                    inner.trip_reason = Some(reason.to_string());
                    self.transition(
                        &mut inner,
                        SafetyState::Unsafe,
                        Severity::Warning,
                        &format!("tripped unsafe: {reason}"),
                    );
                    PendingShutdown(true)
                }
            }
        };
        self.finish(shutdown);
    }

    /// Any state → EMERGENCY_STOP.  Never fails; re-issues the shutdown when
    /// already stopped.
    pub fn emergency_stop(&self) {
        {
            let mut inner = self.lock();
            if inner.state != SafetyState::EmergencyStop {
                error!(from = %inner.state, "EMERGENCY STOP");
                self.transition(
                    &mut inner,
                    SafetyState::EmergencyStop,
                    Severity::Critical,
                    "emergency stop asserted",
                );
            }
        }
        self.finish(PendingShutdown(true));
    }

    /// EMERGENCY_STOP → SAFE.  Requires every interlock fact to be satisfied,
    /// including a released emergency-stop button.
    ///
    /// # Errors
    ///
    /// - [`LumosError::InterlocksUnsatisfied`] while a fact denies permission.
    /// - [`LumosError::InvalidTransition`] from any other state.
    pub fn reset_from_emergency(&self) -> Result<(), LumosError> {
        let mut inner = self.lock();
        match inner.state {
            SafetyState::EmergencyStop => {
                if !inner.interlocks.permits() {
                    let unsatisfied = inner.interlocks.unsatisfied();
                    warn!(?unsatisfied, "emergency reset rejected");
                    return Err(LumosError::InterlocksUnsatisfied(unsatisfied));
                }
                inner.trip_reason = None;
                self.transition(
                    &mut inner,
                    SafetyState::Safe,
                    Severity::Info,
                    "emergency stop reset by operator",
                );
                Ok(())
            }
            from => Err(rejected(from, "reset from emergency")),
        }
    }

    // ── Interlock input ──────────────────────────────────────────────────

    /// Accept a recomputed interlock aggregate.
    ///
    /// An asserted emergency stop forces EMERGENCY_STOP; losing permission
    /// while ARMED or TREATING trips UNSAFE; regaining it while UNSAFE
    /// recovers to SAFE.  Identical sets are ignored.
    pub fn apply_interlocks(&self, interlocks: InterlockSet) {
        let pending = self.push_interlocks(interlocks);
        self.finish(pending);
    }

    /// The state half of [`apply_interlocks`][Self::apply_interlocks]: the
    /// transition happens now, the selective shutdown is returned for the
    /// caller to run after releasing its own locks.
    pub fn push_interlocks(&self, interlocks: InterlockSet) -> PendingShutdown {
        let mut inner = self.lock();
        if inner.interlocks == interlocks {
            return PendingShutdown(false);
        }
        inner.interlocks = interlocks;
        self.observer.on_interlock_changed(&interlocks);

        let state = inner.state;
        if interlocks.emergency_stop_asserted && state != SafetyState::EmergencyStop {
            error!(from = %state, "emergency stop button asserted");
            self.transition(
                &mut inner,
                SafetyState::EmergencyStop,
                Severity::Critical,
                "emergency stop button asserted",
            );
            PendingShutdown(true)
        } else if state.laser_capable() && !interlocks.permits() {
            let unsatisfied = interlocks.unsatisfied();
            let reason = format!("interlocks lost: {unsatisfied:?}");
            error!(from = %state, ?unsatisfied, "interlock lost, tripping to UNSAFE");
            inner.trip_reason = Some(reason.clone());
            self.transition(&mut inner, SafetyState::Unsafe, Severity::Warning, &reason);
            PendingShutdown(true)
        } else if state == SafetyState::Unsafe && interlocks.permits() {
            inner.trip_reason = None;
            self.transition(
                &mut inner,
                SafetyState::Safe,
                Severity::Info,
                "interlocks restored",
            );
            PendingShutdown(false)
        } else {
            PendingShutdown(false)
        }
    }

    /// Run the selective shutdown `shutdown` asks for, if any.
    pub fn finish(&self, shutdown: PendingShutdown) {
        if shutdown.0 {
            self.selective_shutdown();
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn transition(&self, inner: &mut Inner, to: SafetyState, severity: Severity, message: &str) {
        let from = inner.state;
        inner.state = to;
        self.state_tx.send_replace(to);
        info!(%from, %to, "safety state changed");
        self.observer.on_state_changed(to);
        self.observer.on_safety_event(severity, message, Utc::now());
    }

    /// Abort every energy emitter.  Best effort: failures are logged.
    fn selective_shutdown(&self) {
        for device in &self.energy_emitters {
            match device.abort() {
                Ok(()) => info!(device = device.id(), "energy output disabled"),
                Err(e) => error!(device = device.id(), error = %e, "selective shutdown failed"),
            }
        }
    }
}

fn rejected(from: SafetyState, action: &str) -> LumosError {
    warn!(%from, action, "transition rejected");
    LumosError::InvalidTransition {
        from,
        action: action.to_string(),
    }
}
