//! [`ProtocolExecutionEngine`] – runs a [`LineBasedProtocol`] on the hardware.
//!
//! Each run executes on its own tokio task.  For every loop and every line:
//!
//! 1. **Guard** – cancellation, emergency stop and (for lines with a laser
//!    action) laser permission are checked before anything is issued.
//! 2. **Issue** – the line's movement, laser and dwell sub-actions start
//!    concurrently.  Device commands block, so they run on the blocking pool
//!    wrapped in a [`RetryPolicy`].
//! 3. **Supervise** – while sub-actions run, the guards are re-polled every
//!    `poll_interval` and the line is bounded by `line_timeout`.  A tripped
//!    guard aborts the affected devices in place instead of waiting for the
//!    command to finish.
//! 4. **Advance** – the line completes when its slowest sub-action does,
//!    progress is reported and the next line starts.
//!
//! A line that ends early aborts its devices, then waits (bounded) for laser
//! commands still running on the blocking pool and aborts the laser again, so
//! a late set-point cannot outlive the run.
//!
//! Every run ends with exactly one terminal notification and one safety event
//! on the [`ExecutionObserver`].

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use lumos_hal::{DeviceRole, HardwareController, HardwareRegistry};
use lumos_kernel::SafetyCoordinator;
use lumos_types::{
    ExecutionObserver, FaultReason, HardwareError, HardwareErrorKind, LaserAction,
    LineBasedProtocol, LumosError, MovementAction, ProtocolLine, ProtocolOutcome, SafetyState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::context::{CancellationFlag, ExecutionContext};
use crate::retry::{RetryError, RetryPolicy};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Total attempts per sub-action before a transient failure becomes fatal.
pub const MAX_RETRIES: u32 = 3;

/// Fixed wait between attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on one protocol line.
pub const LINE_TIMEOUT: Duration = Duration::from_secs(120);

/// How often guards are re-checked while sub-actions run.
pub const SAFETY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default laser power ceiling in watts.
pub const DEFAULT_POWER_CEILING_W: f64 = 5.0;

/// How long clean-up waits for in-flight laser commands to return.
const LASER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and state
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning knobs for [`ProtocolExecutionEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Total attempts per sub-action (see [`MAX_RETRIES`]).
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub line_timeout: Duration,
    pub poll_interval: Duration,
    /// Protocols commanding more than this are rejected by `execute`.
    pub power_ceiling_w: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            retry_backoff: RETRY_BACKOFF,
            line_timeout: LINE_TIMEOUT,
            poll_interval: SAFETY_POLL_INTERVAL,
            power_ceiling_w: DEFAULT_POWER_CEILING_W,
        }
    }
}

/// Lifecycle of the engine.  Terminal states are left by the next `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Faulted,
    Cancelled,
}

impl From<&ProtocolOutcome> for EngineState {
    fn from(outcome: &ProtocolOutcome) -> Self {
        match outcome {
            ProtocolOutcome::Completed => EngineState::Completed,
            ProtocolOutcome::Faulted(_) => EngineState::Faulted,
            ProtocolOutcome::Cancelled => EngineState::Cancelled,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "IDLE",
            EngineState::Running => "RUNNING",
            EngineState::Completed => "COMPLETED",
            EngineState::Faulted => "FAULTED",
            EngineState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

struct Slot {
    state: EngineState,
    active: Option<CancellationFlag>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Executes one protocol at a time against the registered hardware.
pub struct ProtocolExecutionEngine {
    config: EngineConfig,
    safety: Arc<SafetyCoordinator>,
    registry: HardwareRegistry,
    observer: Arc<dyn ExecutionObserver>,
    slot: Arc<Mutex<Slot>>,
}

impl ProtocolExecutionEngine {
    pub fn new(
        config: EngineConfig,
        safety: Arc<SafetyCoordinator>,
        registry: HardwareRegistry,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Self {
        Self {
            config,
            safety,
            registry,
            observer,
            slot: Arc::new(Mutex::new(Slot {
                state: EngineState::Idle,
                active: None,
            })),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        lock(&self.slot).state
    }

    /// Validate `protocol` and start running it on a new task.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`LumosError::InvalidProtocol`] when the protocol's peak power
    ///   exceeds the ceiling.
    /// - [`LumosError::Hardware`] when a device the protocol needs is not
    ///   registered.
    /// - [`LumosError::Busy`] while another run is active.
    /// - [`LumosError::Channel`] outside a tokio runtime.
    pub fn execute(&self, protocol: LineBasedProtocol) -> Result<RunHandle, LumosError> {
        let peak = protocol.peak_power_w();
        if peak > self.config.power_ceiling_w {
            return Err(LumosError::InvalidProtocol(format!(
                "peak power {peak} W exceeds the {} W ceiling",
                self.config.power_ceiling_w
            )));
        }
        let motion = if protocol.lines().iter().any(|l| l.movement().is_some()) {
            Some(self.registry.require(DeviceRole::Motion)?)
        } else {
            None
        };
        let laser = if protocol.uses_laser() {
            Some(self.registry.require(DeviceRole::Laser)?)
        } else {
            None
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LumosError::Channel(format!("protocol engine needs a tokio runtime: {e}")))?;

        let cancel = CancellationFlag::new();
        {
            let mut slot = lock(&self.slot);
            if slot.state == EngineState::Running {
                warn!(protocol = protocol.name(), "execute rejected: a run is active");
                return Err(LumosError::Busy);
            }
            slot.state = EngineState::Running;
            slot.active = Some(cancel.clone());
        }

        info!(
            protocol = protocol.name(),
            lines = protocol.lines().len(),
            loops = protocol.loop_count(),
            estimated_ms = protocol.estimated_duration().as_millis() as u64,
            "protocol run starting"
        );
        let run = Run {
            config: self.config,
            safety: Arc::clone(&self.safety),
            observer: Arc::clone(&self.observer),
            motion,
            laser,
            laser_in_flight: InFlight::new(),
            cancel: cancel.clone(),
        };
        let release = SlotRelease {
            slot: Arc::clone(&self.slot),
            settled: false,
        };
        let task = runtime.spawn(run.execute(protocol, release));
        Ok(RunHandle { cancel, task })
    }

    /// Cancel the active run.  Returns `true` if one was active.
    pub fn cancel(&self) -> bool {
        let slot = lock(&self.slot);
        match (&slot.state, &slot.active) {
            (EngineState::Running, Some(flag)) => {
                info!("protocol run cancellation requested");
                flag.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Join/cancel handle of a run started by [`ProtocolExecutionEngine::execute`].
///
/// Dropping the handle does not stop the run.
pub struct RunHandle {
    cancel: CancellationFlag,
    task: JoinHandle<ProtocolOutcome>,
}

impl RunHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run's terminal outcome.
    ///
    /// # Errors
    ///
    /// [`LumosError::Channel`] if the run task panicked.
    pub async fn join(self) -> Result<ProtocolOutcome, LumosError> {
        self.task
            .await
            .map_err(|e| LumosError::Channel(format!("protocol run task failed: {e}")))
    }
}

/// Returns the engine to a terminal state even if the run task unwinds.
struct SlotRelease {
    slot: Arc<Mutex<Slot>>,
    settled: bool,
}

impl SlotRelease {
    fn settle(mut self, state: EngineState) {
        let mut slot = lock(&self.slot);
        slot.state = state;
        slot.active = None;
        self.settled = true;
    }
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        if !self.settled {
            let mut slot = lock(&self.slot);
            slot.state = EngineState::Faulted;
            slot.active = None;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Command {
    Move(MovementAction),
    Laser(LaserAction),
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Move(_) => "movement",
            Command::Laser(LaserAction::Set { .. }) => "laser_set",
            Command::Laser(LaserAction::Ramp { .. }) => "laser_ramp",
        }
    }

    fn apply(&self, device: &dyn HardwareController) -> Result<(), HardwareError> {
        match *self {
            Command::Move(m) => device.apply_position(m.target_mm, m.speed_mm_s),
            Command::Laser(LaserAction::Set { power_w }) => device.apply_laser_power(power_w),
            Command::Laser(ramp @ LaserAction::Ramp { start_w, end_w, .. }) => {
                device.apply_laser_ramp(start_w, end_w, ramp.duration())
            }
        }
    }
}

#[derive(Debug)]
struct ActionFailure {
    action: &'static str,
    error: RetryError,
}

/// Counts commands running on the blocking pool.  Aborting a sub-action's
/// task does not stop the blocking call it already started.
#[derive(Clone)]
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn new() -> Self {
        Self(Arc::new(watch::channel(0).0))
    }

    fn enter(&self) -> InFlightGuard {
        self.0.send_modify(|n| *n += 1);
        InFlightGuard(Arc::clone(&self.0))
    }

    fn is_busy(&self) -> bool {
        *self.0.borrow() > 0
    }

    /// `false` if commands are still running after `within`.
    async fn drained(&self, within: Duration) -> bool {
        let mut rx = self.0.subscribe();
        let waited = time::timeout(within, rx.wait_for(|n| *n == 0)).await;
        matches!(waited, Ok(Ok(_)))
    }
}

struct InFlightGuard(Arc<watch::Sender<usize>>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run task
// ─────────────────────────────────────────────────────────────────────────────

struct Run {
    config: EngineConfig,
    safety: Arc<SafetyCoordinator>,
    observer: Arc<dyn ExecutionObserver>,
    motion: Option<Arc<dyn HardwareController>>,
    laser: Option<Arc<dyn HardwareController>>,
    laser_in_flight: InFlight,
    cancel: CancellationFlag,
}

impl Run {
    async fn execute(self, protocol: LineBasedProtocol, release: SlotRelease) -> ProtocolOutcome {
        let treating = self.safety.state() == SafetyState::Armed
            && match self.safety.start_treatment() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "could not enter treatment");
                    false
                }
            };

        let mut ctx = ExecutionContext::new(self.cancel.clone());
        let outcome = match self.run_loops(&protocol, &mut ctx).await {
            Ok(()) => ProtocolOutcome::Completed,
            Err(outcome) => outcome,
        };
        if let ProtocolOutcome::Faulted(reason) = &outcome {
            ctx.record_fault(reason.clone());
        }

        if outcome == ProtocolOutcome::Completed
            && let Some(laser) = &self.laser
        {
            let laser = Arc::clone(laser);
            let off = tokio::task::spawn_blocking(move || laser.apply_laser_power(0.0)).await;
            if !matches!(off, Ok(Ok(()))) {
                warn!("could not command laser to 0 W after completion");
            }
        }
        if treating
            && self.safety.state() == SafetyState::Treating
            && let Err(e) = self.safety.stop_treatment()
        {
            warn!(error = %e, "could not leave treatment");
        }
        release.settle(EngineState::from(&outcome));

        match &outcome {
            ProtocolOutcome::Completed => info!(
                protocol = protocol.name(),
                elapsed_ms = ctx.elapsed().as_millis() as u64,
                "protocol run completed"
            ),
            other => warn!(
                protocol = protocol.name(),
                loop_index = ctx.loop_index(),
                line_index = ctx.line_index(),
                outcome = %other,
                fault = ?ctx.last_fault(),
                "protocol run ended early"
            ),
        }
        self.observer.on_protocol_terminal(&outcome);
        self.observer.on_safety_event(
            outcome.severity(),
            &format!("protocol '{}' {outcome}", protocol.name()),
            Utc::now(),
        );
        outcome
    }

    async fn run_loops(
        &self,
        protocol: &LineBasedProtocol,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ProtocolOutcome> {
        for loop_index in 0..protocol.loop_count() {
            for (line_index, line) in protocol.lines().iter().enumerate() {
                ctx.enter(loop_index, line_index);
                debug!(
                    loop_index,
                    line_index,
                    expected_ms = line.duration_from(ctx.position_mm()).as_millis() as u64,
                    "line starting"
                );
                self.run_line(line, ctx).await?;
                if let Some(m) = line.movement() {
                    ctx.moved_to(m.target_mm);
                }
                self.observer
                    .on_protocol_progress(line_index, loop_index, ctx.elapsed());
            }
        }
        Ok(())
    }

    async fn run_line(
        &self,
        line: &ProtocolLine,
        ctx: &ExecutionContext,
    ) -> Result<(), ProtocolOutcome> {
        let uses_laser = line.laser().is_some();
        self.check_guards(uses_laser, ctx)?;

        let policy = RetryPolicy::new(self.config.max_attempts, self.config.retry_backoff);
        let mut actions: JoinSet<Result<(), ActionFailure>> = JoinSet::new();
        if let (Some(m), Some(stage)) = (line.movement(), &self.motion) {
            actions.spawn(device_action(policy, Arc::clone(stage), Command::Move(*m), None));
        }
        if let (Some(l), Some(laser)) = (line.laser(), &self.laser) {
            actions.spawn(device_action(
                policy,
                Arc::clone(laser),
                Command::Laser(*l),
                Some(self.laser_in_flight.clone()),
            ));
        }
        if let Some(dwell) = line.dwell() {
            let duration = dwell.duration();
            actions.spawn(async move {
                time::sleep(duration).await;
                Ok(())
            });
        }

        let deadline = Instant::now() + self.config.line_timeout;
        let mut poll = time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                joined = actions.join_next() => match joined {
                    None => return Ok(()),
                    Some(Ok(Ok(()))) => continue,
                    // A device stopped by a shutdown reports the guard's
                    // reason, not its own abort.
                    Some(Ok(Err(failure))) => match self.check_guards(uses_laser, ctx) {
                        Err(stop) => stop,
                        Ok(()) => self.fault_from(failure),
                    },
                    Some(Err(join_error)) => ProtocolOutcome::Faulted(FaultReason::Hardware(
                        format!("sub-action task failed: {join_error}"),
                    )),
                },
                _ = time::sleep_until(deadline) => {
                    error!(timeout_ms = self.config.line_timeout.as_millis() as u64, "line timed out");
                    ProtocolOutcome::Faulted(FaultReason::Timeout(format!(
                        "line {} of loop {} exceeded {:?}",
                        ctx.line_index(),
                        ctx.loop_index(),
                        self.config.line_timeout
                    )))
                }
                _ = poll.tick() => match self.check_guards(uses_laser, ctx) {
                    Ok(()) => continue,
                    Err(stop) => stop,
                },
            };
            // Waits for the retry wrappers to stop so none starts a new attempt.
            actions.shutdown().await;
            self.clean_up(line, &outcome).await;
            return Err(outcome);
        }
    }

    /// Cancellation, emergency stop and, for laser lines, laser permission.
    fn check_guards(&self, uses_laser: bool, ctx: &ExecutionContext) -> Result<(), ProtocolOutcome> {
        if ctx.is_cancelled() {
            return Err(ProtocolOutcome::Cancelled);
        }
        let state = self.safety.state();
        if state == SafetyState::EmergencyStop {
            return Err(ProtocolOutcome::Faulted(FaultReason::EmergencyStop));
        }
        if uses_laser && !self.safety.query_laser_permitted() {
            return Err(ProtocolOutcome::Faulted(FaultReason::SafetyViolation(format!(
                "laser not permitted while {state}"
            ))));
        }
        Ok(())
    }

    fn fault_from(&self, failure: ActionFailure) -> ProtocolOutcome {
        let ActionFailure { action, error } = failure;
        let last = error.last_error().to_string();
        match error {
            RetryError::Exhausted { attempts, .. } => {
                self.safety
                    .trip_unsafe(&format!("{action} failed after {attempts} attempts: {last}"));
                ProtocolOutcome::Faulted(FaultReason::RetriesExhausted {
                    action: action.to_string(),
                    error: last,
                })
            }
            RetryError::Fatal(_) => {
                ProtocolOutcome::Faulted(FaultReason::Hardware(format!("{action}: {last}")))
            }
        }
    }

    /// Laser output is always stopped; motion only on cancellation or
    /// timeout, never on safety faults.
    async fn clean_up(&self, line: &ProtocolLine, outcome: &ProtocolOutcome) {
        if let Some(laser) = &self.laser {
            abort_device(laser, outcome);
        }
        let stop_motion = matches!(
            outcome,
            ProtocolOutcome::Cancelled | ProtocolOutcome::Faulted(FaultReason::Timeout(_))
        );
        if stop_motion
            && line.movement().is_some()
            && let Some(stage) = &self.motion
        {
            abort_device(stage, outcome);
        }
        if let Some(laser) = &self.laser
            && self.laser_in_flight.is_busy()
        {
            if !self.laser_in_flight.drained(LASER_DRAIN_TIMEOUT).await {
                error!(
                    device = laser.id(),
                    waited_ms = LASER_DRAIN_TIMEOUT.as_millis() as u64,
                    "laser command still running after abort"
                );
            }
            // The command may have landed after the first abort.
            abort_device(laser, outcome);
        }
    }
}

/// One device command under `policy`, on the blocking pool.  Each attempt is
/// counted in `in_flight` until the blocking call returns.
fn device_action(
    policy: RetryPolicy,
    device: Arc<dyn HardwareController>,
    command: Command,
    in_flight: Option<InFlight>,
) -> impl Future<Output = Result<(), ActionFailure>> + Send + 'static {
    async move {
        let action = command.label();
        policy
            .run(action, |attempt| {
                let device = Arc::clone(&device);
                let guard = in_flight.as_ref().map(InFlight::enter);
                debug!(action, attempt, device = device.id(), "issuing command");
                async move {
                    tokio::task::spawn_blocking(move || {
                        let _guard = guard;
                        command.apply(device.as_ref())
                    })
                    .await
                    .unwrap_or_else(|e| {
                        Err(HardwareError::new(
                            HardwareErrorKind::Fault,
                            format!("{action} worker failed: {e}"),
                        ))
                    })
                }
            })
            .await
            .map_err(|error| ActionFailure { action, error })
    }
}

fn abort_device(device: &Arc<dyn HardwareController>, outcome: &ProtocolOutcome) {
    match device.abort() {
        Ok(()) => info!(device = device.id(), %outcome, "device aborted"),
        Err(e) => error!(device = device.id(), %outcome, error = %e, "device abort failed"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    use lumos_hal::{SimCommand, SimLaser, SimStage};
    use lumos_types::{
        DwellAction, InterlockFact, InterlockSet, ObservedEvent, RecordingObserver, StatusSnapshot,
    };

    struct Rig {
        engine: ProtocolExecutionEngine,
        safety: Arc<SafetyCoordinator>,
        stage: Arc<SimStage>,
        laser: Arc<SimLaser>,
        observer: Arc<RecordingObserver>,
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_backoff: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            line_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    fn rig_with(config: EngineConfig) -> Rig {
        let laser = SimLaser::new("laser");
        rig_around(config, laser.clone(), laser)
    }

    /// The engine drives `driver`; `laser` is the simulated device behind it.
    fn rig_around(
        config: EngineConfig,
        laser: Arc<SimLaser>,
        driver: Arc<dyn HardwareController>,
    ) -> Rig {
        let stage = SimStage::new("stage");
        let registry = HardwareRegistry::new()
            .with(DeviceRole::Motion, stage.clone())
            .with(DeviceRole::Laser, driver);
        registry.connect_all().unwrap();
        let observer = RecordingObserver::new();
        let safety = Arc::new(SafetyCoordinator::from_registry(&registry, observer.clone()));
        safety.apply_interlocks(InterlockSet::all_satisfied());
        safety.arm().unwrap();
        let engine = ProtocolExecutionEngine::new(
            config,
            Arc::clone(&safety),
            registry,
            observer.clone(),
        );
        Rig {
            engine,
            safety,
            stage,
            laser,
            observer,
        }
    }

    fn rig() -> Rig {
        rig_with(fast_config())
    }

    /// Backoff long enough that a guard must cut it short.
    fn slow_retry_config() -> EngineConfig {
        EngineConfig {
            retry_backoff: Duration::from_secs(1),
            ..fast_config()
        }
    }

    /// Set-points spend `delay` on the wire before reaching the laser.
    struct SlowLaser {
        inner: Arc<SimLaser>,
        delay: Duration,
    }

    impl HardwareController for SlowLaser {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn connect(&self) -> Result<(), HardwareError> {
            self.inner.connect()
        }

        fn apply_laser_power(&self, watts: f64) -> Result<(), HardwareError> {
            std::thread::sleep(self.delay);
            self.inner.apply_laser_power(watts)
        }

        fn get_status(&self) -> StatusSnapshot {
            self.inner.get_status()
        }

        fn abort(&self) -> Result<(), HardwareError> {
            self.inner.abort()
        }
    }

    fn mv(target_mm: f64, speed_mm_s: f64) -> Option<MovementAction> {
        Some(MovementAction {
            target_mm,
            speed_mm_s,
        })
    }

    fn set(power_w: f64) -> Option<LaserAction> {
        Some(LaserAction::Set { power_w })
    }

    fn ramp(start_w: f64, end_w: f64, duration_s: f64) -> Option<LaserAction> {
        Some(LaserAction::Ramp {
            start_w,
            end_w,
            duration_s,
        })
    }

    fn dwell(duration_s: f64) -> Option<DwellAction> {
        Some(DwellAction { duration_s })
    }

    fn protocol(lines: Vec<ProtocolLine>, loops: u32) -> LineBasedProtocol {
        LineBasedProtocol::new("test", lines, loops).unwrap()
    }

    fn line(
        movement: Option<MovementAction>,
        laser: Option<LaserAction>,
        dwell: Option<DwellAction>,
    ) -> ProtocolLine {
        ProtocolLine::new(movement, laser, dwell).unwrap()
    }

    fn position_commands(stage: &SimStage) -> usize {
        stage
            .commands()
            .iter()
            .filter(|c| matches!(c, SimCommand::Position { .. }))
            .count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completes_every_line_of_every_loop() {
        let rig = rig();
        let handle = rig
            .engine
            .execute(protocol(
                vec![
                    line(mv(0.2, 20.0), set(1.0), dwell(0.02)),
                    line(mv(0.0, 20.0), None, dwell(0.02)),
                ],
                2,
            ))
            .unwrap();

        assert_eq!(handle.join().await.unwrap(), ProtocolOutcome::Completed);
        assert_eq!(rig.observer.progress(), vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
        assert_eq!(rig.observer.terminals(), vec![ProtocolOutcome::Completed]);
        assert_eq!(rig.engine.state(), EngineState::Completed);
        assert_eq!(rig.safety.state(), SafetyState::Armed);
        assert!(rig.laser.power_w().abs() < f64::EPSILON, "laser left on");
        assert_eq!(
            rig.observer.states(),
            vec![SafetyState::Armed, SafetyState::Treating, SafetyState::Armed]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sub_actions_run_concurrently() {
        let rig = rig();
        let started = StdInstant::now();
        let handle = rig
            .engine
            .execute(protocol(
                vec![line(mv(2.0, 10.0), ramp(0.0, 1.0, 0.2), dwell(0.2))],
                1,
            ))
            .unwrap();
        assert_eq!(handle.join().await.unwrap(), ProtocolOutcome::Completed);
        let elapsed = started.elapsed();
        // Slowest sub-action is 200 ms; sequential execution would take 600 ms.
        assert!(elapsed >= Duration::from_millis(190), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_failures_are_retried() {
        let rig = rig();
        rig.stage.fail_next(2, HardwareErrorKind::Transient);
        let handle = rig
            .engine
            .execute(protocol(vec![line(mv(0.1, 10.0), None, None)], 1))
            .unwrap();
        assert_eq!(handle.join().await.unwrap(), ProtocolOutcome::Completed);
        assert_eq!(position_commands(&rig.stage), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn three_failures_exhaust_retries_and_trip_unsafe() {
        let rig = rig();
        rig.stage.fail_next(3, HardwareErrorKind::Transient);
        let handle = rig
            .engine
            .execute(protocol(vec![line(mv(0.1, 10.0), None, None)], 1))
            .unwrap();

        let outcome = handle.join().await.unwrap();
        assert!(matches!(
            outcome,
            ProtocolOutcome::Faulted(FaultReason::RetriesExhausted { ref action, .. }) if action == "movement"
        ));
        assert_eq!(rig.observer.terminals().len(), 1);
        assert_eq!(position_commands(&rig.stage), 3);
        assert_eq!(rig.safety.state(), SafetyState::Unsafe);
        assert_eq!(rig.engine.state(), EngineState::Faulted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fatal_hardware_error_is_not_retried() {
        let rig = rig();
        rig.laser.fail_next(1, HardwareErrorKind::Fault);
        let handle = rig
            .engine
            .execute(protocol(vec![line(None, set(1.0), None)], 1))
            .unwrap();
        assert!(matches!(
            handle.join().await.unwrap(),
            ProtocolOutcome::Faulted(FaultReason::Hardware(_))
        ));
        let attempts = rig
            .laser
            .commands()
            .iter()
            .filter(|c| matches!(c, SimCommand::LaserPower { .. }))
            .count();
        assert_eq!(attempts, 1);
        assert_eq!(rig.safety.state(), SafetyState::Armed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_point_landing_after_a_fault_is_switched_off() {
        let laser = SimLaser::new("laser");
        let slow = Arc::new(SlowLaser {
            inner: laser.clone(),
            delay: Duration::from_millis(150),
        });
        let rig = rig_around(fast_config(), laser, slow);
        rig.stage.fail_next(1, HardwareErrorKind::Fault);

        let handle = rig
            .engine
            .execute(protocol(vec![line(mv(0.5, 10.0), set(2.0), None)], 1))
            .unwrap();
        let outcome = handle.join().await.unwrap();
        assert!(matches!(
            outcome,
            ProtocolOutcome::Faulted(FaultReason::Hardware(ref m)) if m.starts_with("movement")
        ));
        assert_eq!(rig.observer.terminals(), vec![outcome]);
        assert!(
            rig.laser.power_w().abs() < f64::EPSILON,
            "laser emitting {} W after the run ended",
            rig.laser.power_w()
        );

        // The set-point did land, and an abort followed it.
        let commands = rig.laser.commands();
        let landed = commands
            .iter()
            .position(|c| matches!(c, SimCommand::LaserPower { .. }))
            .unwrap();
        assert!(commands[landed..].contains(&SimCommand::Abort));

        time::sleep(Duration::from_millis(200)).await;
        assert!(rig.laser.power_w().abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emergency_stop_cuts_retry_backoff_short() {
        let rig = rig_with(slow_retry_config());
        rig.stage.fail_next(2, HardwareErrorKind::Transient);
        let handle = rig
            .engine
            .execute(protocol(vec![line(mv(0.1, 10.0), None, None)], 1))
            .unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let started = StdInstant::now();
        rig.safety.emergency_stop();
        assert_eq!(
            handle.join().await.unwrap(),
            ProtocolOutcome::Faulted(FaultReason::EmergencyStop)
        );
        assert!(started.elapsed() < Duration::from_millis(200), "{:?}", started.elapsed());
        assert_eq!(position_commands(&rig.stage), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_cuts_retry_backoff_short() {
        let rig = rig_with(slow_retry_config());
        rig.stage.fail_next(2, HardwareErrorKind::Transient);
        let handle = rig
            .engine
            .execute(protocol(vec![line(mv(0.1, 10.0), None, None)], 1))
            .unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let started = StdInstant::now();
        handle.cancel();
        assert_eq!(handle.join().await.unwrap(), ProtocolOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(200), "{:?}", started.elapsed());
        assert_eq!(position_commands(&rig.stage), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interlock_loss_cuts_laser_retry_backoff_short() {
        let rig = rig_with(slow_retry_config());
        rig.laser.fail_next(2, HardwareErrorKind::Transient);
        let handle = rig
            .engine
            .execute(protocol(vec![line(None, set(1.0), None)], 1))
            .unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let started = StdInstant::now();
        let mut lost = InterlockSet::all_satisfied();
        lost.set(InterlockFact::HardwareInterlock, false);
        rig.safety.apply_interlocks(lost);
        assert!(matches!(
            handle.join().await.unwrap(),
            ProtocolOutcome::Faulted(FaultReason::SafetyViolation(_))
        ));
        assert!(started.elapsed() < Duration::from_millis(200), "{:?}", started.elapsed());
        let attempts = rig
            .laser
            .commands()
            .iter()
            .filter(|c| matches!(c, SimCommand::LaserPower { .. }))
            .count();
        assert_eq!(attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_during_dwell_is_prompt() {
        let rig = rig();
        let handle = rig
            .engine
            .execute(protocol(vec![line(None, None, dwell(10.0))], 1))
            .unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let started = StdInstant::now();
        assert!(rig.engine.cancel());
        assert_eq!(handle.join().await.unwrap(), ProtocolOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(rig.engine.state(), EngineState::Cancelled);
        assert!(!rig.engine.cancel(), "nothing left to cancel");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_interrupts_a_long_move() {
        let rig = rig();
        let handle = rig
            .engine
            .execute(protocol(vec![line(mv(50.0, 1.0), None, None)], 1))
            .unwrap();
        time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let started = StdInstant::now();
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome, ProtocolOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(rig.stage.abort_count(), 1);
        assert!(rig.stage.position_mm() < 1.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emergency_stop_during_ramp_aborts_laser_only() {
        let rig = rig();
        let handle = rig
            .engine
            .execute(protocol(
                vec![line(mv(0.3, 1.0), ramp(0.0, 2.0, 5.0), None)],
                1,
            ))
            .unwrap();
        time::sleep(Duration::from_millis(60)).await;

        rig.safety.emergency_stop();
        let started = StdInstant::now();
        assert_eq!(
            handle.join().await.unwrap(),
            ProtocolOutcome::Faulted(FaultReason::EmergencyStop)
        );
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(rig.laser.abort_count() >= 1);
        assert_eq!(rig.stage.abort_count(), 0);
        assert!(rig.laser.power_w().abs() < f64::EPSILON);
        assert_eq!(rig.safety.state(), SafetyState::EmergencyStop);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interlock_loss_mid_ramp_is_a_safety_violation() {
        let rig = rig();
        let handle = rig
            .engine
            .execute(protocol(vec![line(None, ramp(0.5, 1.0, 5.0), None)], 1))
            .unwrap();
        time::sleep(Duration::from_millis(60)).await;

        let mut lost = InterlockSet::all_satisfied();
        lost.set(InterlockFact::HardwareInterlock, false);
        rig.safety.apply_interlocks(lost);

        assert!(matches!(
            handle.join().await.unwrap(),
            ProtocolOutcome::Faulted(FaultReason::SafetyViolation(_))
        ));
        assert_eq!(rig.safety.state(), SafetyState::Unsafe);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn laser_line_needs_permission() {
        let rig = rig();
        rig.safety.disarm().unwrap();
        let handle = rig
            .engine
            .execute(protocol(vec![line(None, set(1.0), None)], 1))
            .unwrap();
        assert!(matches!(
            handle.join().await.unwrap(),
            ProtocolOutcome::Faulted(FaultReason::SafetyViolation(_))
        ));
        assert!(
            !rig.laser
                .commands()
                .iter()
                .any(|c| matches!(c, SimCommand::LaserPower { .. })),
            "no laser command may be issued without permission"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn motion_only_protocol_runs_while_safe() {
        let rig = rig();
        rig.safety.disarm().unwrap();
        let handle = rig
            .engine
            .execute(protocol(vec![line(mv(0.1, 10.0), None, None)], 1))
            .unwrap();
        assert_eq!(handle.join().await.unwrap(), ProtocolOutcome::Completed);
        assert_eq!(rig.safety.state(), SafetyState::Safe);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_execute_is_rejected_while_running() {
        let rig = rig();
        let first = rig
            .engine
            .execute(protocol(vec![line(None, None, dwell(5.0))], 1))
            .unwrap();
        assert_eq!(rig.engine.state(), EngineState::Running);

        let second = rig
            .engine
            .execute(protocol(vec![line(None, None, dwell(0.01))], 1));
        assert!(matches!(second, Err(LumosError::Busy)));

        first.cancel();
        first.join().await.unwrap();
        // A finished run frees the engine.
        let third = rig
            .engine
            .execute(protocol(vec![line(None, None, dwell(0.01))], 1))
            .unwrap();
        assert_eq!(third.join().await.unwrap(), ProtocolOutcome::Completed);
    }

    #[tokio::test]
    async fn protocol_above_power_ceiling_is_rejected() {
        let rig = rig();
        let result = rig
            .engine
            .execute(protocol(vec![line(None, ramp(1.0, 20.0, 1.0), None)], 1));
        assert!(matches!(result, Err(LumosError::InvalidProtocol(ref m)) if m.contains("ceiling")));
        assert_eq!(rig.engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn missing_device_is_rejected_up_front() {
        let safety = Arc::new(SafetyCoordinator::detached());
        let engine = ProtocolExecutionEngine::new(
            fast_config(),
            safety,
            HardwareRegistry::new(),
            RecordingObserver::new(),
        );
        let result = engine.execute(protocol(vec![line(mv(1.0, 1.0), None, None)], 1));
        assert!(matches!(result, Err(LumosError::Hardware(_))));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn line_timeout_faults_and_aborts_motion() {
        let rig = rig_with(EngineConfig {
            line_timeout: Duration::from_millis(100),
            ..fast_config()
        });
        let handle = rig
            .engine
            .execute(protocol(vec![line(mv(10.0, 1.0), None, None)], 1))
            .unwrap();
        assert!(matches!(
            handle.join().await.unwrap(),
            ProtocolOutcome::Faulted(FaultReason::Timeout(_))
        ));
        assert_eq!(rig.stage.abort_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_run_ends_with_one_terminal_and_one_safety_event() {
        let rig = rig();
        let handle = rig
            .engine
            .execute(protocol(vec![line(None, None, dwell(0.01))], 1))
            .unwrap();
        handle.join().await.unwrap();

        let events = rig.observer.events();
        let terminals = events
            .iter()
            .filter(|e| matches!(e, ObservedEvent::Terminal(_)))
            .count();
        assert_eq!(terminals, 1);
        assert!(matches!(
            events.last(),
            Some(ObservedEvent::Safety { message, .. }) if message.contains("completed")
        ));
    }

    #[test]
    fn engine_config_deserialises_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.line_timeout, LINE_TIMEOUT);
        assert_eq!(config.poll_interval, SAFETY_POLL_INTERVAL);
    }
}
