//! In-process simulated devices for CI testing and demos without hardware.
//!
//! [`SimStage`], [`SimLaser`] and [`SimSupervisor`] implement the hardware
//! contracts with plausible timing: moves take `distance / speed`, ramps take
//! their programmed duration, and both poll an abort flag every few
//! milliseconds so `abort()` interrupts them in place.  Every command is
//! recorded and failures can be injected, which lets the full Lumos stack run
//! in headless tests.
//!
//! # Example
//!
//! ```rust
//! use lumos_hal::controller::HardwareController;
//! use lumos_hal::sim::SimStage;
//! use lumos_types::HardwareErrorKind;
//!
//! let stage = SimStage::new("stage");
//! stage.connect().unwrap();
//! stage.apply_position(0.01, 10.0).expect("sim move must succeed");
//!
//! stage.fail_next(1, HardwareErrorKind::Transient);
//! assert!(stage.apply_position(0.0, 10.0).is_err());
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lumos_types::{HardwareError, HardwareErrorKind, StatusSnapshot};
use tokio::sync::watch;
use tracing::debug;

use crate::controller::HardwareController;
use crate::supervisor::HeartbeatLink;

/// Granularity of simulated motion and ramps; bounds abort latency.
const SIM_TICK: Duration = Duration::from_millis(5);

/// Speed used by [`SimStage::home`].
const HOME_SPEED_MM_S: f64 = 20.0;

/// A command received by a simulated device.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    Connect,
    Position { target_mm: f64, speed_mm_s: f64 },
    LaserPower { watts: f64 },
    LaserRamp { start_w: f64, end_w: f64, duration: Duration },
    Home,
    Abort,
}

// ────────────────────────────────────────────────────────────────────────────
// Shared plumbing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FaultPlan {
    remaining: u32,
    kind: Option<HardwareErrorKind>,
}

/// Book-keeping every simulated controller shares.
struct SimCore {
    id: String,
    connected: AtomicBool,
    connect_fails: AtomicBool,
    busy: AtomicBool,
    abort_requested: AtomicBool,
    aborts: AtomicU32,
    faults: Mutex<FaultPlan>,
    log: Mutex<Vec<SimCommand>>,
}

impl SimCore {
    fn new(id: String) -> Self {
        Self {
            id,
            connected: AtomicBool::new(false),
            connect_fails: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            aborts: AtomicU32::new(0),
            faults: Mutex::new(FaultPlan::default()),
            log: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, cmd: SimCommand) {
        debug!(device = %self.id, command = ?cmd, "sim command");
        if let Ok(mut log) = self.log.lock() {
            log.push(cmd);
        }
    }

    fn connect(&self) -> Result<(), HardwareError> {
        self.record(SimCommand::Connect);
        if self.connect_fails.load(Ordering::Acquire) {
            return Err(HardwareError::new(
                HardwareErrorKind::Disconnected,
                format!("{} did not answer", self.id),
            ));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Consume one injected failure, if any, then check the link.
    fn precheck(&self) -> Result<(), HardwareError> {
        if let Ok(mut plan) = self.faults.lock()
            && plan.remaining > 0
        {
            plan.remaining -= 1;
            let kind = plan.kind.unwrap_or(HardwareErrorKind::Transient);
            return Err(HardwareError::new(
                kind,
                format!("{} injected {kind} failure", self.id),
            ));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(HardwareError::new(
                HardwareErrorKind::Disconnected,
                format!("{} is not connected", self.id),
            ));
        }
        Ok(())
    }

    /// Run `step(fraction)` every tick for `total`, stopping early on abort.
    fn timed<F: FnMut(f64)>(&self, total: Duration, mut step: F) -> Result<(), HardwareError> {
        self.abort_requested.store(false, Ordering::Release);
        self.busy.store(true, Ordering::Release);
        let began = Instant::now();
        let result = loop {
            if self.abort_requested.swap(false, Ordering::AcqRel) {
                break Err(HardwareError::aborted(format!("{} aborted", self.id)));
            }
            let elapsed = began.elapsed();
            if elapsed >= total {
                step(1.0);
                break Ok(());
            }
            step(elapsed.as_secs_f64() / total.as_secs_f64());
            thread::sleep(SIM_TICK.min(total - elapsed));
        };
        self.busy.store(false, Ordering::Release);
        result
    }

    fn abort(&self) {
        self.record(SimCommand::Abort);
        self.aborts.fetch_add(1, Ordering::AcqRel);
        self.abort_requested.store(true, Ordering::Release);
    }

    fn fail_next(&self, count: u32, kind: HardwareErrorKind) {
        if let Ok(mut plan) = self.faults.lock() {
            plan.remaining = count;
            plan.kind = Some(kind);
        }
    }

    fn commands(&self) -> Vec<SimCommand> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stage
// ────────────────────────────────────────────────────────────────────────────

/// A simulated single-axis actuator stage.
pub struct SimStage {
    core: SimCore,
    position_mm: Mutex<f64>,
}

impl SimStage {
    /// Create a disconnected stage at the home position.
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            core: SimCore::new(id.into()),
            position_mm: Mutex::new(0.0),
        })
    }

    /// Make the next `count` position/home commands fail with `kind`.
    pub fn fail_next(&self, count: u32, kind: HardwareErrorKind) {
        self.core.fail_next(count, kind);
    }

    /// Make `connect()` fail while `fail` is set.
    pub fn fail_connect(&self, fail: bool) {
        self.core.connect_fails.store(fail, Ordering::Release);
    }

    /// Number of `abort()` calls received.
    pub fn abort_count(&self) -> u32 {
        self.core.aborts.load(Ordering::Acquire)
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<SimCommand> {
        self.core.commands()
    }

    pub fn position_mm(&self) -> f64 {
        self.position_mm.lock().map(|p| *p).unwrap_or(f64::NAN)
    }

    fn move_to(&self, target_mm: f64, speed_mm_s: f64) -> Result<(), HardwareError> {
        if !(speed_mm_s.is_finite() && speed_mm_s > 0.0) || !target_mm.is_finite() {
            return Err(HardwareError::new(
                HardwareErrorKind::Fault,
                format!("{} rejected move to {target_mm} at {speed_mm_s}", self.core.id),
            ));
        }
        let start = self.position_mm();
        let distance = target_mm - start;
        let total = Duration::try_from_secs_f64(distance.abs() / speed_mm_s).unwrap_or(Duration::MAX);
        self.core.timed(total, |fraction| {
            if let Ok(mut p) = self.position_mm.lock() {
                *p = start + distance * fraction;
            }
        })
    }
}

impl HardwareController for SimStage {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn connect(&self) -> Result<(), HardwareError> {
        self.core.connect()
    }

    fn apply_position(&self, target_mm: f64, speed_mm_s: f64) -> Result<(), HardwareError> {
        self.core.record(SimCommand::Position {
            target_mm,
            speed_mm_s,
        });
        self.core.precheck()?;
        self.move_to(target_mm, speed_mm_s)
    }

    fn home(&self) -> Result<(), HardwareError> {
        self.core.record(SimCommand::Home);
        self.core.precheck()?;
        self.move_to(0.0, HOME_SPEED_MM_S)
    }

    fn get_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            device: self.core.id.clone(),
            connected: self.core.connected.load(Ordering::Acquire),
            busy: self.core.busy.load(Ordering::Acquire),
            position_mm: Some(self.position_mm()),
            ..StatusSnapshot::default()
        }
    }

    fn abort(&self) -> Result<(), HardwareError> {
        self.core.abort();
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Laser
// ────────────────────────────────────────────────────────────────────────────

/// A simulated laser driver with an interlock input.
///
/// Output power and the interlock line are published on `watch` channels so
/// an interlock coordinator can subscribe to them.
pub struct SimLaser {
    core: SimCore,
    power_w: watch::Sender<f64>,
    interlock_line: watch::Sender<bool>,
}

impl SimLaser {
    /// Create a disconnected laser at 0 W with its interlock line closed.
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        let (power_w, _) = watch::channel(0.0);
        let (interlock_line, _) = watch::channel(true);
        Arc::new(Self {
            core: SimCore::new(id.into()),
            power_w,
            interlock_line,
        })
    }

    /// Make the next `count` laser commands fail with `kind`.
    pub fn fail_next(&self, count: u32, kind: HardwareErrorKind) {
        self.core.fail_next(count, kind);
    }

    pub fn abort_count(&self) -> u32 {
        self.core.aborts.load(Ordering::Acquire)
    }

    pub fn commands(&self) -> Vec<SimCommand> {
        self.core.commands()
    }

    /// Current output in watts.
    pub fn power_w(&self) -> f64 {
        *self.power_w.borrow()
    }

    /// Open (`false`) or close (`true`) the simulated interlock line.
    pub fn set_interlock_line(&self, closed: bool) {
        self.interlock_line.send_replace(closed);
    }

    /// Subscribe to output power changes.
    pub fn power_feed(&self) -> watch::Receiver<f64> {
        self.power_w.subscribe()
    }

    /// Subscribe to interlock line changes.
    pub fn interlock_feed(&self) -> watch::Receiver<bool> {
        self.interlock_line.subscribe()
    }

    fn set_power(&self, watts: f64) {
        self.power_w.send_if_modified(|p| {
            let changed = (*p - watts).abs() > f64::EPSILON;
            *p = watts;
            changed
        });
    }
}

impl HardwareController for SimLaser {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn connect(&self) -> Result<(), HardwareError> {
        self.core.connect()
    }

    fn apply_laser_power(&self, watts: f64) -> Result<(), HardwareError> {
        self.core.record(SimCommand::LaserPower { watts });
        self.core.precheck()?;
        if !(watts.is_finite() && watts >= 0.0) {
            return Err(HardwareError::new(
                HardwareErrorKind::Fault,
                format!("{} rejected power {watts}", self.core.id),
            ));
        }
        self.set_power(watts);
        Ok(())
    }

    fn apply_laser_ramp(
        &self,
        start_w: f64,
        end_w: f64,
        duration: Duration,
    ) -> Result<(), HardwareError> {
        self.core.record(SimCommand::LaserRamp {
            start_w,
            end_w,
            duration,
        });
        self.core.precheck()?;
        let result = self.core.timed(duration, |fraction| {
            self.set_power(start_w + (end_w - start_w) * fraction);
        });
        if result.is_err() {
            self.set_power(0.0);
        }
        result
    }

    fn get_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            device: self.core.id.clone(),
            connected: self.core.connected.load(Ordering::Acquire),
            busy: self.core.busy.load(Ordering::Acquire),
            laser_power_w: Some(self.power_w()),
            interlock_ok: Some(*self.interlock_line.borrow()),
            ..StatusSnapshot::default()
        }
    }

    fn abort(&self) -> Result<(), HardwareError> {
        self.core.abort();
        self.set_power(0.0);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────────────────

/// A simulated external supervisor board.
///
/// It records heartbeats and reports [`has_cut_power`][Self::has_cut_power]
/// once the gap since the last heartbeat exceeds its timeout, the way the
/// real board would drop the laser's enable line.
pub struct SimSupervisor {
    timeout: Duration,
    created: Instant,
    last_beat: Mutex<Option<Instant>>,
    last_token: AtomicU64,
    beats: AtomicU64,
    link_down: AtomicBool,
    latency: Mutex<Duration>,
}

impl SimSupervisor {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            created: Instant::now(),
            last_beat: Mutex::new(None),
            last_token: AtomicU64::new(0),
            beats: AtomicU64::new(0),
            link_down: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    /// Simulate a broken link: every send fails while `down` is set.
    pub fn set_link_down(&self, down: bool) {
        self.link_down.store(down, Ordering::Release);
    }

    /// Delay every send by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut l) = self.latency.lock() {
            *l = latency;
        }
    }

    pub fn beats_received(&self) -> u64 {
        self.beats.load(Ordering::Acquire)
    }

    pub fn last_token(&self) -> u64 {
        self.last_token.load(Ordering::Acquire)
    }

    /// `true` once no heartbeat has arrived within the timeout.
    pub fn has_cut_power(&self) -> bool {
        let since = self
            .last_beat
            .lock()
            .ok()
            .and_then(|b| *b)
            .unwrap_or(self.created);
        since.elapsed() > self.timeout
    }
}

#[async_trait]
impl HeartbeatLink for SimSupervisor {
    async fn send_heartbeat(&self, token: u64) -> Result<(), HardwareError> {
        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.link_down.load(Ordering::Acquire) {
            return Err(HardwareError::new(
                HardwareErrorKind::Disconnected,
                "heartbeat link down",
            ));
        }
        if let Ok(mut last) = self.last_beat.lock() {
            *last = Some(Instant::now());
        }
        self.last_token.store(token, Ordering::Release);
        self.beats.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_stage() -> Arc<SimStage> {
        let stage = SimStage::new("stage");
        stage.connect().unwrap();
        stage
    }

    fn connected_laser() -> Arc<SimLaser> {
        let laser = SimLaser::new("laser");
        laser.connect().unwrap();
        laser
    }

    #[test]
    fn stage_moves_and_records_position() {
        let stage = connected_stage();
        stage.apply_position(0.5, 50.0).unwrap();
        assert!((stage.position_mm() - 0.5).abs() < 1e-9);
        assert!(matches!(
            stage.commands().last(),
            Some(SimCommand::Position { .. })
        ));
    }

    #[test]
    fn stage_requires_connection() {
        let stage = SimStage::new("stage");
        let err = stage.apply_position(1.0, 1.0).unwrap_err();
        assert_eq!(err.kind, HardwareErrorKind::Disconnected);
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let stage = connected_stage();
        stage.fail_next(2, HardwareErrorKind::Transient);
        assert_eq!(
            stage.apply_position(0.0, 1.0).unwrap_err().kind,
            HardwareErrorKind::Transient
        );
        assert!(stage.apply_position(0.0, 1.0).is_err());
        assert!(stage.apply_position(0.0, 1.0).is_ok());
    }

    #[test]
    fn abort_interrupts_a_long_move() {
        let stage = connected_stage();
        let mover = Arc::clone(&stage);
        let handle = thread::spawn(move || mover.apply_position(100.0, 1.0));
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        stage.abort().unwrap();
        let result = handle.join().unwrap();
        assert_eq!(result.unwrap_err().kind, HardwareErrorKind::Aborted);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(stage.abort_count(), 1);
        // Stopped part way.
        assert!(stage.position_mm() < 100.0);
        assert!(!stage.get_status().busy);
    }

    #[test]
    fn stale_abort_does_not_cancel_next_command() {
        let stage = connected_stage();
        stage.abort().unwrap();
        assert!(stage.apply_position(0.01, 10.0).is_ok());
    }

    #[test]
    fn home_returns_to_zero() {
        let stage = connected_stage();
        stage.apply_position(0.2, 100.0).unwrap();
        stage.home().unwrap();
        assert!(stage.position_mm().abs() < 1e-9);
    }

    #[test]
    fn stage_does_not_fire_a_laser() {
        let stage = connected_stage();
        assert_eq!(
            stage.apply_laser_power(1.0).unwrap_err().kind,
            HardwareErrorKind::Unsupported
        );
    }

    #[test]
    fn laser_power_is_published() {
        let laser = connected_laser();
        let feed = laser.power_feed();
        laser.apply_laser_power(2.0).unwrap();
        assert!((*feed.borrow() - 2.0).abs() < f64::EPSILON);
        assert_eq!(laser.get_status().laser_power_w, Some(2.0));
    }

    #[test]
    fn laser_ramp_ends_at_end_power() {
        let laser = connected_laser();
        laser
            .apply_laser_ramp(0.0, 3.0, Duration::from_millis(30))
            .unwrap();
        assert!((laser.power_w() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn laser_abort_drops_output_to_zero() {
        let laser = connected_laser();
        let ramper = Arc::clone(&laser);
        let handle =
            thread::spawn(move || ramper.apply_laser_ramp(1.0, 5.0, Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(30));
        laser.abort().unwrap();
        assert_eq!(
            handle.join().unwrap().unwrap_err().kind,
            HardwareErrorKind::Aborted
        );
        assert!(laser.power_w().abs() < f64::EPSILON);
    }

    #[test]
    fn laser_interlock_line_feeds_status() {
        let laser = connected_laser();
        let mut feed = laser.interlock_feed();
        assert!(*feed.borrow_and_update());
        laser.set_interlock_line(false);
        assert!(feed.has_changed().unwrap());
        assert_eq!(laser.get_status().interlock_ok, Some(false));
    }

    #[tokio::test]
    async fn supervisor_records_heartbeats() {
        let sup = SimSupervisor::new(Duration::from_secs(1));
        sup.send_heartbeat(7).await.unwrap();
        assert_eq!(sup.beats_received(), 1);
        assert_eq!(sup.last_token(), 7);
        assert!(!sup.has_cut_power());
    }

    #[tokio::test]
    async fn supervisor_link_down_fails_send() {
        let sup = SimSupervisor::new(Duration::from_secs(1));
        sup.set_link_down(true);
        let err = sup.send_heartbeat(1).await.unwrap_err();
        assert_eq!(err.kind, HardwareErrorKind::Disconnected);
        assert_eq!(sup.beats_received(), 0);
    }

    #[test]
    fn supervisor_cuts_power_when_silent() {
        let sup = SimSupervisor::new(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(40));
        assert!(sup.has_cut_power());
    }
}
