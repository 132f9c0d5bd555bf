//! [`TreatmentSystem`] – the composition root.
//!
//! Builds every long-lived component exactly once and wires them together:
//!
//! ```text
//!  HardwareRegistry ──► SafetyCoordinator ◄── InterlockCoordinator ◄── device feeds
//!         │                 ▲      ▲
//!         │                 │      └───────── Watchdog ──► HeartbeatLink
//!         └──────► ProtocolExecutionEngine
//!
//!  all observer callbacks ──► BusObserver ──► EventBus ──► AuditRecorder
//! ```
//!
//! The methods on `TreatmentSystem` are the whole operator surface; the
//! accessors exist for status displays and tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lumos_hal::{DeviceRole, HardwareRegistry, HeartbeatLink, SimLaser, SimStage, SimSupervisor};
use lumos_kernel::{
    InterlockCoordinator, SafetyCoordinator, Watchdog, WatchdogConfig, WatchdogHandle,
};
use lumos_middleware::{AuditRecorder, AuditRecorderHandle, BusObserver, EventBus, JsonlAuditLog};
use lumos_types::{
    ExecutionObserver, InterlockFact, InterlockSet, LineBasedProtocol, LumosError, ObserverSet,
    SafetyState, StatusSnapshot,
};
use tracing::{info, warn};

use crate::engine::{EngineConfig, EngineState, ProtocolExecutionEngine, RunHandle};

/// Source tag stamped on every bus event the core publishes.
pub const EVENT_SOURCE: &str = "lumos-core";

/// Everything [`TreatmentSystem::start`] needs besides the hardware.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    pub watchdog: WatchdogConfig,
    /// Also carries the power ceiling shared with the interlock coordinator.
    pub engine: EngineConfig,
    /// JSON-lines audit log; `None` disables persistence.
    pub audit_path: Option<PathBuf>,
}

/// Point-in-time view for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub safety_state: SafetyState,
    pub interlocks: InterlockSet,
    pub laser_permitted: bool,
    pub engine_state: EngineState,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    /// Events the audit log failed to persist.
    pub audit_failures: u64,
    pub devices: Vec<(DeviceRole, StatusSnapshot)>,
}

/// Owns the safety core and exposes the operator-facing operations.
pub struct TreatmentSystem {
    safety: Arc<SafetyCoordinator>,
    interlocks: Arc<InterlockCoordinator>,
    engine: ProtocolExecutionEngine,
    registry: HardwareRegistry,
    bus: EventBus,
    watchdog: WatchdogHandle,
    audit: Option<AuditRecorderHandle>,
}

impl TreatmentSystem {
    /// Connect the hardware and start the core.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`LumosError::Audit`] when the audit log cannot be opened.
    /// - [`LumosError::Hardware`] when a device fails to connect.
    /// - [`LumosError::Channel`] outside a tokio runtime.
    pub fn start(
        config: SystemConfig,
        registry: HardwareRegistry,
        link: Arc<dyn HeartbeatLink>,
    ) -> Result<Self, LumosError> {
        Self::start_observed(config, registry, link, ObserverSet::new())
    }

    /// Like [`start`][Self::start], with extra observers notified next to the
    /// event bus.
    ///
    /// # Errors
    ///
    /// See [`start`][Self::start].
    pub fn start_observed(
        config: SystemConfig,
        registry: HardwareRegistry,
        link: Arc<dyn HeartbeatLink>,
        extra: ObserverSet,
    ) -> Result<Self, LumosError> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| LumosError::Channel(format!("treatment system needs a tokio runtime: {e}")))?;

        let bus = EventBus::default();
        // Subscribe the recorder before anything can publish.
        let audit = match &config.audit_path {
            Some(path) => {
                let log = JsonlAuditLog::open(path)?;
                Some(AuditRecorder::spawn(&bus, Box::new(log)))
            }
            None => None,
        };

        let observer: Arc<dyn ExecutionObserver> = Arc::new(
            ObserverSet::new()
                .with(Arc::new(BusObserver::new(bus.clone(), EVENT_SOURCE)))
                .with(Arc::new(extra)),
        );

        registry.connect_all()?;
        let safety = Arc::new(SafetyCoordinator::from_registry(
            &registry,
            Arc::clone(&observer),
        ));
        let interlocks =
            InterlockCoordinator::new(Arc::clone(&safety), config.engine.power_ceiling_w);
        let watchdog = Watchdog::spawn(config.watchdog, link, Arc::clone(&safety));
        let engine = ProtocolExecutionEngine::new(
            config.engine,
            Arc::clone(&safety),
            registry.clone(),
            observer,
        );

        info!(
            power_ceiling_w = config.engine.power_ceiling_w,
            audit = config.audit_path.is_some(),
            "treatment system started"
        );
        Ok(Self {
            safety,
            interlocks,
            engine,
            registry,
            bus,
            watchdog,
            audit,
        })
    }

    /// Start over freshly built simulated devices with the laser's interlock
    /// line and power output feeding the interlock coordinator.
    ///
    /// # Errors
    ///
    /// See [`start`][Self::start].
    pub fn simulated(config: SystemConfig) -> Result<(Self, SimulatedRig), LumosError> {
        let rig = SimulatedRig::new(config.watchdog.supervisor_timeout());
        let system = Self::start(config, rig.registry(), rig.supervisor.clone())?;
        system
            .interlocks
            .attach(InterlockFact::HardwareInterlock, rig.laser.interlock_feed());
        system.interlocks.attach_power(rig.laser.power_feed());
        Ok((system, rig))
    }

    // ── operator surface ────────────────────────────────────────────────────

    /// # Errors
    ///
    /// See [`SafetyCoordinator::arm`].
    pub fn arm(&self) -> Result<(), LumosError> {
        self.safety.arm()
    }

    /// Cancels any active run before leaving the laser-capable states.
    ///
    /// # Errors
    ///
    /// See [`SafetyCoordinator::disarm`].
    pub fn disarm(&self) -> Result<(), LumosError> {
        self.engine.cancel();
        self.safety.disarm()
    }

    pub fn emergency_stop(&self) {
        self.safety.emergency_stop();
    }

    /// # Errors
    ///
    /// See [`SafetyCoordinator::reset_from_emergency`].
    pub fn reset_from_emergency(&self) -> Result<(), LumosError> {
        self.safety.reset_from_emergency()
    }

    /// # Errors
    ///
    /// See [`ProtocolExecutionEngine::execute`].
    pub fn execute(&self, protocol: LineBasedProtocol) -> Result<RunHandle, LumosError> {
        self.engine.execute(protocol)
    }

    /// Returns `true` if a run was active.
    pub fn cancel(&self) -> bool {
        self.engine.cancel()
    }

    // ── accessors ───────────────────────────────────────────────────────────

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            safety_state: self.safety.state(),
            interlocks: self.safety.interlocks(),
            laser_permitted: self.safety.query_laser_permitted(),
            engine_state: self.engine.state(),
            heartbeats_sent: self.watchdog.heartbeats_sent(),
            heartbeat_failures: self.watchdog.failures(),
            audit_failures: self.audit.as_ref().map_or(0, AuditRecorderHandle::failures),
            devices: self.registry.status_all(),
        }
    }

    pub fn safety(&self) -> &Arc<SafetyCoordinator> {
        &self.safety
    }

    pub fn interlocks(&self) -> &Arc<InterlockCoordinator> {
        &self.interlocks
    }

    pub fn engine(&self) -> &ProtocolExecutionEngine {
        &self.engine
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Cancel any run, leave the laser-capable states, stop the watchdog and
    /// flush the audit log.
    ///
    /// Returns the number of audit events written.
    ///
    /// # Errors
    ///
    /// The audit recorder's error, if persisting failed.
    pub async fn shutdown(self) -> Result<u64, LumosError> {
        if self.engine.cancel() {
            info!("active run cancelled for shutdown");
        }
        if self.safety.state().laser_capable()
            && let Err(e) = self.safety.disarm()
        {
            warn!(error = %e, "disarm during shutdown failed");
        }
        self.watchdog.stop().await;
        let written = match self.audit {
            Some(recorder) => recorder.stop().await?,
            None => 0,
        };
        info!(audit_events = written, "treatment system stopped");
        Ok(written)
    }
}

/// The simulated devices behind [`TreatmentSystem::simulated`].
#[derive(Clone)]
pub struct SimulatedRig {
    pub stage: Arc<SimStage>,
    pub laser: Arc<SimLaser>,
    pub supervisor: Arc<SimSupervisor>,
}

impl SimulatedRig {
    pub fn new(supervisor_timeout: Duration) -> Self {
        Self {
            stage: SimStage::new("sim-stage"),
            laser: SimLaser::new("sim-laser"),
            supervisor: SimSupervisor::new(supervisor_timeout),
        }
    }

    pub fn registry(&self) -> HardwareRegistry {
        HardwareRegistry::new()
            .with(DeviceRole::Motion, self.stage.clone())
            .with(DeviceRole::Laser, self.laser.clone())
    }
}
