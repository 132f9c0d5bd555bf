//! `lumos-runtime` – protocol execution and process wiring.
//!
//! # Modules
//!
//! - [`engine`] – [`ProtocolExecutionEngine`]: runs a
//!   [`LineBasedProtocol`][lumos_types::LineBasedProtocol] one line at a time,
//!   each line's movement, laser and dwell sub-actions concurrently, under
//!   continuous safety polling, bounded retries and a per-line timeout.
//! - [`retry`] – [`RetryPolicy`]: fixed-backoff retry of transient
//!   [`HardwareError`][lumos_types::HardwareError]s.
//! - [`context`] – [`ExecutionContext`] and the cooperative
//!   [`CancellationFlag`] shared between a run and its handles.
//! - [`system`] – [`TreatmentSystem`]: the composition root that builds the
//!   safety coordinator, interlock coordinator, watchdog, engine, event bus
//!   and audit recorder once, and exposes the operator surface.
//! - [`telemetry`] – [`init_tracing`]: `tracing` subscriber with an optional
//!   OTLP exporter.
//!
//! # Safety gating
//!
//! The engine never decides on its own whether the laser may fire.  Every
//! laser sub-action is preceded by
//! [`SafetyCoordinator::query_laser_permitted`], and the engine keeps
//! re-polling it while the line runs.  [`SafetyCoordinator`] is re-exported
//! so callers holding a [`TreatmentSystem`] need no direct dependency on
//! `lumos-kernel`.

pub mod context;
pub mod engine;
pub mod retry;
pub mod system;
pub mod telemetry;

pub use context::{CancellationFlag, ExecutionContext};
pub use engine::{EngineConfig, EngineState, ProtocolExecutionEngine, RunHandle};
pub use retry::{RetryError, RetryPolicy};
pub use system::{SimulatedRig, SystemConfig, SystemStatus, TreatmentSystem};
pub use telemetry::{init_tracing, TracerProviderGuard};

pub use lumos_kernel::SafetyCoordinator;
