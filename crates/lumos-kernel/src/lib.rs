//! `lumos-kernel` – Safety & Supervision
//!
//! Decides when energy-emitting hardware may operate.  It does not sequence
//! treatments; it enforces the rules every sequence must obey.
//!
//! # Modules
//!
//! - [`safety`] – [`SafetyCoordinator`][safety::SafetyCoordinator]:
//!   the authoritative SAFE / ARMED / TREATING / UNSAFE / EMERGENCY_STOP
//!   state machine and the sole gate on laser permission.  Issues the
//!   selective shutdown of energy emitters.
//! - [`interlock`] – [`InterlockCoordinator`][interlock::InterlockCoordinator]:
//!   aggregates the hardware interlock line, session validity, the power
//!   ceiling and the emergency-stop button, and pushes every change into the
//!   safety coordinator.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]:
//!   periodic heartbeat to the external supervisor; local failures trip the
//!   safety coordinator to UNSAFE.

pub mod interlock;
pub mod safety;
pub mod watchdog;

pub use interlock::InterlockCoordinator;
pub use safety::{PendingShutdown, SafetyCoordinator};
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogHandle};
