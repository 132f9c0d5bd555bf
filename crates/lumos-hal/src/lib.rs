//! `lumos-hal` – Hardware Abstraction Layer
//!
//! The narrow contracts through which the treatment core reaches physical
//! devices, plus simulated implementations.
//!
//! # Modules
//!
//! - [`controller`] – [`HardwareController`][controller::HardwareController]:
//!   the single polymorphic device contract (connect, position, laser power,
//!   laser ramp, home, status, abort).
//! - [`supervisor`] – [`HeartbeatLink`][supervisor::HeartbeatLink]: the
//!   outbound channel to the external heartbeat supervisor.
//! - [`registry`] – [`HardwareRegistry`][registry::HardwareRegistry]: role-keyed
//!   device handles wired at the composition root.
//! - [`sim`] – simulated stage, laser and supervisor for headless runs.

pub mod controller;
pub mod registry;
pub mod sim;
pub mod supervisor;

pub use controller::HardwareController;
pub use registry::{DeviceRole, HardwareRegistry};
pub use sim::{SimCommand, SimLaser, SimStage, SimSupervisor};
pub use supervisor::HeartbeatLink;
