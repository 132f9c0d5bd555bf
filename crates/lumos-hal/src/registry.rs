//! [`HardwareRegistry`] – central driver registry keyed by device role.
//!
//! The composition root registers one [`HardwareController`] per
//! [`DeviceRole`].  The safety coordinator asks the registry for its
//! energy-emitting devices (the targets of a selective shutdown) and the
//! protocol engine resolves the motion and laser contracts from it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use lumos_types::{HardwareError, HardwareErrorKind, LumosError, StatusSnapshot};
use tracing::{info, warn};

use crate::controller::HardwareController;

/// What a registered device is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceRole {
    /// Actuator stage that positions the treatment head.
    Motion,
    /// Laser driver.  Energy-emitting.
    Laser,
}

impl DeviceRole {
    /// `true` for roles that a selective shutdown must disable.
    pub fn emits_energy(self) -> bool {
        matches!(self, DeviceRole::Laser)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Motion => f.write_str("motion"),
            DeviceRole::Laser => f.write_str("laser"),
        }
    }
}

/// Role-keyed registry of shared device handles.
///
/// Handles are `Arc`s so the same driver can be held by the registry, the
/// safety coordinator and the engine at once.
#[derive(Default, Clone)]
pub struct HardwareRegistry {
    devices: BTreeMap<DeviceRole, Arc<dyn HardwareController>>,
}

impl HardwareRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` for `role`.  Any previously registered driver for the
    /// same role is replaced.
    pub fn register(&mut self, role: DeviceRole, device: Arc<dyn HardwareController>) {
        self.devices.insert(role, device);
    }

    /// Builder-style [`register`][Self::register].
    pub fn with(mut self, role: DeviceRole, device: Arc<dyn HardwareController>) -> Self {
        self.register(role, device);
        self
    }

    /// Driver registered for `role`, if any.
    pub fn get(&self, role: DeviceRole) -> Option<Arc<dyn HardwareController>> {
        self.devices.get(&role).cloned()
    }

    /// Driver registered for `role`.
    ///
    /// # Errors
    ///
    /// [`LumosError::Hardware`] with kind `Disconnected` when nothing is
    /// registered for the role.
    pub fn require(&self, role: DeviceRole) -> Result<Arc<dyn HardwareController>, LumosError> {
        self.get(role).ok_or_else(|| {
            HardwareError::new(
                HardwareErrorKind::Disconnected,
                format!("no {role} device is registered"),
            )
            .into()
        })
    }

    /// Every driver whose role emits energy.
    pub fn energy_emitters(&self) -> Vec<Arc<dyn HardwareController>> {
        self.devices
            .iter()
            .filter(|(role, _)| role.emits_energy())
            .map(|(_, dev)| Arc::clone(dev))
            .collect()
    }

    /// Connect every registered device, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// The first [`HardwareError`] returned by a device's `connect`.
    pub fn connect_all(&self) -> Result<(), LumosError> {
        for (role, dev) in &self.devices {
            if let Err(e) = dev.connect() {
                warn!(role = %role, device = dev.id(), error = %e, "device connect failed");
                return Err(e.into());
            }
            info!(role = %role, device = dev.id(), "device connected");
        }
        Ok(())
    }

    /// Status of every registered device, in role order.
    pub fn status_all(&self) -> Vec<(DeviceRole, StatusSnapshot)> {
        self.devices
            .iter()
            .map(|(role, dev)| (*role, dev.get_status()))
            .collect()
    }
}
