//! Generic [`HardwareController`] trait for stages, laser drivers and any other
//! device the treatment core commands.
//!
//! Drivers implement this trait and are handed to the kernel and the engine
//! through a [`HardwareRegistry`][crate::registry::HardwareRegistry].  The
//! rest of the system only ever talks to the trait, so vendor SDK bindings can
//! be swapped without touching safety or sequencing logic.
//!
//! # Threading
//!
//! All methods take `&self`: the engine, the safety coordinator and status
//! pollers may call a controller concurrently, so implementations must be
//! internally synchronised.  In particular [`HardwareController::abort`] must
//! be callable while another thread is blocked inside a long command and must
//! make that command return promptly with
//! [`HardwareErrorKind::Aborted`][lumos_types::HardwareErrorKind::Aborted].

use std::time::Duration;

use lumos_types::{HardwareError, StatusSnapshot};

/// A physical device driver.
///
/// Device families implement only the commands they support; the provided
/// defaults answer [`HardwareError::unsupported`].
pub trait HardwareController: Send + Sync {
    /// Stable identifier, e.g. `"stage_x"` or `"laser"`.
    fn id(&self) -> &str;

    /// Open the link to the device.
    ///
    /// # Errors
    ///
    /// Returns a [`HardwareError`] if the device cannot be reached.
    fn connect(&self) -> Result<(), HardwareError>;

    /// Move to `target_mm` at `speed_mm_s`.  Blocks until the move completes
    /// or is aborted.
    ///
    /// # Errors
    ///
    /// Returns a [`HardwareError`] if the move fails or is aborted.
    fn apply_position(&self, target_mm: f64, speed_mm_s: f64) -> Result<(), HardwareError> {
        let _ = (target_mm, speed_mm_s);
        Err(HardwareError::unsupported(format!(
            "{} does not support positioning",
            self.id()
        )))
    }

    /// Set a fixed laser output.  Returns once the set-point is applied.
    ///
    /// # Errors
    ///
    /// Returns a [`HardwareError`] if the driver rejects the command.
    fn apply_laser_power(&self, watts: f64) -> Result<(), HardwareError> {
        let _ = watts;
        Err(HardwareError::unsupported(format!(
            "{} does not support laser power",
            self.id()
        )))
    }

    /// Ramp laser output linearly from `start_w` to `end_w` over `duration`.
    /// Blocks until the ramp finishes or is aborted.
    ///
    /// # Errors
    ///
    /// Returns a [`HardwareError`] if the ramp fails or is aborted.
    fn apply_laser_ramp(
        &self,
        start_w: f64,
        end_w: f64,
        duration: Duration,
    ) -> Result<(), HardwareError> {
        let _ = (start_w, end_w, duration);
        Err(HardwareError::unsupported(format!(
            "{} does not support laser ramps",
            self.id()
        )))
    }

    /// Drive to the home reference.
    ///
    /// # Errors
    ///
    /// Returns a [`HardwareError`] if homing fails.
    fn home(&self) -> Result<(), HardwareError> {
        Err(HardwareError::unsupported(format!(
            "{} does not support homing",
            self.id()
        )))
    }

    /// Latest known device status.  Never blocks on a running command.
    fn get_status(&self) -> StatusSnapshot;

    /// Best-effort immediate halt of whatever the device is doing.  For
    /// energy emitters this also drops output to zero.
    ///
    /// # Errors
    ///
    /// Returns a [`HardwareError`] if the halt request could not be sent.
    fn abort(&self) -> Result<(), HardwareError>;
}
