//! [`HeartbeatLink`] – the channel to the external hardware supervisor.
//!
//! The supervisor is an independent board that cuts laser power on its own
//! when heartbeats stop arriving.  The kernel's watchdog only needs to push a
//! token through this link; how the token travels (serial line, GPIO toggle,
//! CAN frame) is the implementation's business.

use async_trait::async_trait;
use lumos_types::HardwareError;

/// Outbound heartbeat channel to the external supervisor.
#[async_trait]
pub trait HeartbeatLink: Send + Sync {
    /// Deliver heartbeat `token` to the supervisor.
    ///
    /// # Errors
    ///
    /// Returns a [`HardwareError`] when the token could not be sent.  The
    /// watchdog treats any error as a local failure.
    async fn send_heartbeat(&self, token: u64) -> Result<(), HardwareError>;
}
