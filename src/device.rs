//! Device port interface
//!
//! The device port is the emulator-side sink and source of Ethernet
//! frames. The emulated network adapter implements this trait; the
//! receive thread delivers packets through it under the device-access
//! lock.

use std::time::Duration;

use thiserror::Error;

/// Failure modes of [`DevicePort::wait_receive_available`].
///
/// `Timeout` and `Interrupted` are transient and tolerated by the
/// receive path. Anything else indicates a broken device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecvWaitError {
    #[error("timed out waiting for receive buffers")]
    Timeout,
    #[error("wait was interrupted")]
    Interrupted,
    #[error("device error: {0}")]
    Other(String),
}

/// Guest-facing emulated network device.
pub trait DevicePort: Send + Sync {
    /// Blocks until the device can accept a received frame.
    ///
    /// `timeout` of `None` waits indefinitely.
    fn wait_receive_available(&self, timeout: Option<Duration>) -> Result<(), RecvWaitError>;

    /// Hands one Ethernet frame to the device.
    fn receive(&self, frame: &[u8]) -> anyhow::Result<()>;
}
