//! User-mode NAT network transport bridge
//!
//! This crate connects a virtualized guest's emulated network interface
//! to an embedded user-mode TCP/IP engine of the slirp family. The
//! engine is single-threaded, so a dedicated NAT thread owns it and
//! everything it touches: the poll descriptor set handed to the host,
//! the deadline list of engine timers and the engine work queue. Guest
//! device threads submit frames through a locked transmit window; a
//! separate receive thread back-pressures packet delivery into the
//! guest; a one-byte wakeup channel steers the poller out of its wait
//! whenever work arrives from another thread.
//!
//! The engine itself and the emulated device are trait objects supplied
//! by the embedder; see [`engine::NatEngine`] and [`device::DevicePort`].

pub mod buffer;
pub mod config;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
pub mod poll;
pub mod queue;
pub mod stats;
pub mod timer;
pub mod wakeup;

#[cfg(test)]
mod tests;

pub use buffer::{FrameBuf, GsoDescriptor, MAX_FRAME_SIZE};
pub use config::{ConfigNode, ConfigValue, NatConfig, PortForward};
pub use device::{DevicePort, RecvWaitError};
pub use driver::{LinkState, NatDriver, Transmit};
pub use engine::{DnsConfig, EngineConfig, EngineFactory, EngineHost, NatEngine};
pub use error::NatError;
pub use stats::NatStats;
