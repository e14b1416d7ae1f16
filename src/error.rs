//! Error types returned to the device port

use thiserror::Error;

/// Errors surfaced by the transmit path and buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NatError {
    /// The NAT thread is not running or the link is down.
    #[error("network is down")]
    NetDown,
    /// A resource is momentarily busy. The caller may retry.
    #[error("resource busy, try again")]
    TryAgain,
    /// The requested frame size is not acceptable.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The engine work queue refused the request.
    #[error("no buffer space available")]
    NoBufferSpace,
}
