//! Line-oriented transports for instrument drivers.
//!
//! Drivers in [`crate::instrument`] speak text commands; a [`Transport`] only
//! moves lines back and forth. Keeping the two apart lets the drivers be
//! tested against [`MockTransport`] with scripted replies.

pub mod mock;
pub mod tcp;

pub use mock::MockTransport;
pub use tcp::TcpTransport;

use crate::error::CalResult;
use async_trait::async_trait;

/// Command/response channel to one instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resource name used in logs (address, port path).
    fn resource(&self) -> &str;

    /// Send a command without reading a reply.
    ///
    /// # Errors
    /// - `Transport` on a broken connection
    async fn write(&self, command: &str) -> CalResult<()>;

    /// Send a command and read one reply line, trimmed of its terminator.
    ///
    /// # Errors
    /// - `Transport` on a broken connection
    /// - `Timeout` if no reply arrives in time
    async fn query(&self, command: &str) -> CalResult<String>;
}
