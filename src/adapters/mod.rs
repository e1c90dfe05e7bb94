//! Command link implementations
//!
//! This module contains the request/response transport to the stage
//! controller, providing line-oriented I/O for the protocol layer.

pub mod mock;
pub mod serial_adapter;

pub use mock::MockAdapter;
pub use serial_adapter::SerialAdapter;

use crate::error::ScanResult;
use async_trait::async_trait;

/// Line-oriented transport to the controller.
///
/// `send` appends the record terminator. `receive_line` blocks until a
/// terminator is seen or the link's timeout elapses; on timeout it returns
/// whatever partial data arrived (possibly nothing), so callers must parse
/// replies defensively.
#[async_trait]
pub trait CommandLink: Send {
    /// Transmit one command.
    async fn send(&mut self, command: &str) -> ScanResult<()>;

    /// Read one reply, without its terminator.
    async fn receive_line(&mut self) -> ScanResult<Vec<u8>>;

    /// Send a command and read its reply.
    async fn query(&mut self, command: &str) -> ScanResult<Vec<u8>> {
        self.send(command).await?;
        self.receive_line().await
    }
}

#[async_trait]
impl<L: CommandLink + ?Sized> CommandLink for Box<L> {
    async fn send(&mut self, command: &str) -> ScanResult<()> {
        (**self).send(command).await
    }

    async fn receive_line(&mut self) -> ScanResult<Vec<u8>> {
        (**self).receive_line().await
    }
}
