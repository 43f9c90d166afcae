//! Remote shell transport capability

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::UpstreamError;
use crate::types::SshTarget;

/// Ordered chunks of remote shell output.
///
/// The channel closes when the remote side ends the shell.
pub type ShellOutput = mpsc::Receiver<Bytes>;

/// Opens connections to remote shell hosts
#[async_trait]
pub trait ShellTransport: Send + Sync {
    /// Connect and authenticate against a target
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn ShellConnection>, UpstreamError>;
}

/// An established, authenticated connection
#[async_trait]
pub trait ShellConnection: Send + Sync {
    /// Open an interactive shell stream
    async fn shell(&self) -> Result<ShellStream, UpstreamError>;

    /// Close the connection
    async fn close(&self) -> Result<(), UpstreamError>;
}

/// Write half of an interactive shell
#[async_trait]
pub trait ShellChannel: Send + Sync {
    /// Write bytes to the shell's stdin
    async fn write(&self, data: &[u8]) -> Result<(), UpstreamError>;

    /// Close the shell
    async fn close(&self) -> Result<(), UpstreamError>;
}

/// An open interactive shell
pub struct ShellStream {
    /// Input side
    pub channel: Arc<dyn ShellChannel>,
    /// Output side
    pub output: ShellOutput,
}
