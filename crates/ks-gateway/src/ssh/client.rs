//! SSH shell transport built on russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use ks_core::traits::{ShellChannel, ShellConnection, ShellStream, ShellTransport};
use ks_core::types::SshAuth;
use ks_core::{SshTarget, UpstreamError};

/// Terminal type requested for interactive shells
const TERM: &str = "xterm";

/// Initial terminal size (columns, rows)
const TERMINAL_SIZE: (u32, u32) = (80, 24);

/// Commands buffered per shell before writers wait
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Opens SSH connections with russh
pub struct RusshTransport {
    config: Arc<Config>,
    connect_timeout: Duration,
    output_buffer: usize,
}

impl RusshTransport {
    /// Create a transport.
    ///
    /// `output_buffer` bounds the number of output chunks queued per shell.
    pub fn new(connect_timeout: Duration, output_buffer: usize) -> Self {
        let config = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout,
            output_buffer: output_buffer.max(1),
        }
    }
}

#[async_trait]
impl ShellTransport for RusshTransport {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn ShellConnection>, UpstreamError> {
        let address = target.address();
        tracing::debug!("Connecting to {}", address);

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(
                Arc::clone(&self.config),
                (target.host.as_str(), target.port),
                SshClient {
                    address: address.clone(),
                },
            ),
        )
        .await
        .map_err(|_| UpstreamError::Timeout("ssh handshake"))?
        .map_err(|e| UpstreamError::Transport(format!("failed to connect to {}: {}", address, e)))?;

        tracing::debug!("Authenticating as user '{}' on {}", target.username, address);
        let authenticated = match &target.auth {
            SshAuth::Password { password } => handle
                .authenticate_password(&target.username, password)
                .await
                .map_err(|e| UpstreamError::Transport(format!("authentication error: {}", e)))?,
            SshAuth::PrivateKey { key, passphrase } => {
                let key = decode_key(key, passphrase.as_deref())?;
                handle
                    .authenticate_publickey(&target.username, Arc::new(key))
                    .await
                    .map_err(|e| UpstreamError::Transport(format!("authentication error: {}", e)))?
            }
        };

        if !authenticated {
            tracing::warn!("Authentication rejected by {}", address);
            return Err(UpstreamError::Transport(format!(
                "authentication rejected by {}",
                address
            )));
        }

        tracing::debug!("Authenticated on {}", address);
        Ok(Arc::new(RusshConnection {
            handle,
            address,
            output_buffer: self.output_buffer,
        }))
    }
}

/// Decode an OpenSSH or PEM private key
fn decode_key(key: &str, passphrase: Option<&str>) -> Result<KeyPair, UpstreamError> {
    russh_keys::decode_secret_key(key, passphrase)
        .map_err(|e| UpstreamError::Transport(format!("invalid private key: {}", e)))
}

/// An authenticated SSH connection
pub struct RusshConnection {
    handle: Handle<SshClient>,
    address: String,
    output_buffer: usize,
}

#[async_trait]
impl ShellConnection for RusshConnection {
    async fn shell(&self) -> Result<ShellStream, UpstreamError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| UpstreamError::Transport(format!("failed to open session channel: {}", e)))?;

        let (cols, rows) = TERMINAL_SIZE;
        channel
            .request_pty(false, TERM, cols, rows, 0, 0, &[])
            .await
            .map_err(|e| UpstreamError::Transport(format!("pty request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| UpstreamError::Transport(format!("shell request failed: {}", e)))?;

        tracing::debug!("Shell channel {:?} open on {}", channel.id(), self.address);

        let (output_tx, output_rx) = mpsc::channel(self.output_buffer);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(pump_channel(channel, command_rx, output_tx));

        Ok(ShellStream {
            channel: Arc::new(RusshChannel {
                commands: command_tx,
                task,
            }),
            output: output_rx,
        })
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
            .map_err(|e| UpstreamError::Transport(format!("disconnect failed: {}", e)))
    }
}

/// Requests handed to the task that owns a shell channel
enum ShellCommand {
    Write(Bytes, oneshot::Sender<Result<(), UpstreamError>>),
    Close,
}

/// Owns the russh channel: forwards output chunks in arrival order and
/// applies writes in submission order.
async fn pump_channel(
    mut channel: Channel<Msg>,
    mut commands: mpsc::Receiver<ShellCommand>,
    output: mpsc::Sender<Bytes>,
) {
    let id = channel.id();
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    tracing::trace!("Shell {:?}: {} bytes of output", id, data.len());
                    if output.send(Bytes::copy_from_slice(&data)).await.is_err() {
                        tracing::debug!("Shell {:?}: output receiver dropped", id);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    tracing::debug!("Shell {:?} exited with status {}", id, exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    tracing::debug!("Shell {:?} ended by remote", id);
                    break;
                }
                Some(_) => {}
            },

            cmd = commands.recv() => match cmd {
                Some(ShellCommand::Write(data, ack)) => {
                    let result = channel
                        .data(&data[..])
                        .await
                        .map_err(|e| UpstreamError::Transport(format!("write failed: {}", e)));
                    let _ = ack.send(result);
                }
                Some(ShellCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    tracing::debug!("Shell {:?} closed locally", id);
                    break;
                }
            },
        }
    }
}

/// Write half of a russh shell
struct RusshChannel {
    commands: mpsc::Sender<ShellCommand>,
    task: JoinHandle<()>,
}

#[async_trait]
impl ShellChannel for RusshChannel {
    async fn write(&self, data: &[u8]) -> Result<(), UpstreamError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(ShellCommand::Write(Bytes::copy_from_slice(data), ack_tx))
            .await
            .map_err(|_| UpstreamError::Transport("shell is closed".to_string()))?;
        ack_rx
            .await
            .map_err(|_| UpstreamError::Transport("shell is closed".to_string()))?
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        // The pump may already be gone if the remote ended the shell
        let _ = self.commands.send(ShellCommand::Close).await;
        Ok(())
    }
}

impl Drop for RusshChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// russh client handler
struct SshClient {
    address: String,
}

#[async_trait]
impl client::Handler for SshClient {
    type Error = anyhow::Error;

    /// Accept the host key of provisioned environments.
    ///
    /// Containers generate fresh host keys on every start, so there is
    /// nothing stable to pin against.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key for {}: {}",
            self.address,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}
