//! Shell session multiplexing over registered connections

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use ks_core::traits::{ShellChannel, ShellOutput};
use ks_core::types::SessionInfo;
use ks_core::{ClientId, ConnectionId, GatewayError, SessionId, UpstreamError};

use crate::connection::ConnectionRegistry;

/// Snapshot of the session sequence published to subscribers
pub type SessionSnapshot = Arc<Vec<SessionInfo>>;

/// A tracked shell session
#[derive(Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub client_id: ClientId,
    /// Connection the shell was opened on
    pub connection_id: ConnectionId,
    /// Input side of the shell
    pub channel: Arc<dyn ShellChannel>,
    pub is_open: bool,
}

impl SessionRecord {
    /// Serializable view without the channel
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            client_id: self.client_id.clone(),
            connection_id: self.connection_id,
            is_open: self.is_open,
        }
    }
}

struct MultiplexerInner {
    sessions: Vec<SessionRecord>,
    next_id: u64,
}

impl MultiplexerInner {
    fn snapshot(&self) -> SessionSnapshot {
        Arc::new(self.sessions.iter().map(SessionRecord::info).collect())
    }
}

/// Opens interactive shells on registered connections and routes client
/// input to them
pub struct SessionMultiplexer {
    registry: Arc<ConnectionRegistry>,
    open_timeout: Duration,
    inner: RwLock<MultiplexerInner>,
    updates: watch::Sender<SessionSnapshot>,
}

impl SessionMultiplexer {
    /// Create a new session multiplexer
    pub fn new(registry: Arc<ConnectionRegistry>, open_timeout: Duration) -> Self {
        let (updates, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            registry,
            open_timeout,
            inner: RwLock::new(MultiplexerInner {
                sessions: Vec::new(),
                next_id: 0,
            }),
            updates,
        }
    }

    /// Open an interactive shell on a connection.
    ///
    /// The connection is not required to be open; a closed one fails in the
    /// transport. The session id is only assigned once the shell is up.
    /// Returns the session and the ordered stream of shell output.
    pub async fn open_shell_session(
        &self,
        connection_id: ConnectionId,
        client_id: &ClientId,
    ) -> Result<(SessionInfo, ShellOutput), GatewayError> {
        let connection = self
            .registry
            .get(connection_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("connection {}", connection_id)))?;

        let stream = match tokio::time::timeout(self.open_timeout, connection.handle.shell()).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!("Failed to open shell on {}: {}", connection_id, e);
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!("Opening shell on {} timed out", connection_id);
                return Err(UpstreamError::Timeout("shell open").into());
            }
        };

        let info = {
            let mut inner = self.inner.write().await;
            let record = SessionRecord {
                id: SessionId(inner.next_id),
                client_id: client_id.clone(),
                connection_id,
                channel: stream.channel,
                is_open: true,
            };
            inner.next_id += 1;
            let info = record.info();
            inner.sessions.push(record);
            self.updates.send_replace(inner.snapshot());
            info
        };

        tracing::info!(
            "Opened shell {} on {} for client {}",
            info.id,
            connection_id,
            client_id
        );
        Ok((info, stream.output))
    }

    /// Write a client's message to its shell, byte for byte.
    ///
    /// The client's current connection must exist and be open, and the
    /// client must have an open session.
    pub async fn send_shell_message(
        &self,
        client_id: &ClientId,
        message: &[u8],
    ) -> Result<(), GatewayError> {
        let connection = self
            .registry
            .find_current(client_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("connection for client {}", client_id)))?;

        if !connection.is_open {
            return Err(GatewayError::ConnectionClosed(connection.id));
        }

        let session = self
            .find_open(client_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("shell for client {}", client_id)))?;

        tracing::trace!("Writing {} bytes to {}", message.len(), session.id);
        session.channel.write(message).await?;
        Ok(())
    }

    /// Close every open session of a client.
    ///
    /// Returns how many sessions this call closed.
    pub async fn close_client_sessions(&self, client_id: &ClientId) -> usize {
        let channels: Vec<(SessionId, Arc<dyn ShellChannel>)> = {
            let mut inner = self.inner.write().await;
            let closed: Vec<_> = inner
                .sessions
                .iter_mut()
                .filter(|s| s.is_open && &s.client_id == client_id)
                .map(|s| {
                    s.is_open = false;
                    (s.id, Arc::clone(&s.channel))
                })
                .collect();
            if !closed.is_empty() {
                self.updates.send_replace(inner.snapshot());
            }
            closed
        };

        for (id, channel) in &channels {
            if let Err(e) = channel.close().await {
                tracing::debug!("Error while closing shell {}: {}", id, e);
            }
            tracing::info!("Shell {} of client {} closed", id, client_id);
        }

        channels.len()
    }

    /// Mark a session closed after its remote end went away
    pub async fn mark_closed(&self, id: SessionId) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == id && s.is_open) {
            session.is_open = false;
            self.updates.send_replace(inner.snapshot());
        }
    }

    async fn find_open(&self, client_id: &ClientId) -> Option<SessionRecord> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .iter()
            .find(|s| s.is_open && &s.client_id == client_id)
            .cloned()
    }

    /// Get a session by ID
    pub async fn get(&self, id: SessionId) -> Option<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .iter()
            .find(|s| s.id == id)
            .map(SessionRecord::info)
    }

    /// Current state of every session, in id order
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().await.snapshot()
    }

    /// Observe the session sequence
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    /// The id the next session will receive
    pub async fn next_id(&self) -> SessionId {
        SessionId(self.inner.read().await.next_id)
    }
}
