//! Per-client link between a socket and the gateway components
//!
//! A [`ClientLink`] owns one client's state machine. It is fed decoded
//! frames by the socket loop and pushes events and shell output onto an
//! outbound queue that the socket drains in order.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ks_core::traits::ShellOutput;
use ks_core::wire::{ClientMessage, ServerEvent};
use ks_core::{ClientId, ConnectionId, GatewayError, SessionId, SshTarget};

use crate::state::GatewayState;

/// Item queued for delivery to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Control event, sent as a JSON text frame
    Event(ServerEvent),
    /// Shell output, sent as a binary frame with exactly these bytes
    Output(Bytes),
}

/// Where a client is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Socket up, no connection yet
    Idle,
    /// Connection open but the shell failed to open
    Connected { connection_id: ConnectionId },
    /// Connection and shell open
    ShellOpen {
        connection_id: ConnectionId,
        session_id: SessionId,
    },
}

/// One client's view of the gateway
pub struct ClientLink {
    client_id: ClientId,
    state: Arc<GatewayState>,
    phase: ClientPhase,
    outbound: mpsc::Sender<Outbound>,
    /// `user@host:port` of the held connection
    target_key: Option<String>,
    /// Task relaying shell output to `outbound`
    forwarder: Option<JoinHandle<()>>,
}

impl ClientLink {
    /// Create a link for a newly connected client
    pub fn new(client_id: ClientId, state: Arc<GatewayState>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            client_id,
            state,
            phase: ClientPhase::Idle,
            outbound,
            target_key: None,
            forwarder: None,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Handle a JSON control frame
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::ConnectSsh(target)) => self.connect_ssh(target).await,
            Ok(ClientMessage::ShellMessage { data }) => self.handle_input(data.as_bytes()).await,
            Err(e) => {
                tracing::debug!("Malformed frame from client {}: {}", self.client_id, e);
                let error = GatewayError::Invalid(format!("malformed message: {}", e));
                self.send(Outbound::Event(ServerEvent::from_error(&error))).await;
            }
        }
    }

    /// Handle raw shell input
    pub async fn handle_input(&mut self, data: &[u8]) {
        if let Err(e) = self
            .state
            .sessions
            .send_shell_message(&self.client_id, data)
            .await
        {
            tracing::debug!("Shell input from client {} rejected: {}", self.client_id, e);
            self.send(Outbound::Event(ServerEvent::from_error(&e))).await;
        }
    }

    async fn connect_ssh(&mut self, target: SshTarget) {
        if let Err(e) = self.open(target).await {
            self.send(Outbound::Event(ServerEvent::from_error(&e))).await;
        }
    }

    async fn open(&mut self, target: SshTarget) -> Result<(), GatewayError> {
        let held = match self.phase {
            ClientPhase::ShellOpen {
                connection_id,
                session_id,
            } => {
                let still_open = self
                    .state
                    .sessions
                    .get(session_id)
                    .await
                    .is_some_and(|s| s.is_open);
                if still_open {
                    return Err(GatewayError::AlreadyExists(format!(
                        "shell {} for client {}",
                        session_id, self.client_id
                    )));
                }
                Some(connection_id)
            }
            ClientPhase::Connected { connection_id } => Some(connection_id),
            ClientPhase::Idle => None,
        };

        let key = target_key(&target);
        if let Some(connection_id) = held {
            if self.target_key.as_deref() == Some(key.as_str()) {
                // Same target: reuse the connection for a new shell, and
                // drop it when it can no longer open one
                let result = self.open_shell(connection_id).await;
                if result.is_err() {
                    self.release(connection_id).await;
                }
                return result;
            }
            tracing::info!(
                "Client {} switched target to {}, dropping {}",
                self.client_id,
                target.address(),
                connection_id
            );
            self.release(connection_id).await;
        }

        let record = self
            .state
            .connections
            .connect_to_server(&target, &self.client_id)
            .await?;
        self.phase = ClientPhase::Connected {
            connection_id: record.id,
        };
        self.target_key = Some(key);
        self.open_shell(record.id).await
    }

    async fn open_shell(&mut self, connection_id: ConnectionId) -> Result<(), GatewayError> {
        let (session, output) = self
            .state
            .sessions
            .open_shell_session(connection_id, &self.client_id)
            .await?;

        self.phase = ClientPhase::ShellOpen {
            connection_id,
            session_id: session.id,
        };

        // The event goes out before any output the shell produces
        self.send(Outbound::Event(ServerEvent::Connected {
            client_id: self.client_id.clone(),
            connection_id,
            session_id: session.id,
        }))
        .await;
        self.spawn_forwarder(session.id, output);
        Ok(())
    }

    /// Close the connection this link holds and go back to `Idle`
    async fn release(&mut self, connection_id: ConnectionId) {
        if let Err(e) = self.state.connections.close_connection(connection_id).await {
            tracing::warn!(
                "Failed to close {} for client {}: {}",
                connection_id,
                self.client_id,
                e
            );
        }
        self.phase = ClientPhase::Idle;
        self.target_key = None;
    }

    fn spawn_forwarder(&mut self, session_id: SessionId, mut output: ShellOutput) {
        if let Some(previous) = self.forwarder.take() {
            previous.abort();
        }

        let outbound = self.outbound.clone();
        let sessions = Arc::clone(&self.state.sessions);
        let client_id = self.client_id.clone();

        self.forwarder = Some(tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                tracing::trace!("{} bytes from {} to client {}", chunk.len(), session_id, client_id);
                if outbound.send(Outbound::Output(chunk)).await.is_err() {
                    return;
                }
            }

            tracing::info!("Shell {} of client {} ended", session_id, client_id);
            sessions.mark_closed(session_id).await;
            let _ = outbound
                .send(Outbound::Event(ServerEvent::ShellClosed { session_id }))
                .await;
        }));
    }

    /// Tear down everything this client opened.
    ///
    /// Closes the client's connection, then its sessions.
    pub async fn disconnect(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        let held = match self.phase {
            ClientPhase::Connected { connection_id }
            | ClientPhase::ShellOpen { connection_id, .. } => Some(connection_id),
            ClientPhase::Idle => None,
        };
        let id = match held {
            Some(id) => Some(id),
            None => self.state.connections.get_connection_id(&self.client_id).await,
        };
        if let Some(id) = id {
            if let Err(e) = self.state.connections.close_connection(id).await {
                tracing::warn!("Failed to close {} for client {}: {}", id, self.client_id, e);
            }
        }

        let closed = self.state.sessions.close_client_sessions(&self.client_id).await;
        tracing::info!(
            "Client {} disconnected ({} shell{} closed)",
            self.client_id,
            closed,
            if closed == 1 { "" } else { "s" }
        );
        self.phase = ClientPhase::Idle;
        self.target_key = None;
    }

    async fn send(&self, item: Outbound) {
        if self.outbound.send(item).await.is_err() {
            tracing::debug!("Client {} is gone, dropping outbound item", self.client_id);
        }
    }
}

fn target_key(target: &SshTarget) -> String {
    format!("{}@{}", target.username, target.address())
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
