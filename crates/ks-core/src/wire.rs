//! Client wire protocol
//!
//! Control messages are JSON text frames tagged by `type`. Shell output is
//! sent to the client as binary frames carrying the exact bytes the remote
//! shell produced.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GatewayError};
use crate::types::{ClientId, ConnectionId, SessionId, SshTarget};

/// Message from a client to the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a connection and an interactive shell
    ConnectSsh(SshTarget),

    /// Write text to the client's shell
    ShellMessage { data: String },
}

/// Event pushed from the gateway to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection and shell are open
    Connected {
        client_id: ClientId,
        connection_id: ConnectionId,
        session_id: SessionId,
    },

    /// The remote shell ended
    ShellClosed { session_id: SessionId },

    /// Credentials were rejected
    Rejected { message: String },

    /// A request failed
    Error { kind: ErrorKind, message: String },
}

impl ServerEvent {
    /// Map a failure onto the event reported to the client
    pub fn from_error(error: &GatewayError) -> Self {
        match error {
            GatewayError::Unauthorized => ServerEvent::Rejected {
                message: error.to_string(),
            },
            other => ServerEvent::Error {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SshAuth;
    use serde_json::json;

    #[test]
    fn test_parse_connect_ssh() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "connect_ssh",
            "host": "10.0.0.2",
            "username": "root",
            "auth": { "method": "password", "password": "toor" }
        }))
        .unwrap();

        let ClientMessage::ConnectSsh(target) = msg else {
            panic!("expected connect_ssh");
        };
        assert_eq!(target.address(), "10.0.0.2:22");
        assert!(matches!(target.auth, SshAuth::Password { .. }));
    }

    #[test]
    fn test_parse_shell_message() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"shell_message","data":"ls\n"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ShellMessage { data } if data == "ls\n"));
    }

    #[test]
    fn test_unauthorized_becomes_rejected() {
        let event = ServerEvent::from_error(&GatewayError::Unauthorized);
        assert!(matches!(event, ServerEvent::Rejected { .. }));

        let event = ServerEvent::from_error(&GatewayError::ConnectionClosed(ConnectionId(4)));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "error",
                "kind": "connection_closed",
                "message": "Connection conn-4 is closed"
            })
        );
    }

    #[test]
    fn test_connected_event_shape() {
        let event = ServerEvent::Connected {
            client_id: ClientId::new("abc"),
            connection_id: ConnectionId(0),
            session_id: SessionId(0),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "connected", "client_id": "abc", "connection_id": 0, "session_id": 0})
        );
    }
}
