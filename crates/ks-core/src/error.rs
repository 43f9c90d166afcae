//! Core error types for kubeshell

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::ConnectionId;

/// Error taxonomy shared by provisioning, connections and sessions
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Unknown connection, session or client
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already present at check time
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation attempted on a closed connection
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// Credential check failed
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed request or unusable input
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Failure reported by the cluster or shell transport
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl GatewayError {
    /// Stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            GatewayError::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            GatewayError::Unauthorized => ErrorKind::Unauthorized,
            GatewayError::Invalid(_) => ErrorKind::Invalid,
            GatewayError::Upstream(_) => ErrorKind::Upstream,
        }
    }
}

/// Failures coming from external collaborators
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The cluster API answered with a non-success status
    #[error("cluster API returned {status}: {message}")]
    Cluster { status: u16, message: String },

    /// The cluster API reported a conflicting object
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request never produced a response
    #[error("request failed: {0}")]
    Request(String),

    /// Shell transport failure
    #[error("transport: {0}")]
    Transport(String),

    /// Operation did not finish in time
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Wire name of a [`GatewayError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    ConnectionClosed,
    Unauthorized,
    Invalid,
    Upstream,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::AlreadyExists => write!(f, "already_exists"),
            ErrorKind::ConnectionClosed => write!(f, "connection_closed"),
            ErrorKind::Unauthorized => write!(f, "unauthorized"),
            ErrorKind::Invalid => write!(f, "invalid"),
            ErrorKind::Upstream => write!(f, "upstream"),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
