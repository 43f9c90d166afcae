//! ks-core: Core abstractions and configuration for kubeshell
//!
//! This crate provides the domain types, error taxonomy, capability traits,
//! cluster manifests, client wire protocol and configuration structures used
//! by the gateway.

pub mod config;
pub mod error;
pub mod manifest;
pub mod traits;
pub mod types;
pub mod wire;

pub use error::{ErrorKind, GatewayError, UpstreamError};
pub use types::{ClientId, ConnectionId, ImageRef, SessionId, SshTarget, UserIdentity};
