//! ks-gateway: per-user shell environments on a shared cluster
//!
//! The gateway provisions an isolated namespace, deployment and NodePort
//! service for each (user, image) pair, opens SSH connections to remote
//! shells on behalf of WebSocket clients, and relays shell traffic in both
//! directions.

pub mod auth;
pub mod cluster;
pub mod connection;
pub mod provision;
pub mod server;
pub mod session;
pub mod ssh;
pub mod state;

#[cfg(test)]
mod testing;

pub use state::GatewayState;
