//! Transport boundary: HTTP API and WebSocket shell relay

mod link;
mod listener;
mod routes;
mod ws;

pub use link::{ClientLink, ClientPhase, Outbound};
pub use listener::{serve, serve_on};
pub use routes::{router, ApiError};
