//! SSH shell transport

mod client;

pub use client::{RusshConnection, RusshTransport};
