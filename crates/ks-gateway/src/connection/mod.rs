//! Connection management

mod registry;

pub use registry::{ConnectionRecord, ConnectionRegistry, ConnectionSnapshot};
