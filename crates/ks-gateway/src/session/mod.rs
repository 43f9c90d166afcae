//! Session management

mod multiplexer;

pub use multiplexer::{SessionMultiplexer, SessionRecord, SessionSnapshot};
