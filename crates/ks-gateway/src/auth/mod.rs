//! Identity verification
//!
//! Users and their password hashes come from the gateway configuration.

mod users;

pub use users::{hash_password, StaticUsers};
