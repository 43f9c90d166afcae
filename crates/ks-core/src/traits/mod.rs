//! Capabilities consumed from external collaborators

mod cluster;
mod identity;
mod shell;

pub use cluster::ClusterApi;
pub use identity::IdentityProvider;
pub use shell::{ShellChannel, ShellConnection, ShellOutput, ShellStream, ShellTransport};
