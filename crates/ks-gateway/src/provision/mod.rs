//! Per-user environment provisioning

mod manifests;
mod provisioner;

pub use manifests::{deployment_manifest, service_manifest};
pub use provisioner::Provisioner;
