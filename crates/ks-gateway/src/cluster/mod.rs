//! Cluster API access

mod kube;

pub use kube::KubeClient;
