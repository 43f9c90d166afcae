//! Container orchestration capability

use async_trait::async_trait;

use crate::error::UpstreamError;
use crate::manifest::{Deployment, Namespace, Service};
use crate::types::PodSummary;

/// The subset of the cluster API the provisioner relies on.
///
/// Implementations must report an object that already exists on create as
/// [`UpstreamError::Conflict`].
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of all namespaces
    async fn list_namespaces(&self) -> Result<Vec<String>, UpstreamError>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), UpstreamError>;

    /// Names of the deployments in a namespace
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<String>, UpstreamError>;

    /// Create a deployment in the namespace named by its metadata
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), UpstreamError>;

    /// Create a service, returning the node port the cluster allocated
    async fn create_service(&self, service: &Service) -> Result<u16, UpstreamError>;

    /// Pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>, UpstreamError>;
}
