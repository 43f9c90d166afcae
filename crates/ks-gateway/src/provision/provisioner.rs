//! Resource provisioner
//!
//! Ensures a namespace, a deployment and a NodePort service exist for a
//! (user, image) pair. The cluster is the only source of truth: every call
//! queries it again, nothing is cached in-process.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use ks_core::manifest::Namespace;
use ks_core::traits::ClusterApi;
use ks_core::types::{is_dns_label, Endpoint, Environment, PodSummary, ResourceNames};
use ks_core::{GatewayError, ImageRef, UpstreamError, UserIdentity};

use super::manifests::{deployment_manifest, service_manifest};

/// Provisions per-user environments in the cluster
pub struct Provisioner {
    cluster: Arc<dyn ClusterApi>,
    /// Port the environment's SSH daemon listens on
    ssh_port: u16,
    /// Node address reported with endpoints
    node_host: Option<String>,
    /// Bound on a whole provisioning run
    timeout: Duration,
    /// One lock per deployment name, serializing concurrent runs for the
    /// same (user, image)
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl Provisioner {
    /// Create a new provisioner
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        ssh_port: u16,
        node_host: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            ssh_port,
            node_host,
            timeout,
            in_flight: DashMap::new(),
        }
    }

    /// Create the environment for a user and image.
    ///
    /// Fails with [`GatewayError::AlreadyExists`] when the deployment is
    /// already present, either found while checking or reported as a
    /// conflict on create. Nothing is rolled back on partial failure.
    pub async fn ensure_environment(
        &self,
        user: &UserIdentity,
        image: &ImageRef,
    ) -> Result<Environment, GatewayError> {
        let names = ResourceNames::derive(user, image)?;

        let key = names.deployment.clone();
        let lock = Arc::clone(&self.in_flight.entry(key.clone()).or_default());

        let result = {
            let _guard = lock.lock().await;
            match tokio::time::timeout(self.timeout, self.provision(user, image, &names)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        "Provisioning {} for {} timed out after {:?}",
                        image,
                        user,
                        self.timeout
                    );
                    Err(UpstreamError::Timeout("provisioning").into())
                }
            }
        };

        // Only the map and this call hold the lock when nobody is waiting
        self.in_flight
            .remove_if(&key, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    async fn provision(
        &self,
        user: &UserIdentity,
        image: &ImageRef,
        names: &ResourceNames,
    ) -> Result<Environment, GatewayError> {
        let namespaces = self
            .cluster
            .list_namespaces()
            .await
            .map_err(|e| upstream("list namespaces", e))?;

        if namespaces.iter().any(|n| n == &names.namespace) {
            let deployments = self
                .cluster
                .list_deployments(&names.namespace)
                .await
                .map_err(|e| upstream("list deployments", e))?;

            if deployments.iter().any(|d| d == &names.deployment) {
                tracing::info!(
                    "Deployment {} already exists in {}",
                    names.deployment,
                    names.namespace
                );
                return Err(GatewayError::AlreadyExists(format!(
                    "deployment {}",
                    names.deployment
                )));
            }
        } else {
            match self
                .cluster
                .create_namespace(&Namespace::new(names.namespace.clone()))
                .await
            {
                Ok(()) => tracing::info!("Created namespace {} for {}", names.namespace, user),
                Err(UpstreamError::Conflict(_)) => {
                    tracing::debug!("Namespace {} appeared concurrently", names.namespace);
                }
                Err(e) => return Err(upstream("create namespace", e)),
            }
        }

        let deployment = deployment_manifest(names, image, self.ssh_port);
        self.cluster
            .create_deployment(&deployment)
            .await
            .map_err(|e| conflict_or_upstream("create deployment", &names.deployment, e))?;

        let service = service_manifest(names, self.ssh_port);
        let node_port = self
            .cluster
            .create_service(&service)
            .await
            .map_err(|e| conflict_or_upstream("create service", &names.service, e))?;

        tracing::info!(
            "Provisioned {} for {} in {} (node port {})",
            image,
            user,
            names.namespace,
            node_port
        );

        Ok(Environment {
            owner: user.username().to_string(),
            image: image.clone(),
            namespace: names.namespace.clone(),
            deployment: names.deployment.clone(),
            service: names.service.clone(),
            endpoint: Endpoint {
                namespace: names.namespace.clone(),
                service: names.service.clone(),
                node_port,
                node_host: self.node_host.clone(),
            },
        })
    }

    /// Pods in a namespace.
    ///
    /// The name must be a DNS-1123 label; anything else is rejected as
    /// [`GatewayError::Invalid`] before the cluster is called.
    pub async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>, GatewayError> {
        if !is_dns_label(namespace) {
            return Err(GatewayError::Invalid(format!(
                "{:?} is not a valid namespace",
                namespace
            )));
        }
        self.cluster
            .list_pods(namespace)
            .await
            .map_err(|e| upstream("list pods", e))
    }
}

fn upstream(step: &str, error: UpstreamError) -> GatewayError {
    tracing::warn!("Cluster call failed ({}): {}", step, error);
    GatewayError::Upstream(error)
}

fn conflict_or_upstream(step: &str, name: &str, error: UpstreamError) -> GatewayError {
    match error {
        UpstreamError::Conflict(message) => {
            tracing::info!("{} reported a conflict for {}: {}", step, name, message);
            GatewayError::AlreadyExists(name.to_string())
        }
        other => upstream(step, other),
    }
}
