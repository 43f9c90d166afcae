//! Manifests for the objects backing an environment

use ks_core::manifest::{
    Container, ContainerPort, Deployment, DeploymentSpec, LabelSelector, ObjectMeta, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use ks_core::types::ResourceNames;
use ks_core::ImageRef;

/// Single-replica deployment running `image` with `port` exposed
pub fn deployment_manifest(names: &ResourceNames, image: &ImageRef, port: u16) -> Deployment {
    let labels = names.labels();
    Deployment {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        metadata: ObjectMeta {
            name: names.deployment.clone(),
            namespace: Some(names.namespace.clone()),
            labels: labels.clone(),
        },
        spec: DeploymentSpec {
            replicas: 1,
            selector: LabelSelector {
                match_labels: labels.clone(),
            },
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels,
                    ..ObjectMeta::default()
                },
                spec: PodSpec {
                    containers: vec![Container {
                        name: names.container.clone(),
                        image: image.as_str().to_string(),
                        ports: vec![ContainerPort {
                            container_port: port,
                        }],
                    }],
                },
            },
        },
    }
}

/// NodePort service selecting the deployment's pods
pub fn service_manifest(names: &ResourceNames, port: u16) -> Service {
    Service {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        metadata: ObjectMeta {
            name: names.service.clone(),
            namespace: Some(names.namespace.clone()),
            labels: names.labels(),
        },
        spec: ServiceSpec {
            service_type: "NodePort".to_string(),
            selector: names.labels(),
            ports: vec![ServicePort {
                protocol: "TCP".to_string(),
                port,
                target_port: port,
                node_port: None,
            }],
        },
    }
}
