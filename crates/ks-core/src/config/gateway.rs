//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::SSH_CONTAINER_PORT;

/// In-cluster service account token location
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// In-cluster service account CA bundle location
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Configuration for the gateway daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind the HTTP/WebSocket server to
    pub bind_address: String,

    /// Timeout for SSH connect and shell open, in seconds
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout for a whole provisioning run, in seconds
    #[serde(with = "duration_secs")]
    pub provision_timeout: Duration,

    /// Number of output chunks buffered per shell before backpressure
    pub output_buffer: usize,

    /// Port exposed by provisioned containers
    pub ssh_port: u16,

    /// Cluster API access
    pub cluster: ClusterConfig,

    /// Users allowed to provision environments
    pub users: Vec<UserEntry>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            connect_timeout: Duration::from_secs(15),
            provision_timeout: Duration::from_secs(60),
            output_buffer: 256,
            ssh_port: SSH_CONTAINER_PORT,
            cluster: ClusterConfig::default(),
            users: Vec::new(),
        }
    }
}

/// How to reach the Kubernetes API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// API server base URL
    pub api_url: String,

    /// Bearer token (takes precedence over `token_path`)
    pub token: Option<String>,

    /// File containing the bearer token
    pub token_path: Option<PathBuf>,

    /// PEM bundle used to verify the API server
    pub ca_cert_path: Option<PathBuf>,

    /// Skip TLS verification (development clusters only)
    pub accept_invalid_certs: bool,

    /// Address of a cluster node, reported with allocated node ports
    pub node_host: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            token: None,
            token_path: Some(PathBuf::from(SERVICE_ACCOUNT_TOKEN)),
            ca_cert_path: Some(PathBuf::from(SERVICE_ACCOUNT_CA)),
            accept_invalid_certs: false,
            node_host: None,
        }
    }
}

/// A user entry for the static identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    /// Unique username
    pub username: String,
    /// Hex encoded SHA-256 of the password
    pub password_sha256: String,
}
