//! Shared gateway state

use std::sync::Arc;

use ks_core::config::GatewayConfig;
use ks_core::traits::{ClusterApi, IdentityProvider, ShellTransport};

use crate::connection::ConnectionRegistry;
use crate::provision::Provisioner;
use crate::session::SessionMultiplexer;

/// State shared by every HTTP request and WebSocket client
pub struct GatewayState {
    /// Configuration
    pub config: GatewayConfig,
    /// Credential checks
    pub identity: Arc<dyn IdentityProvider>,
    /// Environment provisioning
    pub provisioner: Arc<Provisioner>,
    /// Remote-shell connections
    pub connections: Arc<ConnectionRegistry>,
    /// Shell sessions on those connections
    pub sessions: Arc<SessionMultiplexer>,
}

impl GatewayState {
    /// Wire the gateway's components to their external collaborators
    pub fn new(
        config: GatewayConfig,
        identity: Arc<dyn IdentityProvider>,
        cluster: Arc<dyn ClusterApi>,
        transport: Arc<dyn ShellTransport>,
    ) -> Self {
        let provisioner = Arc::new(Provisioner::new(
            cluster,
            config.ssh_port,
            config.cluster.node_host.clone(),
            config.provision_timeout,
        ));
        let connections = Arc::new(ConnectionRegistry::new(transport, config.connect_timeout));
        let sessions = Arc::new(SessionMultiplexer::new(
            Arc::clone(&connections),
            config.connect_timeout,
        ));

        Self {
            config,
            identity,
            provisioner,
            connections,
            sessions,
        }
    }
}
