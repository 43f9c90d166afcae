//! In-memory fakes for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use ks_core::manifest::{Deployment, Namespace, Service};
use ks_core::traits::{ClusterApi, ShellChannel, ShellConnection, ShellStream, ShellTransport};
use ks_core::types::{PodSummary, SshAuth};
use ks_core::{SshTarget, UpstreamError};

/// Password target on the default port
pub fn password_target(host: &str) -> SshTarget {
    SshTarget {
        host: host.to_string(),
        port: 22,
        username: "root".to_string(),
        auth: SshAuth::Password {
            password: "secret".to_string(),
        },
    }
}

/// Transport that hands out in-memory connections
#[derive(Default)]
pub struct FakeTransport {
    pub connect_calls: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub hang_connect: AtomicBool,
    /// New connections refuse to open shells
    pub fail_shells: AtomicBool,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The n-th connection created, in creation order
    pub fn connection(&self, n: usize) -> Arc<FakeConnection> {
        Arc::clone(&self.connections.lock().unwrap()[n])
    }
}

#[async_trait]
impl ShellTransport for FakeTransport {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn ShellConnection>, UpstreamError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport(format!(
                "connection refused: {}",
                target.address()
            )));
        }
        // Let concurrent connects interleave
        tokio::task::yield_now().await;

        let conn = Arc::new(FakeConnection::default());
        conn.fail_shell
            .store(self.fail_shells.load(Ordering::SeqCst), Ordering::SeqCst);
        self.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok(conn)
    }
}

/// An in-memory connection
#[derive(Default)]
pub struct FakeConnection {
    closed: AtomicBool,
    close_calls: AtomicUsize,
    pub fail_shell: AtomicBool,
    shells: Mutex<Vec<Arc<FakeShell>>>,
}

impl FakeConnection {
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The n-th shell opened on this connection
    pub fn shell(&self, n: usize) -> Arc<FakeShell> {
        Arc::clone(&self.shells.lock().unwrap()[n])
    }
}

#[async_trait]
impl ShellConnection for FakeConnection {
    async fn shell(&self) -> Result<ShellStream, UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::Transport("connection is closed".to_string()));
        }
        if self.fail_shell.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("shell request denied".to_string()));
        }

        let (tx, rx) = mpsc::channel(64);
        let shell = Arc::new(FakeShell {
            written: Mutex::new(Vec::new()),
            output: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        self.shells.lock().unwrap().push(Arc::clone(&shell));

        Ok(ShellStream {
            channel: shell,
            output: rx,
        })
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// An in-memory shell recording every byte written to it
pub struct FakeShell {
    written: Mutex<Vec<u8>>,
    output: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
}

impl FakeShell {
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push a chunk of output as if the remote shell produced it
    pub async fn emit(&self, data: &[u8]) {
        let tx = self.output.lock().unwrap().clone();
        if let Some(tx) = tx {
            tx.send(Bytes::copy_from_slice(data)).await.unwrap();
        }
    }

    /// End the output stream as if the remote shell exited
    pub fn finish(&self) {
        self.output.lock().unwrap().take();
    }
}

#[async_trait]
impl ShellChannel for FakeShell {
    async fn write(&self, data: &[u8]) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::Transport("shell is closed".to_string()));
        }
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.closed.store(true, Ordering::SeqCst);
        self.finish();
        Ok(())
    }
}

#[derive(Default)]
struct ClusterObjects {
    namespaces: Vec<String>,
    deployments: Vec<Deployment>,
    services: Vec<Service>,
}

/// In-memory cluster that rejects duplicate objects with `Conflict`
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<ClusterObjects>,
    /// `list_deployments` returns nothing, as a lagging cache would
    pub stale_lists: AtomicBool,
    pub fail_create_deployment: AtomicBool,
    pub hang_list: AtomicBool,
    pub namespace_creates: AtomicUsize,
    pub list_pods_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.objects.lock().unwrap().namespaces.clone()
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.objects.lock().unwrap().deployments.clone()
    }

    pub fn services(&self) -> Vec<Service> {
        self.objects.lock().unwrap().services.clone()
    }

    /// Seed a namespace without going through the provisioner
    pub fn add_namespace(&self, name: &str) {
        self.objects.lock().unwrap().namespaces.push(name.to_string());
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>, UpstreamError> {
        if self.hang_list.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.namespaces())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), UpstreamError> {
        self.namespace_creates.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock().unwrap();
        let name = &namespace.metadata.name;
        if objects.namespaces.contains(name) {
            return Err(UpstreamError::Conflict(format!("namespaces \"{}\" already exists", name)));
        }
        objects.namespaces.push(name.clone());
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<String>, UpstreamError> {
        if self.stale_lists.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .deployments
            .iter()
            .filter(|d| d.metadata.namespace.as_deref() == Some(namespace))
            .map(|d| d.metadata.name.clone())
            .collect())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), UpstreamError> {
        if self.fail_create_deployment.load(Ordering::SeqCst) {
            return Err(UpstreamError::Cluster {
                status: 500,
                message: "etcd unavailable".to_string(),
            });
        }
        let mut objects = self.objects.lock().unwrap();
        let exists = objects
            .deployments
            .iter()
            .any(|d| d.metadata == deployment.metadata);
        if exists {
            return Err(UpstreamError::Conflict(format!(
                "deployments.apps \"{}\" already exists",
                deployment.metadata.name
            )));
        }
        objects.deployments.push(deployment.clone());
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<u16, UpstreamError> {
        let mut objects = self.objects.lock().unwrap();
        let exists = objects
            .services
            .iter()
            .any(|s| s.metadata.name == service.metadata.name);
        if exists {
            return Err(UpstreamError::Conflict(format!(
                "services \"{}\" already exists",
                service.metadata.name
            )));
        }
        let node_port = 30000 + objects.services.len() as u16;
        let mut stored = service.clone();
        for port in &mut stored.spec.ports {
            port.node_port = Some(node_port);
        }
        objects.services.push(stored);
        Ok(node_port)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>, UpstreamError> {
        self.list_pods_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .deployments
            .iter()
            .filter(|d| d.metadata.namespace.as_deref() == Some(namespace))
            .map(|d| PodSummary {
                name: format!("{}-0", d.metadata.name),
                phase: Some("Running".to_string()),
            })
            .collect())
    }
}
