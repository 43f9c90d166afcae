//! Connection registry
//!
//! Owns every remote-shell connection opened by the gateway. Records are kept
//! in id order and are never removed: closing a connection only flips its
//! `is_open` flag, so closed connections stay queryable.
//!
//! Mutations are serialized by the registry's write lock and every mutation
//! publishes a fresh snapshot on a `watch` channel before the lock is
//! released, so subscribers observe snapshots in mutation order. Transport
//! I/O never runs while the lock is held.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use ks_core::traits::{ShellConnection, ShellTransport};
use ks_core::types::{ConnectionInfo, SshTarget};
use ks_core::{ClientId, ConnectionId, GatewayError, UpstreamError};

/// Snapshot of the registry published to subscribers
pub type ConnectionSnapshot = Arc<Vec<ConnectionInfo>>;

/// A tracked connection
#[derive(Clone)]
pub struct ConnectionRecord {
    /// Registry-assigned id
    pub id: ConnectionId,
    /// Client that requested the connection
    pub client_id: ClientId,
    /// `host:port` of the remote end
    pub address: String,
    /// Transport handle
    pub handle: Arc<dyn ShellConnection>,
    /// Whether the connection is still open
    pub is_open: bool,
}

impl ConnectionRecord {
    /// Serializable view without the transport handle
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            client_id: self.client_id.clone(),
            address: self.address.clone(),
            is_open: self.is_open,
        }
    }
}

struct RegistryInner {
    /// Records ordered by id
    records: Vec<ConnectionRecord>,
    /// Next id to hand out
    next_id: u64,
}

impl RegistryInner {
    fn position(&self, id: ConnectionId) -> Option<usize> {
        self.records.binary_search_by_key(&id, |r| r.id).ok()
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        Arc::new(self.records.iter().map(ConnectionRecord::info).collect())
    }
}

/// Tracks remote-shell connections by id and by client
pub struct ConnectionRegistry {
    transport: Arc<dyn ShellTransport>,
    connect_timeout: Duration,
    inner: RwLock<RegistryInner>,
    updates: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionRegistry {
    /// Create an empty registry that connects through `transport`
    pub fn new(transport: Arc<dyn ShellTransport>, connect_timeout: Duration) -> Self {
        let (updates, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            transport,
            connect_timeout,
            inner: RwLock::new(RegistryInner {
                records: Vec::new(),
                next_id: 0,
            }),
            updates,
        }
    }

    /// Open a connection for a client and start tracking it.
    ///
    /// The transport handshake runs before the record is created, so a
    /// failed connect leaves the registry untouched. Ids are assigned under
    /// the write lock and are therefore strictly increasing in sequence
    /// order no matter how concurrent connects interleave.
    pub async fn connect_to_server(
        &self,
        target: &SshTarget,
        client_id: &ClientId,
    ) -> Result<ConnectionRecord, GatewayError> {
        let address = target.address();
        tracing::debug!("Client {} connecting to {}", client_id, address);

        let handle = match tokio::time::timeout(self.connect_timeout, self.transport.connect(target))
            .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                tracing::warn!("Connection to {} for client {} failed: {}", address, client_id, e);
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(
                    "Connection to {} for client {} timed out after {:?}",
                    address,
                    client_id,
                    self.connect_timeout
                );
                return Err(UpstreamError::Timeout("connect").into());
            }
        };

        let record = {
            let mut inner = self.inner.write().await;
            let record = ConnectionRecord {
                id: ConnectionId(inner.next_id),
                client_id: client_id.clone(),
                address,
                handle,
                is_open: true,
            };
            inner.next_id += 1;
            inner.records.push(record.clone());
            self.updates.send_replace(inner.snapshot());
            record
        };

        tracing::info!(
            "Connected to host {} ({}, client {})",
            record.address,
            record.id,
            client_id
        );
        Ok(record)
    }

    /// Close a connection.
    ///
    /// Returns `true` when this call closed it and `false` when it was
    /// already closed. The record is marked closed even if the transport
    /// reports an error while shutting down.
    pub async fn close_connection(&self, id: ConnectionId) -> Result<bool, GatewayError> {
        let handle = {
            let mut inner = self.inner.write().await;
            let pos = inner
                .position(id)
                .ok_or_else(|| GatewayError::NotFound(format!("connection {}", id)))?;

            let record = &mut inner.records[pos];
            if !record.is_open {
                tracing::debug!("Connection {} already closed", id);
                return Ok(false);
            }
            record.is_open = false;
            let handle = Arc::clone(&record.handle);
            self.updates.send_replace(inner.snapshot());
            handle
        };

        if let Err(e) = handle.close().await {
            tracing::warn!("Error while closing connection {}: {}", id, e);
            return Err(e.into());
        }

        tracing::info!("Connection {} closed", id);
        Ok(true)
    }

    /// Id of the first connection (in sequence order) opened for a client.
    ///
    /// Closed connections are included; check `is_open` when the current
    /// state matters.
    pub async fn get_connection_id(&self, client_id: &ClientId) -> Option<ConnectionId> {
        self.find_by_client(client_id).await.map(|r| r.id)
    }

    /// First connection (in sequence order) opened for a client
    pub async fn find_by_client(&self, client_id: &ClientId) -> Option<ConnectionRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .iter()
            .find(|r| &r.client_id == client_id)
            .cloned()
    }

    /// Connection a client is currently using: its latest open connection,
    /// or its first one when none is open
    pub async fn find_current(&self, client_id: &ClientId) -> Option<ConnectionRecord> {
        let inner = self.inner.read().await;
        let owned: Vec<&ConnectionRecord> = inner
            .records
            .iter()
            .filter(|r| &r.client_id == client_id)
            .collect();
        owned
            .iter()
            .rev()
            .find(|r| r.is_open)
            .or_else(|| owned.first())
            .map(|r| (*r).clone())
    }

    /// Get a connection by id
    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let inner = self.inner.read().await;
        inner.position(id).map(|pos| inner.records[pos].clone())
    }

    /// Current state of every connection, in id order
    pub async fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.read().await.snapshot()
    }

    /// Observe the connection sequence.
    ///
    /// The receiver starts at the latest published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.updates.subscribe()
    }

    /// The id the next connection will receive
    pub async fn next_id(&self) -> ConnectionId {
        ConnectionId(self.inner.read().await.next_id)
    }

    /// Number of tracked connections, open or closed
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Check if no connection was ever opened
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }

    /// Number of open connections
    pub async fn open_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.records.iter().filter(|r| r.is_open).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{password_target, FakeTransport};
    use std::sync::atomic::Ordering;

    fn registry(transport: &Arc<FakeTransport>) -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            Arc::clone(transport) as Arc<dyn ShellTransport>,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_connect_assigns_sequential_ids_from_zero() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);

        let a = registry
            .connect_to_server(&password_target("a"), &ClientId::from("client-a"))
            .await
            .unwrap();
        let b = registry
            .connect_to_server(&password_target("b"), &ClientId::from("client-b"))
            .await
            .unwrap();

        assert_eq!(a.id, ConnectionId(0));
        assert_eq!(b.id, ConnectionId(1));
        assert!(a.is_open && b.is_open);
        assert_eq!(b.address, "b:22");
        assert_eq!(registry.next_id().await, ConnectionId(2));
    }

    #[tokio::test]
    async fn test_concurrent_connects_get_unique_increasing_ids() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let client = ClientId::new(format!("client-{}", i));
                registry
                    .connect_to_server(&password_target("host"), &client)
                    .await
                    .unwrap()
                    .id
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);

        let snapshot = registry.snapshot().await;
        assert!(snapshot.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(snapshot.first().unwrap().id, ConnectionId(0));
        assert_eq!(snapshot.last().unwrap().id, ConnectionId(31));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_registry_unchanged() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_connect.store(true, Ordering::SeqCst);
        let registry = registry(&transport);

        let result = registry
            .connect_to_server(&password_target("down"), &ClientId::from("c"))
            .await;

        assert!(matches!(result, Err(GatewayError::Upstream(_))));
        assert!(registry.is_empty().await);
        assert_eq!(registry.next_id().await, ConnectionId(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let transport = Arc::new(FakeTransport::new());
        transport.hang_connect.store(true, Ordering::SeqCst);
        let registry = registry(&transport);

        let result = registry
            .connect_to_server(&password_target("slow"), &ClientId::from("c"))
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::Upstream(UpstreamError::Timeout("connect")))
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_marks_closed_and_keeps_record() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        let client = ClientId::from("client");

        let record = registry
            .connect_to_server(&password_target("host"), &client)
            .await
            .unwrap();

        assert!(registry.close_connection(record.id).await.unwrap());

        let closed = registry.get(record.id).await.unwrap();
        assert!(!closed.is_open);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.open_count().await, 0);
        assert_eq!(transport.connection(0).close_calls(), 1);
        // Closed connections are still resolvable by client
        assert_eq!(registry.get_connection_id(&client).await, Some(record.id));
    }

    #[tokio::test]
    async fn test_close_twice_succeeds_without_second_transport_close() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);

        let record = registry
            .connect_to_server(&password_target("host"), &ClientId::from("c"))
            .await
            .unwrap();

        assert!(registry.close_connection(record.id).await.unwrap());
        assert!(!registry.close_connection(record.id).await.unwrap());
        assert_eq!(transport.connection(0).close_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_unknown_is_not_found_and_changes_nothing() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        registry
            .connect_to_server(&password_target("host"), &ClientId::from("c"))
            .await
            .unwrap();

        let before = registry.snapshot().await;
        let updates = registry.subscribe();

        let result = registry.close_connection(ConnectionId(99)).await;

        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        assert_eq!(registry.snapshot().await, before);
        assert!(!updates.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_get_connection_id_returns_first_match() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        let client = ClientId::from("shared");

        let first = registry
            .connect_to_server(&password_target("one"), &client)
            .await
            .unwrap();
        registry
            .connect_to_server(&password_target("other"), &ClientId::from("other"))
            .await
            .unwrap();
        registry
            .connect_to_server(&password_target("two"), &client)
            .await
            .unwrap();

        assert_eq!(registry.get_connection_id(&client).await, Some(first.id));
        assert_eq!(
            registry.get_connection_id(&ClientId::from("nobody")).await,
            None
        );
    }

    #[tokio::test]
    async fn test_find_current_prefers_latest_open() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        let client = ClientId::from("c");

        let first = registry
            .connect_to_server(&password_target("one"), &client)
            .await
            .unwrap();
        assert_eq!(registry.find_current(&client).await.unwrap().id, first.id);

        registry.close_connection(first.id).await.unwrap();
        let current = registry.find_current(&client).await.unwrap();
        assert_eq!(current.id, first.id);
        assert!(!current.is_open);

        let second = registry
            .connect_to_server(&password_target("two"), &client)
            .await
            .unwrap();
        assert_eq!(registry.find_current(&client).await.unwrap().id, second.id);
        // First-match lookup is unchanged
        assert_eq!(registry.get_connection_id(&client).await, Some(first.id));
        assert!(registry.find_current(&ClientId::from("nobody")).await.is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_every_transition() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        let mut updates = registry.subscribe();
        assert!(updates.borrow().is_empty());

        let record = registry
            .connect_to_server(&password_target("host"), &ClientId::from("c"))
            .await
            .unwrap();
        assert!(updates.has_changed().unwrap());
        {
            let snapshot = updates.borrow_and_update();
            assert_eq!(snapshot.len(), 1);
            assert!(snapshot[0].is_open);
        }

        registry.close_connection(record.id).await.unwrap();
        assert!(updates.has_changed().unwrap());
        assert!(!updates.borrow_and_update()[0].is_open);
    }
}
