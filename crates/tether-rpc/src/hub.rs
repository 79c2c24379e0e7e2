use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tether_core::{EndpointId, SerializedNode};
use tether_ipc::{ConnectionPool, Transport};

use crate::{
    HandleRegistry, Host, RemoteHandle, StandardHost, TetherError, Value,
    serialize::{deserialize, serialize},
};

/// Process-wide state shared by every channel of one context: the socket
/// pool, the handle registry, the set of endpoints with a live read channel
/// and the host.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    pool: ConnectionPool,
    handles: HandleRegistry,
    readers: Mutex<HashSet<EndpointId>>,
    host: Arc<dyn Host>,
}

impl Hub {
    pub fn new(transport: Arc<dyn Transport>, host: Arc<dyn Host>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                pool: ConnectionPool::new(transport),
                handles: HandleRegistry::new(Arc::clone(&host)),
                readers: Mutex::new(HashSet::new()),
                host,
            }),
        }
    }

    /// Hub with a [`StandardHost`].
    pub fn with_transport(transport: impl Transport) -> Self {
        Self::new(Arc::new(transport), Arc::new(StandardHost::new()))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn handles(&self) -> &HandleRegistry {
        &self.inner.handles
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.inner.host
    }

    /// Pins `value` in this hub's registry.
    pub fn register_handle(&self, value: Value) -> RemoteHandle {
        self.inner.handles.register(value)
    }

    pub fn serialize(&self, value: &Value) -> Result<SerializedNode, TetherError> {
        serialize(value, self.inner.host.as_ref())
    }

    pub fn deserialize(&self, node: SerializedNode) -> Result<Value, TetherError> {
        deserialize(node, self)
    }

    /// Closes every pooled socket and forgets all registered handles.
    pub async fn shutdown(&self) {
        self.inner.pool.release_all().await;
        self.inner.handles.clear();
        tracing::debug!("hub shut down");
    }

    /// Reserves `endpoint` for one read channel.
    pub(crate) fn claim_reader(&self, endpoint: &EndpointId) -> Result<(), TetherError> {
        let mut readers = self
            .inner
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !readers.insert(endpoint.clone()) {
            return Err(TetherError::DuplicateReader {
                endpoint: endpoint.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn release_reader(&self, endpoint: &EndpointId) {
        self.inner
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("handles", &self.inner.handles.len())
            .finish_non_exhaustive()
    }
}
