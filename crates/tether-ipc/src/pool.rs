use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use futures::future::join_all;
use tether_core::{Direction, EndpointId, NORMAL_CLOSURE};
use tokio::sync::Mutex;

use crate::{IpcError, MessageHandler, Socket, Transport};

type PoolKey = (Direction, EndpointId);
type PoolMap = HashMap<PoolKey, PooledConnection>;

#[derive(Debug)]
struct PooledConnection {
    socket: Arc<Socket>,
    /// Claims on a write socket; always 1 for read sockets.
    ref_count: usize,
}

/// Physical sockets shared by every channel of one hub.
///
/// At most one read socket exists per endpoint; write sockets are shared and
/// reference counted. Entries disappear when their socket closes. Sockets are
/// closed only after their entry is gone and the pool lock is released.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    entries: Arc<Mutex<PoolMap>>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns a live socket for `(direction, endpoint)`, opening one if needed.
    pub async fn acquire(
        &self,
        direction: Direction,
        endpoint: &EndpointId,
        on_message: Option<MessageHandler>,
    ) -> Result<Arc<Socket>, IpcError> {
        if direction == Direction::Write && on_message.is_some() {
            return Err(IpcError::InvalidConfiguration(
                "write sockets do not take a message handler".to_string(),
            ));
        }

        let key = (direction, endpoint.clone());
        let mut entries = self.entries.lock().await;
        if entries
            .get(&key)
            .is_some_and(|entry| !entry.socket.is_live())
        {
            entries.remove(&key);
            tracing::debug!(endpoint = %endpoint, direction = %direction, "evicted dead connection");
        }

        if let Some(entry) = entries.get_mut(&key) {
            if direction == Direction::Read {
                return Err(IpcError::DuplicateReader {
                    endpoint: endpoint.clone(),
                });
            }
            entry.ref_count += 1;
            return Ok(Arc::clone(&entry.socket));
        }

        let socket = Arc::new(self.transport.open(endpoint, direction, on_message).await?);
        entries.insert(
            key.clone(),
            PooledConnection {
                socket: Arc::clone(&socket),
                ref_count: 1,
            },
        );
        self.watch(key, &socket);
        Ok(socket)
    }

    /// Drops one claim on `(direction, endpoint)`. Read sockets close at once;
    /// write sockets close with their last claim. Unknown keys are ignored.
    pub async fn release(&self, direction: Direction, endpoint: &EndpointId) {
        let key = (direction, endpoint.clone());
        let released = take_claim(&mut *self.entries.lock().await, &key);
        if let Some(socket) = released {
            socket.close(NORMAL_CLOSURE).await;
        }
    }

    /// Like [`ConnectionPool::release`], but only if the pooled socket is
    /// still `socket`. Claims on an evicted socket are already gone.
    pub async fn release_socket(&self, socket: &Arc<Socket>) {
        let key = (socket.direction(), socket.endpoint().clone());
        let released = {
            let mut entries = self.entries.lock().await;
            let current = entries
                .get(&key)
                .is_some_and(|entry| Arc::ptr_eq(&entry.socket, socket));
            if !current {
                return;
            }
            take_claim(&mut entries, &key)
        };
        if let Some(socket) = released {
            socket.close(NORMAL_CLOSURE).await;
        }
    }

    /// Closes every pooled socket concurrently and empties the pool.
    pub async fn release_all(&self) {
        let sockets: Vec<_> = self
            .entries
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry.socket)
            .collect();
        tracing::debug!(count = sockets.len(), "releasing all connections");
        join_all(sockets.iter().map(|socket| socket.close(NORMAL_CLOSURE))).await;
    }

    /// True if the pool holds a live socket for `(direction, endpoint)`.
    pub async fn contains(&self, direction: Direction, endpoint: &EndpointId) -> bool {
        self.entries
            .lock()
            .await
            .get(&(direction, endpoint.clone()))
            .is_some_and(|entry| entry.socket.is_live())
    }

    pub async fn ref_count(&self, direction: Direction, endpoint: &EndpointId) -> Option<usize> {
        self.entries
            .lock()
            .await
            .get(&(direction, endpoint.clone()))
            .map(|entry| entry.ref_count)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Evicts the entry for `socket` once it closes, whoever closed it.
    fn watch(&self, key: PoolKey, socket: &Arc<Socket>) {
        let closed = socket.closed_signal();
        let watched: Weak<Socket> = Arc::downgrade(socket);
        let entries: Weak<Mutex<PoolMap>> = Arc::downgrade(&self.entries);

        tokio::spawn(async move {
            closed.await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            let mut entries = entries.lock().await;
            let same = entries
                .get(&key)
                .is_some_and(|entry| Arc::as_ptr(&entry.socket) == watched.as_ptr());
            if same {
                entries.remove(&key);
                tracing::debug!(endpoint = %key.1, direction = %key.0, "connection closed, evicted");
            }
        });
    }
}

/// Removes one claim and returns the socket if it must now be closed.
fn take_claim(entries: &mut PoolMap, key: &PoolKey) -> Option<Arc<Socket>> {
    let entry = entries.get_mut(key)?;
    if key.0 == Direction::Write && entry.ref_count > 1 {
        entry.ref_count -= 1;
        return None;
    }
    entries.remove(key).map(|entry| entry.socket)
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}
