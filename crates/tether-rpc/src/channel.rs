//! Read and write halves of logical channels.
//!
//! A channel binds an endpoint id to a pooled socket on first use. Closing a
//! channel is terminal: it gives up the pooled claim, and later `connect` or
//! `send` calls fail with [`TetherError::ChannelClosed`].

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use serde::Serialize;
use serde_json::Value as Json;
use tether_core::{ControlFrame, Direction, EndpointId};
use tether_ipc::{MessageHandler, Socket, SocketState, codec::encode_text};
use tokio::sync::{Mutex as AsyncMutex, oneshot};

use crate::{Hub, TetherError};

/// Callback receiving every decoded message of a read channel.
pub type Listener = Arc<dyn Fn(&Json) + Send + Sync>;

/// Callback receiving the raw JSON text of every message.
pub(crate) type TextListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Json(Listener),
    Text(TextListener),
}

/// Token returned by [`ReadChannel::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Default)]
struct Slot {
    socket: Option<Arc<Socket>>,
    closed: bool,
}

impl Slot {
    fn state(&self) -> ChannelState {
        if self.closed {
            return ChannelState::Closed;
        }
        match &self.socket {
            Some(socket) if socket.state() == SocketState::Connecting => ChannelState::Connecting,
            Some(socket) if socket.is_live() => ChannelState::Connected,
            _ => ChannelState::Unconnected,
        }
    }

    fn live_socket(&self) -> Option<&Arc<Socket>> {
        self.socket.as_ref().filter(|socket| socket.is_live())
    }
}

/// Subscriber list of a read channel.
#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    entries: Vec<(ListenerId, Subscriber)>,
    closed: bool,
}

impl Listeners {
    fn add(&self, listener: Subscriber) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.lock();
        // A closed channel never delivers again; dropping the listener
        // releases whatever it captured.
        if !state.closed {
            state.entries.push((id, listener));
        }
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|(entry, _)| *entry != id);
        let removed = state.entries.len() != before;
        if removed {
            tracing::trace!(listener = id.0, "listener removed");
        }
        removed
    }

    fn close(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        drop(drained);
    }

    /// Calls every listener in subscription order. Listeners may add or
    /// remove listeners; changes apply from the next message on.
    ///
    /// The text is parsed into [`Json`] once, and only if a JSON listener is
    /// subscribed. Text that does not parse still reaches text listeners.
    fn dispatch(&self, endpoint: &EndpointId, text: &str) {
        let snapshot: Vec<Subscriber> = self
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        let mut parsed: Option<Option<Json>> = None;
        for listener in snapshot {
            match listener {
                Subscriber::Text(listener) => listener(text),
                Subscriber::Json(listener) => {
                    let message = parsed.get_or_insert_with(|| {
                        serde_json::from_str::<Json>(text)
                            .inspect_err(|err| {
                                tracing::warn!(
                                    error = %err,
                                    endpoint = %endpoint,
                                    "dropping undecodable message"
                                );
                            })
                            .ok()
                    });
                    if let Some(message) = message {
                        listener(message);
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving half of an endpoint. At most one exists per endpoint and hub.
pub struct ReadChannel {
    hub: Hub,
    endpoint: EndpointId,
    slot: AsyncMutex<Slot>,
    listeners: Arc<Listeners>,
}

impl ReadChannel {
    /// Fails with [`TetherError::DuplicateReader`] if the hub already has a
    /// read channel for `endpoint`.
    pub fn new(hub: &Hub, endpoint: EndpointId) -> Result<Self, TetherError> {
        hub.claim_reader(&endpoint)?;
        Ok(Self {
            hub: hub.clone(),
            endpoint,
            slot: AsyncMutex::new(Slot::default()),
            listeners: Arc::new(Listeners::default()),
        })
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub async fn state(&self) -> ChannelState {
        self.slot.lock().await.state()
    }

    /// Opens the read socket unless one is already live.
    pub async fn connect(&self) -> Result<(), TetherError> {
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return Err(TetherError::ChannelClosed {
                endpoint: self.endpoint.clone(),
            });
        }
        if slot.live_socket().is_some() {
            return Ok(());
        }

        let listeners = Arc::clone(&self.listeners);
        let endpoint = self.endpoint.clone();
        let handler: MessageHandler =
            Arc::new(move |text: String| listeners.dispatch(&endpoint, &text));
        let socket = self
            .hub
            .pool()
            .acquire(Direction::Read, &self.endpoint, Some(handler))
            .await?;
        slot.socket = Some(socket);
        tracing::debug!(endpoint = %self.endpoint, "read channel connected");
        Ok(())
    }

    /// Releases the socket and the endpoint reservation. Idempotent.
    pub async fn close(&self) {
        let socket = {
            let mut slot = self.slot.lock().await;
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.socket.take()
        };
        self.listeners.close();
        if let Some(socket) = socket {
            self.hub.pool().release_socket(&socket).await;
        }
        self.hub.release_reader(&self.endpoint);
        tracing::debug!(endpoint = %self.endpoint, "read channel closed");
    }

    /// Subscribes to every later message.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Json) + Send + Sync + 'static,
    {
        self.listeners.add(Subscriber::Json(Arc::new(listener)))
    }

    /// Subscribes to the raw JSON text of every later message.
    pub(crate) fn add_text_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.add(Subscriber::Text(Arc::new(listener)))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Resolves with the next message. Subscribes immediately; dropping the
    /// future unsubscribes.
    pub fn next(&self) -> NextMessage {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let id = self
            .listeners
            .add(Subscriber::Json(Arc::new(move |message: &Json| {
                let sender = sender.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(sender) = sender {
                    let _ = sender.send(message.clone());
                }
            })));
        NextMessage {
            endpoint: self.endpoint.clone(),
            listeners: Arc::clone(&self.listeners),
            id,
            receiver,
        }
    }
}

impl Drop for ReadChannel {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        if slot.closed {
            return;
        }
        slot.closed = true;
        self.listeners.close();

        let hub = self.hub.clone();
        let endpoint = self.endpoint.clone();
        match (slot.socket.take(), tokio::runtime::Handle::try_current()) {
            (Some(socket), Ok(runtime)) => {
                runtime.spawn(async move {
                    hub.pool().release_socket(&socket).await;
                    hub.release_reader(&endpoint);
                });
            }
            _ => hub.release_reader(&endpoint),
        }
    }
}

impl fmt::Debug for ReadChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadChannel")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Future returned by [`ReadChannel::next`].
pub struct NextMessage {
    endpoint: EndpointId,
    listeners: Arc<Listeners>,
    id: ListenerId,
    receiver: oneshot::Receiver<Json>,
}

impl Future for NextMessage {
    type Output = Result<Json, TetherError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(message)) => {
                this.listeners.remove(this.id);
                Poll::Ready(Ok(message))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(TetherError::ChannelClosed {
                endpoint: this.endpoint.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for NextMessage {
    fn drop(&mut self) {
        self.listeners.remove(self.id);
    }
}

/// Sending half of an endpoint. Clones share one pooled claim.
#[derive(Clone)]
pub struct WriteChannel {
    inner: Arc<WriteInner>,
}

struct WriteInner {
    hub: Hub,
    endpoint: EndpointId,
    slot: AsyncMutex<Slot>,
}

impl WriteChannel {
    pub fn new(hub: &Hub, endpoint: EndpointId) -> Self {
        Self {
            inner: Arc::new(WriteInner {
                hub: hub.clone(),
                endpoint,
                slot: AsyncMutex::new(Slot::default()),
            }),
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.inner.endpoint
    }

    /// True if both handles share one claim.
    pub fn ptr_eq(&self, other: &WriteChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.slot.lock().await.state()
    }

    pub async fn connect(&self) -> Result<(), TetherError> {
        let mut slot = self.inner.slot.lock().await;
        self.inner.connect_locked(&mut slot).await.map(|_| ())
    }

    /// Sends one `[command, body]` frame, connecting first if needed.
    pub async fn send(&self, frame: ControlFrame) -> Result<(), TetherError> {
        let text = encode_text(&frame)?;
        let mut slot = self.inner.slot.lock().await;
        let socket = self.inner.connect_locked(&mut slot).await?;
        socket.send(text)?;
        Ok(())
    }

    /// Sends `body` as a `message` frame.
    pub async fn send_message<T: Serialize>(&self, body: &T) -> Result<(), TetherError> {
        self.send(ControlFrame::message(body)?).await
    }

    /// Disconnects the endpoint's reader until it reconnects.
    pub async fn pause(&self) -> Result<(), TetherError> {
        self.send(ControlFrame::Pause).await
    }

    /// Discards messages queued for the endpoint.
    pub async fn delete(&self) -> Result<(), TetherError> {
        self.send(ControlFrame::Delete).await
    }

    /// Gives up this channel's claim. Idempotent.
    pub async fn close(&self) {
        let socket = {
            let mut slot = self.inner.slot.lock().await;
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.socket.take()
        };
        if let Some(socket) = socket {
            self.inner.hub.pool().release_socket(&socket).await;
        }
        tracing::debug!(endpoint = %self.inner.endpoint, "write channel closed");
    }
}

impl WriteInner {
    async fn connect_locked(&self, slot: &mut Slot) -> Result<Arc<Socket>, TetherError> {
        if slot.closed {
            return Err(TetherError::ChannelClosed {
                endpoint: self.endpoint.clone(),
            });
        }
        if let Some(socket) = slot.live_socket() {
            return Ok(Arc::clone(socket));
        }

        let socket = self
            .hub
            .pool()
            .acquire(Direction::Write, &self.endpoint, None)
            .await?;
        slot.socket = Some(Arc::clone(&socket));
        tracing::debug!(endpoint = %self.endpoint, "write channel connected");
        Ok(socket)
    }
}

impl Drop for WriteInner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        if slot.closed {
            return;
        }
        slot.closed = true;
        let Some(socket) = slot.socket.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let hub = self.hub.clone();
            runtime.spawn(async move {
                hub.pool().release_socket(&socket).await;
            });
        }
    }
}

impl fmt::Debug for WriteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteChannel")
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

/// Creates both halves of a fresh endpoint.
pub fn channel(hub: &Hub) -> Result<(ReadChannel, WriteChannel), TetherError> {
    let endpoint = EndpointId::generate();
    let read = ReadChannel::new(hub, endpoint.clone())?;
    Ok((read, WriteChannel::new(hub, endpoint)))
}
