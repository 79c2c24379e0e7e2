//! Request/response calls between contexts.
//!
//! A [`CommandEndpoint`] serves `executeScript` and `postMessage` requests
//! arriving on its read channel. A [`RemoteWindow`] sends those requests and
//! collects responses on a private inbox channel.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::BoxFuture;
use tether_core::{
    CallId, CallOutcome, Command, ControlFrame, EndpointId, ExceptionDetails, ExecuteScriptParams,
    PostMessageParams, RequestHeader, RpcRequest, RpcResponse, SerializedNode,
};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};

use crate::{
    ChannelState, ErrorValue, Function, Hub, ReadChannel, TetherError, Value, WriteChannel, channel,
};

/// Callback receiving values posted to a command endpoint.
pub type PostMessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Token returned by [`CommandEndpoint::add_message_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Serves remote calls addressed to one endpoint.
pub struct CommandEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    hub: Hub,
    channel: ReadChannel,
    handlers: Mutex<Vec<(HandlerId, PostMessageHandler)>>,
    next_handler: AtomicU64,
    requests: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl CommandEndpoint {
    pub fn new(hub: &Hub, endpoint: EndpointId) -> Result<Self, TetherError> {
        let channel = ReadChannel::new(hub, endpoint)?;
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        channel.add_text_listener(move |text| {
            let _ = requests_tx.send(text.to_owned());
        });

        Ok(Self {
            inner: Arc::new(EndpointInner {
                hub: hub.clone(),
                channel,
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(0),
                requests: Mutex::new(Some(requests_rx)),
            }),
        })
    }

    /// Creates and connects an endpoint.
    pub async fn start(hub: &Hub, endpoint: EndpointId) -> Result<Self, TetherError> {
        let endpoint = Self::new(hub, endpoint)?;
        endpoint.connect().await?;
        Ok(endpoint)
    }

    pub fn endpoint(&self) -> &EndpointId {
        self.inner.channel.endpoint()
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.channel.state().await
    }

    /// Connects the read channel and starts dispatching requests.
    pub async fn connect(&self) -> Result<(), TetherError> {
        self.inner.channel.connect().await?;
        let requests = self
            .inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(requests) = requests {
            tokio::spawn(dispatch_requests(Arc::downgrade(&self.inner), requests));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.inner.channel.close().await;
    }

    /// Registers a handler for posted values; handlers run in registration
    /// order.
    pub fn add_message_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers();
        let before = handlers.len();
        handlers.retain(|(entry, _)| *entry != id);
        let removed = handlers.len() != before;
        if removed {
            tracing::trace!(handler = id.0, "message handler removed");
        }
        removed
    }

    /// Resolves with the next posted value.
    pub async fn next_message(&self) -> Result<Value, TetherError> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let id = self.add_message_handler(move |value| {
            let sender = sender.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(sender) = sender {
                let _ = sender.send(value);
            }
        });
        let _guard = HandlerGuard {
            endpoint: self,
            id,
        };
        receiver.await.map_err(|_| TetherError::ChannelClosed {
            endpoint: self.endpoint().clone(),
        })
    }
}

struct HandlerGuard<'a> {
    endpoint: &'a CommandEndpoint,
    id: HandlerId,
}

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.endpoint.remove_message_handler(self.id);
    }
}

impl EndpointInner {
    fn handlers(&self) -> MutexGuard<'_, Vec<(HandlerId, PostMessageHandler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handles requests one at a time in arrival order. Script results are
/// awaited on their own tasks.
async fn dispatch_requests(
    endpoint: Weak<EndpointInner>,
    mut requests: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = requests.recv().await {
        let Some(endpoint) = endpoint.upgrade() else {
            return;
        };
        handle_request(&endpoint, &text);
    }
}

fn handle_request(endpoint: &EndpointInner, text: &str) {
    let hub = endpoint.hub.clone();
    let request = match serde_json::from_str::<RpcRequest>(text) {
        Ok(request) => request,
        Err(err) => {
            match serde_json::from_str::<RequestHeader>(text) {
                Ok(RequestHeader {
                    id,
                    resp_channel: Some(resp_channel),
                }) => {
                    tracing::warn!(error = %err, id = %id, "answering undecodable request with empty result");
                    tokio::spawn(respond(hub, id, resp_channel, CallOutcome::default()));
                }
                _ => tracing::warn!(error = %err, "dropping undecodable request"),
            }
            return;
        }
    };

    let RpcRequest {
        id,
        command,
        resp_channel,
    } = request;
    tracing::debug!(id = %id, command = command.name(), "handling request");

    match command {
        Command::ExecuteScript(params) => {
            let pending = invoke(&hub, params);
            tokio::spawn(async move {
                let outcome = match pending {
                    Ok(call) => match call.await {
                        Ok(value) => match hub.serialize(&value) {
                            Ok(result) => CallOutcome {
                                result: Some(result),
                                exception_details: None,
                            },
                            Err(err) => exception_outcome(&hub, &type_error(&err)),
                        },
                        Err(thrown) => exception_outcome(&hub, &thrown),
                    },
                    Err(err) => exception_outcome(&hub, &type_error(&err)),
                };
                if let Some(resp_channel) = resp_channel {
                    respond(hub, id, resp_channel, outcome).await;
                }
            });
        }
        Command::PostMessage(PostMessageParams { msg }) => {
            match hub.deserialize(msg) {
                Ok(value) => {
                    let handlers: Vec<PostMessageHandler> = endpoint
                        .handlers()
                        .iter()
                        .map(|(_, handler)| Arc::clone(handler))
                        .collect();
                    for handler in handlers {
                        handler(value.clone());
                    }
                }
                Err(err) => tracing::warn!(error = %err, id = %id, "dropping undecodable posted message"),
            }
            if let Some(resp_channel) = resp_channel {
                tokio::spawn(respond(hub, id, resp_channel, CallOutcome::default()));
            }
        }
    }
}

/// Decodes the function and arguments and starts the call.
fn invoke(
    hub: &Hub,
    params: ExecuteScriptParams,
) -> Result<BoxFuture<'static, Result<Value, Value>>, TetherError> {
    let ExecuteScriptParams { function, args } = params;
    let function = match hub.deserialize(function)? {
        Value::Function(function) => function,
        other => {
            return Ok(Box::pin(futures::future::ready(Err(Value::Error(
                ErrorValue::type_error(format!("{other} is not a function")),
            )))));
        }
    };
    let args = args
        .into_iter()
        .map(|arg| hub.deserialize(arg))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(function.call(args))
}

fn type_error(err: &TetherError) -> Value {
    Value::Error(ErrorValue::type_error(err.to_string()))
}

fn exception_outcome(hub: &Hub, thrown: &Value) -> CallOutcome {
    let text = thrown.to_string();
    let exception = hub
        .serialize(thrown)
        .or_else(|err| hub.serialize(&type_error(&err)))
        .unwrap_or_else(|_| SerializedNode::String {
            value: Some(text.clone()),
            object_id: None,
        });
    CallOutcome {
        result: None,
        exception_details: Some(ExceptionDetails {
            line_number: coerce_int(thrown.property("lineNumber")),
            column_number: coerce_int(thrown.property("columnNumber")),
            text,
            exception,
        }),
    }
}

/// Integer form of a position field; 0 when absent or not a number.
fn coerce_int(value: Option<Value>) -> i64 {
    match value {
        Some(Value::Number(number)) if number.is_finite() => number.trunc() as i64,
        Some(Value::BigInt(number)) => i64::try_from(number).unwrap_or(0),
        Some(Value::String(text)) => leading_int(&text).unwrap_or(0),
        _ => 0,
    }
}

fn leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let digits_start = usize::from(text.starts_with(['-', '+']));
    let digits_end = text[digits_start..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(text.len(), |end| end + digits_start);
    text[..digits_end].parse().ok()
}

async fn respond(hub: Hub, id: CallId, resp_channel: SerializedNode, outcome: CallOutcome) {
    let channel = match hub.deserialize(resp_channel) {
        Ok(Value::Channel(channel)) => channel,
        Ok(other) => {
            tracing::warn!(id = %id, value = ?other, "response channel is not a channel");
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, id = %id, "undecodable response channel");
            return;
        }
    };

    let response = RpcResponse {
        id,
        result: outcome,
    };
    if let Err(err) = channel.send_message(&response).await {
        tracing::warn!(error = %err, id = %id, endpoint = %channel.endpoint(), "failed to send response");
    }
    channel.close().await;
}

type PendingCalls = Arc<Mutex<HashMap<CallId, oneshot::Sender<CallOutcome>>>>;

/// Caller side of a command endpoint.
pub struct RemoteWindow {
    hub: Hub,
    send: WriteChannel,
    inbox: AsyncMutex<Option<Inbox>>,
    next_id: AtomicU64,
    pending: PendingCalls,
}

/// Private response channel pair of a remote window.
struct Inbox {
    read: ReadChannel,
    reply: WriteChannel,
}

impl RemoteWindow {
    /// Targets `endpoint`, or a fresh endpoint if `None`.
    pub fn new(hub: &Hub, endpoint: Option<EndpointId>) -> Self {
        let endpoint = endpoint.unwrap_or_else(EndpointId::generate);
        Self::with_channel(hub, WriteChannel::new(hub, endpoint))
    }

    /// Sends requests over an existing write channel.
    pub fn with_channel(hub: &Hub, send: WriteChannel) -> Self {
        Self {
            hub: hub.clone(),
            send,
            inbox: AsyncMutex::new(None),
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        self.send.endpoint()
    }

    /// Connects the request channel and the response inbox.
    pub async fn connect(&self) -> Result<(), TetherError> {
        let (send, inbox) = futures::join!(self.send.connect(), self.reply_channel());
        send?;
        inbox.map(|_| ())
    }

    /// Returns the inbox's write half, creating and connecting the inbox on
    /// first use.
    async fn reply_channel(&self) -> Result<WriteChannel, TetherError> {
        let mut inbox = self.inbox.lock().await;
        if let Some(inbox) = inbox.as_ref() {
            return Ok(inbox.reply.clone());
        }
        if self.send.state().await == ChannelState::Closed {
            return Err(TetherError::ChannelClosed {
                endpoint: self.endpoint().clone(),
            });
        }

        let (read, reply) = channel(&self.hub)?;
        let pending = Arc::clone(&self.pending);
        read.add_text_listener(move |text| match serde_json::from_str::<RpcResponse>(text) {
            Ok(response) => {
                let waiter = lock_pending(&pending).remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response.result);
                    }
                    None => tracing::debug!(id = %response.id, "dropping response for unknown call"),
                }
            }
            Err(err) => tracing::warn!(error = %err, "dropping undecodable response"),
        });
        read.connect().await?;

        let reply_channel = reply.clone();
        *inbox = Some(Inbox { read, reply });
        Ok(reply_channel)
    }

    /// Sends one request. With `expects_response`, resolves with the
    /// correlated outcome; otherwise resolves with `None` once sent.
    pub async fn send_message(
        &self,
        command: Command,
        expects_response: bool,
    ) -> Result<Option<CallOutcome>, TetherError> {
        let id = CallId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (resp_channel, receiver) = if expects_response {
            let reply = self.reply_channel().await?;
            let node = self.hub.serialize(&Value::Channel(reply))?;
            let (sender, receiver) = oneshot::channel();
            lock_pending(&self.pending).insert(id, sender);
            (Some(node), Some(receiver))
        } else {
            (None, None)
        };

        let request = RpcRequest {
            id,
            command,
            resp_channel,
        };
        if let Err(err) = self.send.send_message(&request).await {
            lock_pending(&self.pending).remove(&id);
            return Err(err);
        }

        match receiver {
            Some(receiver) => receiver.await.map(Some).map_err(|_| TetherError::ChannelClosed {
                endpoint: self.endpoint().clone(),
            }),
            None => Ok(None),
        }
    }

    /// Runs `function` remotely with `args` and returns its result. A thrown
    /// value comes back as [`TetherError::RemoteOperation`].
    pub async fn execute_script(
        &self,
        function: &Function,
        args: Vec<Value>,
    ) -> Result<Value, TetherError> {
        let params = ExecuteScriptParams {
            function: self.hub.serialize(&Value::Function(function.clone()))?,
            args: args
                .iter()
                .map(|arg| self.hub.serialize(arg))
                .collect::<Result<_, _>>()?,
        };
        let outcome = self
            .send_message(Command::ExecuteScript(params), true)
            .await?
            .unwrap_or_default();

        if let Some(details) = outcome.exception_details {
            let ExceptionDetails {
                text,
                line_number,
                column_number,
                exception,
            } = details;
            return Err(TetherError::RemoteOperation {
                text,
                line_number,
                column_number,
                exception: self.hub.deserialize(exception)?,
            });
        }
        match outcome.result {
            Some(result) => self.hub.deserialize(result),
            None => Ok(Value::Undefined),
        }
    }

    /// Hands `message` to the remote endpoint's message handlers.
    pub async fn post_message(&self, message: &Value) -> Result<(), TetherError> {
        let params = PostMessageParams {
            msg: self.hub.serialize(message)?,
        };
        self.send_message(Command::PostMessage(params), false)
            .await
            .map(|_| ())
    }

    /// Makes the remote reader disconnect until it reconnects.
    pub async fn pause(&self) -> Result<(), TetherError> {
        self.send.send(ControlFrame::Pause).await
    }

    /// Closes the request channel and the inbox. Calls still waiting for a
    /// response fail with [`TetherError::ChannelClosed`].
    pub async fn close(&self) {
        let inbox = self.inbox.lock().await.take();
        match &inbox {
            Some(inbox) => {
                futures::join!(self.send.close(), inbox.read.close(), inbox.reply.close());
            }
            None => self.send.close().await,
        }
        lock_pending(&self.pending).clear();
    }
}

fn lock_pending(
    pending: &Mutex<HashMap<CallId, oneshot::Sender<CallOutcome>>>,
) -> MutexGuard<'_, HashMap<CallId, oneshot::Sender<CallOutcome>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::{coerce_int, leading_int};
    use crate::Value;

    #[test]
    fn positions_coerce_like_parse_int() {
        assert_eq!(coerce_int(Some(Value::Number(12.9))), 12);
        assert_eq!(coerce_int(Some(Value::Number(f64::NAN))), 0);
        assert_eq!(coerce_int(Some(Value::from("  42px"))), 42);
        assert_eq!(coerce_int(Some(Value::from("line"))), 0);
        assert_eq!(coerce_int(None), 0);
        assert_eq!(leading_int("-7"), Some(-7));
    }
}
