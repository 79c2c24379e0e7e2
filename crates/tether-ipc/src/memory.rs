use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{Direction, EndpointId};

use crate::{
    IpcError, MessageHandler, Outbound, Socket, SocketDriver, Transport,
    relay::{ReaderEvent, ReaderLease, Relay},
};

/// In-process transport: sockets are tasks talking to a shared [`Relay`].
///
/// Two hubs built on clones of one `MemoryTransport` behave like two
/// processes connected to the same relay daemon.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    relay: Arc<Relay>,
}

impl MemoryTransport {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(
        &self,
        endpoint: &EndpointId,
        direction: Direction,
        on_message: Option<MessageHandler>,
    ) -> Result<Socket, IpcError> {
        let (socket, driver) = Socket::pair(endpoint.clone(), direction);
        let relay = Arc::clone(&self.relay);
        match direction {
            Direction::Write => {
                driver.mark_open();
                tokio::spawn(drive_writer(relay, driver));
            }
            Direction::Read => {
                let lease = relay.attach_reader(endpoint)?;
                driver.mark_open();
                tokio::spawn(drive_reader(relay, driver, lease, on_message));
            }
        }
        tracing::debug!(endpoint = %endpoint, direction = %direction, "memory socket open");
        Ok(socket)
    }
}

async fn drive_writer(relay: Arc<Relay>, mut driver: SocketDriver) {
    while let Some(outbound) = driver.next_outbound().await {
        match outbound {
            Outbound::Text(text) => {
                if let Err(err) = relay.deliver(driver.endpoint(), &text) {
                    tracing::warn!(error = %err, endpoint = %driver.endpoint(), "closing write socket on undecodable frame");
                    break;
                }
            }
            Outbound::Close(_) => break,
        }
    }
}

async fn drive_reader(
    relay: Arc<Relay>,
    mut driver: SocketDriver,
    mut lease: ReaderLease,
    on_message: Option<MessageHandler>,
) {
    loop {
        tokio::select! {
            biased;
            outbound = driver.next_outbound() => match outbound {
                Some(Outbound::Text(_)) => {
                    tracing::warn!(endpoint = %driver.endpoint(), "read socket ignored outbound frame");
                }
                Some(Outbound::Close(_)) | None => break,
            },
            event = lease.events.recv() => match event {
                Some(ReaderEvent::Message(text)) => {
                    if let Some(handler) = &on_message {
                        handler(text);
                    }
                }
                Some(ReaderEvent::Disconnect) | None => break,
            },
        }
    }

    driver.mark_closing();
    let unread = lease.take_unread();
    relay.detach_reader(driver.endpoint(), lease.token, unread);
}
