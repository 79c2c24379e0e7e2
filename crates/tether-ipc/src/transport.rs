use async_trait::async_trait;
use tether_core::{Direction, EndpointId};

use crate::{IpcError, MessageHandler, Socket};

/// Opens physical sockets for (endpoint, direction) pairs.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a socket and resolves once it is open. Read sockets deliver each
    /// inbound frame to `on_message`.
    async fn open(
        &self,
        endpoint: &EndpointId,
        direction: Direction,
        on_message: Option<MessageHandler>,
    ) -> Result<Socket, IpcError>;
}
