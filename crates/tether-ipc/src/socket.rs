use std::sync::Arc;

use tether_core::{Direction, EndpointId};
use tokio::sync::{mpsc, watch};

use crate::IpcError;

/// Callback receiving every inbound text frame of a read socket, in order.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Lifecycle of one physical socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Work handed from a [`Socket`] to the task driving its connection.
#[derive(Debug)]
pub enum Outbound {
    /// Transmit one text frame.
    Text(String),
    /// Start a graceful shutdown with the given close code.
    Close(u16),
}

/// Caller side of a physical duplex socket.
///
/// Transports pair every `Socket` with a [`SocketDriver`] owned by a task
/// that performs the actual I/O. The socket reports `Closed` as soon as that
/// driver is dropped, whatever the reason.
#[derive(Debug)]
pub struct Socket {
    endpoint: EndpointId,
    direction: Direction,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<SocketState>,
}

/// Transport side of a [`Socket`].
#[derive(Debug)]
pub struct SocketDriver {
    endpoint: EndpointId,
    direction: Direction,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    state: watch::Sender<SocketState>,
}

impl Socket {
    /// Creates a connecting socket and the driver a transport runs for it.
    pub fn pair(endpoint: EndpointId, direction: Direction) -> (Socket, SocketDriver) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SocketState::Connecting);
        let socket = Socket {
            endpoint: endpoint.clone(),
            direction,
            outbound: outbound_tx,
            state: state_rx,
        };
        let driver = SocketDriver {
            endpoint,
            direction,
            outbound: outbound_rx,
            state: state_tx,
        };
        (socket, driver)
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// True while the socket is connecting or open.
    pub fn is_live(&self) -> bool {
        self.state() <= SocketState::Open
    }

    /// Queues one text frame for transmission.
    pub fn send(&self, text: String) -> Result<(), IpcError> {
        if self.direction == Direction::Read {
            return Err(IpcError::InvalidConfiguration(
                "read sockets cannot send frames".to_string(),
            ));
        }
        if !self.is_live() {
            return Err(self.closed_error());
        }
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| self.closed_error())
    }

    /// Performs a graceful shutdown and waits until the socket reports closed.
    pub async fn close(&self, code: u16) {
        if self.state() == SocketState::Closed {
            return;
        }
        let _ = self.outbound.send(Outbound::Close(code));
        self.closed().await;
    }

    /// Resolves once the socket is closed, locally or by the peer.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|state| *state == SocketState::Closed).await;
    }

    /// Like [`Socket::closed`], but does not borrow the socket.
    pub fn closed_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.clone();
        async move {
            let _ = state.wait_for(|state| *state == SocketState::Closed).await;
        }
    }

    fn closed_error(&self) -> IpcError {
        IpcError::Closed {
            endpoint: self.endpoint.clone(),
            direction: self.direction,
        }
    }
}

impl SocketDriver {
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn mark_open(&self) {
        self.state.send_replace(SocketState::Open);
    }

    pub fn mark_closing(&self) {
        self.state.send_replace(SocketState::Closing);
    }

    /// Next frame or close request; `None` once the socket handle is gone.
    /// Cancel safe.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }
}

impl Drop for SocketDriver {
    fn drop(&mut self) {
        self.state.send_replace(SocketState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::{Outbound, Socket, SocketState};
    use tether_core::{Direction, EndpointId};

    #[tokio::test]
    async fn dropping_driver_closes_socket() {
        let (socket, driver) = Socket::pair(EndpointId::from("ep"), Direction::Write);
        driver.mark_open();
        assert!(socket.is_live());

        drop(driver);
        socket.closed().await;
        assert_eq!(socket.state(), SocketState::Closed);
        assert!(socket.send("late".to_string()).is_err());
    }

    #[tokio::test]
    async fn close_waits_for_driver() {
        let (socket, mut driver) = Socket::pair(EndpointId::from("ep"), Direction::Write);
        driver.mark_open();

        let task = tokio::spawn(async move {
            while let Some(outbound) = driver.next_outbound().await {
                if let Outbound::Close(code) = outbound {
                    return code;
                }
            }
            0
        });

        socket.close(1000).await;
        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(task.await.expect("driver task"), 1000);
    }

    #[test]
    fn read_sockets_refuse_to_send() {
        let (socket, driver) = Socket::pair(EndpointId::from("ep"), Direction::Read);
        driver.mark_open();
        assert!(socket.send("x".to_string()).is_err());
    }
}
