//! Pooled duplex sockets for tether endpoints, plus the relay they talk to.

mod error;
mod memory;
mod pool;
mod relay;
mod socket;
mod transport;

pub mod codec;
pub mod framing;
pub mod link;
pub mod server;

pub use error::IpcError;
pub use link::{LinkFrame, RejectReason, UnixTransport};
pub use memory::MemoryTransport;
pub use pool::ConnectionPool;
pub use relay::{ReaderEvent, ReaderLease, Relay};
pub use server::serve_unix;
pub use socket::{MessageHandler, Outbound, Socket, SocketDriver, SocketState};
pub use transport::Transport;
