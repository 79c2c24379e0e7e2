use tether_core::{CoreError, Direction, EndpointId};
use thiserror::Error;

/// Transport, pooling and link-protocol failures.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Underlying socket I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Frame payload encoding failed.
    #[error("failed to encode payload: {0}")]
    Encode(String),
    /// Frame payload decoding failed.
    #[error("failed to decode payload: {0}")]
    Decode(String),
    /// Control frame content was not understood.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// Operation exceeded configured timeout.
    #[error("operation timed out")]
    Timeout,
    /// Frame size exceeded maximum allowed payload.
    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: u32, max: u32 },
    /// Peer link protocol version did not match local expectation.
    #[error("protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },
    /// Peer sent a frame that is not valid in the current link state.
    #[error("unexpected link frame: {0}")]
    UnexpectedFrame(String),
    /// Relay refused the link.
    #[error("relay rejected link: {0}")]
    Rejected(String),
    /// A reader is already attached to the endpoint.
    #[error("a reader is already attached to endpoint {endpoint}")]
    DuplicateReader { endpoint: EndpointId },
    /// Caller combined options that cannot work together.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Socket is closing or closed.
    #[error("{direction} socket for endpoint {endpoint} is closed")]
    Closed {
        endpoint: EndpointId,
        direction: Direction,
    },
}
