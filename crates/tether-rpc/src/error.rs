use tether_core::{CoreError, EndpointId};
use tether_ipc::IpcError;
use thiserror::Error;

use crate::Value;

/// Channel, serialization and remote call failures.
#[derive(Debug, Error)]
pub enum TetherError {
    /// A reader already exists for the endpoint.
    #[error("a reader already exists for endpoint {endpoint}")]
    DuplicateReader { endpoint: EndpointId },
    /// Caller combined options that cannot work together.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Value has no wire encoding.
    #[error("can't serialize value of type {type_name}; wrap it in a RemoteHandle instead")]
    UnsupportedType { type_name: String },
    /// Wire content was not understood.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// Host could not turn function text into a callable.
    #[error("host cannot compile function `{text}`")]
    UnknownFunction { text: String },
    /// Remote operation threw or rejected.
    #[error("remote operation failed: {text}")]
    RemoteOperation {
        text: String,
        line_number: i64,
        column_number: i64,
        /// The thrown value, rebuilt locally.
        exception: Value,
    },
    /// Socket closed before the operation completed.
    #[error("connection lost for endpoint {endpoint}")]
    ConnectionLost { endpoint: EndpointId },
    /// Channel was closed and cannot be used again.
    #[error("channel for endpoint {endpoint} is closed")]
    ChannelClosed { endpoint: EndpointId },
    /// Serialization produced more than one root node.
    #[error("serialization produced more than one root value")]
    MultipleRoots,
    /// Any other transport failure.
    #[error(transparent)]
    Transport(IpcError),
}

impl From<IpcError> for TetherError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::DuplicateReader { endpoint } => TetherError::DuplicateReader { endpoint },
            IpcError::InvalidConfiguration(message) => TetherError::InvalidConfiguration(message),
            IpcError::Closed { endpoint, .. } => TetherError::ConnectionLost { endpoint },
            IpcError::Core(err) => err.into(),
            other => TetherError::Transport(other),
        }
    }
}

impl From<CoreError> for TetherError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownDirection(_) => TetherError::InvalidConfiguration(err.to_string()),
            CoreError::UnknownControlCommand(_)
            | CoreError::InvalidJson(_)
            | CoreError::MalformedNode(_)
            | CoreError::UnknownNodeType(_) => TetherError::MalformedMessage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::MalformedMessage(err.to_string())
    }
}
