use thiserror::Error;

/// Failures raised while interpreting core wire values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A channel direction string was neither `read` nor `write`.
    #[error("unknown channel direction '{0}'")]
    UnknownDirection(String),
    /// A control frame named a command outside the supported set.
    #[error("unknown control command '{0}'")]
    UnknownControlCommand(String),
    /// Text handed to the node reader was not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),
    /// A serialized node was missing a member or had one of the wrong shape.
    #[error("malformed node: {0}")]
    MalformedNode(String),
    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),
}
