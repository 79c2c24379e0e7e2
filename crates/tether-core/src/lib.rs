pub mod direction;
pub mod errors;
pub mod ids;
pub mod node;
pub mod paths;
pub mod protocol;
mod scan;

pub use direction::Direction;
pub use errors::CoreError;
pub use ids::{CallId, EndpointId, HandleId};
pub use paths::default_socket_path;
pub use node::{ErrorRecord, Fields, HandleDescriptor, RegExpSource, SerializedNode, WireNumber};
pub use protocol::{
    CallOutcome, Command, ControlFrame, ExceptionDetails, ExecuteScriptParams, INVALID_FRAME,
    NORMAL_CLOSURE, PROTOCOL_VERSION, PostMessageParams, RequestHeader, RpcRequest, RpcResponse,
};
