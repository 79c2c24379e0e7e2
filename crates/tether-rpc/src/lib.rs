//! Channels, structured serialization and remote calls on top of pooled
//! tether sockets.

mod channel;
mod error;
mod handles;
mod host;
mod hub;
mod rpc;

pub mod serialize;
pub mod value;

pub use channel::{ChannelState, Listener, ListenerId, NextMessage, ReadChannel, WriteChannel, channel};
pub use error::TetherError;
pub use handles::HandleRegistry;
pub use host::{Host, STANDARD_ERROR_KINDS, StandardHost};
pub use hub::Hub;
pub use rpc::{CommandEndpoint, HandlerId, PostMessageHandler, RemoteWindow};
pub use serialize::TypeName;
pub use value::{
    Array, ErrorData, ErrorValue, Function, HostObject, Map, Object, RegExp, RemoteHandle, Set,
    Value, same_value_zero,
};
