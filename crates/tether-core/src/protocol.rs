use std::fmt;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{Error as _, IgnoredAny, MapAccess, SeqAccess, Visitor},
    ser::{SerializeMap, SerializeTuple},
};
use serde_json::value::RawValue;

use crate::{CallId, CoreError, SerializedNode};

/// Link protocol version exchanged in relay hello frames.
pub const PROTOCOL_VERSION: u32 = 1;

/// Close code sent on a graceful socket shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code sent when a peer writes a frame that cannot be decoded.
pub const INVALID_FRAME: u16 = 1007;

/// Low-level frame written by a write channel: `[command, body]`.
///
/// Message bodies stay raw JSON text; the relay forwards them untouched.
#[derive(Debug, Clone)]
pub enum ControlFrame {
    /// Deliver `body` to the endpoint's reader.
    Message(Box<RawValue>),
    /// Disconnect the endpoint's reader until it reconnects.
    Pause,
    /// Discard messages queued for the endpoint.
    Delete,
}

impl ControlFrame {
    /// Message frame carrying `body` as JSON.
    pub fn message<T: Serialize + ?Sized>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(ControlFrame::Message(serde_json::value::to_raw_value(body)?))
    }

    pub fn command(&self) -> &'static str {
        match self {
            ControlFrame::Message(_) => "message",
            ControlFrame::Pause => "pause",
            ControlFrame::Delete => "delete",
        }
    }
}

impl PartialEq for ControlFrame {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ControlFrame::Message(a), ControlFrame::Message(b)) => a.get() == b.get(),
            (ControlFrame::Pause, ControlFrame::Pause)
            | (ControlFrame::Delete, ControlFrame::Delete) => true,
            _ => false,
        }
    }
}

impl Serialize for ControlFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(self.command())?;
        match self {
            ControlFrame::Message(body) => tuple.serialize_element(body)?,
            ControlFrame::Pause | ControlFrame::Delete => tuple.serialize_element(&())?,
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for ControlFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameVisitor;

        impl<'de> Visitor<'de> for FrameVisitor {
            type Value = ControlFrame;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [command, body] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ControlFrame, A::Error> {
                let command: String = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                // `null` is a valid message body, so the body is read raw.
                let body: Option<Box<RawValue>> = seq.next_element::<Box<RawValue>>()?;
                match command.as_str() {
                    "message" => body
                        .map(ControlFrame::Message)
                        .ok_or_else(|| A::Error::invalid_length(1, &self)),
                    "pause" => Ok(ControlFrame::Pause),
                    "delete" => Ok(ControlFrame::Delete),
                    _ => Err(A::Error::custom(CoreError::UnknownControlCommand(command))),
                }
            }
        }

        deserializer.deserialize_seq(FrameVisitor)
    }
}

/// Call request sent to a command endpoint.
///
/// Encoded as `{"id", "command", "params", "respChannel"}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Caller-assigned correlation id.
    pub id: CallId,
    /// Command name and its parameters.
    pub command: Command,
    /// Serialized write channel the outcome should be sent to.
    pub resp_channel: Option<SerializedNode>,
}

impl Serialize for RpcRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.resp_channel.is_some() { 4 } else { 3 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("command", self.command.name())?;
        match &self.command {
            Command::ExecuteScript(params) => map.serialize_entry("params", params)?,
            Command::PostMessage(params) => map.serialize_entry("params", params)?,
        }
        if let Some(channel) = &self.resp_channel {
            map.serialize_entry("respChannel", channel)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RpcRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RequestVisitor;

        impl<'de> Visitor<'de> for RequestVisitor {
            type Value = RpcRequest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an rpc request object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<RpcRequest, A::Error> {
                let mut id: Option<CallId> = None;
                let mut command: Option<String> = None;
                let mut params: Option<Box<RawValue>> = None;
                let mut resp_channel: Option<SerializedNode> = None;
                while let Some(key) = access.next_key::<String>()? {
                    match key.as_str() {
                        "id" => id = Some(access.next_value()?),
                        "command" => command = Some(access.next_value()?),
                        "params" => params = Some(access.next_value()?),
                        "respChannel" => resp_channel = access.next_value()?,
                        _ => {
                            access.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                let id = id.ok_or_else(|| A::Error::missing_field("id"))?;
                let command = command.ok_or_else(|| A::Error::missing_field("command"))?;
                let params = params.ok_or_else(|| A::Error::missing_field("params"))?;
                let command = Command::decode(&command, params.get()).map_err(A::Error::custom)?;
                Ok(RpcRequest {
                    id,
                    command,
                    resp_channel,
                })
            }
        }

        deserializer.deserialize_map(RequestVisitor)
    }
}

/// Minimal request view used when the full request fails to decode.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestHeader {
    pub id: CallId,
    #[serde(rename = "respChannel", default)]
    pub resp_channel: Option<SerializedNode>,
}

/// Commands understood by a command endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Runs a function in the remote context.
    ExecuteScript(ExecuteScriptParams),
    /// Hands a value to the remote context's message handlers.
    PostMessage(PostMessageParams),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ExecuteScript(_) => "executeScript",
            Command::PostMessage(_) => "postMessage",
        }
    }

    /// Decodes the `params` text of the command called `name`.
    pub fn decode(name: &str, params: &str) -> Result<Self, serde_json::Error> {
        match name {
            "executeScript" => serde_json::from_str(params).map(Command::ExecuteScript),
            "postMessage" => serde_json::from_str(params).map(Command::PostMessage),
            other => Err(serde_json::Error::custom(format!("unknown command '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteScriptParams {
    /// Function to invoke.
    #[serde(rename = "fn")]
    pub function: SerializedNode,
    /// Positional arguments.
    pub args: Vec<SerializedNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostMessageParams {
    pub msg: SerializedNode,
}

/// Response correlated to a request by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Request id echoed back.
    pub id: CallId,
    /// Outcome of the command.
    pub result: CallOutcome,
}

/// Either a serialized return value, exception details, or neither for
/// commands without a return value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SerializedNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_details: Option<ExceptionDetails>,
}

/// Description of a value thrown by a remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    /// String form of the thrown value.
    pub text: String,
    pub line_number: i64,
    pub column_number: i64,
    /// The thrown value itself.
    pub exception: SerializedNode,
}
