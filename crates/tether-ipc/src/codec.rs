//! Payload codecs: CBOR for relay link frames, JSON for channel text.

use serde::{Serialize, de::DeserializeOwned};

use crate::IpcError;

/// Serializes a link frame to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, IpcError> {
    serde_cbor::to_vec(value).map_err(|err| IpcError::Encode(err.to_string()))
}

/// Deserializes a CBOR link frame payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    serde_cbor::from_slice(bytes).map_err(|err| IpcError::Decode(err.to_string()))
}

/// Serializes a value to the JSON text carried by channel sockets.
pub fn encode_text<T: Serialize>(value: &T) -> Result<String, IpcError> {
    serde_json::to_string(value).map_err(|err| IpcError::Encode(err.to_string()))
}

/// Parses JSON text received on a channel socket.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, IpcError> {
    serde_json::from_str(text).map_err(|err| IpcError::Decode(err.to_string()))
}
